use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response};
use reqwest::header::{COOKIE, USER_AGENT};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::api::{CommentApi, MemberApi};
use crate::model::{
    BrowseQuery, Comment, CommentEdit, CommentPage, Member, MemberPatch, NewComment, Session, Site,
};

pub const MEMBERS_API_PATH: &str = "members/api/";
pub const CONTENT_SETTINGS_PATH: &str = "ghost/api/content/settings/";
pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const DEFAULT_REPLIES_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub site_url: String,
    /// Defaults to `<site_url>/members/api/`.
    pub api_url: Option<String>,
    /// Content API key used to read site settings.
    pub api_key: Option<String>,
    /// Raw `Cookie` header carrying the member session.
    pub session_cookie: Option<String>,
    pub user_agent: String,
    pub page_size: u32,
    pub replies_page_size: u32,
    pub http_client: Option<HttpClient>,
}

/// Blocking client for a site's members comments API.
pub struct Client {
    http: HttpClient,
    user_agent: String,
    site_url: Url,
    api_url: Url,
    api_key: Option<String>,
    session_cookie: Option<String>,
    page_size: u32,
    replies_page_size: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct CommentsEnvelope<T> {
    comments: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct SettingsEnvelope {
    settings: Site,
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.user_agent.trim().is_empty() {
            bail!("members client user agent required");
        }
        let site_url = with_trailing_slash(
            Url::parse(&config.site_url)
                .with_context(|| format!("invalid site url {:?}", config.site_url))?,
        );
        let api_url = match config.api_url.as_deref().filter(|u| !u.trim().is_empty()) {
            Some(raw) => Url::parse(raw).with_context(|| format!("invalid api url {raw:?}"))?,
            None => site_url.join(MEMBERS_API_PATH)?,
        };

        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(Duration::from_secs(20))
                .build()?,
        };

        Ok(Client {
            http,
            user_agent: config.user_agent,
            site_url,
            api_url: with_trailing_slash(api_url),
            api_key: config.api_key.filter(|k| !k.trim().is_empty()),
            session_cookie: config.session_cookie.filter(|c| !c.trim().is_empty()),
            page_size: if config.page_size == 0 {
                DEFAULT_PAGE_SIZE
            } else {
                config.page_size
            },
            replies_page_size: if config.replies_page_size == 0 {
                DEFAULT_REPLIES_PAGE_SIZE
            } else {
                config.replies_page_size
            },
        })
    }

    pub fn api_url(&self) -> &Url {
        &self.api_url
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.api_url
            .join(path)
            .with_context(|| format!("build url for {path}"))
    }

    pub fn browse_url(&self, query: &BrowseQuery) -> Result<Url> {
        let mut url = self.endpoint(&format!("comments/post/{}/", query.post_id))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("page", &query.page.max(1).to_string())
                .append_pair("limit", &self.page_size.to_string())
                .append_pair("order", query.order.as_param());
            if let Some(after) = query.after.as_deref() {
                pairs.append_pair("filter", &format!("id:<'{after}'"));
            }
            if let Some(before) = query.before.as_deref() {
                pairs.append_pair("filter", &format!("id:>'{before}'"));
            }
        }
        Ok(url)
    }

    pub fn replies_url(&self, comment_id: &str, after: Option<&str>) -> Result<Url> {
        let mut url = self.endpoint(&format!("comments/{comment_id}/replies/"))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("limit", &self.replies_page_size.to_string());
            if let Some(after) = after {
                pairs.append_pair("filter", &format!("id:>'{after}'"));
            }
        }
        Ok(url)
    }

    pub fn settings_url(&self) -> Result<Option<Url>> {
        let Some(key) = self.api_key.as_deref() else {
            return Ok(None);
        };
        let mut url = self.site_url.join(CONTENT_SETTINGS_PATH)?;
        url.query_pairs_mut().append_pair("key", key);
        Ok(Some(url))
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self
            .http
            .request(method, url)
            .header(USER_AGENT, &self.user_agent);
        match self.session_cookie.as_deref() {
            Some(cookie) => builder.header(COOKIE, cookie),
            None => builder,
        }
    }

    fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let response = builder.send()?;
        let status = response.status();
        if !status.is_success() {
            bail!("members api returned {status}");
        }
        Ok(response)
    }

    fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        debug!(%url, "members api GET");
        Ok(self.send(self.request(Method::GET, url))?.json()?)
    }

    fn send_comment<B: Serialize>(&self, method: Method, url: Url, body: &B) -> Result<Comment> {
        debug!(%url, %method, "members api write");
        let envelope: CommentsEnvelope<Comment> = self
            .send(self.request(method, url).json(&CommentsEnvelope {
                comments: vec![body],
            }))?
            .json()?;
        envelope
            .comments
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("members api returned no comment"))
    }

    fn site(&self) -> Result<Site> {
        match self.settings_url()? {
            Some(url) => {
                let envelope: SettingsEnvelope =
                    self.get_json(url).context("fetch site settings")?;
                Ok(envelope.settings)
            }
            None => Ok(Site {
                url: self.site_url.to_string(),
                ..Default::default()
            }),
        }
    }

    fn member(&self) -> Result<Option<Member>> {
        let url = self.endpoint("member/")?;
        let response = self.send(self.request(Method::GET, url))?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        Ok(Some(response.json().context("decode member")?))
    }
}

impl CommentApi for Client {
    fn browse(&self, query: &BrowseQuery) -> Result<CommentPage> {
        self.get_json(self.browse_url(query)?)
            .context("browse comments")
    }

    fn count(&self, post_id: &str) -> Result<i64> {
        let mut url = self.endpoint("comments/counts/")?;
        url.query_pairs_mut().append_pair("ids", post_id);
        let counts: HashMap<String, i64> = self.get_json(url).context("count comments")?;
        Ok(counts.get(post_id).copied().unwrap_or(0))
    }

    fn read(&self, comment_id: &str) -> Result<Comment> {
        let url = self.endpoint(&format!("comments/{comment_id}/"))?;
        let envelope: CommentsEnvelope<Comment> =
            self.get_json(url).context("read comment")?;
        envelope
            .comments
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("comment {comment_id} not found"))
    }

    fn add(&self, comment: &NewComment) -> Result<Comment> {
        let url = self.endpoint("comments/")?;
        self.send_comment(Method::POST, url, comment)
            .context("add comment")
    }

    fn edit(&self, edit: &CommentEdit) -> Result<Comment> {
        let url = self.endpoint(&format!("comments/{}/", edit.id))?;
        self.send_comment(Method::PUT, url, edit)
            .context("edit comment")
    }

    fn like(&self, comment_id: &str) -> Result<()> {
        let url = self.endpoint(&format!("comments/{comment_id}/like/"))?;
        self.send(self.request(Method::POST, url))
            .context("like comment")?;
        Ok(())
    }

    fn unlike(&self, comment_id: &str) -> Result<()> {
        let url = self.endpoint(&format!("comments/{comment_id}/like/"))?;
        self.send(self.request(Method::DELETE, url))
            .context("unlike comment")?;
        Ok(())
    }

    fn report(&self, comment_id: &str) -> Result<()> {
        let url = self.endpoint(&format!("comments/{comment_id}/report/"))?;
        self.send(self.request(Method::POST, url))
            .context("report comment")?;
        Ok(())
    }

    fn replies(&self, comment_id: &str, after: Option<&str>) -> Result<CommentPage> {
        self.get_json(self.replies_url(comment_id, after)?)
            .context("load replies")
    }
}

impl MemberApi for Client {
    fn session(&self) -> Result<Session> {
        let site = self.site()?;
        let member = self.member().context("fetch member session")?;
        Ok(Session {
            site: Some(site),
            member,
        })
    }

    fn update(&self, patch: &MemberPatch) -> Result<Option<Member>> {
        let url = self.endpoint("member/")?;
        let response = self
            .send(self.request(Method::PUT, url).json(patch))
            .context("update member")?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        Ok(Some(response.json().context("decode member")?))
    }
}
