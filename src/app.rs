use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::actions::Action;
use crate::admin::AdminFrameApi;
use crate::api::{MemoryCommentApi, Services};
use crate::config::{self, Config};
use crate::dispatcher::Dispatcher;
use crate::format;
use crate::members;
use crate::model::{Comment, CommentStatus, Counts, InitStatus, Member, Site};
use crate::rpc::{FrameTransport, RpcClient};
use crate::thread::ThreadState;

const DEMO_POST_ID: &str = "demo";

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub offline: bool,
    pub pages: u32,
    pub post_id: Option<String>,
    pub config_file: Option<PathBuf>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            offline: false,
            pages: 1,
            post_id: None,
            config_file: None,
        }
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over `fallback`.
pub fn init_tracing(fallback: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

pub fn run(options: RunOptions) -> Result<()> {
    let cfg = config::load(config::LoadOptions {
        config_file: options.config_file.clone(),
        env_prefix: None,
    })
    .context("load config")?;
    init_tracing(&cfg.log.filter);

    let post_id = options
        .post_id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .or_else(|| Some(cfg.site.post_id.clone()).filter(|id| !id.trim().is_empty()));

    let (services, post_id) = if options.offline {
        let post_id = post_id.unwrap_or_else(|| DEMO_POST_ID.to_string());
        (demo_services(&post_id, Utc::now()), post_id)
    } else {
        let Some(post_id) = post_id else {
            bail!("no post id configured; pass --post or set site.post_id");
        };
        (http_services(&cfg)?, post_id)
    };
    if !options.offline && !cfg.site.admin_url.is_empty() {
        info!(
            admin_url = %cfg.site.admin_url,
            "admin frame needs an embedding host; moderation is disabled"
        );
    }

    let mut dispatcher = Dispatcher::new(
        ThreadState::new(post_id.clone(), None),
        services,
        cfg.thread.dispatcher_options(),
    );
    load_pages(&mut dispatcher, options.pages)
        .with_context(|| format!("load comments for post {post_id}"))?;
    dispatcher.shutdown();

    print!("{}", render_thread(dispatcher.state(), Utc::now()));
    Ok(())
}

/// Runs `init` and then pages older comments until `pages` pages are loaded
/// or the post runs out.
pub fn load_pages(dispatcher: &mut Dispatcher, pages: u32) -> Result<()> {
    dispatcher.dispatch_blocking(Action::Init);
    if dispatcher.state().init_status == InitStatus::Failed {
        bail!("initialisation failed");
    }
    for _ in 1..pages.max(1) {
        let has_more = dispatcher
            .state()
            .pagination
            .as_ref()
            .is_some_and(|p| p.has_more());
        if !has_more {
            break;
        }
        dispatcher.dispatch_blocking(Action::LoadMoreComments);
        if dispatcher.status().is_failed() {
            let message = dispatcher
                .state()
                .popup_notification
                .as_ref()
                .and_then(|n| n.message.clone())
                .unwrap_or_else(|| "unknown error".into());
            bail!("{message}");
        }
    }
    Ok(())
}

pub fn http_services(cfg: &Config) -> Result<Services> {
    if cfg.site.site_url.trim().is_empty() {
        bail!("site.site_url is required unless --offline is used");
    }
    let client = members::Client::new(members::ClientConfig {
        site_url: cfg.site.site_url.clone(),
        api_url: Some(cfg.site.api_url.clone()),
        api_key: Some(cfg.site.api_key.clone()),
        session_cookie: Some(cfg.site.session_cookie.clone()),
        user_agent: cfg.site.user_agent.clone(),
        page_size: cfg.thread.page_size,
        replies_page_size: cfg.thread.replies_page_size,
        http_client: None,
    })
    .context("create members client")?;
    let client = Arc::new(client);
    Ok(Services::new(client.clone(), client))
}

/// Connects moderation to an admin frame reachable through `transport`.
/// The returned client must be fed every message the host receives.
pub fn connect_admin(
    cfg: &Config,
    services: Services,
    transport: Arc<dyn FrameTransport>,
) -> Result<(Services, Arc<RpcClient>)> {
    if cfg.site.admin_url.trim().is_empty() {
        bail!("site.admin_url is required for moderation");
    }
    let rpc = Arc::new(RpcClient::new(&cfg.site.admin_url, transport)?);
    let admin = AdminFrameApi::new(rpc.clone(), Some(cfg.admin.rpc_timeout));
    Ok((services.with_admin(Arc::new(admin)), rpc))
}

pub fn demo_services(post_id: &str, now: DateTime<Utc>) -> Services {
    let viewer = Member {
        id: "member-you".into(),
        name: Some("You".into()),
        ..Default::default()
    };
    let api = Arc::new(MemoryCommentApi::new(
        Site {
            title: "Offline demo".into(),
            url: "http://localhost/".into(),
            ..Default::default()
        },
        Some(viewer),
    ));
    api.seed(demo_comments(post_id, now));
    Services::new(api.clone(), api)
}

fn demo_comments(post_id: &str, now: DateTime<Utc>) -> Vec<Comment> {
    let author = |id: &str, name: &str| Member {
        id: id.into(),
        name: Some(name.into()),
        ..Default::default()
    };
    let comment = |id: &str, minutes_ago: i64, member: Member, html: &str| Comment {
        id: id.into(),
        post_id: Some(post_id.to_string()),
        parent_id: None,
        status: CommentStatus::Published,
        html: html.into(),
        created_at: now - ChronoDuration::minutes(minutes_ago),
        edited_at: None,
        member: Some(member),
        liked: false,
        counts: Counts::default(),
        replies: Vec::new(),
    };
    let reply = |id: &str, parent: &str, minutes_ago: i64, member: Member, html: &str| Comment {
        parent_id: Some(parent.into()),
        ..comment(id, minutes_ago, member, html)
    };

    let ada = author("member-ada", "Ada Lovelace");
    let grace = author("member-grace", "Grace Hopper");
    let alan = author("member-alan", "Alan Turing");

    let mut first = comment(
        "demo-1",
        60 * 26,
        ada.clone(),
        "<p>The engine only needs a comments API and an admin frame.</p>",
    );
    first.counts.likes = 4;
    first.replies = vec![
        reply("demo-1-1", "demo-1", 60 * 25, grace.clone(), "<p>And both are traits.</p>"),
        reply("demo-1-2", "demo-1", 60 * 3, alan.clone(), "<p>Paging works both ways too.</p>"),
    ];
    let mut hidden = comment("demo-2", 90, grace, "<p>Spam link</p>");
    hidden.status = CommentStatus::Hidden;

    vec![
        first,
        hidden,
        comment("demo-3", 12, alan, "<p>Replies show up under their <b>top-level</b> comment.</p>"),
        comment("demo-4", 1, ada, "<p>Just testing &amp; checking.</p>"),
    ]
}

pub fn render_thread(state: &ThreadState, now: DateTime<Utc>) -> String {
    let mut out = String::new();
    let title = state
        .site
        .as_ref()
        .map(|site| site.title.as_str())
        .filter(|title| !title.is_empty())
        .unwrap_or("Comments");
    let _ = writeln!(out, "{title} - {} comments", state.comment_count);
    if state.comments.is_empty() {
        let _ = writeln!(out, "\nNo comments yet.");
    }

    for comment in state.comments.top_level() {
        let _ = writeln!(out);
        render_comment(&mut out, state, comment, 0, now);
        let replies = state.comments.replies(&comment.id);
        let appended = state.comments.appended_replies(&comment.id);
        for reply in replies.iter().chain(appended.iter()) {
            render_comment(&mut out, state, reply, 1, now);
        }
        let shown = (replies.len() + appended.len()) as i64;
        let remaining = comment.counts.replies - shown;
        if remaining > 0 {
            let _ = writeln!(out, "    ({remaining} more replies)");
        }
    }

    if let Some(pagination) = state.pagination.filter(|p| p.has_more()) {
        let _ = writeln!(
            out,
            "\n(page {} of {}, more comments available)",
            pagination.page, pagination.pages
        );
    }
    out
}

fn render_comment(
    out: &mut String,
    state: &ThreadState,
    comment: &Comment,
    depth: usize,
    now: DateTime<Utc>,
) {
    let indent = "    ".repeat(depth);
    if let Some(notice) = format::unpublished_notice(comment.status, state.is_admin()) {
        let _ = writeln!(out, "{indent}{notice}");
        return;
    }

    let member = state.author(comment);
    let name = format::author_name(member);
    let mut header = format!(
        "{indent}[{}] {name} · {}",
        format::initials(name),
        format::relative_time(comment.created_at, now)
    );
    if comment.edited_at.is_some() {
        header.push_str(" · edited");
    }
    if comment.counts.likes > 0 {
        let _ = write!(header, " · {} likes", comment.counts.likes);
    }
    let _ = writeln!(out, "{header}");
    for line in format::plain_text(&comment.html).lines() {
        let _ = writeln!(out, "{indent}  {line}");
    }
}
