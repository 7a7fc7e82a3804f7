use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;

use crate::model::{
    AdminUser, BrowseQuery, Comment, CommentEdit, CommentPage, Member, MemberPatch, NewComment,
    PageMeta, Pagination, Session, Site, SortOrder,
};

pub trait CommentApi: Send + Sync {
    fn browse(&self, query: &BrowseQuery) -> Result<CommentPage>;
    fn count(&self, post_id: &str) -> Result<i64>;
    fn read(&self, comment_id: &str) -> Result<Comment>;
    fn add(&self, comment: &NewComment) -> Result<Comment>;
    fn edit(&self, edit: &CommentEdit) -> Result<Comment>;
    fn like(&self, comment_id: &str) -> Result<()>;
    fn unlike(&self, comment_id: &str) -> Result<()>;
    fn report(&self, comment_id: &str) -> Result<()>;
    fn replies(&self, comment_id: &str, after: Option<&str>) -> Result<CommentPage>;
}

pub trait MemberApi: Send + Sync {
    fn session(&self) -> Result<Session>;
    fn update(&self, patch: &MemberPatch) -> Result<Option<Member>>;
}

/// Privileged operations that only the admin frame can perform.
pub trait AdminApi: Send + Sync {
    fn current_user(&self) -> Result<Option<AdminUser>>;
    fn hide_comment(&self, comment_id: &str) -> Result<()>;
    fn show_comment(&self, comment_id: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct Services {
    pub comments: Arc<dyn CommentApi>,
    pub members: Arc<dyn MemberApi>,
    pub admin: Option<Arc<dyn AdminApi>>,
}

impl Services {
    pub fn new(comments: Arc<dyn CommentApi>, members: Arc<dyn MemberApi>) -> Self {
        Self {
            comments,
            members,
            admin: None,
        }
    }

    pub fn with_admin(mut self, admin: Arc<dyn AdminApi>) -> Self {
        self.admin = Some(admin);
        self
    }

    pub fn admin(&self) -> Result<&dyn AdminApi> {
        self.admin
            .as_deref()
            .ok_or_else(|| anyhow!("admin session not available"))
    }
}

const MEMORY_PAGE_SIZE: u32 = 20;
const MEMORY_REPLIES_PAGE_SIZE: u32 = 100;
const MEMORY_EMBEDDED_REPLIES: usize = 3;

/// In-process comments backend used for offline browsing and tests.
///
/// Mirrors the members API closely enough for the engine: newest-first
/// browsing with `after`/`before` anchors, oldest-first reply pages, and the
/// known gap where a freshly created comment comes back without its member.
pub struct MemoryCommentApi {
    state: Mutex<MemoryState>,
    page_size: u32,
    replies_page_size: u32,
    calls: AtomicUsize,
    fail_next: Mutex<Option<String>>,
}

struct MemoryState {
    site: Site,
    member: Option<Member>,
    comments: Vec<Comment>,
    reports: Vec<String>,
    next_id: u64,
    clock: DateTime<Utc>,
}

impl MemoryCommentApi {
    pub fn new(site: Site, member: Option<Member>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                site,
                member,
                comments: Vec::new(),
                reports: Vec::new(),
                next_id: 1,
                clock: Utc::now(),
            }),
            page_size: MEMORY_PAGE_SIZE,
            replies_page_size: MEMORY_REPLIES_PAGE_SIZE,
            calls: AtomicUsize::new(0),
            fail_next: Mutex::new(None),
        }
    }

    pub fn with_page_sizes(mut self, page_size: u32, replies_page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self.replies_page_size = replies_page_size.max(1);
        self
    }

    /// Stores comments, flattening any nested replies.
    pub fn seed(&self, comments: Vec<Comment>) {
        let mut state = self.state.lock();
        for mut comment in comments {
            let replies = std::mem::take(&mut comment.replies);
            if comment.created_at > state.clock {
                state.clock = comment.created_at;
            }
            state.comments.push(comment);
            for reply in replies {
                if reply.created_at > state.clock {
                    state.clock = reply.created_at;
                }
                state.comments.push(Comment {
                    replies: Vec::new(),
                    ..reply
                });
            }
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn reports(&self) -> Vec<String> {
        self.state.lock().reports.clone()
    }

    /// Makes the next facade call fail with `message`.
    pub fn fail_next_call(&self, message: &str) {
        *self.fail_next.lock() = Some(message.to_string());
    }

    fn begin(&self, op: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.fail_next.lock().take() {
            bail!("{op}: {message}");
        }
        Ok(())
    }
}

impl MemoryState {
    fn position(&self, id: &str) -> Option<usize> {
        self.comments.iter().position(|c| c.id == id)
    }

    fn find(&self, id: &str) -> Result<&Comment> {
        self.comments
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| anyhow!("comment {id} not found"))
    }

    fn reply_count(&self, id: &str) -> i64 {
        self.comments
            .iter()
            .filter(|c| c.parent_id.as_deref() == Some(id))
            .count() as i64
    }

    fn replies_of(&self, id: &str) -> Vec<&Comment> {
        let mut replies: Vec<&Comment> = self
            .comments
            .iter()
            .filter(|c| c.parent_id.as_deref() == Some(id))
            .collect();
        replies.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
        replies
    }

    fn hydrate(&self, comment: &Comment) -> Comment {
        let mut out = comment.clone();
        out.counts.replies = self.reply_count(&comment.id);
        if comment.parent_id.is_none() {
            out.replies = self
                .replies_of(&comment.id)
                .into_iter()
                .take(MEMORY_EMBEDDED_REPLIES)
                .cloned()
                .collect();
        }
        out
    }

    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        self.clock = if now > self.clock {
            now
        } else {
            self.clock + ChronoDuration::milliseconds(1)
        };
        self.clock
    }
}

fn sort_key(comment: &Comment) -> (DateTime<Utc>, &str) {
    (comment.created_at, comment.id.as_str())
}

fn paginate(total: usize, page: u32, limit: u32) -> (std::ops::Range<usize>, Pagination) {
    let page = page.max(1);
    let limit = limit.max(1);
    let pages = total.div_ceil(limit as usize) as u32;
    let start = ((page - 1) as usize * limit as usize).min(total);
    let end = (start + limit as usize).min(total);
    let pagination = Pagination {
        page,
        limit,
        pages,
        total: total as u64,
        next: (page < pages).then_some(page + 1),
        prev: (page > 1).then_some(page - 1),
    };
    (start..end, pagination)
}

impl CommentApi for MemoryCommentApi {
    fn browse(&self, query: &BrowseQuery) -> Result<CommentPage> {
        self.begin("browse")?;
        let state = self.state.lock();
        let mut top: Vec<&Comment> = state
            .comments
            .iter()
            .filter(|c| c.parent_id.is_none())
            .filter(|c| c.post_id.as_deref().unwrap_or(&query.post_id) == query.post_id)
            .collect();
        top.sort_by(|a, b| sort_key(b).cmp(&sort_key(a)));

        if let Some(after) = query.after.as_deref() {
            let anchor = state.find(after).context("browse anchor")?;
            let anchor_key = sort_key(anchor);
            top.retain(|c| sort_key(c) < anchor_key);
        }
        if let Some(before) = query.before.as_deref() {
            let anchor = state.find(before).context("browse anchor")?;
            let anchor_key = sort_key(anchor);
            top.retain(|c| sort_key(c) > anchor_key);
        }
        if query.order == SortOrder::OldestFirst {
            top.reverse();
        }

        let (range, pagination) = paginate(top.len(), query.page, self.page_size);
        let comments = top[range].iter().map(|c| state.hydrate(c)).collect();
        Ok(CommentPage {
            comments,
            meta: PageMeta {
                pagination: Some(pagination),
            },
        })
    }

    fn count(&self, post_id: &str) -> Result<i64> {
        self.begin("count")?;
        let state = self.state.lock();
        let roots: HashMap<&str, &Comment> = state
            .comments
            .iter()
            .filter(|c| c.parent_id.is_none())
            .map(|c| (c.id.as_str(), c))
            .collect();
        let count = state
            .comments
            .iter()
            .filter(|c| c.status.is_published())
            .filter(|c| {
                let root = match c.parent_id.as_deref() {
                    Some(parent) => roots.get(parent).copied(),
                    None => Some(*c),
                };
                root.and_then(|r| r.post_id.as_deref())
                    .map(|p| p == post_id)
                    .unwrap_or(true)
            })
            .count();
        Ok(count as i64)
    }

    fn read(&self, comment_id: &str) -> Result<Comment> {
        self.begin("read")?;
        let state = self.state.lock();
        let comment = state.find(comment_id)?;
        Ok(state.hydrate(comment))
    }

    fn add(&self, comment: &NewComment) -> Result<Comment> {
        self.begin("add")?;
        let mut state = self.state.lock();
        if let Some(parent) = comment.parent_id.as_deref() {
            state.find(parent).context("reply parent")?;
        }
        let created_at = state.tick();
        let id = format!("{:024x}", state.next_id);
        state.next_id += 1;
        let stored = Comment {
            id,
            post_id: Some(comment.post_id.clone()),
            parent_id: comment.parent_id.clone(),
            status: Default::default(),
            html: comment.html.clone(),
            created_at,
            edited_at: None,
            member: state.member.clone(),
            liked: false,
            counts: Default::default(),
            replies: Vec::new(),
        };
        state.comments.push(stored.clone());
        Ok(Comment {
            member: None,
            ..stored
        })
    }

    fn edit(&self, edit: &CommentEdit) -> Result<Comment> {
        self.begin("edit")?;
        let mut state = self.state.lock();
        let now = state.tick();
        let index = state
            .position(&edit.id)
            .ok_or_else(|| anyhow!("comment {} not found", edit.id))?;
        let comment = &mut state.comments[index];
        if let Some(html) = edit.html.as_ref() {
            comment.html = html.clone();
            comment.edited_at = Some(now);
        }
        if let Some(status) = edit.status {
            comment.status = status;
        }
        let updated = state.comments[index].clone();
        Ok(Comment {
            counts: crate::model::Counts {
                replies: state.reply_count(&updated.id),
                ..updated.counts
            },
            ..updated
        })
    }

    fn like(&self, comment_id: &str) -> Result<()> {
        self.begin("like")?;
        let mut state = self.state.lock();
        let index = state
            .position(comment_id)
            .ok_or_else(|| anyhow!("comment {comment_id} not found"))?;
        let comment = &mut state.comments[index];
        if !comment.liked {
            comment.liked = true;
            comment.counts.likes += 1;
        }
        Ok(())
    }

    fn unlike(&self, comment_id: &str) -> Result<()> {
        self.begin("unlike")?;
        let mut state = self.state.lock();
        let index = state
            .position(comment_id)
            .ok_or_else(|| anyhow!("comment {comment_id} not found"))?;
        let comment = &mut state.comments[index];
        if comment.liked {
            comment.liked = false;
            comment.counts.likes -= 1;
        }
        Ok(())
    }

    fn report(&self, comment_id: &str) -> Result<()> {
        self.begin("report")?;
        let mut state = self.state.lock();
        state.find(comment_id)?;
        state.reports.push(comment_id.to_string());
        Ok(())
    }

    fn replies(&self, comment_id: &str, after: Option<&str>) -> Result<CommentPage> {
        self.begin("replies")?;
        let state = self.state.lock();
        state.find(comment_id)?;
        let mut replies = state.replies_of(comment_id);
        if let Some(after) = after {
            let anchor = state.find(after).context("replies anchor")?;
            let anchor_key = sort_key(anchor);
            replies.retain(|r| sort_key(r) > anchor_key);
        }
        let (range, pagination) = paginate(replies.len(), 1, self.replies_page_size);
        Ok(CommentPage {
            comments: replies[range].iter().map(|r| (*r).clone()).collect(),
            meta: PageMeta {
                pagination: Some(pagination),
            },
        })
    }
}

impl MemberApi for MemoryCommentApi {
    fn session(&self) -> Result<Session> {
        self.begin("session")?;
        let state = self.state.lock();
        Ok(Session {
            site: Some(state.site.clone()),
            member: state.member.clone(),
        })
    }

    fn update(&self, patch: &MemberPatch) -> Result<Option<Member>> {
        self.begin("update member")?;
        let mut state = self.state.lock();
        let Some(member) = state.member.as_mut() else {
            return Ok(None);
        };
        if let Some(name) = patch.name.as_ref() {
            member.name = Some(name.clone());
        }
        if let Some(bio) = patch.bio.as_ref() {
            member.bio = bio.clone();
        }
        let updated = member.clone();
        for comment in state.comments.iter_mut() {
            if let Some(author) = comment.member.as_mut() {
                if author.id == updated.id {
                    *author = updated.clone();
                }
            }
        }
        Ok(Some(updated))
    }
}
