//! Comment tree and the thread snapshot the dispatcher patches.
//!
//! Comments are stored once, keyed by id. Top-level order lives in `roots`
//! (newest first, as fetched) and every top-level node keeps two ordered id
//! lists: `replies` (paginated, oldest first) and `appended` (created or
//! received locally, not yet covered by a reply page).

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::model::{
    AdminUser, Comment, CommentStatus, FocusedComment, InitStatus, Member, MemberUpdate,
    Pagination, Popup, PopupNotification, Site,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ThreadError {
    #[error("comment {0} is not loaded")]
    UnknownComment(String),
}

#[derive(Debug, Clone, PartialEq)]
struct Node {
    comment: Comment,
    replies: Vec<String>,
    appended: Vec<String>,
}

impl Node {
    fn new(comment: Comment) -> Self {
        Self {
            comment,
            replies: Vec::new(),
            appended: Vec::new(),
        }
    }
}

/// Outcome of merging a reply page into a comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyMerge {
    pub added: usize,
    pub caught_up: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommentTree {
    nodes: HashMap<String, Node>,
    roots: Vec<String>,
}

impl CommentTree {
    pub fn from_comments(comments: Vec<Comment>) -> Self {
        let mut tree = Self::default();
        tree.extend_older(comments);
        tree
    }

    /// Number of top-level comments.
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Comment> {
        self.nodes.get(id).map(|node| &node.comment)
    }

    pub fn top_level_ids(&self) -> &[String] {
        &self.roots
    }

    pub fn top_level(&self) -> impl Iterator<Item = &Comment> + '_ {
        self.roots.iter().filter_map(|id| self.get(id))
    }

    pub fn reply_ids(&self, id: &str) -> &[String] {
        self.nodes
            .get(id)
            .map(|node| node.replies.as_slice())
            .unwrap_or(&[])
    }

    pub fn appended_ids(&self, id: &str) -> &[String] {
        self.nodes
            .get(id)
            .map(|node| node.appended.as_slice())
            .unwrap_or(&[])
    }

    pub fn replies(&self, id: &str) -> Vec<&Comment> {
        self.reply_ids(id).iter().filter_map(|r| self.get(r)).collect()
    }

    pub fn appended_replies(&self, id: &str) -> Vec<&Comment> {
        self.appended_ids(id)
            .iter()
            .filter_map(|r| self.get(r))
            .collect()
    }

    /// The last reply loaded through pagination, which anchors the next page.
    pub fn last_reply_id(&self, id: &str) -> Option<&str> {
        self.reply_ids(id).last().map(String::as_str)
    }

    pub fn top_level_ancestor<'a>(&'a self, id: &'a str) -> Option<&'a str> {
        let comment = self.get(id)?;
        match comment.parent_id.as_deref() {
            Some(parent) if self.contains(parent) => Some(parent),
            Some(_) => None,
            None => Some(id),
        }
    }

    /// Adds a top-level comment (and its embedded replies) to the arena
    /// without placing it in `roots`.
    fn ingest(&mut self, mut comment: Comment) -> String {
        let id = comment.id.clone();
        let embedded = std::mem::take(&mut comment.replies);
        let mut node = Node::new(comment);
        for mut reply in embedded {
            reply.replies.clear();
            if node.replies.contains(&reply.id) {
                continue;
            }
            node.replies.push(reply.id.clone());
            self.nodes.insert(reply.id.clone(), Node::new(reply));
        }
        self.nodes.insert(id.clone(), node);
        id
    }

    /// Appends strictly older comments at the tail. Ids already present are
    /// skipped so the list never holds duplicates.
    pub fn extend_older(&mut self, comments: Vec<Comment>) -> usize {
        let mut added = 0;
        for comment in comments {
            if self.contains(&comment.id) {
                debug!(id = %comment.id, "skipping duplicate older comment");
                continue;
            }
            let id = self.ingest(comment);
            self.roots.push(id);
            added += 1;
        }
        added
    }

    /// Inserts a block of newer comments, already in newest-first order, in
    /// front of every existing entry.
    pub fn prepend_newer(&mut self, comments: Vec<Comment>) -> usize {
        let mut block = Vec::with_capacity(comments.len());
        for comment in comments {
            if self.contains(&comment.id) {
                debug!(id = %comment.id, "skipping duplicate newer comment");
                continue;
            }
            block.push(self.ingest(comment));
        }
        let added = block.len();
        block.extend(std::mem::take(&mut self.roots));
        self.roots = block;
        added
    }

    pub fn insert_top_level(&mut self, comment: Comment) {
        if self.contains(&comment.id) {
            return;
        }
        let id = self.ingest(comment);
        self.roots.insert(0, id);
    }

    /// Records a locally created reply and bumps the parent's reply total.
    pub fn append_reply(&mut self, parent_id: &str, mut reply: Comment) -> Result<(), ThreadError> {
        if !self.nodes.contains_key(parent_id) {
            return Err(ThreadError::UnknownComment(parent_id.to_string()));
        }
        reply.replies.clear();
        let reply_id = reply.id.clone();
        self.nodes.insert(reply_id.clone(), Node::new(reply));
        let parent = self
            .nodes
            .get_mut(parent_id)
            .ok_or_else(|| ThreadError::UnknownComment(parent_id.to_string()))?;
        if !parent.replies.contains(&reply_id) && !parent.appended.contains(&reply_id) {
            parent.appended.push(reply_id);
            parent.comment.counts.replies += 1;
        }
        Ok(())
    }

    /// Merges a fetched reply page: appended entries the page now covers are
    /// dropped from the pending bucket, and the page is appended to `replies`.
    pub fn extend_replies(
        &mut self,
        parent_id: &str,
        page: Vec<Comment>,
    ) -> Result<ReplyMerge, ThreadError> {
        if !self.nodes.contains_key(parent_id) {
            return Err(ThreadError::UnknownComment(parent_id.to_string()));
        }
        let fetched: HashSet<String> = page.iter().map(|r| r.id.clone()).collect();
        let mut ids = Vec::with_capacity(page.len());
        for mut reply in page {
            reply.replies.clear();
            ids.push(reply.id.clone());
            self.nodes.insert(reply.id.clone(), Node::new(reply));
        }

        let parent = self
            .nodes
            .get_mut(parent_id)
            .ok_or_else(|| ThreadError::UnknownComment(parent_id.to_string()))?;
        let before = parent.appended.len();
        parent.appended.retain(|id| !fetched.contains(id));
        let caught_up = before - parent.appended.len();

        let mut added = 0;
        for id in ids {
            if parent.replies.contains(&id) {
                continue;
            }
            parent.replies.push(id);
            added += 1;
        }
        Ok(ReplyMerge { added, caught_up })
    }

    /// Sets the status of any loaded comment, returning the previous one.
    pub fn set_status(&mut self, id: &str, status: CommentStatus) -> Option<CommentStatus> {
        let node = self.nodes.get_mut(id)?;
        let previous = node.comment.status;
        node.comment.status = status;
        Some(previous)
    }

    /// Flips the viewer's like. Returns false when the comment is unknown or
    /// already in the requested state.
    pub fn set_liked(&mut self, id: &str, liked: bool) -> bool {
        let Some(node) = self.nodes.get_mut(id) else {
            return false;
        };
        if node.comment.liked == liked {
            return false;
        }
        node.comment.liked = liked;
        node.comment.counts.likes += if liked { 1 } else { -1 };
        true
    }

    /// Swaps in a canonical record for a loaded comment, keeping its reply
    /// lists and, when the record lacks one, its member.
    pub fn replace(&mut self, mut comment: Comment) -> bool {
        let Some(node) = self.nodes.get_mut(&comment.id) else {
            return false;
        };
        comment.replies.clear();
        if comment.member.is_none() {
            comment.member = node.comment.member.take();
        }
        node.comment = comment;
        true
    }

    /// Rebuilds wire-shaped comments, replies first and then pending ones.
    pub fn to_nested(&self) -> Vec<Comment> {
        self.top_level()
            .map(|comment| {
                let mut out = comment.clone();
                out.replies = self
                    .replies(&comment.id)
                    .into_iter()
                    .chain(self.appended_replies(&comment.id))
                    .cloned()
                    .collect();
                out
            })
            .collect()
    }
}

/// Immutable snapshot of everything the widget renders.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThreadState {
    pub post_id: String,
    pub site: Option<Site>,
    pub member: Option<Member>,
    pub admin: Option<AdminUser>,
    pub comments: CommentTree,
    pub pagination: Option<Pagination>,
    pub future_pagination: Option<Pagination>,
    pub comment_count: i64,
    pub focused: Option<FocusedComment>,
    pub popup: Option<Popup>,
    pub popup_notification: Option<PopupNotification>,
    pub init_status: InitStatus,
    pub member_update: Option<MemberUpdate>,
}

impl ThreadState {
    pub fn new(post_id: impl Into<String>, focused: Option<FocusedComment>) -> Self {
        Self {
            post_id: post_id.into(),
            focused,
            ..Default::default()
        }
    }

    /// Author shown for a comment. The signed-in member wins over the copy
    /// embedded in their own comments, so profile edits show up everywhere.
    pub fn author<'a>(&'a self, comment: &'a Comment) -> Option<&'a Member> {
        let embedded = comment.member.as_ref()?;
        match self.member.as_ref() {
            Some(current) if current.id == embedded.id => Some(current),
            _ => Some(embedded),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.admin.is_some()
    }

    pub fn merge(&self, patch: Patch) -> ThreadState {
        self.clone().apply(patch)
    }

    pub fn apply(mut self, patch: Patch) -> ThreadState {
        if let Some(comments) = patch.comments {
            self.comments = comments;
        }
        if let Some(pagination) = patch.pagination {
            self.pagination = Some(pagination);
        }
        if let Some(pagination) = patch.future_pagination {
            self.future_pagination = Some(pagination);
        }
        if let Some(count) = patch.comment_count {
            self.comment_count = count;
        }
        if let Some(site) = patch.site {
            self.site = Some(site);
        }
        if let Some(member) = patch.member {
            self.member = Some(member);
        }
        if let Some(admin) = patch.admin {
            self.admin = admin;
        }
        if let Some(popup) = patch.popup {
            self.popup = popup;
        }
        if let Some(notification) = patch.popup_notification {
            self.popup_notification = notification;
        }
        if let Some(status) = patch.init_status {
            self.init_status = status;
        }
        if let Some(update) = patch.member_update {
            self.member_update = Some(update);
        }
        self
    }
}

/// Partial state produced by a handler. `None` leaves a field untouched;
/// the nested options clear a field when set to `Some(None)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    pub comments: Option<CommentTree>,
    pub pagination: Option<Pagination>,
    pub future_pagination: Option<Pagination>,
    pub comment_count: Option<i64>,
    pub site: Option<Site>,
    pub member: Option<Member>,
    pub admin: Option<Option<AdminUser>>,
    pub popup: Option<Option<Popup>>,
    pub popup_notification: Option<Option<PopupNotification>>,
    pub init_status: Option<InitStatus>,
    pub member_update: Option<MemberUpdate>,
}

impl Patch {
    pub fn is_failure(&self) -> bool {
        matches!(self.member_update, Some(MemberUpdate::Failed { .. }))
            || matches!(self.init_status, Some(InitStatus::Failed))
    }
}
