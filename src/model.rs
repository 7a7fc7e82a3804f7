use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Member {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub expertise: Option<String>,
    #[serde(default, rename = "avatar_image")]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub paid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum CommentStatus {
    #[default]
    Published,
    Hidden,
    Deleted,
}

impl CommentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommentStatus::Published => "published",
            CommentStatus::Hidden => "hidden",
            CommentStatus::Deleted => "deleted",
        }
    }

    pub fn is_published(&self) -> bool {
        matches!(self, CommentStatus::Published)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Counts {
    #[serde(default)]
    pub likes: i64,
    #[serde(default)]
    pub replies: i64,
}

/// A comment as the members API returns it. `replies` is only populated on
/// the wire; once a comment enters a [`crate::thread::CommentTree`] its replies
/// live in the tree's index lists instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    #[serde(default)]
    pub post_id: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub status: CommentStatus,
    #[serde(default)]
    pub html: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub member: Option<Member>,
    #[serde(default)]
    pub liked: bool,
    #[serde(default, rename = "count")]
    pub counts: Counts,
    #[serde(default)]
    pub replies: Vec<Comment>,
}

impl Comment {
    pub fn is_reply(&self) -> bool {
        self.parent_id.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    #[serde(default)]
    pub pages: u32,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub next: Option<u32>,
    #[serde(default)]
    pub prev: Option<u32>,
}

impl Pagination {
    pub fn next_page(cursor: Option<&Pagination>) -> u32 {
        cursor.map(|p| p.page + 1).unwrap_or(1)
    }

    pub fn has_more(&self) -> bool {
        self.next.is_some() || self.page < self.pages
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PageMeta {
    #[serde(default)]
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CommentPage {
    #[serde(default)]
    pub comments: Vec<Comment>,
    #[serde(default)]
    pub meta: PageMeta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

impl SortOrder {
    pub fn as_param(&self) -> &'static str {
        match self {
            SortOrder::NewestFirst => "created_at desc",
            SortOrder::OldestFirst => "created_at asc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BrowseQuery {
    pub page: u32,
    pub post_id: String,
    /// Only comments older than this top-level comment.
    pub after: Option<String>,
    /// Only comments newer than this top-level comment.
    pub before: Option<String>,
    pub order: SortOrder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewComment {
    pub post_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub html: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentEdit {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CommentStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MemberPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// `Some(None)` clears the bio and is sent as an explicit `null`.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "explicit_null"
    )]
    pub bio: Option<Option<String>>,
}

/// Keeps a present `null` apart from a missing field: the former becomes
/// `Some(None)`, the latter falls back to `None` through `#[serde(default)]`.
pub(crate) fn explicit_null<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl MemberPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.bio.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default = "default_comments_enabled")]
    pub comments_enabled: String,
}

impl Default for Site {
    fn default() -> Self {
        Self {
            title: String::new(),
            url: String::new(),
            locale: None,
            comments_enabled: default_comments_enabled(),
        }
    }
}

fn default_comments_enabled() -> String {
    "all".into()
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Session {
    pub site: Option<Site>,
    pub member: Option<Member>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminUser {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
}

/// Deep-link anchor. Pagination is anchored on the top-level ancestor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FocusedComment {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
}

impl FocusedComment {
    pub fn ancestor_id(&self) -> &str {
        self.parent_id.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Popup {
    #[serde(rename_all = "camelCase")]
    AddDetails {
        #[serde(default)]
        expertise_autofocus: bool,
    },
    #[serde(rename_all = "camelCase")]
    Report {
        comment_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ConfirmDelete {
        comment_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Error,
    Success,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PopupNotification {
    pub kind: String,
    pub status: NotificationStatus,
    pub auto_hide: bool,
    pub closeable: bool,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub message: Option<String>,
    /// Bumped for every notification raised while another is still set, so
    /// presentation can replay the same kind twice.
    pub count: u32,
}

impl PopupNotification {
    pub fn failure(
        kind: impl Into<String>,
        message: impl Into<String>,
        duration: Duration,
        previous: Option<&PopupNotification>,
    ) -> Self {
        Self {
            kind: kind.into(),
            status: NotificationStatus::Error,
            auto_hide: true,
            closeable: true,
            duration,
            message: Some(message.into()),
            count: previous.map(|p| p.count + 1).unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitStatus {
    #[default]
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberUpdate {
    Saved,
    Failed { error: String },
}
