//! Intent handlers. Each handler reads a snapshot, calls the facades and
//! returns a [`Patch`]; nothing here mutates shared state, so a failed call
//! leaves the thread exactly as it was.

use std::fmt;
use std::str::FromStr;
use std::thread;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::api::Services;
use crate::model::{
    BrowseQuery, CommentEdit, CommentStatus, InitStatus, MemberPatch, MemberUpdate, NewComment,
    Pagination, Popup, SortOrder,
};
use crate::thread::{CommentTree, Patch, ThreadError, ThreadState};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown action {0:?}")]
pub struct UnknownAction(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Init,
    InitAdmin,
    LoadMoreComments,
    LoadFutureComments,
    LoadMoreReplies,
    AddComment,
    AddReply,
    EditComment,
    DeleteComment,
    HideComment,
    ShowComment,
    LikeComment,
    UnlikeComment,
    ReportComment,
    UpdateMember,
    OpenPopup,
    ClosePopup,
}

const ALL_KINDS: [ActionKind; 17] = [
    ActionKind::Init,
    ActionKind::InitAdmin,
    ActionKind::LoadMoreComments,
    ActionKind::LoadFutureComments,
    ActionKind::LoadMoreReplies,
    ActionKind::AddComment,
    ActionKind::AddReply,
    ActionKind::EditComment,
    ActionKind::DeleteComment,
    ActionKind::HideComment,
    ActionKind::ShowComment,
    ActionKind::LikeComment,
    ActionKind::UnlikeComment,
    ActionKind::ReportComment,
    ActionKind::UpdateMember,
    ActionKind::OpenPopup,
    ActionKind::ClosePopup,
];

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Init => "init",
            ActionKind::InitAdmin => "initAdmin",
            ActionKind::LoadMoreComments => "loadMoreComments",
            ActionKind::LoadFutureComments => "loadFutureComments",
            ActionKind::LoadMoreReplies => "loadMoreReplies",
            ActionKind::AddComment => "addComment",
            ActionKind::AddReply => "addReply",
            ActionKind::EditComment => "editComment",
            ActionKind::DeleteComment => "deleteComment",
            ActionKind::HideComment => "hideComment",
            ActionKind::ShowComment => "showComment",
            ActionKind::LikeComment => "likeComment",
            ActionKind::UnlikeComment => "unlikeComment",
            ActionKind::ReportComment => "reportComment",
            ActionKind::UpdateMember => "updateMember",
            ActionKind::OpenPopup => "openPopup",
            ActionKind::ClosePopup => "closePopup",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_KINDS
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownAction(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "camelCase")]
pub enum Action {
    Init,
    InitAdmin,
    LoadMoreComments,
    LoadFutureComments,
    #[serde(rename_all = "camelCase")]
    LoadMoreReplies { comment_id: String },
    AddComment { html: String },
    #[serde(rename_all = "camelCase")]
    AddReply { parent_id: String, html: String },
    #[serde(rename_all = "camelCase")]
    EditComment { comment_id: String, html: String },
    #[serde(rename_all = "camelCase")]
    DeleteComment { comment_id: String },
    #[serde(rename_all = "camelCase")]
    HideComment { comment_id: String },
    #[serde(rename_all = "camelCase")]
    ShowComment { comment_id: String },
    #[serde(rename_all = "camelCase")]
    LikeComment { comment_id: String },
    #[serde(rename_all = "camelCase")]
    UnlikeComment { comment_id: String },
    #[serde(rename_all = "camelCase")]
    ReportComment { comment_id: String },
    UpdateMember {
        #[serde(default)]
        name: Option<String>,
        #[serde(default, deserialize_with = "crate::model::explicit_null")]
        bio: Option<Option<String>>,
    },
    OpenPopup(Popup),
    ClosePopup,
}

impl Action {
    /// Builds an action from an intent name and its JSON payload.
    pub fn from_intent(name: &str, payload: Option<Value>) -> Result<Action> {
        let kind: ActionKind = name.parse()?;
        let envelope = match payload {
            Some(data) => json!({"action": kind.as_str(), "data": data}),
            None => json!({"action": kind.as_str()}),
        };
        serde_json::from_value(envelope).with_context(|| format!("invalid payload for {kind}"))
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Init => ActionKind::Init,
            Action::InitAdmin => ActionKind::InitAdmin,
            Action::LoadMoreComments => ActionKind::LoadMoreComments,
            Action::LoadFutureComments => ActionKind::LoadFutureComments,
            Action::LoadMoreReplies { .. } => ActionKind::LoadMoreReplies,
            Action::AddComment { .. } => ActionKind::AddComment,
            Action::AddReply { .. } => ActionKind::AddReply,
            Action::EditComment { .. } => ActionKind::EditComment,
            Action::DeleteComment { .. } => ActionKind::DeleteComment,
            Action::HideComment { .. } => ActionKind::HideComment,
            Action::ShowComment { .. } => ActionKind::ShowComment,
            Action::LikeComment { .. } => ActionKind::LikeComment,
            Action::UnlikeComment { .. } => ActionKind::UnlikeComment,
            Action::ReportComment { .. } => ActionKind::ReportComment,
            Action::UpdateMember { .. } => ActionKind::UpdateMember,
            Action::OpenPopup(_) => ActionKind::OpenPopup,
            Action::ClosePopup => ActionKind::ClosePopup,
        }
    }
}

/// Runs one intent against a snapshot. `Ok(None)` is a no-op.
pub fn handle(action: &Action, state: &ThreadState, services: &Services) -> Result<Option<Patch>> {
    match action {
        Action::Init => init(state, services),
        Action::InitAdmin => init_admin(services),
        Action::LoadMoreComments => load_more_comments(state, services),
        Action::LoadFutureComments => load_future_comments(state, services),
        Action::LoadMoreReplies { comment_id } => load_more_replies(state, services, comment_id),
        Action::AddComment { html } => add_comment(state, services, html),
        Action::AddReply { parent_id, html } => add_reply(state, services, parent_id, html),
        Action::EditComment { comment_id, html } => edit_comment(state, services, comment_id, html),
        Action::DeleteComment { comment_id } => delete_comment(state, services, comment_id),
        Action::HideComment { comment_id } => {
            services.admin()?.hide_comment(comment_id)?;
            Ok(Some(set_status(state, comment_id, CommentStatus::Hidden)))
        }
        Action::ShowComment { comment_id } => {
            services.admin()?.show_comment(comment_id)?;
            Ok(Some(set_status(state, comment_id, CommentStatus::Published)))
        }
        Action::LikeComment { comment_id } => {
            services.comments.like(comment_id).context("like comment")?;
            Ok(Some(set_liked(state, comment_id, true)))
        }
        Action::UnlikeComment { comment_id } => {
            services.comments.unlike(comment_id).context("unlike comment")?;
            Ok(Some(set_liked(state, comment_id, false)))
        }
        Action::ReportComment { comment_id } => {
            services.comments.report(comment_id).context("report comment")?;
            Ok(Some(Patch::default()))
        }
        Action::UpdateMember { name, bio } => {
            let bio = bio.as_ref().map(|bio| bio.as_deref());
            Ok(update_member(state, services, name.as_deref(), bio))
        }
        Action::OpenPopup(popup) => Ok(Some(Patch {
            popup: Some(Some(popup.clone())),
            ..Default::default()
        })),
        Action::ClosePopup => Ok(Some(Patch {
            popup: Some(None),
            ..Default::default()
        })),
    }
}

fn joined<T>(handle: thread::ScopedJoinHandle<'_, Result<T>>) -> Result<T> {
    handle
        .join()
        .map_err(|_| anyhow!("facade call panicked"))?
}

fn init(state: &ThreadState, services: &Services) -> Result<Option<Patch>> {
    let anchor = state.focused.as_ref().map(|f| f.ancestor_id().to_string());
    let query = BrowseQuery {
        page: 1,
        post_id: state.post_id.clone(),
        after: anchor.clone(),
        ..Default::default()
    };

    let loaded = thread::scope(|scope| {
        let session = scope.spawn(|| services.members.session());
        let count = scope.spawn(|| services.comments.count(&state.post_id));
        let focused = anchor
            .as_deref()
            .map(|id| scope.spawn(move || services.comments.read(id)));
        let page = services.comments.browse(&query);
        let session = joined(session);
        let count = joined(count);
        let focused = focused.map(joined).transpose();
        (session, page, count, focused)
    });

    let (session, page, count, focused) = match loaded {
        (Ok(session), Ok(page), Ok(count), Ok(focused)) => (session, page, count, focused),
        (session, page, count, focused) => {
            let err = session
                .err()
                .or(page.err())
                .or(count.err())
                .or(focused.err())
                .unwrap_or_else(|| anyhow!("initialisation failed"));
            error!(error = %format!("{err:#}"), "failed to initialise comments");
            return Ok(Some(Patch {
                init_status: Some(InitStatus::Failed),
                ..Default::default()
            }));
        }
    };

    let mut comments = CommentTree::default();
    if let Some(focused) = focused {
        comments.extend_older(vec![focused]);
    }
    comments.extend_older(page.comments);

    Ok(Some(Patch {
        comments: Some(comments),
        pagination: Some(page.meta.pagination.unwrap_or(Pagination {
            page: 1,
            ..Default::default()
        })),
        comment_count: Some(count),
        site: session.site,
        member: session.member,
        init_status: Some(InitStatus::Success),
        ..Default::default()
    }))
}

fn init_admin(services: &Services) -> Result<Option<Patch>> {
    let Some(admin) = services.admin.as_ref() else {
        return Ok(None);
    };
    match admin.current_user() {
        Ok(user) => Ok(Some(Patch {
            admin: Some(user),
            ..Default::default()
        })),
        Err(err) => {
            warn!(error = %format!("{err:#}"), "failed to fetch current admin user");
            Ok(None)
        }
    }
}

fn load_more_comments(state: &ThreadState, services: &Services) -> Result<Option<Patch>> {
    let page = Pagination::next_page(state.pagination.as_ref());
    let query = BrowseQuery {
        page,
        post_id: state.post_id.clone(),
        after: state.focused.as_ref().map(|f| f.ancestor_id().to_string()),
        before: None,
        order: SortOrder::NewestFirst,
    };
    let data = services
        .comments
        .browse(&query)
        .context("load older comments")?;

    let mut comments = state.comments.clone();
    let added = comments.extend_older(data.comments);
    debug!(page, added, "loaded older comments");

    Ok(Some(Patch {
        comments: Some(comments),
        pagination: Some(data.meta.pagination.unwrap_or(Pagination {
            page,
            ..Default::default()
        })),
        ..Default::default()
    }))
}

fn load_future_comments(state: &ThreadState, services: &Services) -> Result<Option<Patch>> {
    let Some(focused) = state.focused.as_ref() else {
        debug!("newer comments are only paged around a focused comment");
        return Ok(None);
    };
    let page = Pagination::next_page(state.future_pagination.as_ref());
    let query = BrowseQuery {
        page,
        post_id: state.post_id.clone(),
        after: None,
        before: Some(focused.ancestor_id().to_string()),
        order: SortOrder::OldestFirst,
    };
    let mut data = services
        .comments
        .browse(&query)
        .context("load newer comments")?;
    data.comments.reverse();

    let mut comments = state.comments.clone();
    let added = comments.prepend_newer(data.comments);
    debug!(page, added, "loaded newer comments");

    Ok(Some(Patch {
        comments: Some(comments),
        future_pagination: Some(data.meta.pagination.unwrap_or(Pagination {
            page,
            ..Default::default()
        })),
        ..Default::default()
    }))
}

fn load_more_replies(
    state: &ThreadState,
    services: &Services,
    comment_id: &str,
) -> Result<Option<Patch>> {
    if !state.comments.contains(comment_id) {
        return Err(ThreadError::UnknownComment(comment_id.to_string()).into());
    }
    let after = state.comments.last_reply_id(comment_id);
    let data = services
        .comments
        .replies(comment_id, after)
        .context("load replies")?;

    let mut comments = state.comments.clone();
    let merge = comments.extend_replies(comment_id, data.comments)?;
    debug!(
        comment_id,
        added = merge.added,
        caught_up = merge.caught_up,
        "loaded replies"
    );

    Ok(Some(Patch {
        comments: Some(comments),
        ..Default::default()
    }))
}

fn add_comment(state: &ThreadState, services: &Services, html: &str) -> Result<Option<Patch>> {
    let mut created = services
        .comments
        .add(&NewComment {
            post_id: state.post_id.clone(),
            parent_id: None,
            html: html.to_string(),
        })
        .context("add comment")?;
    if created.member.is_none() {
        created.member = state.member.clone();
    }

    let mut comments = state.comments.clone();
    comments.insert_top_level(created);

    Ok(Some(Patch {
        comments: Some(comments),
        comment_count: Some(state.comment_count + 1),
        ..Default::default()
    }))
}

fn add_reply(
    state: &ThreadState,
    services: &Services,
    parent_id: &str,
    html: &str,
) -> Result<Option<Patch>> {
    let target = state
        .comments
        .top_level_ancestor(parent_id)
        .ok_or_else(|| ThreadError::UnknownComment(parent_id.to_string()))?
        .to_string();

    let mut created = services
        .comments
        .add(&NewComment {
            post_id: state.post_id.clone(),
            parent_id: Some(target.clone()),
            html: html.to_string(),
        })
        .context("add reply")?;
    if created.member.is_none() {
        created.member = state.member.clone();
    }

    let mut comments = state.comments.clone();
    comments.append_reply(&target, created)?;

    Ok(Some(Patch {
        comments: Some(comments),
        comment_count: Some(state.comment_count + 1),
        ..Default::default()
    }))
}

fn edit_comment(
    state: &ThreadState,
    services: &Services,
    comment_id: &str,
    html: &str,
) -> Result<Option<Patch>> {
    let updated = services
        .comments
        .edit(&CommentEdit {
            id: comment_id.to_string(),
            html: Some(html.to_string()),
            status: None,
        })
        .context("edit comment")?;

    let mut comments = state.comments.clone();
    if !comments.replace(updated) {
        debug!(comment_id, "edited comment is not loaded");
    }
    Ok(Some(Patch {
        comments: Some(comments),
        ..Default::default()
    }))
}

fn delete_comment(
    state: &ThreadState,
    services: &Services,
    comment_id: &str,
) -> Result<Option<Patch>> {
    services
        .comments
        .edit(&CommentEdit {
            id: comment_id.to_string(),
            html: None,
            status: Some(CommentStatus::Deleted),
        })
        .context("delete comment")?;
    Ok(Some(set_status(state, comment_id, CommentStatus::Deleted)))
}

/// Counter change for a status transition; only moves into or out of
/// `published` count.
fn count_delta(previous: Option<CommentStatus>, next: CommentStatus) -> i64 {
    match previous {
        Some(prev) if prev.is_published() && !next.is_published() => -1,
        Some(prev) if !prev.is_published() && next.is_published() => 1,
        _ => 0,
    }
}

fn set_status(state: &ThreadState, comment_id: &str, status: CommentStatus) -> Patch {
    let mut comments = state.comments.clone();
    let previous = comments.set_status(comment_id, status);
    if previous.is_none() {
        debug!(comment_id, status = status.as_str(), "status change for unloaded comment");
    }
    Patch {
        comments: Some(comments),
        comment_count: Some(state.comment_count + count_delta(previous, status)),
        ..Default::default()
    }
}

fn set_liked(state: &ThreadState, comment_id: &str, liked: bool) -> Patch {
    let mut comments = state.comments.clone();
    comments.set_liked(comment_id, liked);
    Patch {
        comments: Some(comments),
        ..Default::default()
    }
}

/// Minimal member patch: only fields that differ from the current member.
/// `bio` is `Some(None)` when the caller asked to clear it.
pub fn member_changes(
    state: &ThreadState,
    name: Option<&str>,
    bio: Option<Option<&str>>,
) -> MemberPatch {
    let current = state.member.as_ref();
    let mut patch = MemberPatch::default();
    if let Some(name) = name.filter(|n| !n.is_empty()) {
        if current.and_then(|m| m.name.as_deref()) != Some(name) {
            patch.name = Some(name.to_string());
        }
    }
    if let Some(bio) = bio {
        if current.and_then(|m| m.bio.as_deref()) != bio {
            patch.bio = Some(bio.map(str::to_string));
        }
    }
    patch
}

fn update_member(
    state: &ThreadState,
    services: &Services,
    name: Option<&str>,
    bio: Option<Option<&str>>,
) -> Option<Patch> {
    let changes = member_changes(state, name, bio);
    if changes.is_empty() {
        return None;
    }

    let failed = |error: String| Patch {
        member_update: Some(MemberUpdate::Failed { error }),
        ..Default::default()
    };

    match services.members.update(&changes) {
        Ok(Some(member)) => Some(Patch {
            member: Some(member),
            member_update: Some(MemberUpdate::Saved),
            ..Default::default()
        }),
        Ok(None) => Some(failed("failed to update member".to_string())),
        Err(err) => Some(failed(format!("{err:#}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MemoryCommentApi;
    use crate::model::{Comment, FocusedComment, Member, Site};
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Arc;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap()
    }

    fn comment(id: &str, minute: u32, parent: Option<&str>) -> Comment {
        Comment {
            id: id.into(),
            post_id: Some("post".into()),
            parent_id: parent.map(Into::into),
            status: CommentStatus::Published,
            html: String::new(),
            created_at: at(minute),
            edited_at: None,
            member: None,
            liked: false,
            counts: Default::default(),
            replies: Vec::new(),
        }
    }

    fn member() -> Member {
        Member {
            id: "m1".into(),
            name: Some("Ada".into()),
            bio: Some("engineer".into()),
            ..Default::default()
        }
    }

    fn setup(seed: Vec<Comment>) -> (Arc<MemoryCommentApi>, Services) {
        let api = Arc::new(
            MemoryCommentApi::new(Site::default(), Some(member())).with_page_sizes(2, 10),
        );
        api.seed(seed);
        let services = Services::new(api.clone(), api.clone());
        (api, services)
    }

    fn run(action: Action, state: &ThreadState, services: &Services) -> ThreadState {
        match handle(&action, state, services).unwrap() {
            Some(patch) => state.merge(patch),
            None => state.clone(),
        }
    }

    fn top_ids(state: &ThreadState) -> Vec<String> {
        state.comments.top_level_ids().to_vec()
    }

    #[test]
    fn intent_names_round_trip() {
        for kind in ALL_KINDS {
            assert_eq!(kind.as_str().parse::<ActionKind>().unwrap(), kind);
        }
        assert_eq!(
            "doSomething".parse::<ActionKind>().unwrap_err(),
            UnknownAction("doSomething".into())
        );
    }

    #[test]
    fn from_intent_decodes_payloads() {
        let action =
            Action::from_intent("addReply", Some(json!({"parentId": "p", "html": "<p>x</p>"})))
                .unwrap();
        assert_eq!(
            action,
            Action::AddReply {
                parent_id: "p".into(),
                html: "<p>x</p>".into()
            }
        );
        let popup = Action::from_intent(
            "openPopup",
            Some(json!({"type": "report", "commentId": "c1"})),
        )
        .unwrap();
        assert_eq!(
            popup,
            Action::OpenPopup(Popup::Report {
                comment_id: "c1".into()
            })
        );
        assert_eq!(
            Action::from_intent("closePopup", None).unwrap(),
            Action::ClosePopup
        );
        assert!(Action::from_intent("bogus", None).is_err());
    }

    #[test]
    fn init_loads_first_page_count_and_session() {
        let (_api, services) = setup(vec![
            comment("a", 1, None),
            comment("b", 2, None),
            comment("c", 3, None),
        ]);
        let state = run(Action::Init, &ThreadState::new("post", None), &services);
        assert_eq!(state.init_status, InitStatus::Success);
        assert_eq!(top_ids(&state), vec!["c", "b"]);
        assert_eq!(state.comment_count, 3);
        assert_eq!(state.member.as_ref().unwrap().id, "m1");
        assert_eq!(state.pagination.unwrap().page, 1);
    }

    #[test]
    fn init_failure_marks_status_failed() {
        let (api, services) = setup(vec![comment("a", 1, None)]);
        api.fail_next_call("offline");
        let patch = handle(&Action::Init, &ThreadState::new("post", None), &services)
            .unwrap()
            .unwrap();
        assert!(patch.is_failure());
        assert!(patch.comments.is_none());
    }

    #[test]
    fn load_more_comments_pages_older_without_duplicates() {
        let (_api, services) = setup((1..=5).map(|m| comment(&format!("c{m}"), m, None)).collect());
        let mut state = run(Action::Init, &ThreadState::new("post", None), &services);
        state = run(Action::LoadMoreComments, &state, &services);
        state = run(Action::LoadMoreComments, &state, &services);
        assert_eq!(top_ids(&state), vec!["c5", "c4", "c3", "c2", "c1"]);
        assert_eq!(state.pagination.unwrap().page, 3);
        assert!(!state.pagination.unwrap().has_more());
    }

    #[test]
    fn focused_comment_anchors_both_directions() {
        let (_api, services) = setup((1..=6).map(|m| comment(&format!("c{m}"), m, None)).collect());
        let focused = FocusedComment {
            id: "c4".into(),
            parent_id: None,
        };
        let mut state = run(Action::Init, &ThreadState::new("post", Some(focused)), &services);
        assert_eq!(top_ids(&state), vec!["c4", "c3", "c2"]);

        state = run(Action::LoadFutureComments, &state, &services);
        assert_eq!(top_ids(&state), vec!["c6", "c5", "c4", "c3", "c2"]);
        assert_eq!(state.future_pagination.unwrap().page, 1);

        state = run(Action::LoadMoreComments, &state, &services);
        assert_eq!(top_ids(&state), vec!["c6", "c5", "c4", "c3", "c2", "c1"]);
    }

    #[test]
    fn future_comments_without_focus_is_noop() {
        let (api, services) = setup(vec![comment("a", 1, None)]);
        let state = ThreadState::new("post", None);
        let before = api.call_count();
        assert!(handle(&Action::LoadFutureComments, &state, &services)
            .unwrap()
            .is_none());
        assert_eq!(api.call_count(), before);
    }

    #[test]
    fn add_reply_goes_to_appended_then_reconciles() {
        let mut parent = comment("p", 1, None);
        parent.replies = vec![comment("r1", 2, Some("p"))];
        let (_api, services) = setup(vec![parent]);
        let mut state = run(Action::Init, &ThreadState::new("post", None), &services);
        let count = state.comment_count;

        state = run(
            Action::AddReply {
                parent_id: "r1".into(),
                html: "<p>mine</p>".into(),
            },
            &state,
            &services,
        );
        assert_eq!(state.comment_count, count + 1);
        let appended = state.comments.appended_ids("p").to_vec();
        assert_eq!(appended.len(), 1);
        let reply = state.comments.get(&appended[0]).unwrap();
        assert_eq!(reply.member.as_ref().unwrap().id, "m1");
        assert_eq!(reply.parent_id.as_deref(), Some("p"));
        assert_eq!(state.comments.get("p").unwrap().counts.replies, 2);

        state = run(
            Action::LoadMoreReplies {
                comment_id: "p".into(),
            },
            &state,
            &services,
        );
        assert!(state.comments.appended_ids("p").is_empty());
        assert_eq!(state.comments.reply_ids("p").len(), 2);
        assert_eq!(state.comments.reply_ids("p")[1], appended[0]);
    }

    #[test]
    fn reply_to_unloaded_comment_fails_before_network() {
        let (api, services) = setup(Vec::new());
        let state = ThreadState::new("post", None);
        let calls = api.call_count();
        let result = handle(
            &Action::AddReply {
                parent_id: "ghost".into(),
                html: "x".into(),
            },
            &state,
            &services,
        );
        assert!(result.is_err());
        assert_eq!(api.call_count(), calls);
    }

    #[test]
    fn add_then_delete_restores_count() {
        let (_api, services) = setup(vec![comment("a", 1, None)]);
        let state = run(Action::Init, &ThreadState::new("post", None), &services);
        let before = state.comment_count;
        let added = run(
            Action::AddComment {
                html: "<p>new</p>".into(),
            },
            &state,
            &services,
        );
        assert_eq!(added.comment_count, before + 1);
        let new_id = added.comments.top_level_ids()[0].clone();
        assert_eq!(
            added.comments.get(&new_id).unwrap().member.as_ref().unwrap().id,
            "m1"
        );

        let deleted = run(
            Action::DeleteComment {
                comment_id: new_id.clone(),
            },
            &added,
            &services,
        );
        assert_eq!(deleted.comment_count, before);
        assert_eq!(
            deleted.comments.get(&new_id).unwrap().status,
            CommentStatus::Deleted
        );
        // deleting twice does not double count
        let again = run(Action::DeleteComment { comment_id: new_id }, &deleted, &services);
        assert_eq!(again.comment_count, before);
    }

    #[test]
    fn like_and_unlike_reply() {
        let mut parent = comment("p", 1, None);
        parent.replies = vec![comment("r1", 2, Some("p"))];
        let (_api, services) = setup(vec![parent]);
        let state = run(Action::Init, &ThreadState::new("post", None), &services);
        let liked = run(
            Action::LikeComment {
                comment_id: "r1".into(),
            },
            &state,
            &services,
        );
        let reply = liked.comments.get("r1").unwrap();
        assert!(reply.liked);
        assert_eq!(reply.counts.likes, 1);
        let unliked = run(
            Action::UnlikeComment {
                comment_id: "r1".into(),
            },
            &liked,
            &services,
        );
        assert_eq!(unliked.comments.get("r1").unwrap().counts.likes, 0);
    }

    #[test]
    fn edit_replaces_with_canonical_record() {
        let (_api, services) = setup(vec![comment("a", 1, None)]);
        let state = run(Action::Init, &ThreadState::new("post", None), &services);
        let edited = run(
            Action::EditComment {
                comment_id: "a".into(),
                html: "<p>edited</p>".into(),
            },
            &state,
            &services,
        );
        let a = edited.comments.get("a").unwrap();
        assert_eq!(a.html, "<p>edited</p>");
        assert!(a.edited_at.is_some());
    }

    #[test]
    fn hide_without_admin_fails() {
        let (_api, services) = setup(vec![comment("a", 1, None)]);
        let state = run(Action::Init, &ThreadState::new("post", None), &services);
        let result = handle(
            &Action::HideComment {
                comment_id: "a".into(),
            },
            &state,
            &services,
        );
        assert!(result.is_err());
    }

    #[test]
    fn report_changes_nothing() {
        let (api, services) = setup(vec![comment("a", 1, None)]);
        let state = run(Action::Init, &ThreadState::new("post", None), &services);
        let patch = handle(
            &Action::ReportComment {
                comment_id: "a".into(),
            },
            &state,
            &services,
        )
        .unwrap()
        .unwrap();
        assert_eq!(patch, Patch::default());
        assert_eq!(api.reports(), vec!["a".to_string()]);
    }

    #[test]
    fn update_member_without_changes_is_noop() {
        let (api, services) = setup(Vec::new());
        let state = run(Action::Init, &ThreadState::new("post", None), &services);
        let calls = api.call_count();
        let result = handle(
            &Action::UpdateMember {
                name: Some("Ada".into()),
                bio: None,
            },
            &state,
            &services,
        )
        .unwrap();
        assert!(result.is_none());
        assert_eq!(api.call_count(), calls);
    }

    #[test]
    fn update_member_sends_only_changed_fields() {
        let mut state = ThreadState::new("post", None);
        state.member = Some(member());
        let changes = member_changes(&state, Some("Ada"), Some(Some("")));
        assert_eq!(
            changes,
            MemberPatch {
                name: None,
                bio: Some(Some(String::new()))
            }
        );
        assert!(member_changes(&state, None, Some(Some("engineer"))).is_empty());
        assert!(member_changes(&state, Some(""), None).is_empty());
    }

    #[test]
    fn null_bio_clears_it() {
        let (api, services) = setup(Vec::new());
        let state = run(Action::Init, &ThreadState::new("post", None), &services);
        let action = Action::from_intent("updateMember", Some(json!({"bio": null}))).unwrap();
        assert_eq!(
            action,
            Action::UpdateMember {
                name: None,
                bio: Some(None)
            }
        );

        let changes = member_changes(&state, None, Some(None));
        assert_eq!(serde_json::to_value(&changes).unwrap(), json!({"bio": null}));

        let calls = api.call_count();
        let patch = handle(&action, &state, &services).unwrap().unwrap();
        assert_eq!(api.call_count(), calls + 1);
        assert_eq!(patch.member_update, Some(MemberUpdate::Saved));
        assert_eq!(patch.member.unwrap().bio, None);
    }

    #[test]
    fn missing_bio_leaves_it_alone() {
        let action = Action::from_intent("updateMember", Some(json!({"name": "Grace"}))).unwrap();
        assert_eq!(
            action,
            Action::UpdateMember {
                name: Some("Grace".into()),
                bio: None
            }
        );
    }

    #[test]
    fn update_member_failure_is_structured() {
        let (api, services) = setup(Vec::new());
        let state = run(Action::Init, &ThreadState::new("post", None), &services);
        api.fail_next_call("server down");
        let patch = handle(
            &Action::UpdateMember {
                name: Some("Grace".into()),
                bio: None,
            },
            &state,
            &services,
        )
        .unwrap()
        .unwrap();
        assert!(patch.is_failure());
        assert!(patch.member.is_none());
    }

    #[test]
    fn popups_open_and_close() {
        let (_api, services) = setup(Vec::new());
        let state = ThreadState::new("post", None);
        let opened = run(
            Action::OpenPopup(Popup::Report {
                comment_id: "a".into(),
            }),
            &state,
            &services,
        );
        assert!(opened.popup.is_some());
        let closed = run(Action::ClosePopup, &opened, &services);
        assert!(closed.popup.is_none());
    }
}
