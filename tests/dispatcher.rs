use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use crossbeam_channel::Receiver;
use serde_json::{json, Map, Value};

use comments_engine::actions::{Action, ActionKind};
use comments_engine::api::{MemoryCommentApi, Services};
use comments_engine::app::connect_admin;
use comments_engine::config::Config;
use comments_engine::dispatcher::{ActionStatus, Dispatcher, Options};
use comments_engine::model::{Comment, CommentStatus, Member, Site};
use comments_engine::rpc::{ChannelTransport, OutboundMessage, RpcClient};
use comments_engine::thread::ThreadState;

const ADMIN_URL: &str = "https://blog.example.com/ghost/";
const ORIGIN: &str = "https://blog.example.com";

fn comment(id: &str, minute: u32) -> Comment {
    Comment {
        id: id.into(),
        post_id: Some("post".into()),
        parent_id: None,
        status: CommentStatus::Published,
        html: format!("<p>{id}</p>"),
        created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap(),
        edited_at: None,
        member: Some(Member {
            id: format!("author-{id}"),
            ..Default::default()
        }),
        liked: false,
        counts: Default::default(),
        replies: Vec::new(),
    }
}

fn memory(comments: Vec<Comment>, page_size: u32) -> (Arc<MemoryCommentApi>, Services) {
    let api = Arc::new(
        MemoryCommentApi::new(
            Site::default(),
            Some(Member {
                id: "viewer".into(),
                name: Some("Viewer".into()),
                ..Default::default()
            }),
        )
        .with_page_sizes(page_size, 50),
    );
    api.seed(comments);
    (api.clone(), Services::new(api.clone(), api))
}

fn admin_config(timeout: Duration) -> Config {
    let mut cfg = Config::default();
    cfg.site.admin_url = ADMIN_URL.into();
    cfg.admin.rpc_timeout = timeout;
    cfg
}

/// Answers every request after `delay`, using `respond` to build the body.
fn spawn_frame(
    rpc: Arc<RpcClient>,
    outbound: Receiver<OutboundMessage>,
    delay: Duration,
    respond: impl Fn(&Value) -> Value + Send + 'static,
) {
    thread::spawn(move || {
        for message in outbound.iter() {
            assert_eq!(message.target_origin, ORIGIN);
            let request: Value = serde_json::from_str(&message.data).unwrap();
            thread::sleep(delay);
            let mut reply = respond(&request);
            reply["uid"] = request["uid"].clone();
            rpc.handle_message(ORIGIN, &reply.to_string());
        }
    });
}

fn frame_reply(request: &Value) -> Value {
    match request["action"].as_str() {
        Some("getUser") => json!({"result": {"users": [{"id": "owner", "name": "Owner"}]}}),
        _ => json!({"result": {}}),
    }
}

fn moderated(
    comments: Vec<Comment>,
    timeout: Duration,
) -> (Dispatcher, Arc<RpcClient>, Receiver<OutboundMessage>) {
    let (_api, services) = memory(comments, 20);
    let (transport, outbound) = ChannelTransport::new();
    let (services, rpc) =
        connect_admin(&admin_config(timeout), services, Arc::new(transport)).unwrap();
    let dispatcher = Dispatcher::new(ThreadState::new("post", None), services, Options::default());
    (dispatcher, rpc, outbound)
}

#[test]
fn older_pages_stay_ordered_without_duplicates() {
    let (_api, services) = memory((1..=10).map(|m| comment(&format!("c{m:02}"), m)).collect(), 3);
    let mut dispatcher =
        Dispatcher::new(ThreadState::new("post", None), services, Options::default());
    dispatcher.dispatch_blocking(Action::Init);
    for _ in 0..5 {
        dispatcher.dispatch_blocking(Action::LoadMoreComments);
    }
    let state = dispatcher.state();
    let times: Vec<_> = state.comments.top_level().map(|c| c.created_at).collect();
    assert_eq!(times.len(), 10);
    assert!(times.windows(2).all(|w| w[0] >= w[1]));
    let unique: HashSet<_> = state.comments.top_level_ids().iter().collect();
    assert_eq!(unique.len(), 10);
}

#[test]
fn add_then_delete_restores_count() {
    let (_api, services) = memory(vec![comment("a", 1), comment("b", 2)], 20);
    let mut dispatcher =
        Dispatcher::new(ThreadState::new("post", None), services, Options::default());
    dispatcher.dispatch_blocking(Action::Init);
    let before = dispatcher.state().comment_count;

    dispatcher.dispatch_blocking(Action::AddComment {
        html: "<p>hello</p>".into(),
    });
    let id = dispatcher.state().comments.top_level_ids()[0].clone();
    assert_eq!(dispatcher.state().comment_count, before + 1);

    dispatcher.dispatch_blocking(Action::DeleteComment { comment_id: id });
    assert_eq!(dispatcher.state().comment_count, before);
}

#[test]
fn intent_names_drive_the_dispatcher() {
    let (_api, services) = memory(vec![comment("a", 1)], 20);
    let mut dispatcher =
        Dispatcher::new(ThreadState::new("post", None), services, Options::default());
    dispatcher.dispatch_intent("init", None).unwrap();
    assert!(dispatcher.wait_idle(Duration::from_secs(5)));
    dispatcher
        .dispatch_intent("likeComment", Some(json!({"commentId": "a"})))
        .unwrap();
    assert!(dispatcher.wait_idle(Duration::from_secs(5)));
    assert!(dispatcher.state().comments.get("a").unwrap().liked);
    assert_eq!(
        dispatcher.status(),
        ActionStatus::Success(ActionKind::LikeComment)
    );
    assert!(dispatcher.dispatch_intent("launchRocket", None).is_err());
}

#[test]
fn moderation_goes_through_admin_frame() {
    let (mut dispatcher, rpc, outbound) =
        moderated(vec![comment("a", 1), comment("b", 2)], Duration::from_secs(5));
    spawn_frame(rpc, outbound, Duration::ZERO, frame_reply);

    dispatcher.dispatch_blocking(Action::Init);
    dispatcher.dispatch_blocking(Action::InitAdmin);
    assert_eq!(dispatcher.state().admin.as_ref().unwrap().id, "owner");
    let count = dispatcher.state().comment_count;

    dispatcher.dispatch_blocking(Action::HideComment {
        comment_id: "a".into(),
    });
    assert_eq!(
        dispatcher.state().comments.get("a").unwrap().status,
        CommentStatus::Hidden
    );
    assert_eq!(dispatcher.state().comment_count, count - 1);

    // hiding twice does not count twice
    dispatcher.dispatch_blocking(Action::HideComment {
        comment_id: "a".into(),
    });
    assert_eq!(dispatcher.state().comment_count, count - 1);

    dispatcher.dispatch_blocking(Action::ShowComment {
        comment_id: "a".into(),
    });
    assert_eq!(
        dispatcher.state().comments.get("a").unwrap().status,
        CommentStatus::Published
    );
    assert_eq!(dispatcher.state().comment_count, count);
}

#[test]
fn admin_identity_failure_is_not_fatal() {
    let (mut dispatcher, rpc, outbound) = moderated(vec![comment("a", 1)], Duration::from_secs(5));
    spawn_frame(rpc, outbound, Duration::ZERO, |_| json!({"error": "no session"}));

    dispatcher.dispatch_blocking(Action::InitAdmin);
    assert_eq!(
        dispatcher.status(),
        ActionStatus::Success(ActionKind::InitAdmin)
    );
    assert!(dispatcher.state().admin.is_none());
    assert!(dispatcher.state().popup_notification.is_none());
}

#[test]
fn responses_in_reverse_order_resolve_their_own_calls() {
    let (transport, outbound) = ChannelTransport::new();
    let rpc = Arc::new(RpcClient::new(ADMIN_URL, Arc::new(transport)).unwrap());

    let frame = rpc.clone();
    thread::spawn(move || {
        let first: Value = serde_json::from_str(&outbound.recv().unwrap().data).unwrap();
        let second: Value = serde_json::from_str(&outbound.recv().unwrap().data).unwrap();
        for request in [second, first] {
            let reply = json!({
                "uid": request["uid"],
                "result": {"action": request["action"], "id": request["id"]},
            });
            frame.handle_message(ORIGIN, &reply.to_string());
        }
    });

    let args = |id: &str| {
        let mut map = Map::new();
        map.insert("id".into(), Value::from(id));
        map
    };
    let hide = rpc.call("hideComment", args("a")).unwrap();
    let show = rpc.call("showComment", args("b")).unwrap();
    assert_ne!(hide.uid(), show.uid());

    let timeout = Some(Duration::from_secs(5));
    let shown = show.wait(timeout).unwrap();
    let hidden = hide.wait(timeout).unwrap();
    assert_eq!(hidden, json!({"action": "hideComment", "id": "a"}));
    assert_eq!(shown, json!({"action": "showComment", "id": "b"}));
    assert_eq!(rpc.pending_len(), 0);
}

#[test]
fn foreign_origin_never_resolves_a_call() {
    let (transport, _outbound) = ChannelTransport::new();
    let rpc = RpcClient::new(ADMIN_URL, Arc::new(transport)).unwrap();
    let call = rpc.call("getUser", Map::new()).unwrap();
    let forged = json!({"uid": call.uid(), "result": {"users": []}}).to_string();
    assert!(!rpc.handle_message("https://evil.example.com", &forged));
    assert_eq!(rpc.pending_len(), 1);
    assert!(call.wait(Some(Duration::from_millis(50))).is_err());
    assert_eq!(rpc.pending_len(), 0);
}

#[test]
fn overlapping_dispatches_resolve_last_write_wins() {
    let (mut dispatcher, rpc, outbound) =
        moderated(vec![comment("a", 1), comment("b", 2)], Duration::from_secs(5));
    spawn_frame(rpc, outbound, Duration::from_millis(20), frame_reply);
    dispatcher.dispatch_blocking(Action::Init);
    let count = dispatcher.state().comment_count;

    dispatcher.dispatch(Action::HideComment {
        comment_id: "a".into(),
    });
    dispatcher.dispatch(Action::HideComment {
        comment_id: "b".into(),
    });
    assert!(dispatcher.wait_idle(Duration::from_secs(5)));

    // both handlers patched the same snapshot; the later merge wins
    let state = dispatcher.state();
    let hidden = ["a", "b"]
        .iter()
        .filter(|id| state.comments.get(id).unwrap().status == CommentStatus::Hidden)
        .count();
    assert_eq!(hidden, 1);
    assert_eq!(state.comment_count, count - 1);
}

#[test]
fn results_arriving_after_shutdown_are_discarded() {
    let (mut dispatcher, rpc, outbound) = moderated(vec![comment("a", 1)], Duration::from_secs(5));
    spawn_frame(rpc, outbound, Duration::from_millis(100), frame_reply);
    dispatcher.dispatch_blocking(Action::Init);

    dispatcher.dispatch(Action::HideComment {
        comment_id: "a".into(),
    });
    dispatcher.shutdown();
    thread::sleep(Duration::from_millis(400));

    assert!(!dispatcher.poll());
    assert_eq!(
        dispatcher.state().comments.get("a").unwrap().status,
        CommentStatus::Published
    );
}

#[test]
fn admin_timeout_fails_the_action_and_evicts_the_call() {
    let (mut dispatcher, rpc, _outbound) =
        moderated(vec![comment("a", 1)], Duration::from_millis(50));
    dispatcher.dispatch_blocking(Action::Init);

    dispatcher.dispatch_blocking(Action::HideComment {
        comment_id: "a".into(),
    });
    assert_eq!(
        dispatcher.status(),
        ActionStatus::Failed(ActionKind::HideComment)
    );
    let notification = dispatcher.state().popup_notification.clone().unwrap();
    assert_eq!(notification.kind, "hideComment:failed");
    assert!(notification.message.unwrap().contains("timed out"));
    assert_eq!(rpc.pending_len(), 0);
    assert_eq!(
        dispatcher.state().comments.get("a").unwrap().status,
        CommentStatus::Published
    );
}
