use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wechat_web::Client;
use wechat_web::handlers::{MessageHandler, MessageRouter};
use wechat_web::store::{SessionSnapshot, SessionStore};
use wechat_web::test_utils::{ScriptedHttpClient, create_test_client_with, sample_session, test_config};
use wxcore::login::LoginState;
use wxcore::net::{HttpError, HttpResponse};
use wxcore::session::CookieJar;
use wxcore::types::events::{Event, EventHandler, LogoutReason};
use wxcore::types::{ChatKind, ContactSnapshot, MessageKind, NormalizedMessage, RawContact};

struct Recorder(Mutex<Vec<Event>>);

impl EventHandler for Recorder {
    fn handle_event(&self, event: &Event) {
        self.0.lock().unwrap().push(event.clone());
    }
}

struct CountingTextHandler(AtomicUsize);

#[async_trait]
impl MessageHandler for CountingTextHandler {
    fn kind(&self) -> MessageKind {
        MessageKind::Text
    }

    async fn handle(&self, _client: Arc<Client>, _message: &NormalizedMessage) -> bool {
        self.0.fetch_add(1, Ordering::SeqCst);
        true
    }
}

const IDLE: &str = r#"window.synccheck={retcode:"0",selector:"0"}"#;
const CHANGED: &str = r#"window.synccheck={retcode:"0",selector:"2"}"#;
const DEAD: &str = r#"window.synccheck={retcode:"1101",selector:"0"}"#;

fn snapshot() -> SessionSnapshot {
    let mut cookies = CookieJar::new();
    cookies.set("wxuin", "1234");
    cookies.set("wxsid", "sid");
    cookies.set("webwxuvid", "uvid");

    let mut contacts = ContactSnapshot::default();
    contacts.self_user = Some(RawContact {
        user_name: "@me".into(),
        nick_name: "Me".into(),
        ..Default::default()
    });
    contacts.update_users([RawContact {
        user_name: "@alice".into(),
        nick_name: "Alice".into(),
        sex: 2,
        contact_flag: 1 | 2048,
        ..Default::default()
    }]);

    SessionSnapshot {
        session: sample_session(),
        cookies,
        contacts,
    }
}

async fn write_snapshot(path: &Path) {
    SessionStore::new(path).save(&snapshot()).await.unwrap();
}

async fn wait_until_stopped(client: &Client) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while client.is_running() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("sync loop should end");
}

fn text_message(id: &str, from: &str, text: &str) -> String {
    format!(
        r#"{{"MsgId": "{id}", "FromUserName": "{from}", "ToUserName": "@me", "MsgType": 1, "Content": "{text}", "CreateTime": 1700000100}}"#
    )
}

#[tokio::test]
async fn restored_session_delivers_batches_until_remote_logout() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.bin");
    write_snapshot(&path).await;

    let http = ScriptedHttpClient::new();
    // First answer validates the restored session.
    http.push_response("/synccheck", HttpResponse::ok(IDLE));
    http.push_response("/synccheck", HttpResponse::ok(IDLE));
    http.push_response("/synccheck", HttpResponse::ok(CHANGED));
    http.push_error(
        "/synccheck",
        HttpError::MalformedResponse("bad status line".into()),
    );
    http.push_response("/synccheck", HttpResponse::ok(CHANGED));
    http.push_response("/synccheck", HttpResponse::ok(DEAD));

    http.push_response(
        "/webwxsync",
        HttpResponse::ok(format!(
            r#"{{
                "BaseResponse": {{"Ret": 0, "ErrMsg": ""}},
                "AddMsgCount": 1,
                "AddMsgList": [{}],
                "SyncKey": {{"Count": 1, "List": [{{"Key": 1, "Val": 101}}]}},
                "SyncCheckKey": {{"Count": 2, "List": [{{"Key": 1, "Val": 101}}, {{"Key": 2, "Val": 5}}]}}
            }}"#,
            text_message("1", "@alice", "hi")
        )),
    );
    http.push_response(
        "/webwxsync",
        HttpResponse::ok(format!(
            r#"{{
                "BaseResponse": {{"Ret": 0, "ErrMsg": ""}},
                "AddMsgCount": 1,
                "AddMsgList": [{}],
                "ModContactCount": 1,
                "ModContactList": [{{"UserName": "@bob", "NickName": "Bob", "Sex": 1}}],
                "SyncKey": {{"Count": 1, "List": [{{"Key": 1, "Val": 102}}]}}
            }}"#,
            text_message("2", "@bob", "yo")
        )),
    );

    let handler = Arc::new(CountingTextHandler(AtomicUsize::new(0)));
    let mut router = MessageRouter::new();
    router.register(handler.clone());

    let config = test_config()
        .with_session_path(&path)
        .with_receiving_retry_count(0);
    let client = create_test_client_with(config, http.clone(), router).await;
    let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
    client.add_event_handler(recorder.clone());

    assert!(client.restore().await);
    wait_until_stopped(&client).await;

    assert_eq!(client.login_state(), LoginState::LoggedOut);
    assert!(client.session().await.is_none());
    assert_eq!(handler.0.load(Ordering::SeqCst), 2);

    let events = recorder.0.lock().unwrap().clone();
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::LoggedIn(l) if l.restored && l.user_name == "@me")));

    let cursors: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            Event::SyncBatch(b) => Some(b.cursor.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(cursors, vec!["1_101|2_5".to_string(), "1_102".to_string()]);

    let messages: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            Event::Message(m) => Some((m.text.clone(), m.author.display_name.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(
        messages,
        vec![
            ("hi".to_string(), "Alice".to_string()),
            ("yo".to_string(), "Bob".to_string()),
        ]
    );

    let alice = events
        .iter()
        .find_map(|e| match e {
            Event::Message(m) if m.chat.user_name == "@alice" => Some(m.chat.clone()),
            _ => None,
        })
        .expect("message from Alice");
    assert_eq!(alice.kind, ChatKind::User);
    assert!(alice.flags.is_contact);
    assert!(alice.flags.is_top);

    // Each message is announced before the batch that carried it commits.
    let first_message = events
        .iter()
        .position(|e| matches!(e, Event::Message(_)))
        .unwrap();
    let first_batch = events
        .iter()
        .position(|e| matches!(e, Event::SyncBatch(_)))
        .unwrap();
    assert!(first_message < first_batch);

    let logouts: Vec<LogoutReason> = events
        .iter()
        .filter_map(|e| match e {
            Event::LoggedOut(l) => Some(l.reason.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(logouts, vec![LogoutReason::RemoteLogout { retcode: 1101 }]);
    assert_eq!(http.requests_to("/synccheck"), 6);
    assert_eq!(http.requests_to("/webwxsync"), 2);
}

#[tokio::test]
async fn rejected_snapshot_falls_back_to_unauthenticated() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.bin");
    write_snapshot(&path).await;

    let http = ScriptedHttpClient::new();
    http.push_response("/synccheck", HttpResponse::ok(DEAD));
    let config = test_config().with_session_path(&path);
    let client = create_test_client_with(config, http.clone(), MessageRouter::new()).await;
    let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
    client.add_event_handler(recorder.clone());

    assert!(!client.restore().await);
    assert_eq!(client.login_state(), LoginState::Unauthenticated);
    assert!(client.session().await.is_none());
    assert!(client.contacts().await.users.is_empty());
    assert!(!client.is_running());

    let events = recorder.0.lock().unwrap().clone();
    assert!(!events.iter().any(|e| matches!(e, Event::LoggedIn(_))));
    let transitions: Vec<LoginState> = events
        .iter()
        .filter_map(|e| match e {
            Event::LoginStateChanged(c) => Some(c.to),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![LoginState::Initializing, LoginState::Unauthenticated]
    );
}

#[tokio::test]
async fn snapshot_from_another_version_is_not_restored() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.bin");
    SessionStore::with_version(&path, "0.0.0-old")
        .save(&snapshot())
        .await
        .unwrap();

    let http = ScriptedHttpClient::new();
    let config = test_config().with_session_path(&path);
    let client = create_test_client_with(config, http.clone(), MessageRouter::new()).await;

    assert!(!client.restore().await);
    assert_eq!(client.login_state(), LoginState::Unauthenticated);
    assert!(http.requests().is_empty());
}

#[tokio::test]
async fn shutdown_keeps_session_for_next_start() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.bin");
    let puid_path = dir.path().join("puid.bin");
    write_snapshot(&path).await;

    let http = ScriptedHttpClient::new();
    http.set_fallback("/synccheck", HttpResponse::ok(IDLE));
    let config = test_config()
        .with_session_path(&path)
        .with_puid_path(&puid_path);
    let client = create_test_client_with(config, http.clone(), MessageRouter::new()).await;

    assert!(client.restore().await);
    let alice = client
        .puid_resolver()
        .puid_for_user_name("@alice")
        .await
        .expect("restored contacts are resolved");
    client.shutdown().await.unwrap();
    assert!(!client.is_running());

    let reloaded = SessionStore::new(&path).load().await.unwrap().hit().unwrap();
    assert_eq!(reloaded.session.user_name, "@me");
    assert_eq!(reloaded.cookies.get("wxuin"), Some("1234"));

    let next = create_test_client_with(
        test_config().with_puid_path(&puid_path),
        ScriptedHttpClient::new(),
        MessageRouter::new(),
    )
    .await;
    assert_eq!(
        next.puid_resolver().user_name_for_puid(&alice).await.as_deref(),
        Some("@alice")
    );
}
