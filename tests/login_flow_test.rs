use std::sync::{Arc, Mutex};
use wechat_web::test_utils::{ScriptedHttpClient, create_test_client};
use wxcore::login::LoginState;
use wxcore::net::HttpResponse;
use wxcore::types::events::{Event, EventHandler};

struct Recorder(Mutex<Vec<Event>>);

impl EventHandler for Recorder {
    fn handle_event(&self, event: &Event) {
        self.0.lock().unwrap().push(event.clone());
    }
}

const REDIRECT: &str =
    "https://wx2.qq.com/cgi-bin/mmwebwx-bin/webwxnewloginpage?ticket=T&uuid=second==&lang=zh_CN&scan=1";

const IDLE: &str = r#"window.synccheck={retcode:"0",selector:"0"}"#;
const DEAD: &str = r#"window.synccheck={retcode:"1101",selector:"0"}"#;

/// Scripts a QR login up to the sync check that verifies the new session.
fn script_handshake(http: &ScriptedHttpClient, synccheck: &str) {
    http.push_response(
        "/jslogin",
        HttpResponse::ok(r#"window.QRLogin.code = 200; window.QRLogin.uuid = "first==";"#),
    );
    http.push_response(
        "/jslogin",
        HttpResponse::ok(r#"window.QRLogin.code = 200; window.QRLogin.uuid = "second==";"#),
    );

    let check = "/mmwebwx-bin/login";
    http.push_response(check, HttpResponse::ok("window.code=408;"));
    http.push_response(check, HttpResponse::ok("window.code=201;window.userAvatar = '';"));
    http.push_response(check, HttpResponse::ok("window.code=201;window.userAvatar = '';"));
    http.push_response(
        check,
        HttpResponse::ok(format!("window.code=200;\nwindow.redirect_uri=\"{REDIRECT}\";")),
    );

    http.push_response(
        "/webwxnewloginpage",
        HttpResponse::ok(
            "<error><ret>0</ret><message></message><skey>@crypt_k</skey><wxsid>sid</wxsid>\
             <wxuin>1234</wxuin><pass_ticket>pt</pass_ticket><isgrayscale>1</isgrayscale></error>",
        )
        .with_header("Set-Cookie", "wxuin=1234; Domain=wx2.qq.com; Path=/")
        .with_header("Set-Cookie", "webwx_data_ticket=dt; Domain=qq.com; Path=/"),
    );
    http.push_response(
        "/webwxinit",
        HttpResponse::ok(
            r#"{
                "BaseResponse": {"Ret": 0, "ErrMsg": ""},
                "User": {"UserName": "@me", "NickName": "Me"},
                "SyncKey": {"Count": 1, "List": [{"Key": 1, "Val": 100}]},
                "ContactList": [
                    {"UserName": "@@room", "NickName": "Room"},
                    {"UserName": "@alice", "NickName": "Alice", "Sex": 2},
                    {"UserName": "filehelper", "NickName": "File Transfer"}
                ]
            }"#,
        ),
    );
    http.push_response(
        "/webwxstatusnotify",
        HttpResponse::ok(r#"{"BaseResponse": {"Ret": 0, "ErrMsg": ""}, "MsgID": "77"}"#),
    );
    http.push_response("/synccheck", HttpResponse::ok(synccheck));
}

#[tokio::test]
async fn qr_login_reports_each_status_once_and_activates_last() {
    let http = ScriptedHttpClient::new();
    script_handshake(&http, IDLE);
    let client = create_test_client(http.clone()).await;
    let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
    client.add_event_handler(recorder.clone());

    client.login().await.expect("login should succeed");
    client.stop_sync().await;

    assert_eq!(client.login_state(), LoginState::Active);
    let session = client.session().await.expect("session after login");
    assert_eq!(session.user_name, "@me");
    assert_eq!(session.skey, "@crypt_k");
    assert_eq!(session.urls.sync, "https://webpush.wx2.qq.com/cgi-bin/mmwebwx-bin");
    assert_eq!(session.sync_cursor.check, "1_100");

    let events = recorder.0.lock().unwrap().clone();
    let statuses: Vec<(String, u16, bool)> = events
        .iter()
        .filter_map(|e| match e {
            Event::LoginStatus(s) => Some((s.handshake_id.clone(), s.status, s.qr_content.is_some())),
            _ => None,
        })
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("first==".to_string(), 0, true),
            ("second==".to_string(), 408, true),
            ("second==".to_string(), 201, false),
            ("second==".to_string(), 200, false),
        ]
    );

    let transitions: Vec<(LoginState, LoginState)> = events
        .iter()
        .filter_map(|e| match e {
            Event::LoginStateChanged(c) => Some((c.from, c.to)),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            (LoginState::Unauthenticated, LoginState::AwaitingScan),
            (LoginState::AwaitingScan, LoginState::Confirmed),
            (LoginState::Confirmed, LoginState::Initializing),
            (LoginState::Initializing, LoginState::Active),
        ]
    );

    let confirmed_at = events
        .iter()
        .position(|e| matches!(e, Event::LoginStatus(s) if s.status == 200))
        .unwrap();
    let active_at = events
        .iter()
        .position(|e| matches!(e, Event::LoginStateChanged(c) if c.to == LoginState::Active))
        .unwrap();
    assert!(confirmed_at < active_at);

    let logged_in = events.iter().find_map(|e| match e {
        Event::LoggedIn(l) => Some(l.clone()),
        _ => None,
    });
    let logged_in = logged_in.expect("LoggedIn event");
    assert_eq!(logged_in.nick_name, "Me");
    assert!(!logged_in.restored);

    let contacts = client.contacts().await;
    assert!(contacts.groups.contains_key("@@room"));
    assert!(contacts.users.contains_key("@alice"));
    assert!(!contacts.users.contains_key("filehelper"));

    let alice = client.puid_resolver().puid_for_user_name("@alice").await;
    assert!(alice.is_some());
    let found = client.chat_by_puid(alice.as_deref().unwrap()).await.unwrap();
    assert_eq!(found.nick_name, "Alice");
}

#[tokio::test]
async fn second_login_attempt_is_refused_while_active() {
    let http = ScriptedHttpClient::new();
    script_handshake(&http, IDLE);
    let client = create_test_client(http.clone()).await;

    client.login().await.unwrap();
    client.stop_sync().await;

    assert!(client.login().await.is_err());
    assert_eq!(http.requests_to("/jslogin"), 2);
    assert_eq!(client.login_state(), LoginState::Active);
}

#[tokio::test]
async fn unreachable_status_endpoint_fails_after_retries() {
    let http = ScriptedHttpClient::new();
    http.push_response(
        "/jslogin",
        HttpResponse::ok(r#"window.QRLogin.code = 200; window.QRLogin.uuid = "only==";"#),
    );
    let client = create_test_client(http.clone()).await;

    let err = client.login().await.unwrap_err();
    assert!(matches!(
        err,
        wechat_web::login::LoginError::Network { attempts: 6, .. }
    ));
    assert_eq!(client.login_state(), LoginState::Failed);
    assert_eq!(http.requests_to("/mmwebwx-bin/login"), 6);
    assert!(client.session().await.is_none());
}

#[tokio::test]
async fn session_rejected_right_after_confirmation_fails_the_login() {
    let http = ScriptedHttpClient::new();
    script_handshake(&http, DEAD);
    let client = create_test_client(http.clone()).await;
    let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
    client.add_event_handler(recorder.clone());

    let err = client.login().await.unwrap_err();
    assert!(matches!(
        err,
        wechat_web::login::LoginError::SessionRejected { retcode: 1101 }
    ));
    assert_eq!(client.login_state(), LoginState::Failed);
    assert!(client.session().await.is_none());
    assert!(client.contacts().await.users.is_empty());
    assert!(!client.is_running());
    assert_eq!(http.requests_to("/synccheck"), 1);

    let events = recorder.0.lock().unwrap().clone();
    assert!(!events.iter().any(|e| matches!(e, Event::LoggedIn(_))));
    let last_transition = events.iter().rev().find_map(|e| match e {
        Event::LoginStateChanged(c) => Some((c.from, c.to)),
        _ => None,
    });
    assert_eq!(
        last_transition,
        Some((LoginState::Initializing, LoginState::Failed))
    );
}
