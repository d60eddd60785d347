use crate::client::Client;
use crate::request::{RequestError, check_base_response};
use chrono::Utc;
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use thiserror::Error;
use wxcore::login::LoginState;
use wxcore::net::{HttpError, HttpRequest};
use wxcore::puid::ChatObservation;
use wxcore::session::PUSH_LOGIN_COOKIES;
use wxcore::sync::{SyncCursor, SyncRequest, SyncResponse, SyncSignal};
use wxcore::types::events::{ContactsUpdated, Event, LoggedOut, LogoutReason, SharedData, SyncBatch};
use wxcore::types::{
    ChatFlags, ChatKind, ChatRef, ContactSnapshot, MessageKind, NormalizedMessage, RawContact,
    RawMessage,
};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no active session")]
    NoSession,
    #[error(transparent)]
    Request(#[from] RequestError),
}

impl SyncError {
    fn http_error(&self) -> Option<&HttpError> {
        match self {
            SyncError::Request(e) => e.http_error(),
            SyncError::NoSession => None,
        }
    }
}

/// Outcome of one sync loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Iteration {
    /// Nothing new.
    Quiet,
    /// The long poll timed out. Polled again at once.
    TimedOut,
    /// Keep-alive noise the transport could not parse. Polled again after
    /// the retry delay, without counting as a failure.
    Garbled,
    Delivered,
    Dead { retcode: u32 },
}

impl Client {
    /// One long poll on `synccheck`. Bumps the session's check counter.
    pub(crate) async fn sync_check(&self) -> Result<SyncSignal, SyncError> {
        let url = {
            let mut guard = self.session.write().await;
            let session = guard.as_mut().ok_or(SyncError::NoSession)?;
            let stamp = session.next_check_stamp();
            format!(
                "{}/synccheck?r={}&skey={}&sid={}&uin={}&deviceid={}&synckey={}&_={}",
                session.urls.sync,
                Utc::now().timestamp_millis(),
                urlencoding::encode(&session.skey),
                urlencoding::encode(&session.wxsid),
                urlencoding::encode(&session.wxuin),
                urlencoding::encode(&session.device_id),
                urlencoding::encode(&session.sync_cursor.check),
                stamp
            )
        };
        let body = self
            .get_text(HttpRequest::get(url).with_timeout(self.config.long_poll_timeout))
            .await?;
        Ok(SyncSignal::parse(&body))
    }

    /// Fetches the pending delta. Does not advance the cursor.
    pub(crate) async fn web_sync(&self) -> Result<SyncResponse, SyncError> {
        let (url, base_request, sync_key) = {
            let guard = self.session.read().await;
            let session = guard.as_ref().ok_or(SyncError::NoSession)?;
            let url = format!(
                "{}/webwxsync?sid={}&skey={}&pass_ticket={}",
                session.urls.base,
                urlencoding::encode(&session.wxsid),
                urlencoding::encode(&session.skey),
                urlencoding::encode(&session.pass_ticket)
            );
            (url, session.base_request(), session.sync_cursor.key.clone())
        };
        let body = SyncRequest {
            base_request: &base_request,
            sync_key: &sync_key,
            rr: !Utc::now().timestamp(),
        };
        let resp: SyncResponse = self.post_json(url, &body).await?;
        check_base_response(&resp.base_response)?;
        Ok(resp)
    }

    /// Runs until the session dies, the retry budget is spent, or a stop
    /// is requested. Only the first two end with a `LoggedOut` event.
    pub(crate) async fn sync_loop(self: Arc<Self>) {
        let _running = scopeguard::guard((), |_| {
            self.is_running.store(false, Ordering::SeqCst);
        });
        info!(target: "Client/Sync", "Sync loop started");

        let mut failures = 0u32;
        let reason = loop {
            if self.stop_requested.load(Ordering::SeqCst) {
                info!(target: "Client/Sync", "Stop requested, leaving sync loop");
                return;
            }

            match self.sync_iteration().await {
                Ok(Iteration::Quiet | Iteration::Delivered) => failures = 0,
                Ok(Iteration::TimedOut) => {}
                Ok(Iteration::Garbled) => self.back_off().await,
                Ok(Iteration::Dead { retcode }) => {
                    break LogoutReason::RemoteLogout { retcode };
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        target: "Client/Sync",
                        "Sync iteration failed ({failures}/{}): {e}",
                        self.config.receiving_retry_count
                    );
                    if failures > self.config.receiving_retry_count {
                        break LogoutReason::ExhaustedRetries { failures };
                    }
                    self.back_off().await;
                }
            }
        };

        warn!(target: "Client/Sync", "Sync loop ended: {reason}");
        self.end_dead_session(reason).await;
    }

    /// Waits out the retry delay, or less if a stop is requested.
    async fn back_off(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.retry_delay) => {}
            _ = self.shutdown_notifier.notified() => {}
        }
    }

    async fn sync_iteration(self: &Arc<Self>) -> Result<Iteration, SyncError> {
        let signal = match self.sync_check().await {
            Ok(signal) => signal,
            Err(e) => {
                return match e.http_error() {
                    Some(HttpError::MalformedResponse(detail)) => {
                        debug!(target: "Client/Sync", "Malformed keep-alive ignored: {detail}");
                        Ok(Iteration::Garbled)
                    }
                    Some(HttpError::Timeout) => {
                        debug!(target: "Client/Sync", "Long poll timed out");
                        Ok(Iteration::TimedOut)
                    }
                    _ => Err(e),
                };
            }
        };

        match signal {
            SyncSignal::Idle => Ok(Iteration::Quiet),
            SyncSignal::Dead { retcode } => Ok(Iteration::Dead { retcode }),
            SyncSignal::Changed { selector } => {
                debug!(target: "Client/Sync", "Sync signal, selector {selector}");
                let batch = self.web_sync().await?;
                self.deliver_batch(batch).await;
                Ok(Iteration::Delivered)
            }
        }
    }

    /// Applies contact changes, hands every message to the router and the
    /// event bus, and only then commits the batch's cursor.
    async fn deliver_batch(self: &Arc<Self>, batch: SyncResponse) {
        let SyncResponse {
            add_msg_list,
            mod_contact_list,
            del_contact_list,
            sync_key,
            sync_check_key,
            ..
        } = batch;

        let contact_count = mod_contact_list.len();
        if !mod_contact_list.is_empty() {
            let (groups, users) = ContactSnapshot::split_delta(mod_contact_list);
            self.resolve_contacts(&groups).await;
            self.resolve_contacts(&users).await;
            let updated = ContactsUpdated {
                groups: groups.iter().map(|c| c.user_name.clone()).collect(),
                users: users.iter().map(|c| c.user_name.clone()).collect(),
            };
            {
                let mut contacts = self.contacts.write().await;
                contacts.update_groups(groups);
                contacts.update_users(users);
            }
            self.dispatch_event(Event::ContactsUpdated(updated));
        }
        if !del_contact_list.is_empty() {
            debug!(target: "Client/Sync", "{} contacts removed remotely", del_contact_list.len());
        }

        let self_user_name = self
            .session
            .read()
            .await
            .as_ref()
            .map(|s| s.user_name.clone())
            .unwrap_or_default();

        let mut delivered = 0usize;
        for raw in add_msg_list {
            let Some(message) = self.normalize_message(raw, &self_user_name).await else {
                continue;
            };
            delivered += 1;
            let message = SharedData::new(message);
            if !self.message_router.dispatch(self.clone(), &message).await {
                debug!(
                    target: "Client/Sync",
                    "No handler consumed {} message {}",
                    message.kind,
                    message.id
                );
            }
            self.dispatch_event(Event::Message(message));
        }

        let cursor = SyncCursor::from_sync(sync_key, &sync_check_key);
        if cursor.is_empty() {
            warn!(target: "Client/Sync", "Batch carried no sync key, keeping the previous cursor");
            return;
        }
        let check = cursor.check.clone();
        if let Some(session) = self.session.write().await.as_mut() {
            session.sync_cursor = cursor;
        }
        self.dispatch_event(Event::SyncBatch(SyncBatch {
            messages: delivered,
            contacts: contact_count,
            cursor: check,
        }));
        self.schedule_session_save();
    }

    /// Classifies and routes a raw message. `None` for protocol bookkeeping.
    pub(crate) async fn normalize_message(
        &self,
        raw: RawMessage,
        self_user_name: &str,
    ) -> Option<NormalizedMessage> {
        let Some(kind) = MessageKind::classify(&raw) else {
            debug!(target: "Client/Sync", "Skipping status notification {}", raw.msg_id);
            return None;
        };
        let routing = raw.routing(self_user_name);
        let chat = self.chat_ref(&routing.chat, None, self_user_name).await;
        let author = if routing.author == routing.chat {
            chat.clone()
        } else {
            self.chat_ref(&routing.author, Some(&routing.chat), self_user_name)
                .await
        };

        Some(NormalizedMessage {
            id: raw.msg_id.clone(),
            kind,
            chat,
            author,
            is_self: routing.is_self,
            text: routing.content,
            file_name: (!raw.file_name.is_empty()).then(|| raw.file_name.clone()),
            url: (!raw.url.is_empty()).then(|| raw.url.clone()),
            create_time: raw.create_time,
            raw,
        })
    }

    /// Reference to a chat, with its durable id when it can be resolved.
    /// Group members are looked up inside `group` first.
    async fn chat_ref(&self, user_name: &str, group: Option<&str>, self_user_name: &str) -> ChatRef {
        let system = &self.config.system_accounts;
        let contact = {
            let contacts = self.contacts.read().await;
            match group {
                Some(group) => contacts.member(group, user_name).cloned(),
                None => contacts.get(user_name).cloned(),
            }
        };

        match contact {
            Some(contact) => {
                let puid = self.puid.resolve_contact(&contact).await;
                let display_name = [&contact.remark_name, &contact.display_name, &contact.nick_name]
                    .into_iter()
                    .find(|n| !n.is_empty())
                    .cloned()
                    .unwrap_or_else(|| user_name.to_string());
                ChatRef {
                    user_name: user_name.to_string(),
                    puid,
                    display_name,
                    kind: ChatKind::classify(&contact, system),
                    flags: ChatFlags::from_contact(&contact, user_name == self_user_name),
                }
            }
            None => {
                let bare = RawContact {
                    user_name: user_name.to_string(),
                    ..Default::default()
                };
                let puid = if system.contains(user_name) {
                    self.puid
                        .resolve(&ChatObservation {
                            user_name: user_name.to_string(),
                            ..Default::default()
                        })
                        .await
                } else {
                    None
                };
                ChatRef {
                    user_name: user_name.to_string(),
                    puid,
                    display_name: system.display_name(user_name).unwrap_or(user_name).to_string(),
                    kind: ChatKind::classify(&bare, system),
                    flags: ChatFlags::default(),
                }
            }
        }
    }

    /// Tears down after the service ended the session or the retry budget
    /// ran out. Push-login cookies survive.
    async fn end_dead_session(&self, reason: LogoutReason) {
        if let Err(e) = self.web_logout().await {
            debug!(target: "Client/Sync", "Remote logout failed: {e}");
        }
        self.session_saver.cancel();
        self.session.write().await.take();
        self.contacts.write().await.clear();
        self.cookies.write().await.retain_only(PUSH_LOGIN_COOKIES);

        self.set_login_state(LoginState::LoggedOut);
        self.dispatch_event(Event::LoggedOut(LoggedOut { reason }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::MessageRouter;
    use crate::test_utils::{
        ScriptedHttpClient, create_test_client, create_test_client_with, install_session,
        test_config,
    };
    use std::time::Duration;
    use wxcore::net::HttpResponse;

    #[tokio::test]
    async fn sync_check_advances_the_stamp() {
        let http = ScriptedHttpClient::new();
        http.push_response(
            "/synccheck",
            HttpResponse::ok(r#"window.synccheck={retcode:"0",selector:"2"}"#),
        );
        let client = create_test_client(http.clone()).await;
        install_session(&client).await;
        let before = client.session().await.unwrap().login_time;

        let signal = client.sync_check().await.unwrap();
        assert_eq!(signal, SyncSignal::Changed { selector: 2 });
        assert_eq!(client.session().await.unwrap().login_time, before + 1);

        let url = &http.requests()[0].url;
        assert!(url.starts_with("https://webpush.wx2.qq.com/cgi-bin/mmwebwx-bin/synccheck?"));
        assert!(url.contains(&format!("_={}", before + 1)));
    }

    #[tokio::test(start_paused = true)]
    async fn garbled_keep_alive_backs_off_but_timeout_does_not() {
        let http = ScriptedHttpClient::new();
        http.push_error("/synccheck", HttpError::Timeout);
        http.push_error(
            "/synccheck",
            HttpError::MalformedResponse("bad status line".into()),
        );
        http.push_response(
            "/synccheck",
            HttpResponse::ok(r#"window.synccheck={retcode:"1101",selector:"0"}"#),
        );
        let config = test_config()
            .with_retry_delay(Duration::from_secs(1))
            .with_receiving_retry_count(0);
        let client = create_test_client_with(config, http.clone(), MessageRouter::new()).await;
        install_session(&client).await;

        let started = tokio::time::Instant::now();
        client.start_sync_loop().await;
        while client.is_running() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let elapsed = started.elapsed();

        // One retry delay for the garbled answer, none for the timeout.
        assert!(elapsed >= Duration::from_secs(1), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");
        assert_eq!(http.requests_to("/synccheck"), 3);
    }

    #[tokio::test]
    async fn rejected_batch_is_an_error() {
        let http = ScriptedHttpClient::new();
        http.push_response(
            "/webwxsync",
            HttpResponse::ok(r#"{"BaseResponse":{"Ret":1101,"ErrMsg":""}}"#),
        );
        let client = create_test_client(http).await;
        install_session(&client).await;

        let err = client.web_sync().await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Request(RequestError::Rejected { ret: 1101, .. })
        ));
    }

    #[tokio::test]
    async fn group_message_names_member_author() {
        let client = create_test_client(ScriptedHttpClient::new()).await;
        install_session(&client).await;
        client.contacts.write().await.update_groups([RawContact {
            user_name: "@@room".into(),
            nick_name: "Room".into(),
            member_list: vec![RawContact {
                user_name: "@bob".into(),
                nick_name: "Bob".into(),
                display_name: "Bobby".into(),
                ..Default::default()
            }],
            ..Default::default()
        }]);

        let raw = RawMessage {
            msg_id: "42".into(),
            from_user_name: "@@room".into(),
            to_user_name: "@me".into(),
            msg_type: 1,
            content: "@bob:<br/>hello".into(),
            ..Default::default()
        };
        let message = client.normalize_message(raw, "@me").await.unwrap();
        assert_eq!(message.kind, MessageKind::Text);
        assert_eq!(message.text, "hello");
        assert_eq!(message.chat.display_name, "Room");
        assert_eq!(message.author.user_name, "@bob");
        assert_eq!(message.author.display_name, "Bobby");
        assert!(message.chat.puid.is_some());
        assert!(message.author.puid.is_some());
        assert_ne!(message.chat.puid, message.author.puid);
        assert_eq!(message.chat.kind, ChatKind::Group);
        assert_eq!(message.author.kind, ChatKind::User);
    }

    #[tokio::test]
    async fn status_notifications_are_not_dispatched() {
        let client = create_test_client(ScriptedHttpClient::new()).await;
        let raw = RawMessage {
            msg_type: 51,
            ..Default::default()
        };
        assert!(client.normalize_message(raw, "@me").await.is_none());
    }
}
