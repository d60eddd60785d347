use crate::client::Client;
use crate::request::{RequestError, check_base_response};
use crate::sync::SyncError;
use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use thiserror::Error;
use wxcore::login::{
    HandshakeStatus, LoginDetail, LoginDetailError, LoginState, LoginUtils, RouteUrls,
    UOS_CLIENT_VERSION,
};
use wxcore::net::HttpRequest;
use wxcore::session::{PUSH_LOGIN_COOKIES, Session, SessionBuilder, SessionError};
use wxcore::sync::{
    BaseRequest, InitRequest, InitResponse, StatusNotifyRequest, StatusNotifyResponse, SyncCursor,
    SyncSignal,
};
use wxcore::types::ContactSnapshot;
use wxcore::types::events::{ContactsUpdated, Event, LoggedIn};

const LOGIN_REFERER: &str = "https://wx.qq.com/?&lang=zh_CN&target=t";
/// `webwxstatusnotify` code that marks the web session as opened.
const STATUS_NOTIFY_INITED: u32 = 3;

#[derive(Debug, Error)]
pub enum LoginError {
    #[error("a login attempt is already in progress")]
    AlreadyLoggingIn,
    #[error("already logged in")]
    AlreadyLoggedIn,
    #[error("the service did not issue a handshake id")]
    NoHandshakeId,
    #[error("handshake failed with status {0}")]
    Rejected(u16),
    #[error("confirmation carried no redirect")]
    MissingRedirect,
    #[error("giving up after {attempts} failed status checks: {source}")]
    Network {
        attempts: u32,
        #[source]
        source: RequestError,
    },
    #[error("login detail: {0}")]
    Detail(#[from] LoginDetailError),
    #[error("incomplete session: {0}")]
    Session(#[from] SessionError),
    #[error("request failed: {0}")]
    Request(#[from] RequestError),
    #[error("the service rejected the new session (retcode {retcode})")]
    SessionRejected { retcode: u32 },
    #[error("could not verify the new session: {0}")]
    Unverified(#[source] SyncError),
    #[error("login cancelled")]
    Cancelled,
}

/// Result of one status poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginCheck {
    pub status: HandshakeStatus,
    /// Present when the status is `Confirmed`.
    pub redirect: Option<String>,
}

impl Client {
    pub(crate) async fn fetch_handshake_id(&self) -> Result<String, LoginError> {
        let body = self.get_text(HttpRequest::get(LoginUtils::handshake_url())).await?;
        LoginUtils::parse_handshake_id(&body).ok_or(LoginError::NoHandshakeId)
    }

    /// Asks the service to prompt the phone directly. Needs the `wxuin`
    /// cookie of an earlier session.
    pub(crate) async fn request_push_login(&self) -> Option<String> {
        if !self.config.enable_push_login {
            return None;
        }
        let uin = self.cookies.read().await.get("wxuin")?.to_string();
        match self
            .get_text(HttpRequest::get(LoginUtils::push_login_url(&uin)))
            .await
        {
            Ok(body) => {
                let id = LoginUtils::parse_push_login(&body);
                if id.is_none() {
                    debug!(target: "Client/Login", "Push login declined: {body}");
                }
                id
            }
            Err(e) => {
                warn!(target: "Client/Login", "Push login request failed: {e}");
                None
            }
        }
    }

    pub(crate) async fn check_login(&self, handshake_id: &str) -> Result<LoginCheck, RequestError> {
        let url = LoginUtils::check_url(handshake_id, Utc::now().timestamp());
        let body = self
            .get_text(HttpRequest::get(url).with_timeout(self.config.long_poll_timeout))
            .await?;
        Ok(LoginCheck {
            status: LoginUtils::parse_status(&body),
            redirect: LoginUtils::parse_redirect_uri(&body),
        })
    }

    /// Follows the confirmation redirect by hand, keeping the cookies it
    /// sets, and extracts the session secrets.
    pub(crate) async fn fetch_login_detail(&self, redirect: &str) -> Result<LoginDetail, LoginError> {
        let mut request = HttpRequest::get(redirect)
            .with_header("client-version", UOS_CLIENT_VERSION)
            .with_header("Referer", LOGIN_REFERER);
        if let Some(extspam) = &self.config.uos_extspam {
            request = request.with_header("extspam", extspam.clone());
        }
        let body = self.get_text(request).await?;
        let cookies = self.cookies.read().await;
        Ok(LoginDetail::parse(&body, |name| {
            cookies.get(name).map(str::to_string)
        })?)
    }

    pub(crate) async fn web_init(
        &self,
        urls: &RouteUrls,
        base_request: &BaseRequest,
        pass_ticket: &str,
    ) -> Result<InitResponse, RequestError> {
        let url = format!(
            "{}/webwxinit?r={}&pass_ticket={}",
            urls.base,
            -Utc::now().timestamp() / 1579,
            urlencoding::encode(pass_ticket)
        );
        let init: InitResponse = self.post_json(url, &InitRequest { base_request }).await?;
        check_base_response(&init.base_response)?;
        Ok(init)
    }

    /// Tells the phone that the web session is open.
    pub(crate) async fn status_notify(&self, session: &Session) -> Result<(), RequestError> {
        let url = format!(
            "{}/webwxstatusnotify?lang=zh_CN&pass_ticket={}",
            session.urls.base,
            urlencoding::encode(&session.pass_ticket)
        );
        let base_request = session.base_request();
        let body = StatusNotifyRequest {
            base_request: &base_request,
            code: STATUS_NOTIFY_INITED,
            from_user_name: &session.user_name,
            to_user_name: &session.user_name,
            client_msg_id: Utc::now().timestamp(),
        };
        let resp: StatusNotifyResponse = self.post_json(url, &body).await?;
        check_base_response(&resp.base_response)
    }

    pub(crate) async fn web_logout(&self) -> Result<(), RequestError> {
        let url = {
            let session = self.session.read().await;
            let Some(session) = session.as_ref() else {
                return Ok(());
            };
            format!(
                "{}/webwxlogout?redirect=1&type=1&skey={}",
                session.urls.base,
                urlencoding::encode(&session.skey)
            )
        };
        self.get_text(HttpRequest::get(url)).await.map(|_| ())
    }

    /// Starts a handshake: push login when possible, otherwise a fresh QR
    /// code. Reports status 0 for the new handshake id.
    pub async fn begin_login(self: &Arc<Self>) -> Result<String, LoginError> {
        match self.login_state() {
            LoginState::Active => return Err(LoginError::AlreadyLoggedIn),
            LoginState::Unauthenticated | LoginState::AwaitingScan => {}
            _ => {
                self.set_login_state(LoginState::Unauthenticated);
            }
        }

        let (handshake_id, qr_content) = match self.request_push_login().await {
            Some(id) => {
                info!(target: "Client/Login", "Confirmation pushed to the phone");
                (id, None)
            }
            None => {
                let id = self.fetch_handshake_id().await?;
                let content = LoginUtils::qr_content(&id);
                (id, Some(content))
            }
        };

        self.set_login_state(LoginState::AwaitingScan);
        self.report_status(&handshake_id, HandshakeStatus::Waiting.code(), qr_content);
        Ok(handshake_id)
    }

    /// Polls `handshake_id` until the login completes or fails. Expired
    /// codes are replaced with new ones.
    pub async fn poll_status(self: &Arc<Self>, handshake_id: String) -> Result<(), LoginError> {
        let mut handshake_id = handshake_id;
        let mut failures = 0u32;

        loop {
            if self.stop_requested.load(Ordering::SeqCst) {
                self.set_login_state(LoginState::Unauthenticated);
                return Err(LoginError::Cancelled);
            }

            match self.check_login(&handshake_id).await {
                Ok(check) => {
                    failures = 0;
                    match check.status {
                        HandshakeStatus::Waiting => {}
                        HandshakeStatus::Expired => {
                            info!(target: "Client/Login", "QR code expired, requesting a new one");
                            let fresh = match self.fetch_handshake_id().await {
                                Ok(id) => id,
                                Err(e) => {
                                    self.set_login_state(LoginState::Failed);
                                    return Err(e);
                                }
                            };
                            self.set_login_state(LoginState::AwaitingScan);
                            let content = LoginUtils::qr_content(&fresh);
                            self.report_status(&fresh, HandshakeStatus::Expired.code(), Some(content));
                            handshake_id = fresh;
                        }
                        HandshakeStatus::Scanned => {
                            self.set_login_state(LoginState::Confirmed);
                            self.report_status(&handshake_id, HandshakeStatus::Scanned.code(), None);
                        }
                        HandshakeStatus::Confirmed => {
                            self.report_status(&handshake_id, HandshakeStatus::Confirmed.code(), None);
                            let Some(redirect) = check.redirect else {
                                self.set_login_state(LoginState::Failed);
                                return Err(LoginError::MissingRedirect);
                            };
                            return self.complete_login(&redirect).await;
                        }
                        HandshakeStatus::Failed(code) => {
                            self.report_status(&handshake_id, code, None);
                            self.set_login_state(LoginState::Failed);
                            return Err(LoginError::Rejected(code));
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!(target: "Client/Login", "Status check failed ({failures}): {e}");
                    if failures > self.config.login_retry_count {
                        self.set_login_state(LoginState::Failed);
                        return Err(LoginError::Network {
                            attempts: failures,
                            source: e,
                        });
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.login_poll_interval) => {}
                _ = self.shutdown_notifier.notified() => {}
            }
        }
    }

    async fn complete_login(self: &Arc<Self>, redirect: &str) -> Result<(), LoginError> {
        let detail = match self.fetch_login_detail(redirect).await {
            Ok(detail) => detail,
            Err(e) => {
                error!(target: "Client/Login", "Login detail unusable, the account may be barred from web login: {e}");
                self.set_login_state(LoginState::Failed);
                return Err(e);
            }
        };

        self.set_login_state(LoginState::Initializing);
        match self.initialize_session(RouteUrls::from_redirect(redirect), detail).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(target: "Client/Login", "Session setup failed: {e}");
                self.session.write().await.take();
                self.contacts.write().await.clear();
                self.set_login_state(LoginState::Failed);
                Err(e)
            }
        }
    }

    async fn initialize_session(
        self: &Arc<Self>,
        urls: RouteUrls,
        detail: LoginDetail,
    ) -> Result<(), LoginError> {
        let device_id = LoginUtils::generate_device_id();
        let base_request = BaseRequest {
            uin: detail.wxuin.clone(),
            sid: detail.wxsid.clone(),
            skey: detail.skey.clone(),
            device_id: device_id.clone(),
        };
        let init = self.web_init(&urls, &base_request, &detail.pass_ticket).await?;

        let session = SessionBuilder::new()
            .urls(urls)
            .detail(detail)
            .device_id(device_id)
            .login_time(Utc::now().timestamp_millis())
            .sync_cursor(SyncCursor::from_init(init.sync_key))
            .user(init.user.user_name.clone(), init.user.nick_name.clone())
            .build()?;

        let (groups, users) = ContactSnapshot::split_initial(init.contact_list);
        self.puid.reset_session().await;
        self.puid.resolve_contact(&init.user).await;
        self.resolve_contacts(&groups).await;
        self.resolve_contacts(&users).await;
        let updated = ContactsUpdated {
            groups: groups.iter().map(|c| c.user_name.clone()).collect(),
            users: users.iter().map(|c| c.user_name.clone()).collect(),
        };
        {
            let mut contacts = self.contacts.write().await;
            contacts.clear();
            contacts.self_user = Some(init.user);
            contacts.update_groups(groups);
            contacts.update_users(users);
        }
        *self.session.write().await = Some(session.clone());
        self.dispatch_event(Event::ContactsUpdated(updated));

        if let Err(e) = self.status_notify(&session).await {
            warn!(target: "Client/Login", "Status notify failed: {e}");
        }
        self.verify_session().await?;
        if let Err(e) = self.save_session().await {
            warn!(target: "Client/Store", "Could not save session snapshot: {e}");
        }

        self.enter_active(session, false).await;
        Ok(())
    }

    /// One sync check against the installed session. The service answers a
    /// dead session with a non-zero retcode.
    async fn verify_session(&self) -> Result<(), LoginError> {
        match self.sync_check().await {
            Ok(SyncSignal::Dead { retcode }) => Err(LoginError::SessionRejected { retcode }),
            Ok(_) => Ok(()),
            Err(e) => Err(LoginError::Unverified(e)),
        }
    }

    async fn enter_active(self: &Arc<Self>, session: Session, restored: bool) {
        self.set_login_state(LoginState::Active);
        info!(
            target: "Client/Login",
            "Logged in as {} ({}){}",
            session.nick_name,
            session.user_name,
            if restored { ", session restored" } else { "" }
        );
        self.dispatch_event(Event::LoggedIn(LoggedIn {
            user_name: session.user_name,
            nick_name: session.nick_name,
            restored,
        }));
        self.start_sync_loop().await;
    }

    /// Full QR login: begin a handshake and poll it to completion.
    pub async fn login(self: &Arc<Self>) -> Result<(), LoginError> {
        if self.is_logging_in.swap(true, Ordering::SeqCst) {
            return Err(LoginError::AlreadyLoggingIn);
        }
        let _guard = scopeguard::guard((), |_| {
            self.is_logging_in.store(false, Ordering::Relaxed);
        });
        self.login_with_handshake().await
    }

    async fn login_with_handshake(self: &Arc<Self>) -> Result<(), LoginError> {
        self.stop_requested.store(false, Ordering::SeqCst);
        let handshake_id = self.begin_login().await?;
        self.poll_status(handshake_id).await
    }

    /// Resumes the persisted session if it is still accepted by the
    /// service. Returns whether the client is now logged in.
    pub async fn restore(self: &Arc<Self>) -> bool {
        if self.is_logging_in.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _guard = scopeguard::guard((), |_| {
            self.is_logging_in.store(false, Ordering::Relaxed);
        });
        self.restore_snapshot().await
    }

    async fn restore_snapshot(self: &Arc<Self>) -> bool {
        let Some(store) = &self.session_store else {
            return false;
        };
        if self.login_state() == LoginState::Active {
            return true;
        }
        let snapshot = match store.load().await {
            Ok(loaded) => match loaded.hit() {
                Some(snapshot) => snapshot,
                None => return false,
            },
            Err(e) => {
                warn!(target: "Client/Store", "Failed to load session snapshot: {e}");
                return false;
            }
        };

        if self.login_state() != LoginState::Unauthenticated {
            self.set_login_state(LoginState::Unauthenticated);
        }
        let user_name = snapshot.session.user_name.clone();
        *self.cookies.write().await = snapshot.cookies;
        *self.contacts.write().await = snapshot.contacts;
        *self.session.write().await = Some(snapshot.session);
        self.set_login_state(LoginState::Initializing);

        if let Err(reason) = self.verify_session().await {
            info!(target: "Client/Login", "Cannot resume session of {user_name}: {reason}");
            self.session.write().await.take();
            self.contacts.write().await.clear();
            self.cookies.write().await.retain_only(PUSH_LOGIN_COOKIES);
            self.set_login_state(LoginState::Unauthenticated);
            return false;
        }

        self.puid.reset_session().await;
        let (me, groups, users) = {
            let contacts = self.contacts.read().await;
            (
                contacts.self_user.clone(),
                contacts.groups.values().cloned().collect::<Vec<_>>(),
                contacts.users.values().cloned().collect::<Vec<_>>(),
            )
        };
        if let Some(me) = &me {
            self.puid.resolve_contact(me).await;
        }
        self.resolve_contacts(&groups).await;
        self.resolve_contacts(&users).await;
        let Some(session) = self.session().await else {
            self.set_login_state(LoginState::Unauthenticated);
            return false;
        };
        self.enter_active(session, true).await;
        true
    }

    /// Resumes the persisted session, falling back to a QR login.
    pub async fn login_or_restore(self: &Arc<Self>) -> Result<(), LoginError> {
        if self.is_logging_in.swap(true, Ordering::SeqCst) {
            return Err(LoginError::AlreadyLoggingIn);
        }
        let _guard = scopeguard::guard((), |_| {
            self.is_logging_in.store(false, Ordering::Relaxed);
        });
        if self.restore_snapshot().await {
            return Ok(());
        }
        self.login_with_handshake().await
    }

    /// Logs in again after the session died or on request. A running sync
    /// loop is stopped first. A snapshot younger than the re-auth cool-down
    /// is tried once and kept; an older one is discarded.
    pub async fn relogin(self: &Arc<Self>) -> Result<(), LoginError> {
        if self.is_logging_in.swap(true, Ordering::SeqCst) {
            return Err(LoginError::AlreadyLoggingIn);
        }
        let _guard = scopeguard::guard((), |_| {
            self.is_logging_in.store(false, Ordering::Relaxed);
        });

        self.stop_sync().await;
        self.session_saver.cancel();
        self.session.write().await.take();
        if self.login_state() != LoginState::Unauthenticated {
            self.set_login_state(LoginState::Unauthenticated);
        }

        if let Some(store) = &self.session_store {
            match store.age().await {
                Some(age) if age < self.config.reauth_cool_down => {
                    debug!(target: "Client/Login", "Snapshot is {age:?} old, trying it first");
                    if self.restore_snapshot().await {
                        return Ok(());
                    }
                }
                Some(_) => {
                    if let Err(e) = store.discard().await {
                        warn!(target: "Client/Store", "Could not discard stale snapshot: {e}");
                    }
                }
                None => {}
            }
        }
        self.login_with_handshake().await
    }
}
