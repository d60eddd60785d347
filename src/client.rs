use crate::config::ClientConfig;
use crate::handlers::MessageRouter;
use crate::puid::PuidResolver;
use crate::qrcode;
use crate::store::{SessionSnapshot, SessionStore, StoreError};
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use wxcore::login::LoginState;
use wxcore::net::HttpClient;
use wxcore::session::{CookieJar, Session};
use wxcore::types::events::{CoreEventBus, Event, EventHandler, LoginStateChanged, LoginStatus};
use wxcore::types::{ContactSnapshot, RawContact};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client is not logged in")]
    NotLoggedIn,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// A web session client: login, sync loop, session and identity stores.
pub struct Client {
    pub(crate) config: ClientConfig,
    pub http_client: Arc<dyn HttpClient>,
    pub(crate) event_bus: CoreEventBus,

    pub(crate) login_state: std::sync::Mutex<LoginState>,
    /// Last (handshake id, status) pair reported to subscribers.
    pub(crate) last_reported: std::sync::Mutex<Option<(String, u16)>>,

    pub(crate) session: RwLock<Option<Session>>,
    pub(crate) cookies: RwLock<CookieJar>,
    pub(crate) contacts: RwLock<ContactSnapshot>,

    pub(crate) puid: Arc<PuidResolver>,
    pub(crate) session_store: Option<SessionStore>,
    pub(crate) session_saver: crate::store::Debouncer,

    pub(crate) message_router: MessageRouter,

    pub(crate) is_logging_in: AtomicBool,
    pub(crate) is_running: AtomicBool,
    pub(crate) stop_requested: AtomicBool,
    pub(crate) shutdown_notifier: Notify,
    pub(crate) sync_task: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Builds a client, opening the identity store if one is configured.
    pub async fn new(
        config: ClientConfig,
        http_client: Arc<dyn HttpClient>,
        message_router: MessageRouter,
    ) -> Result<Arc<Self>, ClientError> {
        let puid = match &config.puid_path {
            Some(path) => {
                PuidResolver::open(
                    path,
                    config.puid_log_path.clone(),
                    config.system_accounts.clone(),
                    config.puid_dump_delay,
                )
                .await?
            }
            None => PuidResolver::in_memory(config.system_accounts.clone()),
        };
        let session_store = config.session_path.as_ref().map(SessionStore::new);
        let session_saver = crate::store::Debouncer::new("session save", config.session_save_delay);

        Ok(Arc::new(Self {
            config,
            http_client,
            event_bus: CoreEventBus::new(),
            login_state: std::sync::Mutex::new(LoginState::Unauthenticated),
            last_reported: std::sync::Mutex::new(None),
            session: RwLock::new(None),
            cookies: RwLock::new(CookieJar::new()),
            contacts: RwLock::new(ContactSnapshot::default()),
            puid,
            session_store,
            session_saver,
            message_router,
            is_logging_in: AtomicBool::new(false),
            is_running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            shutdown_notifier: Notify::new(),
            sync_task: Mutex::new(None),
        }))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn add_event_handler(&self, handler: Arc<dyn EventHandler>) {
        self.event_bus.add_handler(handler);
    }

    pub(crate) fn dispatch_event(&self, event: Event) {
        self.event_bus.dispatch(&event);
    }

    pub fn login_state(&self) -> LoginState {
        *self
            .login_state
            .lock()
            .expect("login state mutex should not be poisoned")
    }

    pub fn is_logged_in(&self) -> bool {
        self.login_state() == LoginState::Active
    }

    /// True while the sync loop task is alive.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    /// Moves to `to` and announces the change. Transitions the state table
    /// does not allow are refused and logged.
    pub(crate) fn set_login_state(&self, to: LoginState) -> bool {
        let from = {
            let mut state = self
                .login_state
                .lock()
                .expect("login state mutex should not be poisoned");
            let from = *state;
            if from == to {
                return true;
            }
            if !from.can_transition_to(to) {
                warn!(target: "Client/Login", "Refusing login state transition {from} -> {to}");
                return false;
            }
            *state = to;
            from
        };
        debug!(target: "Client/Login", "Login state {from} -> {to}");
        self.dispatch_event(Event::LoginStateChanged(LoginStateChanged { from, to }));
        true
    }

    /// Emits a handshake status report unless the same pair was the last one
    /// reported. `qr_content` is rendered to a PNG when present.
    pub(crate) fn report_status(&self, handshake_id: &str, status: u16, qr_content: Option<String>) {
        {
            let mut last = self
                .last_reported
                .lock()
                .expect("status mutex should not be poisoned");
            if last
                .as_ref()
                .is_some_and(|(id, code)| id == handshake_id && *code == status)
            {
                return;
            }
            *last = Some((handshake_id.to_string(), status));
        }

        let qr_png = match &qr_content {
            Some(content) if self.event_bus.has_handlers() => match qrcode::render_png(content) {
                Ok(png) => Some(png),
                Err(e) => {
                    warn!(target: "Client/Login", "Failed to render QR code: {e}");
                    None
                }
            },
            _ => None,
        };
        info!(target: "Client/Login", "Handshake {handshake_id} status {status}");
        self.dispatch_event(Event::LoginStatus(LoginStatus {
            handshake_id: handshake_id.to_string(),
            status,
            qr_content,
            qr_png,
        }));
    }

    /// The current session, if logged in.
    pub async fn session(&self) -> Option<Session> {
        self.session.read().await.clone()
    }

    pub async fn contacts(&self) -> ContactSnapshot {
        self.contacts.read().await.clone()
    }

    pub fn puid_resolver(&self) -> &Arc<PuidResolver> {
        &self.puid
    }

    /// Resolves a contact and every member it lists.
    pub(crate) async fn resolve_contacts(&self, contacts: &[RawContact]) {
        for contact in contacts {
            self.puid.resolve_contact(contact).await;
            for member in &contact.member_list {
                self.puid.resolve_contact(member).await;
            }
        }
    }

    /// Looks a chat up by its durable id.
    pub async fn chat_by_puid(&self, puid: &str) -> Option<RawContact> {
        let user_name = self.puid.user_name_for_puid(puid).await?;
        let contacts = self.contacts.read().await;
        if let Some(contact) = contacts.get(&user_name) {
            return Some(contact.clone());
        }
        contacts
            .groups
            .values()
            .flat_map(|g| g.member_list.iter())
            .find(|m| m.user_name == user_name)
            .cloned()
    }

    pub(crate) async fn start_sync_loop(self: &Arc<Self>) {
        self.stop_requested.store(false, Ordering::SeqCst);
        self.is_running.store(true, Ordering::SeqCst);
        let this = self.clone();
        let handle = tokio::spawn(async move { this.sync_loop().await });
        if let Some(previous) = self.sync_task.lock().await.replace(handle) {
            previous.abort();
        }
    }

    /// Asks the sync loop to stop and waits for it to exit. The loop checks
    /// the request before each poll, so an in-flight long poll finishes
    /// first. Must not be called from a message handler.
    pub async fn stop_sync(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.shutdown_notifier.notify_waiters();
        let handle = self.sync_task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await
                && !e.is_cancelled()
            {
                warn!(target: "Client/Sync", "Sync loop task failed: {e}");
            }
            debug!(target: "Client/Sync", "Sync loop stopped");
        }
    }

    /// Writes the session snapshot now. No-op without a store or a session.
    pub async fn save_session(&self) -> Result<(), ClientError> {
        let Some(store) = &self.session_store else {
            return Ok(());
        };
        let Some(session) = self.session.read().await.clone() else {
            return Ok(());
        };
        let snapshot = SessionSnapshot {
            session,
            cookies: self.cookies.read().await.clone(),
            contacts: self.contacts.read().await.clone(),
        };
        store.save(&snapshot).await?;
        Ok(())
    }

    pub(crate) fn schedule_session_save(self: &Arc<Self>) {
        if self.session_store.is_none() {
            return;
        }
        let this = self.clone();
        self.session_saver.schedule(async move {
            if let Err(e) = this.save_session().await {
                warn!(target: "Client/Store", "Debounced session save failed: {e}");
            }
        });
    }

    /// Stops the sync loop and forgets the session locally and remotely.
    /// The snapshot file is removed so the next start needs a new login.
    pub async fn logout(&self) -> Result<(), ClientError> {
        let was_active = self.is_logged_in();
        self.stop_sync().await;
        self.session_saver.cancel();

        if was_active && let Err(e) = self.web_logout().await {
            debug!(target: "Client/Login", "Remote logout failed: {e}");
        }
        self.session.write().await.take();
        self.contacts.write().await.clear();
        self.cookies.write().await.clear();
        if let Some(store) = &self.session_store {
            store.discard().await?;
        }

        if was_active {
            self.set_login_state(LoginState::LoggedOut);
        } else {
            self.set_login_state(LoginState::Unauthenticated);
        }
        info!(target: "Client/Login", "Logged out");
        Ok(())
    }

    /// Stops the sync loop and writes both stores. The session stays valid
    /// for a later restore.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        info!(target: "Client", "Shutting down client");
        self.stop_sync().await;
        self.session_saver.cancel();
        self.save_session().await?;
        self.puid.flush().await?;
        Ok(())
    }
}
