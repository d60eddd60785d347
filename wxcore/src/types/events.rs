use crate::login::LoginState;
use crate::types::message::NormalizedMessage;
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Wrapper for large event data that uses Arc for cheap cloning.
#[derive(Debug, Clone)]
pub struct SharedData<T>(pub Arc<T>);

impl<T> SharedData<T> {
    pub fn new(data: T) -> Self {
        Self(Arc::new(data))
    }
}

impl<T> std::ops::Deref for SharedData<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T: Serialize> Serialize for SharedData<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &Event);
}

#[derive(Default, Clone)]
pub struct CoreEventBus {
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
}

impl CoreEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .expect("RwLock should not be poisoned")
            .push(handler);
    }

    /// Returns true if there are any event handlers registered.
    pub fn has_handlers(&self) -> bool {
        !self
            .handlers
            .read()
            .expect("RwLock should not be poisoned")
            .is_empty()
    }

    pub fn dispatch(&self, event: &Event) {
        let handlers = self
            .handlers
            .read()
            .expect("RwLock should not be poisoned")
            .clone();
        for handler in handlers.iter() {
            handler.handle_event(event);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub enum Event {
    LoginStateChanged(LoginStateChanged),
    /// Handshake status report. Emitted once per distinct
    /// (handshake id, status) pair.
    LoginStatus(LoginStatus),
    LoggedIn(LoggedIn),
    /// The sync loop ended on its own. Never emitted for an explicit stop.
    LoggedOut(LoggedOut),

    Message(SharedData<NormalizedMessage>),
    ContactsUpdated(ContactsUpdated),
    /// A sync batch was delivered and its cursor committed.
    SyncBatch(SyncBatch),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoginStateChanged {
    pub from: LoginState,
    pub to: LoginState,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginStatus {
    pub handshake_id: String,
    pub status: u16,
    /// Content encoded in the QR code, absent for push login.
    pub qr_content: Option<String>,
    /// Rendered PNG, absent for push login and for non-QR statuses.
    #[serde(skip)]
    pub qr_png: Option<Bytes>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggedIn {
    pub user_name: String,
    pub nick_name: String,
    /// True when the session came from a snapshot rather than a handshake.
    pub restored: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum LogoutReason {
    /// The service reported the session dead.
    RemoteLogout { retcode: u32 },
    /// Too many consecutive failed iterations.
    ExhaustedRetries { failures: u32 },
}

impl fmt::Display for LogoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogoutReason::RemoteLogout { retcode } => {
                write!(f, "logged out by remote (retcode {retcode})")
            }
            LogoutReason::ExhaustedRetries { failures } => {
                write!(f, "gave up after {failures} consecutive failures")
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggedOut {
    pub reason: LogoutReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContactsUpdated {
    pub groups: Vec<String>,
    pub users: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncBatch {
    pub messages: usize,
    pub contacts: usize,
    /// String form of the committed cursor.
    pub cursor: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder(Mutex<Vec<String>>);

    impl EventHandler for Recorder {
        fn handle_event(&self, event: &Event) {
            if let Event::LoggedOut(out) = event {
                self.0.lock().unwrap().push(out.reason.to_string());
            }
        }
    }

    #[test]
    fn bus_dispatches_to_every_handler() {
        let bus = CoreEventBus::new();
        assert!(!bus.has_handlers());

        let a = Arc::new(Recorder(Mutex::new(Vec::new())));
        let b = Arc::new(Recorder(Mutex::new(Vec::new())));
        bus.add_handler(a.clone());
        bus.add_handler(b.clone());

        bus.dispatch(&Event::LoggedOut(LoggedOut {
            reason: LogoutReason::RemoteLogout { retcode: 1101 },
        }));

        assert_eq!(a.0.lock().unwrap().len(), 1);
        assert_eq!(
            b.0.lock().unwrap()[0],
            "logged out by remote (retcode 1101)"
        );
    }
}
