use super::codec::{self, Format, Loaded, WriteGate};
use super::error::Result;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use wxcore::session::{CookieJar, Session};
use wxcore::types::ContactSnapshot;

const SESSION_NAMESPACE: &str = "wechat_web::session";
const LEGACY_SESSION_NAMESPACES: &[&str] = &["wechat_web::hotreload"];

/// Everything needed to resume a session without scanning again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session: Session,
    pub cookies: CookieJar,
    pub contacts: ContactSnapshot,
}

/// Durable home of the session snapshot.
///
/// Writes are serialized through one lock and applied through a
/// [`WriteGate`], so a save abandoned mid-write never lands over a later one.
/// Reads happen at startup before any sync loop exists.
pub struct SessionStore {
    path: PathBuf,
    format: Format,
    write_lock: Mutex<()>,
    gate: Arc<WriteGate>,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_version(path, env!("CARGO_PKG_VERSION"))
    }

    /// Store tagged with an explicit format version.
    pub fn with_version(path: impl Into<PathBuf>, version: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            format: Format {
                namespace: SESSION_NAMESPACE,
                legacy_namespaces: LEGACY_SESSION_NAMESPACES,
                version: version.into(),
            },
            write_lock: Mutex::new(()),
            gate: Arc::new(WriteGate::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.path.clone();
        let format = self.format.clone();
        let snapshot = snapshot.clone();
        let gate = self.gate.clone();
        let ticket = gate.ticket();
        let written = tokio::task::spawn_blocking(move || {
            gate.write(ticket, || codec::save(&path, &format, &snapshot))
        })
        .await??;
        if written {
            debug!(target: "Client/Store", "Session snapshot saved to {}", self.path.display());
        }
        Ok(())
    }

    /// Loads the snapshot. A missing file or a snapshot from another
    /// version is a miss.
    pub async fn load(&self) -> Result<Loaded<SessionSnapshot>> {
        let path = self.path.clone();
        let format = self.format.clone();
        let _guard = self.write_lock.lock().await;
        let loaded =
            tokio::task::spawn_blocking(move || codec::load::<SessionSnapshot>(&path, &format))
                .await??;
        if let Loaded::Miss(miss) = &loaded {
            info!(target: "Client/Store", "No usable session snapshot: {miss:?}");
        }
        Ok(loaded)
    }

    /// Time since the snapshot was last written, `None` if there is none.
    pub async fn age(&self) -> Option<Duration> {
        let meta = tokio::fs::metadata(&self.path).await.ok()?;
        let modified = meta.modified().ok()?;
        Some(
            SystemTime::now()
                .duration_since(modified)
                .unwrap_or(Duration::ZERO),
        )
    }

    pub async fn discard(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.path.clone();
        let gate = self.gate.clone();
        let ticket = gate.ticket();
        tokio::task::spawn_blocking(move || {
            gate.write(ticket, || match std::fs::remove_file(&path) {
                Ok(()) => {
                    info!(target: "Client/Store", "Discarded session snapshot {}", path.display());
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            })
        })
        .await??;
        Ok(())
    }
}
