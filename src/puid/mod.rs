//! Durable chat ids with debounced persistence.

pub mod diagnostics;

use crate::store::codec::{self, Format, Loaded, WriteGate};
use crate::store::{Debouncer, StoreError};
use diagnostics::PuidLog;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use wxcore::puid::{ChatObservation, MatchSource, PuidMap, PuidTables};
use wxcore::types::{RawContact, SystemAccounts};

const PUID_NAMESPACE: &str = "wechat_web::puid";
const LEGACY_PUID_NAMESPACES: &[&str] = &["wechat_web::utils::puid"];
const PUID_FORMAT_VERSION: &str = "1";

fn puid_format() -> Format {
    Format {
        namespace: PUID_NAMESPACE,
        legacy_namespaces: LEGACY_PUID_NAMESPACES,
        version: PUID_FORMAT_VERSION.to_string(),
    }
}

/// Resolves chats to durable ids and keeps the identity store on disk.
///
/// Each resolution holds one lock for lookup and update together, so two
/// concurrent observations of a new chat cannot mint two ids.
pub struct PuidResolver {
    map: Mutex<PuidMap>,
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
    gate: Arc<WriteGate>,
    dump: Debouncer,
    diagnostics: Option<PuidLog>,
}

impl PuidResolver {
    /// Resolver without a backing file.
    pub fn in_memory(system: SystemAccounts) -> Arc<Self> {
        Arc::new(Self {
            map: Mutex::new(PuidMap::new(system)),
            path: None,
            write_lock: Mutex::new(()),
            gate: Arc::new(WriteGate::new()),
            dump: Debouncer::new("puid dump", Duration::from_secs(30)),
            diagnostics: None,
        })
    }

    /// Opens the identity store at `path`, starting empty if the file is
    /// missing or from another format version.
    pub async fn open(
        path: impl Into<PathBuf>,
        log_path: Option<PathBuf>,
        system: SystemAccounts,
        dump_delay: Duration,
    ) -> Result<Arc<Self>, StoreError> {
        let path = path.into();
        let load_path = path.clone();
        let loaded = tokio::task::spawn_blocking(move || {
            codec::load::<PuidTables>(&load_path, &puid_format())
        })
        .await??;

        let tables = match loaded {
            Loaded::Hit(tables) => {
                info!(
                    target: "Client/Puid",
                    "Loaded {} PUIDs from {}",
                    tables.len(),
                    path.display()
                );
                tables
            }
            Loaded::Miss(miss) => {
                debug!(target: "Client/Puid", "Starting with an empty PUID map ({miss:?})");
                PuidTables::default()
            }
        };

        let diagnostics = match log_path {
            Some(p) => match PuidLog::open(&p, diagnostics::DEFAULT_MAX_BYTES) {
                Ok(log) => Some(log),
                Err(e) => {
                    warn!(target: "Client/Puid", "Cannot open PUID log {}: {e}", p.display());
                    None
                }
            },
            None => None,
        };

        Ok(Arc::new(Self {
            map: Mutex::new(PuidMap::from_tables(tables, system)),
            path: Some(path),
            write_lock: Mutex::new(()),
            gate: Arc::new(WriteGate::new()),
            dump: Debouncer::new("puid dump", dump_delay),
            diagnostics,
        }))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn trace(&self, args: std::fmt::Arguments<'_>) {
        debug!(target: "Client/Puid", "{args}");
        if let Some(log) = &self.diagnostics {
            log.record(args);
        }
    }

    /// Durable id for `chat`, minting one if needed. `None` when the chat
    /// lacks the attributes needed to identify it.
    pub async fn resolve(self: &Arc<Self>, chat: &ChatObservation) -> Option<String> {
        let resolution = {
            let mut map = self.map.lock().await;
            map.resolve(chat)
        };

        let Some(resolution) = resolution else {
            self.trace(format_args!(
                "{} has no user name or nick name, not resolvable",
                chat.user_name
            ));
            return None;
        };

        match resolution.source {
            MatchSource::System => {}
            MatchSource::Minted => self.trace(format_args!(
                "New chat {} {} assigned PUID {}",
                chat.user_name, chat.caption, resolution.puid
            )),
            source => self.trace(format_args!(
                "{} matched PUID {} by {}",
                chat.user_name, resolution.puid, source
            )),
        }

        if resolution.updated {
            self.schedule_dump();
        }
        Some(resolution.puid)
    }

    pub async fn resolve_contact(self: &Arc<Self>, contact: &RawContact) -> Option<String> {
        self.resolve(&ChatObservation::from_contact(contact)).await
    }

    /// Starts a new session: routing names from earlier sessions no longer
    /// count as live.
    pub async fn reset_session(&self) {
        self.map.lock().await.reset_session();
    }

    pub async fn puid_for_user_name(&self, user_name: &str) -> Option<String> {
        let map = self.map.lock().await;
        map.puid_for_user_name(user_name).map(str::to_string)
    }

    pub async fn user_name_for_puid(&self, puid: &str) -> Option<String> {
        let map = self.map.lock().await;
        map.user_name_for_puid(puid).map(str::to_string)
    }

    pub async fn tables(&self) -> PuidTables {
        self.map.lock().await.tables().clone()
    }

    pub async fn len(&self) -> usize {
        self.map.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.map.lock().await.is_empty()
    }

    fn schedule_dump(self: &Arc<Self>) {
        if self.path.is_none() {
            return;
        }
        let this = self.clone();
        self.dump.schedule(async move {
            if let Err(e) = this.dump().await {
                warn!(target: "Client/Puid", "Debounced PUID dump failed: {e}");
            }
        });
    }

    /// Writes the store now and drops any pending debounced write.
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.dump.cancel();
        self.dump().await
    }

    async fn dump(&self) -> Result<(), StoreError> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().await;
        let tables = self.tables().await;
        let count = tables.len();
        let gate = self.gate.clone();
        let ticket = gate.ticket();
        let written = tokio::task::spawn_blocking(move || {
            gate.write(ticket, || codec::save(&path, &puid_format(), &tables))
        })
        .await??;
        if written {
            self.trace(format_args!("Dumped {count} PUIDs to disk"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wxcore::puid::Caption;

    fn chat(user_name: &str, nick: &str) -> ChatObservation {
        ChatObservation {
            user_name: user_name.to_string(),
            caption: Caption::new(nick, 0, "", ""),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn concurrent_resolution_mints_one_id() {
        let resolver = PuidResolver::in_memory(SystemAccounts::default());
        let observation = chat("@0123456789abcdef0123", "Newcomer");

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let resolver = resolver.clone();
            let observation = observation.clone();
            tasks.push(tokio::spawn(async move {
                resolver.resolve(&observation).await
            }));
        }

        let mut ids = std::collections::BTreeSet::new();
        for task in tasks {
            ids.insert(task.await.unwrap().unwrap());
        }
        assert_eq!(ids.len(), 1);
        assert_eq!(resolver.len().await, 1);
    }

    #[tokio::test]
    async fn flush_and_reopen_keeps_mappings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("puid.bin");
        let log_path = dir.path().join("puid.log");

        let resolver = PuidResolver::open(
            &path,
            Some(log_path.clone()),
            SystemAccounts::default(),
            Duration::from_secs(30),
        )
        .await
        .unwrap();
        let mut alice = chat("@alice-routing-1", "Alice");
        alice.wxid = Some("alice_w".into());
        let puid = resolver.resolve(&alice).await.unwrap();
        resolver.flush().await.unwrap();
        let before = resolver.tables().await;

        let reopened = PuidResolver::open(&path, None, SystemAccounts::default(), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(reopened.tables().await, before);
        assert_eq!(
            reopened.puid_for_user_name("@alice-routing-1").await.as_deref(),
            Some(puid.as_str())
        );
        assert!(std::fs::read_to_string(log_path).unwrap().contains(&puid));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn flush_outlives_an_interrupted_debounced_dump() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("puid.bin");
        let resolver = PuidResolver::open(&path, None, SystemAccounts::default(), Duration::ZERO)
            .await
            .unwrap();

        for i in 0..2_000 {
            let mut observation = chat(&format!("@member-{i:04}"), &format!("Member {i}"));
            observation.wxid = Some(format!("member_{i}"));
            resolver.resolve(&observation).await.unwrap();
        }
        // The last debounced dump is writing when the flush cancels it.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let mut late = chat("@late-arrival", "Late");
        late.wxid = Some("late_w".into());
        let late_puid = resolver.resolve(&late).await.unwrap();
        resolver.flush().await.unwrap();
        let flushed = resolver.tables().await;

        tokio::time::sleep(Duration::from_millis(500)).await;
        let reopened = PuidResolver::open(&path, None, SystemAccounts::default(), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(reopened.tables().await, flushed);
        assert_eq!(
            reopened.puid_for_user_name("@late-arrival").await.as_deref(),
            Some(late_puid.as_str())
        );
    }
}
