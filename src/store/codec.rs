//! Versioned binary envelope shared by the session snapshot and the
//! identity store.
//!
//! Every file holds `{namespace, version, payload}`. The envelope decodes
//! independently of the payload, so a version check never depends on the
//! payload layout still being readable.

use super::error::{Result, StoreError};
use log::{debug, warn};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    namespace: String,
    version: String,
    payload: Vec<u8>,
}

/// Identity of one on-disk format.
#[derive(Debug, Clone)]
pub struct Format {
    pub namespace: &'static str,
    /// Names this format was stored under by older releases.
    pub legacy_namespaces: &'static [&'static str],
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Miss {
    NotFound,
    VersionMismatch { found: String, expected: String },
}

#[derive(Debug)]
pub enum Loaded<T> {
    Hit(T),
    Miss(Miss),
}

impl<T> Loaded<T> {
    pub fn hit(self) -> Option<T> {
        match self {
            Loaded::Hit(v) => Some(v),
            Loaded::Miss(_) => None,
        }
    }
}

fn bincode_config() -> bincode::config::Configuration {
    bincode::config::standard()
}

pub fn encode<T: Serialize>(format: &Format, value: &T) -> Result<Vec<u8>> {
    let payload = bincode::serde::encode_to_vec(value, bincode_config())
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    encode_envelope(format.namespace, &format.version, payload)
}

fn encode_envelope(namespace: &str, version: &str, payload: Vec<u8>) -> Result<Vec<u8>> {
    let envelope = Envelope {
        namespace: namespace.to_string(),
        version: version.to_string(),
        payload,
    };
    bincode::serde::encode_to_vec(&envelope, bincode_config())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode_envelope(bytes: &[u8]) -> Result<Envelope> {
    let (envelope, _): (Envelope, usize) =
        bincode::serde::decode_from_slice(bytes, bincode_config())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(envelope)
}

/// Serializes `value` and atomically replaces `path` with it.
pub fn save<T: Serialize>(path: &Path, format: &Format, value: &T) -> Result<()> {
    let bytes = encode(format, value)?;
    write_atomic(path, &bytes)?;
    Ok(())
}

/// Orders the writes to one file.
///
/// Callers draw a ticket while their snapshot is taken, then write through
/// [`WriteGate::write`] on the blocking pool. The gate's lock lives inside the
/// blocking closure, so it still holds when the task that started the write
/// has been aborted. A write whose ticket is older than the last one applied
/// is dropped.
#[derive(Debug, Default)]
pub struct WriteGate {
    next: AtomicU64,
    applied: Mutex<u64>,
}

impl WriteGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ticket(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Runs `write` unless a newer ticket already went through. Returns
    /// whether it ran.
    pub fn write<F>(&self, ticket: u64, write: F) -> Result<bool>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut applied = self.applied.lock().unwrap_or_else(PoisonError::into_inner);
        if *applied > ticket {
            debug!(
                target: "Client/Store",
                "Dropping write #{ticket}, #{} already applied",
                *applied
            );
            return Ok(false);
        }
        write()?;
        *applied = ticket;
        Ok(true)
    }
}

/// Reads `path`.
///
/// A missing file or a version other than `format.version` is a miss, not an
/// error. A file stored under a legacy namespace is rewritten under the
/// current one and read again, once.
pub fn load<T: DeserializeOwned>(path: &Path, format: &Format) -> Result<Loaded<T>> {
    load_inner(path, format, false)
}

fn load_inner<T: DeserializeOwned>(path: &Path, format: &Format, recur: bool) -> Result<Loaded<T>> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Loaded::Miss(Miss::NotFound)),
        Err(e) => return Err(e.into()),
    };
    let envelope = decode_envelope(&bytes)?;

    if envelope.namespace != format.namespace {
        let is_legacy = format.legacy_namespaces.contains(&envelope.namespace.as_str());
        if !is_legacy || recur {
            return Err(StoreError::UnknownNamespace {
                found: envelope.namespace,
                expected: format.namespace.to_string(),
            });
        }
        warn!(
            target: "Client/Store",
            "Migrating {} from namespace '{}' to '{}'",
            path.display(),
            envelope.namespace,
            format.namespace
        );
        let rewritten = encode_envelope(format.namespace, &envelope.version, envelope.payload)?;
        write_atomic(path, &rewritten)?;
        return load_inner(path, format, true);
    }

    if envelope.version != format.version {
        debug!(
            target: "Client/Store",
            "{} was written by version {}, expected {}; ignoring it",
            path.display(),
            envelope.version,
            format.version
        );
        return Ok(Loaded::Miss(Miss::VersionMismatch {
            found: envelope.version,
            expected: format.version.clone(),
        }));
    }

    let (value, _): (T, usize) =
        bincode::serde::decode_from_slice(&envelope.payload, bincode_config())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(Loaded::Hit(value))
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut suffix = [0u8; 6];
    rand::rng().fill_bytes(&mut suffix);
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}", hex::encode(suffix)));
    PathBuf::from(name)
}

/// Writes `bytes` to a sibling temp file, syncs it, then renames it over
/// `path`. The canonical path only ever holds a complete file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let temp = temp_path_for(path);
    debug!(target: "Client/Store", "Writing {} via {}", path.display(), temp.display());
    let result = (|| {
        let mut file = fs::File::create(&temp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        match fs::rename(&temp, path) {
            Ok(()) => Ok(()),
            // Platforms that refuse to rename over an existing file.
            Err(_) if path.exists() => {
                fs::remove_file(path)?;
                fs::rename(&temp, path)
            }
            Err(e) => Err(e),
        }
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result
}
