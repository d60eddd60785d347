use chrono::Local;
use log::warn;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Default size at which the diagnostic log rotates.
pub const DEFAULT_MAX_BYTES: u64 = 1024 * 1024;

struct Sink {
    file: File,
    written: u64,
}

/// Size-capped log of identity resolution decisions.
///
/// When the file reaches `max_bytes` it is moved to `<path>.1` (replacing
/// any previous backup) and a fresh file is started. A write failure
/// disables the log instead of failing resolution.
pub struct PuidLog {
    path: PathBuf,
    max_bytes: u64,
    sink: Mutex<Option<Sink>>,
}

impl PuidLog {
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64) -> io::Result<Self> {
        let path = path.into();
        let sink = Self::open_sink(&path)?;
        Ok(Self {
            path,
            max_bytes,
            sink: Mutex::new(Some(sink)),
        })
    }

    fn open_sink(path: &Path) -> io::Result<Sink> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let written = file.metadata()?.len();
        Ok(Sink { file, written })
    }

    fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".1");
        PathBuf::from(name)
    }

    pub fn record(&self, args: fmt::Arguments<'_>) {
        let line = format!("{} {}\n", Local::now().format("%Y-%m-%d %H:%M:%S"), args);
        let Ok(mut guard) = self.sink.lock() else {
            return;
        };
        let Some(sink) = guard.as_mut() else {
            return;
        };

        let result = (|| -> io::Result<()> {
            if sink.written > 0 && sink.written + line.len() as u64 > self.max_bytes {
                sink.file.flush()?;
                fs::rename(&self.path, self.backup_path())?;
                *sink = Self::open_sink(&self.path)?;
            }
            sink.file.write_all(line.as_bytes())?;
            sink.written += line.len() as u64;
            Ok(())
        })();

        if let Err(e) = result {
            warn!(
                target: "Client/Puid",
                "Disabling PUID diagnostic log {}: {e}",
                self.path.display()
            );
            *guard = None;
        }
    }
}
