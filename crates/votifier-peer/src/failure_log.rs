//! Append-only record of votes that could not be decoded or authenticated.

use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::Mutex;
use votifier_core::ErrorKind;

use crate::app::AppError;

const SEPARATOR: &str = "========================================";

/// Writer for `failed-votes.log`.
#[derive(Debug)]
pub struct FailureLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FailureLog {
    /// Log at `path`; parent directories are created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// File being appended to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record.
    pub async fn record(
        &self,
        source: SocketAddr,
        kind: ErrorKind,
        raw: Vec<u8>,
    ) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
            let entry = format_entry(OffsetDateTime::now_utc(), source, kind, &raw);
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            file.write_all(entry.as_bytes())?;
            Ok::<_, AppError>(())
        })
        .await
        .map_err(|e| AppError::Runtime(format!("failure log join error: {e}")))?
    }
}

fn format_entry(at: OffsetDateTime, source: SocketAddr, kind: ErrorKind, raw: &[u8]) -> String {
    let date = at.format(&Rfc3339).unwrap_or_else(|_| at.unix_timestamp().to_string());
    let mut out = format!("{SEPARATOR}\nDate: {date}\nSource: {source}\nError: {kind}\n");
    if !raw.is_empty() {
        out.push_str("Payload/Data:\n");
        match std::str::from_utf8(raw) {
            Ok(text) => out.push_str(text),
            Err(_) => out.push_str(&hex_dump(raw)),
        }
        out.push('\n');
    }
    out.push_str(SEPARATOR);
    out.push_str("\n\n");
    out
}

fn hex_dump(raw: &[u8]) -> String {
    raw.chunks(32)
        .map(|chunk| chunk.iter().map(|b| format!("{b:02x}")).collect::<String>())
        .collect::<Vec<_>>()
        .join("\n")
}
