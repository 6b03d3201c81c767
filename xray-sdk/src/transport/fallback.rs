//! Local fallback log for undeliverable traces

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;
use xray_core::dto::ingest::IngestPayload;

/// Serializes appends from concurrent deliveries within the process
static APPEND_LOCK: Mutex<()> = Mutex::new(());

/// Appends `payload` as one JSON line to `path`, creating parent directories
pub(crate) fn append(path: &Path, payload: &IngestPayload) -> io::Result<()> {
    let mut line = serde_json::to_vec(payload)?;
    line.push(b'\n');

    let _guard = APPEND_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&line)?;
    file.flush()
}
