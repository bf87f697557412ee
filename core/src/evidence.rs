//! Append-only JSON-Lines evidence log with a byte budget.
//!
//! Every event is wrapped with `schemaVersion: 1` and written on one line.
//! When the next line would push the file past the configured budget the
//! writer latches itself off for the remainder of the run, appending a single
//! `evidence.truncated` marker if that still fits. All later appends are
//! silently dropped.

use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use serde_json::Value;
use serde_json::json;
use tracing::warn;

use crate::util::now_iso;

pub const EVENT_SCHEMA_VERSION: i64 = 1;

/// Default byte budget: 20 MB.
pub const DEFAULT_EVIDENCE_MAX_BYTES: u64 = 20_000_000;

pub struct EvidenceWriter {
    path: PathBuf,
    max_bytes: u64,
    disabled: Mutex<bool>,
}

impl EvidenceWriter {
    pub fn new(path: PathBuf, max_bytes: u64) -> Self {
        Self {
            path,
            max_bytes,
            disabled: Mutex::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event. Failures are logged, never propagated: evidence is
    /// diagnostic output and must not take the run down with it.
    pub fn append(&self, event: Value) {
        #[expect(clippy::unwrap_used)]
        let mut disabled = self.disabled.lock().unwrap();
        if *disabled {
            return;
        }

        let mut wrapped = json!({"schemaVersion": EVENT_SCHEMA_VERSION});
        if let (Some(target), Some(source)) = (wrapped.as_object_mut(), event.as_object()) {
            for (key, value) in source {
                target.insert(key.clone(), value.clone());
            }
        }
        let mut line = wrapped.to_string();
        line.push('\n');

        let current = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if self.max_bytes > 0 && current + line.len() as u64 > self.max_bytes {
            *disabled = true;
            let marker = json!({
                "schemaVersion": EVENT_SCHEMA_VERSION,
                "type": "evidence.truncated",
                "at": now_iso(),
                "maxBytes": self.max_bytes,
            })
            .to_string();
            if current + marker.len() as u64 + 1 <= self.max_bytes {
                self.write_line(&format!("{marker}\n"));
            }
            return;
        }

        self.write_line(&line);
    }

    fn write_line(&self, line: &str) {
        if let Some(parent) = self.path.parent()
            && let Err(err) = std::fs::create_dir_all(parent)
        {
            warn!("failed to create evidence directory: {err}");
            return;
        }
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(err) = result {
            warn!("failed to append evidence event: {err}");
        }
    }
}
