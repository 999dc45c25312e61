use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::request::GenerationKind;

/// Lifecycle events recorded for one generation request. Payloads carry
/// credential fingerprints at most, never the key.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JournalEvent {
    SubmissionStarted {
        provider: String,
        kind: GenerationKind,
        model: Option<String>,
        credential_fingerprint: Option<String>,
    },
    SubmissionImmediate {
        provider: String,
        inline: bool,
    },
    TaskAccepted {
        provider: String,
        task_id: String,
    },
    PollTick {
        provider: String,
        task_id: String,
        tick: u32,
        status: String,
    },
    GenerationSucceeded {
        provider: String,
        task_id: Option<String>,
        degraded: bool,
    },
    GenerationFailed {
        provider: String,
        error_kind: ErrorKind,
        code: String,
        message: String,
    },
    FallbackAttempt {
        from: String,
        to: String,
        code: String,
    },
}

/// Append-only JSONL journal.
///
/// Every line carries `type`, `request_id` and `ts`; event fields are merged
/// after the defaults.
#[derive(Debug, Clone)]
pub struct GenerationJournal {
    inner: Arc<JournalInner>,
}

#[derive(Debug)]
struct JournalInner {
    path: PathBuf,
    lock: Mutex<()>,
}

impl GenerationJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(JournalInner {
                path: path.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn emit(&self, request_id: &Uuid, event: &JournalEvent) -> anyhow::Result<Value> {
        let mut line = Map::new();
        line.insert("request_id".to_string(), Value::String(request_id.to_string()));
        line.insert("ts".to_string(), Value::String(now_utc_iso()));
        match serde_json::to_value(event)? {
            Value::Object(fields) => line.extend(fields),
            other => anyhow::bail!("journal event serialized to non-object: {other}"),
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let encoded = serde_json::to_string(&line)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("journal lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(encoded.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(line))
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
