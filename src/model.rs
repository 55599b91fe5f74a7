//! Wire-level data model: job messages, status messages, and the worker
//! bookkeeping record the admission controller keeps per spawned process.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::fmt;

/// A job message as received from the broker. Keeps unknown keys intact
/// (processors only look at a handful of recognized fields) and exposes
/// typed accessors for the ones the dispatcher itself cares about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobMessage(Map<String, Value>);

impl JobMessage {
    pub fn from_bytes(body: &[u8]) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_slice(body)?;
        let map = value.as_object().cloned().unwrap_or_default();
        Ok(Self(map))
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn data_file(&self) -> Option<&str> {
        self.str_field("data_file")
    }

    pub fn facility(&self) -> Option<String> {
        self.str_field("facility").map(|s| s.to_uppercase())
    }

    /// The instrument tag, uppercased per §3. Absent when the message
    /// doesn't carry one (e.g. the script-writer's reduced schema).
    pub fn instrument(&self) -> Option<String> {
        self.str_field("instrument").map(|s| s.to_uppercase())
    }

    pub fn ipts(&self) -> Option<String> {
        self.str_field("ipts").map(|s| s.to_uppercase())
    }

    pub fn run_number(&self) -> Option<&str> {
        self.str_field("run_number")
    }

    pub fn use_default(&self) -> bool {
        self.0.get("use_default").and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn template_data(&self) -> Option<&Value> {
        self.0.get("template_data")
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&Value::Object(self.0.clone())).expect("job message is valid JSON")
    }
}

impl fmt::Display for JobMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::Object(self.0.clone()))
    }
}

/// One status transition a processor's `handle` produces, before it has
/// been turned into bytes for the wire (§4.2: "a generator of
/// `(destination, status_message)` pairs"). `Complete` and `Error` are
/// mutually exclusive by construction: a single call site never builds
/// both for the same job (§9 open question resolution).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StatusOutcome {
    Started,
    Complete { information: Option<String> },
    Error { reason: String },
    Disabled,
}

/// A status message: the original job message plus the outcome fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusMessage {
    base: JobMessage,
    information: Option<String>,
    error: Option<String>,
}

impl StatusMessage {
    pub fn from_outcome(base: JobMessage, hostname: &str, outcome: StatusOutcome) -> Self {
        match outcome {
            StatusOutcome::Started | StatusOutcome::Disabled => Self {
                base,
                information: Some(hostname.to_string()),
                error: None,
            },
            StatusOutcome::Complete { information } => Self {
                base,
                information: Some(information.unwrap_or_else(|| hostname.to_string())),
                error: None,
            },
            StatusOutcome::Error { reason } => Self {
                base,
                information: Some(hostname.to_string()),
                error: Some(reason),
            },
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut map = self.base.as_map().clone();
        if let Some(info) = &self.information {
            map.insert("information".to_string(), Value::String(info.clone()));
        }
        if let Some(err) = &self.error {
            map.insert("error".to_string(), Value::String(err.clone()));
        }
        serde_json::to_vec(&Value::Object(map)).expect("status message is valid JSON")
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Bookkeeping for one spawned worker, held by the admission controller
/// in both the global set and the per-instrument index.
#[derive(Clone, Debug)]
pub struct WorkerRecord {
    pub pid: u32,
    pub instrument: Option<String>,
    pub message: JobMessage,
    pub started_at: DateTime<Utc>,
}

impl WorkerRecord {
    pub fn new(pid: u32, instrument: Option<String>, message: JobMessage) -> Self {
        Self {
            pid,
            instrument,
            message,
            started_at: Utc::now(),
        }
    }
}
