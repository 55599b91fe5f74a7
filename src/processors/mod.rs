//! Concrete processors (§4.2): one per message type the agent
//! understands. Each owns its own input/output destinations and knows how
//! to turn a job message into a terminal [`StatusOutcome`].

pub mod catalog;
pub mod reduction;
pub mod script_writer;

use crate::error::AgentError;
use crate::model::{JobMessage, StatusOutcome};
use async_trait::async_trait;
use std::path::Path;

/// One registered message-type handler. `handle` returns the ordered
/// sequence of `(destination, status)` transitions it wants published
/// (§4.2) — the dispatcher publishes each in turn and never invents one
/// of its own, so a processor controls exactly when (and whether) a
/// `started` transition precedes its terminal one.
#[async_trait]
pub trait Processor: Send + Sync {
    fn input_destination(&self) -> &str;
    fn started_destination(&self) -> &str;
    fn complete_destination(&self) -> &str;
    fn error_destination(&self) -> &str;

    /// `None` for processors with no disabled-instrument concept (§4.2).
    fn disabled_destination(&self) -> Option<&str> {
        None
    }

    /// Pre-flight validation of the fields this processor requires,
    /// checked by the dispatcher before any transition is published.
    /// Failures are reported on the agent-wide error destination, not
    /// this processor's own, mirroring `PostProcessAdmin`'s handling of a
    /// message that fails construction before the processor ever runs
    /// (§7 error kind 1, §8 scenario 2).
    fn validate(&self, _message: &JobMessage) -> Result<(), String> {
        Ok(())
    }

    async fn handle(&self, message: &JobMessage) -> Vec<ProcessorOutcome>;
}

pub struct ProcessorOutcome {
    pub destination: String,
    pub outcome: StatusOutcome,
    /// Worker OS pid, if this transition is the one that spawned a
    /// worker, so the dispatcher can register it with the admission
    /// controller (§4.5 step 7).
    pub spawned_pid: Option<u32>,
}

impl ProcessorOutcome {
    pub fn started(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            outcome: StatusOutcome::Started,
            spawned_pid: None,
        }
    }
}

/// Shared validation for processors that operate on a data file
/// (reduction, catalog): `facility`, `instrument`, `ipts`, `run_number`
/// present, and a readable `data_file` (§3 data model; grounded on
/// `base_processor.py`'s `_process_data`, which raises on exactly these
/// before the processor is ever invoked).
pub fn validate_data_file_fields(message: &JobMessage) -> Result<(), String> {
    match message.data_file() {
        Some(data_file) if is_readable_file(data_file) => {}
        Some(data_file) => {
            return Err(AgentError::DataFileUnreadable(data_file.to_string()).to_string())
        }
        None => return Err("data_file is missing".to_string()),
    }
    if message.facility().is_none() {
        return Err("facility is missing".to_string());
    }
    if message.instrument().is_none() {
        return Err("instrument is missing".to_string());
    }
    if message.ipts().is_none() {
        return Err("ipts is missing".to_string());
    }
    if message.run_number().is_none() {
        return Err("run_number is missing".to_string());
    }
    Ok(())
}

/// True only if `path` is a regular file this process can actually read,
/// not merely one that exists (§3, "must be readable"; grounded on
/// `base_processor.py`'s `os.access(self.data_file, os.R_OK)` check —
/// `Path::is_file` alone would pass a file with permission bits that deny
/// us, e.g. mode 000 or a different owning uid).
fn is_readable_file(path: &str) -> bool {
    let path = Path::new(path);
    path.is_file() && std::fs::File::open(path).is_ok()
}
