//! Reduction processor (§4.2): runs a per-instrument reduction script
//! through the job handler and reports the classified outcome. Emits
//! `disabled` instead of spawning anything when the instrument has no
//! reduction script installed.

use super::{validate_data_file_fields, Processor, ProcessorOutcome};
use crate::config::{FilesystemConfig, ResourceLimitsConfig};
use crate::job_handler::{self, WorkerSpawnRequest};
use crate::model::{JobMessage, StatusOutcome};
use async_trait::async_trait;
use regex::Regex;
use std::path::PathBuf;

pub struct ReductionProcessor {
    input_destination: String,
    started_destination: String,
    complete_destination: String,
    error_destination: String,
    disabled_destination: String,
    filesystem: FilesystemConfig,
    resource_limits: ResourceLimitsConfig,
    ignorable_patterns: Vec<Regex>,
    communication_only: bool,
}

impl ReductionProcessor {
    pub fn new(
        input_destination: impl Into<String>,
        started_destination: impl Into<String>,
        complete_destination: impl Into<String>,
        error_destination: impl Into<String>,
        disabled_destination: impl Into<String>,
        filesystem: FilesystemConfig,
        resource_limits: ResourceLimitsConfig,
        ignorable_patterns: Vec<Regex>,
        communication_only: bool,
    ) -> Self {
        Self {
            input_destination: input_destination.into(),
            started_destination: started_destination.into(),
            complete_destination: complete_destination.into(),
            error_destination: error_destination.into(),
            disabled_destination: disabled_destination.into(),
            filesystem,
            resource_limits,
            ignorable_patterns,
            communication_only,
        }
    }

    fn instrument_shared_dir(&self, facility: &str, instrument: &str) -> PathBuf {
        match &self.filesystem.instrument_shared_root {
            Some(root) => root.join(facility).join(instrument).join("shared/autoreduce"),
            None => PathBuf::from(format!("/{facility}/{instrument}/shared/autoreduce")),
        }
    }

    fn proposal_shared_dir(&self, facility: &str, instrument: &str, ipts: &str) -> PathBuf {
        match &self.filesystem.dev_output_dir {
            Some(dir) => dir.clone(),
            None => PathBuf::from(format!("/{facility}/{instrument}/{ipts}/shared/autoreduce")),
        }
    }

    fn error(&self, reason: impl Into<String>) -> Vec<ProcessorOutcome> {
        vec![ProcessorOutcome {
            destination: self.error_destination.clone(),
            outcome: StatusOutcome::Error { reason: reason.into() },
            spawned_pid: None,
        }]
    }
}

#[async_trait]
impl Processor for ReductionProcessor {
    fn input_destination(&self) -> &str {
        &self.input_destination
    }
    fn started_destination(&self) -> &str {
        &self.started_destination
    }
    fn complete_destination(&self) -> &str {
        &self.complete_destination
    }
    fn error_destination(&self) -> &str {
        &self.error_destination
    }
    fn disabled_destination(&self) -> Option<&str> {
        Some(&self.disabled_destination)
    }

    fn validate(&self, message: &JobMessage) -> Result<(), String> {
        validate_data_file_fields(message)
    }

    async fn handle(&self, message: &JobMessage) -> Vec<ProcessorOutcome> {
        // `validate` has already confirmed these are present.
        let data_file = message.data_file().unwrap_or_default();
        let facility = message.facility().unwrap_or_default();
        let instrument = message.instrument().unwrap_or_default();
        let ipts = message.ipts().unwrap_or_default();

        let instrument_shared = self.instrument_shared_dir(&facility, &instrument);
        let script = instrument_shared.join(format!("reduce_{instrument}.py"));
        if !script.is_file() {
            return vec![ProcessorOutcome {
                destination: self.disabled_destination.clone(),
                outcome: StatusOutcome::Disabled,
                spawned_pid: None,
            }];
        }

        let started = ProcessorOutcome::started(self.started_destination.clone());

        let proposal_shared = self.proposal_shared_dir(&facility, &instrument, &ipts);
        let log_dir = proposal_shared.join("reduction_log");
        if let Err(e) = std::fs::create_dir_all(&log_dir) {
            let mut transitions = vec![started];
            transitions.append(&mut self.error(format!("could not create log directory: {e}")));
            return transitions;
        }

        let basename = PathBuf::from(data_file)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "job".to_string());

        let request = WorkerSpawnRequest {
            python_executable: self.filesystem.python_executable.clone(),
            script,
            input_file: PathBuf::from(data_file),
            output_dir: proposal_shared,
            log_path: log_dir.join(format!("{basename}.log")),
            err_path: log_dir.join(format!("{basename}.err")),
        };

        let outcome = job_handler::run(
            &request,
            &self.resource_limits,
            &self.ignorable_patterns,
            self.communication_only,
        )
        .await;

        let terminal = if outcome.success {
            ProcessorOutcome {
                destination: self.complete_destination.clone(),
                outcome: StatusOutcome::Complete {
                    information: outcome.information,
                },
                spawned_pid: outcome.pid,
            }
        } else {
            ProcessorOutcome {
                destination: self.error_destination.clone(),
                outcome: StatusOutcome::Error {
                    reason: outcome.error.unwrap_or_else(|| "unknown worker failure".to_string()),
                },
                spawned_pid: outcome.pid,
            }
        };

        vec![started, terminal]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(fields: serde_json::Value) -> JobMessage {
        JobMessage::from_bytes(fields.to_string().as_bytes()).unwrap()
    }

    fn processor(filesystem: FilesystemConfig) -> ReductionProcessor {
        ReductionProcessor::new(
            "/queue/REDUCTION.DATA_READY",
            "/queue/REDUCTION.STARTED",
            "/queue/REDUCTION.COMPLETE",
            "/queue/REDUCTION.ERROR",
            "/queue/REDUCTION.DISABLED",
            filesystem,
            ResourceLimitsConfig::default(),
            Vec::new(),
            true,
        )
    }

    #[test]
    fn missing_data_file_fails_validation() {
        let p = processor(FilesystemConfig::default());
        let msg = message(json!({
            "facility": "SNS", "instrument": "EQSANS",
            "ipts": "IPTS-1", "run_number": "1",
            "data_file": "/does/not/exist",
        }));
        let err = p.validate(&msg).unwrap_err();
        assert!(err.contains("Data file does not exist or is not readable"));
    }

    #[tokio::test]
    async fn unknown_instrument_is_disabled_with_no_started() {
        let tmp = tempfile::tempdir().unwrap();
        let data_file = tmp.path().join("input.nxs");
        std::fs::write(&data_file, b"data").unwrap();

        let mut filesystem = FilesystemConfig::default();
        filesystem.instrument_shared_root = Some(tmp.path().to_path_buf());
        filesystem.dev_output_dir = Some(tmp.path().to_path_buf());

        let p = processor(filesystem);
        let msg = message(json!({
            "facility": "SNS", "instrument": "UNKNOWN",
            "ipts": "IPTS-1", "run_number": "1",
            "data_file": data_file.to_string_lossy(),
        }));
        assert!(p.validate(&msg).is_ok());
        let transitions = p.handle(&msg).await;
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].destination, "/queue/REDUCTION.DISABLED");
        assert_eq!(transitions[0].outcome, StatusOutcome::Disabled);
    }

    #[tokio::test]
    async fn communication_only_completes_without_spawning() {
        let tmp = tempfile::tempdir().unwrap();
        let data_file = tmp.path().join("input.nxs");
        std::fs::write(&data_file, b"data").unwrap();
        let instrument_shared = tmp.path().join("SNS/EQSANS/shared/autoreduce");
        std::fs::create_dir_all(&instrument_shared).unwrap();
        std::fs::write(instrument_shared.join("reduce_EQSANS.py"), b"# script").unwrap();

        let mut filesystem = FilesystemConfig::default();
        filesystem.instrument_shared_root = Some(tmp.path().to_path_buf());
        filesystem.dev_output_dir = Some(tmp.path().to_path_buf());

        let p = processor(filesystem);
        let msg = message(json!({
            "facility": "SNS", "instrument": "EQSANS",
            "ipts": "IPTS-1", "run_number": "1",
            "data_file": data_file.to_string_lossy(),
        }));
        let transitions = p.handle(&msg).await;
        assert_eq!(transitions.len(), 2);
        assert_eq!(transitions[0].destination, "/queue/REDUCTION.STARTED");
        assert_eq!(transitions[0].outcome, StatusOutcome::Started);
        assert_eq!(transitions[1].destination, "/queue/REDUCTION.COMPLETE");
        match &transitions[1].outcome {
            StatusOutcome::Complete { .. } => {}
            _ => panic!("expected complete outcome"),
        }
    }
}
