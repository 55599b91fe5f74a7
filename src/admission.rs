//! Admission controller (§4.3): tracks in-flight workers globally and per
//! instrument, and decides accept/reject for newly arrived messages.
//! State lives behind a `Mutex` that is never held across a broker or
//! process-wait call (§5).

use crate::model::{JobMessage, WorkerRecord};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio::time::sleep;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum AdmissionDecision {
    Accept,
    Reject,
    /// Accepted without per-instrument accounting because the message
    /// carried no `instrument` field (§4.3 step 3).
    NoInstrument,
}

struct AdmissionState {
    global: Vec<WorkerRecord>,
    by_instrument: HashMap<String, Vec<usize>>,
}

impl AdmissionState {
    fn new() -> Self {
        Self {
            global: Vec::new(),
            by_instrument: HashMap::new(),
        }
    }

    fn instrument_count(&self, instrument: &str) -> usize {
        self.by_instrument
            .get(instrument)
            .map(|ids| ids.len())
            .unwrap_or(0)
    }

    /// Removes records whose process has been observed to exit (§4.3 step
    /// 1). `is_alive` is injected so tests can simulate exits without real
    /// processes.
    fn sweep(&mut self, is_alive: &dyn Fn(u32) -> bool + Send + Sync) {
        let alive_indices: Vec<usize> = self
            .global
            .iter()
            .enumerate()
            .filter(|(_, record)| is_alive(record.pid))
            .map(|(i, _)| i)
            .collect();

        if alive_indices.len() == self.global.len() {
            return;
        }

        let survivors: Vec<WorkerRecord> = alive_indices
            .iter()
            .map(|&i| self.global[i].clone())
            .collect();
        self.global = survivors;

        self.by_instrument.clear();
        for (idx, record) in self.global.iter().enumerate() {
            if let Some(instrument) = &record.instrument {
                self.by_instrument.entry(instrument.clone()).or_default().push(idx);
            }
        }
    }

    fn record(&mut self, record: WorkerRecord) {
        let idx = self.global.len();
        if let Some(instrument) = &record.instrument {
            self.by_instrument
                .entry(instrument.clone())
                .or_default()
                .push(idx);
        }
        self.global.push(record);
    }
}

pub struct AdmissionController {
    state: Mutex<AdmissionState>,
    jobs_per_instrument: usize,
    max_concurrent_workers: usize,
    slot_poll_interval: std::time::Duration,
}

impl AdmissionController {
    pub fn new(
        jobs_per_instrument: usize,
        max_concurrent_workers: usize,
        slot_poll_interval: std::time::Duration,
    ) -> Self {
        Self {
            state: Mutex::new(AdmissionState::new()),
            jobs_per_instrument,
            max_concurrent_workers,
            slot_poll_interval,
        }
    }

    /// §4.3 `admit`: sweeps finished workers, then decides.
    pub async fn admit(&self, message: &JobMessage, is_alive: &dyn Fn(u32) -> bool + Send + Sync) -> AdmissionDecision {
        let mut state = self.state.lock().await;
        state.sweep(is_alive);

        match message.instrument() {
            Some(instrument) if self.jobs_per_instrument > 0 => {
                if state.instrument_count(&instrument) >= self.jobs_per_instrument {
                    AdmissionDecision::Reject
                } else {
                    AdmissionDecision::Accept
                }
            }
            Some(_) => AdmissionDecision::NoInstrument,
            None => AdmissionDecision::NoInstrument,
        }
    }

    pub async fn record(&self, record: WorkerRecord) {
        self.state.lock().await.record(record);
    }

    pub async fn global_count(&self) -> usize {
        self.state.lock().await.global.len()
    }

    pub async fn instrument_count(&self, instrument: &str) -> usize {
        self.state.lock().await.instrument_count(instrument)
    }

    /// Blocks the caller while the global count exceeds the configured cap,
    /// sweeping finished workers on each poll (§4.3 `wait_for_slot`).
    pub async fn wait_for_slot(&self, is_alive: &dyn Fn(u32) -> bool + Send + Sync) {
        loop {
            let mut state = self.state.lock().await;
            state.sweep(is_alive);
            let count = state.global.len();
            drop(state);
            if count <= self.max_concurrent_workers {
                return;
            }
            sleep(self.slot_poll_interval).await;
        }
    }
}

/// Liveness check backed by `kill(pid, 0)`: whether the operating system
/// still has a process at `pid` (§4.3 `sweep`). Delivers no signal; a
/// successful call just confirms the pid is addressable.
#[cfg(unix)]
pub fn os_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
pub fn os_process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(instrument: Option<&str>) -> JobMessage {
        let mut value = json!({"facility": "SNS"});
        if let Some(instrument) = instrument {
            value["instrument"] = json!(instrument);
        }
        JobMessage::from_bytes(value.to_string().as_bytes()).unwrap()
    }

    fn always_alive(_pid: u32) -> bool {
        true
    }

    #[tokio::test]
    async fn missing_instrument_bypasses_per_instrument_cap() {
        let controller = AdmissionController::new(1, 10, std::time::Duration::from_millis(1));
        let decision = controller.admit(&job(None), &always_alive).await;
        assert_eq!(decision, AdmissionDecision::NoInstrument);
    }

    #[tokio::test]
    async fn rejects_third_job_over_per_instrument_cap() {
        let controller = AdmissionController::new(2, 100, std::time::Duration::from_millis(1));
        controller
            .record(WorkerRecord::new(1, Some("EQSANS".to_string()), job(Some("EQSANS"))))
            .await;
        controller
            .record(WorkerRecord::new(2, Some("EQSANS".to_string()), job(Some("EQSANS"))))
            .await;

        let decision = controller.admit(&job(Some("EQSANS")), &always_alive).await;
        assert_eq!(decision, AdmissionDecision::Reject);
    }

    #[tokio::test]
    async fn zero_jobs_per_instrument_disables_check() {
        let controller = AdmissionController::new(0, 100, std::time::Duration::from_millis(1));
        controller
            .record(WorkerRecord::new(1, Some("EQSANS".to_string()), job(Some("EQSANS"))))
            .await;
        let decision = controller.admit(&job(Some("EQSANS")), &always_alive).await;
        assert_eq!(decision, AdmissionDecision::NoInstrument);
    }

    #[tokio::test]
    async fn sweep_drops_exited_workers() {
        let controller = AdmissionController::new(1, 100, std::time::Duration::from_millis(1));
        controller
            .record(WorkerRecord::new(1, Some("EQSANS".to_string()), job(Some("EQSANS"))))
            .await;
        let decision = controller.admit(&job(Some("EQSANS")), &|_| false).await;
        assert_eq!(decision, AdmissionDecision::Accept);
        assert_eq!(controller.global_count().await, 0);
    }

    #[tokio::test]
    async fn wait_for_slot_returns_once_under_cap() {
        let controller = std::sync::Arc::new(AdmissionController::new(
            0,
            1,
            std::time::Duration::from_millis(5),
        ));
        controller
            .record(WorkerRecord::new(1, None, job(None)))
            .await;
        let controller_clone = controller.clone();
        let waiter = tokio::spawn(async move {
            controller_clone.wait_for_slot(&|_| false).await;
        });
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("wait_for_slot should return")
            .unwrap();
    }
}
