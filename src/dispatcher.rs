//! Dispatcher loop (§4.5): receives frames, demultiplexes by destination,
//! consults the admission controller, and hands accepted work to the
//! resolved processor. Ordering guarantee: within one job, `started`
//! always precedes `complete`/`error`/`disabled`, and the two are
//! mutually exclusive by construction (`ProcessorOutcome` carries a
//! single [`crate::model::StatusOutcome`]).

use crate::admission::{os_process_alive, AdmissionController, AdmissionDecision};
use crate::broker::Frame;
use crate::metrics::Metrics;
use crate::model::{JobMessage, StatusMessage, StatusOutcome, WorkerRecord};
use crate::registry::ProcessorRegistry;
use crate::session::SessionManager;
use crate::signal::Shutdown;
use tracing::{error, warn};

pub struct Dispatcher {
    registry: ProcessorRegistry,
    admission: Arc<AdmissionController>,
    session: Arc<SessionManager>,
    error_destination: String,
    hostname: String,
    metrics: Metrics,
}

impl Dispatcher {
    pub fn new(
        registry: ProcessorRegistry,
        admission: Arc<AdmissionController>,
        session: Arc<SessionManager>,
        error_destination: String,
        hostname: String,
        metrics: Metrics,
    ) -> Self {
        Self {
            registry,
            admission,
            session,
            error_destination,
            hostname,
            metrics,
        }
    }

    /// Runs until `shutdown` is triggered (§4.6). `next_frame()` blocks
    /// indefinitely while the broker is idle — the normal, unattended
    /// case this agent is built for — so the loop selects between it and
    /// `shutdown.cancelled()` rather than only checking the flag between
    /// completed receives; otherwise a signal arriving with no job in
    /// flight would never be observed.
    pub async fn run(&self, shutdown: &Shutdown) {
        let destinations = self.registry.subscription_set();
        self.session.connect_and_subscribe(&destinations).await;

        while !shutdown.is_stopping() {
            tokio::select! {
                frame = self.session.next_frame(&destinations) => {
                    self.handle_frame(frame).await;
                }
                _ = shutdown.cancelled() => {
                    break;
                }
            }
        }
    }

    /// One pass through §4.5's steps 1-7. Public so integration tests can
    /// drive a single frame deterministically instead of racing `run`'s
    /// stop flag against its receive loop.
    pub async fn handle_frame(&self, frame: Frame) {
        let message = match JobMessage::from_bytes(&frame.body) {
            Ok(message) => message,
            Err(e) => {
                self.session.nack(&frame).await;
                self.publish_agent_error(crate::error::AgentError::MalformedMessage(e).to_string())
                    .await;
                return;
            }
        };

        if self.session.is_ping_destination(&frame.destination) {
            self.session.handle_ping(&frame).await;
            return;
        }

        let decision = self.admission.admit(&message, &os_process_alive).await;
        self.metrics
            .admissions_total
            .with_label_values(&[decision_label(decision)])
            .inc();

        if decision == AdmissionDecision::Reject {
            // Soft rejection: nack only. The broker's redelivery policy
            // decides whether this message is retried (§4.3, §7 kind 5).
            self.session.nack(&frame).await;
            return;
        }
        self.session.ack(&frame).await;

        let Some(processor) = self.registry.lookup(&frame.destination) else {
            self.publish_agent_error(
                crate::error::AgentError::UnknownDestination(frame.destination.clone()).to_string(),
            )
            .await;
            return;
        };

        // Pre-flight validation happens before any transition is published:
        // a message that fails it never gets a `started` notice, only an
        // agent-wide error (§7 error kind 1, §8 scenario 2).
        if let Err(reason) = processor.validate(&message) {
            self.publish_agent_error(reason).await;
            return;
        }

        self.admission.wait_for_slot(&os_process_alive).await;

        let transitions = processor.handle(&message).await;
        for outcome in transitions {
            self.metrics
                .classifications_total
                .with_label_values(&[classification_label(&outcome.outcome)])
                .inc();

            let status =
                StatusMessage::from_outcome(message.clone(), &self.hostname, outcome.outcome);
            if let Err(e) = self.session.publish(&outcome.destination, &status.to_bytes()).await {
                warn!(error = %e, destination = %outcome.destination, "failed to publish status transition");
            }

            if let Some(pid) = outcome.spawned_pid {
                let instrument = message.instrument();
                self.admission
                    .record(WorkerRecord::new(pid, instrument.clone(), message.clone()))
                    .await;
                if let Some(instrument) = instrument {
                    self.metrics
                        .workers_by_instrument
                        .with_label_values(&[instrument.as_str()])
                        .set(self.admission.instrument_count(&instrument).await as i64);
                }
            }
        }

        self.metrics
            .workers_in_flight
            .set(self.admission.global_count().await as i64);
    }

    async fn publish_agent_error(&self, reason: String) {
        error!(%reason, "dispatcher error");
        let body = serde_json::json!({ "error": reason }).to_string();
        if let Err(e) = self.session.publish(&self.error_destination, body.as_bytes()).await {
            warn!(error = %e, "failed to publish agent-wide error");
        }
    }
}

fn decision_label(decision: AdmissionDecision) -> &'static str {
    match decision {
        AdmissionDecision::Accept => "accept",
        AdmissionDecision::Reject => "reject",
        AdmissionDecision::NoInstrument => "no_instrument",
    }
}

fn classification_label(outcome: &StatusOutcome) -> &'static str {
    match outcome {
        StatusOutcome::Started => "started",
        StatusOutcome::Complete { information: Some(_) } => "complete_with_note",
        StatusOutcome::Complete { information: None } => "complete",
        StatusOutcome::Error { .. } => "error",
        StatusOutcome::Disabled => "disabled",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::in_memory::InMemoryBroker;
    use crate::config::BrokerConfig;
    use crate::model::StatusOutcome as Outcome;
    use crate::processors::{Processor, ProcessorOutcome};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct StubProcessor {
        complete_destination: String,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Processor for StubProcessor {
        fn input_destination(&self) -> &str {
            "/queue/STUB"
        }
        fn started_destination(&self) -> &str {
            "/queue/STUB.STARTED"
        }
        fn complete_destination(&self) -> &str {
            &self.complete_destination
        }
        fn error_destination(&self) -> &str {
            "/queue/STUB.ERROR"
        }
        async fn handle(&self, _message: &JobMessage) -> Vec<ProcessorOutcome> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            vec![
                ProcessorOutcome::started(self.started_destination().to_string()),
                ProcessorOutcome {
                    destination: self.complete_destination.clone(),
                    outcome: Outcome::Complete { information: None },
                    spawned_pid: None,
                },
            ]
        }
    }

    fn dispatcher_with_stub() -> (
        Dispatcher,
        crate::broker::in_memory::InMemoryBrokerHandle,
    ) {
        let (broker, handle) = InMemoryBroker::new();
        let session = Arc::new(SessionManager::new(
            Box::new(broker),
            BrokerConfig::default(),
            "test-host".to_string(),
            "heart_beat".to_string(),
            "/topic/PING".to_string(),
            Metrics::new(),
        ));
        let mut registry = ProcessorRegistry::new("/topic/PING");
        registry.register(Arc::new(StubProcessor {
            complete_destination: "/queue/STUB.COMPLETE".to_string(),
            calls: AtomicUsize::new(0),
        }));
        let admission = Arc::new(AdmissionController::new(0, 10, std::time::Duration::from_millis(1)));
        let dispatcher = Dispatcher::new(
            registry,
            admission,
            session,
            "postprocess_error".to_string(),
            "test-host".to_string(),
            Metrics::new(),
        );
        (dispatcher, handle)
    }

    #[tokio::test]
    async fn happy_path_publishes_started_then_complete() {
        let (dispatcher, handle) = dispatcher_with_stub();
        let frame = handle.push_frame("/queue/STUB", json!({"facility": "SNS"}).to_string().as_bytes());
        dispatcher.handle_frame(frame.clone()).await;

        assert_eq!(handle.acked_ids().await, vec![frame.message_id]);
        let published = handle.published().await;
        assert_eq!(published[0].0, "/queue/STUB.STARTED");
        assert_eq!(published[1].0, "/queue/STUB.COMPLETE");
    }

    #[tokio::test]
    async fn malformed_body_is_nacked_and_reported() {
        let (dispatcher, handle) = dispatcher_with_stub();
        let frame = handle.push_frame("/queue/STUB", b"not json");
        dispatcher.handle_frame(frame.clone()).await;

        assert_eq!(handle.nacked_ids().await, vec![frame.message_id]);
        let published = handle.published().await;
        assert_eq!(published[0].0, "postprocess_error");
    }

    #[tokio::test]
    async fn unregistered_destination_is_acked_and_reports_error() {
        let (dispatcher, handle) = dispatcher_with_stub();
        let frame = handle.push_frame("/queue/UNKNOWN", json!({"facility": "SNS"}).to_string().as_bytes());
        dispatcher.handle_frame(frame.clone()).await;

        assert_eq!(handle.acked_ids().await, vec![frame.message_id]);
        let published = handle.published().await;
        assert_eq!(published[0].0, "postprocess_error");
    }

    #[tokio::test]
    async fn per_instrument_rejection_nacks_without_transitions() {
        let (broker, handle) = InMemoryBroker::new();
        let session = Arc::new(SessionManager::new(
            Box::new(broker),
            BrokerConfig::default(),
            "test-host".to_string(),
            "heart_beat".to_string(),
            "/topic/PING".to_string(),
            Metrics::new(),
        ));
        let mut registry = ProcessorRegistry::new("/topic/PING");
        registry.register(Arc::new(StubProcessor {
            complete_destination: "/queue/STUB.COMPLETE".to_string(),
            calls: AtomicUsize::new(0),
        }));
        let admission = Arc::new(AdmissionController::new(2, 10, std::time::Duration::from_millis(1)));
        // Use this test process's own pid so `os_process_alive` reports
        // both records as still running, regardless of sandbox pid layout.
        let own_pid = std::process::id();
        admission
            .record(WorkerRecord::new(own_pid, Some("EQSANS".to_string()), JobMessage::from_bytes(b"{}").unwrap()))
            .await;
        admission
            .record(WorkerRecord::new(own_pid, Some("EQSANS".to_string()), JobMessage::from_bytes(b"{}").unwrap()))
            .await;
        let dispatcher = Dispatcher::new(
            registry,
            admission,
            session,
            "postprocess_error".to_string(),
            "test-host".to_string(),
            Metrics::new(),
        );

        let frame = handle.push_frame(
            "/queue/STUB",
            json!({"facility": "SNS", "instrument": "EQSANS"}).to_string().as_bytes(),
        );
        dispatcher.handle_frame(frame.clone()).await;

        assert_eq!(handle.nacked_ids().await, vec![frame.message_id]);
        assert!(handle.published().await.is_empty());
    }

    #[tokio::test]
    async fn run_exits_on_shutdown_with_broker_idle() {
        let (dispatcher, _handle) = dispatcher_with_stub();
        let shutdown = std::sync::Arc::new(crate::signal::Shutdown::new());

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.trigger();
        });

        // No frame is ever pushed onto the broker: `run` must still return
        // via `shutdown.cancelled()` rather than blocking on `next_frame()`.
        tokio::time::timeout(std::time::Duration::from_secs(5), dispatcher.run(&shutdown))
            .await
            .expect("run() returns once shutdown is triggered, even with no frame ever arriving");
    }
}
