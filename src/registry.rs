//! Processor registry (§4.2): a fixed, configuration-time set of
//! destination → handler mappings, immutable for the agent's lifetime.

use crate::processors::Processor;
use std::collections::HashMap;
use std::sync::Arc;

/// The union of every registered processor's input destination plus the
/// ping destination, de-duplicated (§4.2).
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn Processor>>,
    ping_destination: String,
}

impl ProcessorRegistry {
    pub fn new(ping_destination: impl Into<String>) -> Self {
        Self {
            processors: HashMap::new(),
            ping_destination: ping_destination.into(),
        }
    }

    pub fn register(&mut self, processor: Arc<dyn Processor>) {
        self.processors
            .insert(processor.input_destination().to_string(), processor);
    }

    pub fn lookup(&self, destination: &str) -> Option<Arc<dyn Processor>> {
        self.processors.get(destination).cloned()
    }

    pub fn is_ping_destination(&self, destination: &str) -> bool {
        destination == self.ping_destination
    }

    pub fn subscription_set(&self) -> Vec<String> {
        let mut destinations: Vec<String> = self.processors.keys().cloned().collect();
        if !destinations.iter().any(|d| d == &self.ping_destination) {
            destinations.push(self.ping_destination.clone());
        }
        destinations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobMessage, StatusOutcome};
    use crate::processors::ProcessorOutcome;
    use async_trait::async_trait;

    struct StubProcessor;

    #[async_trait]
    impl Processor for StubProcessor {
        fn input_destination(&self) -> &str {
            "/queue/STUB"
        }
        fn started_destination(&self) -> &str {
            "/queue/STUB.STARTED"
        }
        fn complete_destination(&self) -> &str {
            "/queue/STUB.COMPLETE"
        }
        fn error_destination(&self) -> &str {
            "/queue/STUB.ERROR"
        }
        async fn handle(&self, _message: &JobMessage) -> Vec<ProcessorOutcome> {
            vec![ProcessorOutcome {
                destination: self.complete_destination().to_string(),
                outcome: StatusOutcome::Complete { information: None },
                spawned_pid: None,
            }]
        }
    }

    #[test]
    fn subscription_set_includes_ping_destination_once() {
        let mut registry = ProcessorRegistry::new("/topic/PING");
        registry.register(Arc::new(StubProcessor));
        let subs = registry.subscription_set();
        assert_eq!(subs.iter().filter(|d| *d == "/topic/PING").count(), 1);
        assert!(subs.iter().any(|d| d == "/queue/STUB"));
    }

    #[test]
    fn lookup_returns_registered_processor() {
        let mut registry = ProcessorRegistry::new("/topic/PING");
        registry.register(Arc::new(StubProcessor));
        assert!(registry.lookup("/queue/STUB").is_some());
        assert!(registry.lookup("/queue/OTHER").is_none());
    }
}
