//! How a single step reaches its capability.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use herald_bus::{handler_fn, validate_segment, BusError, EventChannel, HandlerError, SubscriptionId};
use herald_core::events::{topics, DomainEvent};
use herald_core::types::{Intent, Timestamp};
use herald_core::Event;
use herald_router::{CapabilityError, CapabilityRegistry};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

/// Executes one resolved step.
#[async_trait]
pub trait SubTaskExecutor: Send + Sync {
    async fn execute(
        &self,
        intent: &Intent,
        timeout: Duration,
    ) -> Result<serde_json::Value, CapabilityError>;
}

/// Invokes capabilities directly through the registry.
pub struct RegistryExecutor {
    registry: Arc<CapabilityRegistry>,
}

impl RegistryExecutor {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl SubTaskExecutor for RegistryExecutor {
    async fn execute(
        &self,
        intent: &Intent,
        timeout: Duration,
    ) -> Result<serde_json::Value, CapabilityError> {
        self.registry
            .invoke(&intent.target, &intent.action, &intent.parameters, timeout)
            .await
            .map(|output| output.to_value())
    }
}

type Waiters = Arc<Mutex<HashMap<Uuid, oneshot::Sender<DomainEvent>>>>;

/// Publishes each step as a routed intent and waits for the capability
/// response carrying the same correlation id.
pub struct BusExecutor {
    bus: Arc<EventChannel>,
    registry: Arc<CapabilityRegistry>,
    namespace: String,
    waiters: Waiters,
}

impl BusExecutor {
    pub fn new(
        bus: Arc<EventChannel>,
        registry: Arc<CapabilityRegistry>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            registry,
            namespace: namespace.into(),
            waiters: Arc::default(),
        }
    }

    /// Subscribe to `*.response` so replies reach their waiting step.
    pub fn attach(&self) -> Result<SubscriptionId, BusError> {
        let waiters = Arc::clone(&self.waiters);
        self.bus.subscribe(
            "*.response",
            handler_fn("coordinator-responses", move |event: Event| {
                let waiters = Arc::clone(&waiters);
                async move {
                    let response = DomainEvent::from_event(&event)?;
                    let correlation_id = match &response {
                        DomainEvent::CapabilityResponded {
                            correlation_id: Some(id),
                            ..
                        } => *id,
                        _ => return Ok(()),
                    };
                    let waiter = waiters
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .remove(&correlation_id);
                    if let Some(tx) = waiter {
                        tx.send(response).map_err(|_| {
                            HandlerError::new(format!("step {} stopped waiting", correlation_id))
                        })?;
                    }
                    Ok(())
                }
            }),
        )
    }

    fn forget(&self, id: &Uuid) {
        self.waiters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(id);
    }
}

#[async_trait]
impl SubTaskExecutor for BusExecutor {
    async fn execute(
        &self,
        intent: &Intent,
        timeout: Duration,
    ) -> Result<serde_json::Value, CapabilityError> {
        if !self.registry.contains(&intent.target) {
            return Err(CapabilityError::UnknownCapability(intent.target.clone()));
        }
        // A dotted action would publish on a topic no dispatcher listens to.
        if validate_segment(&intent.action).is_err() {
            return Err(CapabilityError::InvalidParameters(format!(
                "'{}' is not a valid action",
                intent.action
            )));
        }
        let correlation_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(correlation_id, tx);

        let topic = topics::routed(&self.namespace, &intent.target, &intent.action);
        let routed = DomainEvent::IntentRouted {
            topic: topic.clone(),
            intent: intent.clone(),
            correlation_id: Some(correlation_id),
            timestamp: Timestamp::now(),
        };
        if let Err(e) = self.bus.publish_event(&routed).await {
            self.forget(&correlation_id);
            return Err(CapabilityError::Other(e.to_string()));
        }
        debug!(%topic, %correlation_id, "Step published");

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(CapabilityError::Other("response channel dropped".into()));
            }
            Err(_) => {
                self.forget(&correlation_id);
                let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(%topic, timeout_ms = ms, "No capability response in time");
                return Err(CapabilityError::Timeout(ms));
            }
        };

        match response {
            DomainEvent::CapabilityResponded {
                success: true,
                data,
                ..
            } => Ok(data),
            DomainEvent::CapabilityResponded {
                error, retryable, ..
            } => {
                let message = error.unwrap_or_else(|| "capability failed".into());
                // The classification survives the hop; the concrete kind
                // does not.
                if retryable {
                    Err(CapabilityError::Network(message))
                } else {
                    Err(CapabilityError::Other(message))
                }
            }
            other => Err(CapabilityError::Other(format!(
                "unexpected response event {}",
                other.event_name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::types::Parameters;
    use herald_router::{Capability, CapabilityDispatcher};

    struct EchoMail {
        fail: Option<CapabilityError>,
    }

    #[async_trait]
    impl Capability for EchoMail {
        fn name(&self) -> &str {
            "mail"
        }

        async fn authenticate(&self) -> Result<bool, CapabilityError> {
            Ok(true)
        }

        async fn fetch(
            &self,
            params: &herald_core::types::Parameters,
        ) -> Result<Vec<serde_json::Value>, CapabilityError> {
            match &self.fail {
                Some(e) => Err(e.clone()),
                None => Ok(vec![serde_json::json!({"subject": "Q3 report", "query": params})]),
            }
        }

        async fn act(&self, _action: &str, _data: &Parameters) -> Result<bool, CapabilityError> {
            Ok(true)
        }
    }

    fn wired(fail: Option<CapabilityError>) -> (Arc<EventChannel>, BusExecutor) {
        let bus = Arc::new(EventChannel::new(32));
        let registry = Arc::new(CapabilityRegistry::new());
        registry.register(Arc::new(EchoMail { fail }));
        CapabilityDispatcher::new(Arc::clone(&registry), &bus, Duration::from_secs(1))
            .attach("agent")
            .unwrap();
        let executor = BusExecutor::new(Arc::clone(&bus), registry, "agent");
        executor.attach().unwrap();
        bus.start().unwrap();
        (bus, executor)
    }

    fn search() -> Intent {
        Intent::new("search", "mail", Parameters::new(), 1.0, "cmd", "search on mail")
    }

    #[tokio::test]
    async fn test_bus_round_trip() {
        let (bus, executor) = wired(None);
        let data = executor
            .execute(&search(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(data["subject"], "Q3 report");
        assert!(executor.waiters.lock().unwrap().is_empty());
        bus.shutdown(true).await;
    }

    #[tokio::test]
    async fn test_bus_error_keeps_retry_class() {
        let (bus, executor) = wired(Some(CapabilityError::RateLimited("mail".into())));
        let err = executor
            .execute(&search(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let (bus2, executor) = wired(Some(CapabilityError::Authentication("mail".into())));
        let err = executor
            .execute(&search(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Authentication failed"));
        bus.shutdown(true).await;
        bus2.shutdown(true).await;
    }

    #[tokio::test]
    async fn test_unregistered_target_fails_fast() {
        let (bus, executor) = wired(None);
        let intent = Intent::new("send", "fax", Parameters::new(), 1.0, "cmd", "send on fax");
        let err = executor
            .execute(&intent, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, CapabilityError::UnknownCapability("fax".into()));
        bus.shutdown(true).await;
    }

    #[tokio::test]
    async fn test_dotted_action_fails_fast() {
        let (bus, executor) = wired(None);
        let intent = Intent::new("mark.read", "mail", Parameters::new(), 1.0, "cmd", "mark read");
        let err = tokio::time::timeout(
            Duration::from_secs(1),
            executor.execute(&intent, Duration::from_secs(30)),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, CapabilityError::InvalidParameters(_)));
        assert!(!err.is_retryable());
        assert!(executor.waiters.lock().unwrap().is_empty());
        bus.shutdown(true).await;
    }

    #[tokio::test]
    async fn test_registry_executor() {
        let registry = Arc::new(CapabilityRegistry::new());
        registry.register(Arc::new(EchoMail { fail: None }));
        let executor = RegistryExecutor::new(registry);
        let data = executor
            .execute(&search(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(data["count"], 1);
        assert_eq!(data["query"]["action"], "search");
    }
}
