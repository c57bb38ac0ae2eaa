//! Bridges routed intents to capabilities.
//!
//! Subscribes to `<namespace>.*.*`, invokes the named capability through the
//! registry and publishes the result on `<target>.response`. Invocations run
//! in their own task so a slow service never stalls the dispatch loop.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use herald_bus::{BusError, EventChannel, EventHandler, HandlerError, SubscriptionId};
use herald_core::events::DomainEvent;
use herald_core::types::{Intent, Timestamp};
use herald_core::Event;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::capability::CapabilityRegistry;

pub struct CapabilityDispatcher {
    registry: Arc<CapabilityRegistry>,
    bus: Weak<EventChannel>,
    timeout: Duration,
}

impl CapabilityDispatcher {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        bus: &Arc<EventChannel>,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            bus: Arc::downgrade(bus),
            timeout,
        })
    }

    /// Subscribe to every routed intent under `namespace`.
    pub fn attach(self: &Arc<Self>, namespace: &str) -> Result<SubscriptionId, BusError> {
        let bus = self.bus.upgrade().ok_or(BusError::Closed)?;
        bus.subscribe(
            &format!("{}.*.*", namespace),
            Arc::clone(self) as Arc<dyn EventHandler>,
        )
    }

    /// Invoke the capability behind `intent` and build its response event.
    pub async fn execute(
        registry: &CapabilityRegistry,
        intent: &Intent,
        correlation_id: Option<Uuid>,
        timeout: Duration,
    ) -> DomainEvent {
        let result = registry
            .invoke(&intent.target, &intent.action, &intent.parameters, timeout)
            .await;
        let (success, data, error, retryable) = match result {
            Ok(output) => (true, output.to_value(), None, false),
            Err(e) => {
                warn!(
                    capability = %intent.target,
                    action = %intent.action,
                    error = %e,
                    "Capability invocation failed"
                );
                (false, serde_json::Value::Null, Some(e.to_string()), e.is_retryable())
            }
        };
        DomainEvent::CapabilityResponded {
            capability: intent.target.to_lowercase(),
            action: intent.action.clone(),
            success,
            data,
            error,
            retryable,
            correlation_id,
            intent: Some(intent.clone()),
            timestamp: Timestamp::now(),
        }
    }
}

#[async_trait]
impl EventHandler for CapabilityDispatcher {
    fn name(&self) -> &str {
        "capability-dispatcher"
    }

    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        let (intent, correlation_id) = match DomainEvent::from_event(event)? {
            DomainEvent::IntentRouted {
                intent,
                correlation_id,
                ..
            } => (intent, correlation_id),
            other => {
                return Err(HandlerError::new(format!(
                    "expected intent_routed, got {}",
                    other.event_name()
                )))
            }
        };

        let registry = Arc::clone(&self.registry);
        let bus = self.bus.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            let response = Self::execute(&registry, &intent, correlation_id, timeout).await;
            let Some(bus) = bus.upgrade() else {
                return;
            };
            match bus.publish_event(&response).await {
                Ok(()) => debug!(topic = %response.topic(), "Capability response published"),
                Err(e) => warn!(error = %e, "Could not publish capability response"),
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::tests::MockCapability;
    use crate::error::CapabilityError;
    use herald_bus::handler_fn;
    use herald_core::types::Parameters;
    use tokio::sync::mpsc;

    fn setup(mock: MockCapability) -> (Arc<EventChannel>, mpsc::UnboundedReceiver<Event>) {
        let bus = Arc::new(EventChannel::new(32));
        let registry = Arc::new(CapabilityRegistry::new());
        registry.register(Arc::new(mock));
        let dispatcher = CapabilityDispatcher::new(registry, &bus, Duration::from_secs(1));
        dispatcher.attach("agent").unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        bus.subscribe(
            "*.response",
            handler_fn("response-sink", move |event: Event| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(event);
                    Ok(())
                }
            }),
        )
        .unwrap();
        bus.start().unwrap();
        (bus, rx)
    }

    fn routed(action: &str, correlation_id: Uuid) -> DomainEvent {
        let mut params = Parameters::new();
        params.insert("recipient".into(), "bob@example.com".into());
        DomainEvent::IntentRouted {
            topic: format!("agent.mail.{}", action),
            intent: Intent::new(action, "mail", params, 0.9, "ctx", "send it to bob"),
            correlation_id: Some(correlation_id),
            timestamp: Timestamp::now(),
        }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no response published")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_success_response_carries_correlation() {
        let (bus, mut rx) = setup(MockCapability::new("mail"));
        let id = Uuid::new_v4();
        bus.publish_event(&routed("send", id)).await.unwrap();

        let event = next(&mut rx).await;
        assert_eq!(event.topic, "mail.response");
        match DomainEvent::from_event(&event).unwrap() {
            DomainEvent::CapabilityResponded {
                success,
                correlation_id,
                data,
                intent,
                ..
            } => {
                assert!(success);
                assert_eq!(correlation_id, Some(id));
                assert_eq!(data["ok"], true);
                assert_eq!(intent.unwrap().parameters["recipient"], "bob@example.com");
            }
            other => panic!("unexpected {:?}", other),
        }
        bus.shutdown(true).await;
    }

    #[tokio::test]
    async fn test_failure_response_is_classified() {
        let mut mock = MockCapability::new("mail");
        mock.act_result = Err(CapabilityError::Network("connection reset".into()));
        let (bus, mut rx) = setup(mock);
        bus.publish_event(&routed("send", Uuid::new_v4()))
            .await
            .unwrap();

        let event = next(&mut rx).await;
        assert_eq!(event.payload["success"], false);
        assert_eq!(event.payload["retryable"], true);
        assert!(event.payload["error"]
            .as_str()
            .unwrap()
            .contains("connection reset"));
        bus.shutdown(true).await;
    }

    #[tokio::test]
    async fn test_non_intent_payload_is_a_handler_error() {
        let bus = Arc::new(EventChannel::new(8));
        let dispatcher =
            CapabilityDispatcher::new(Arc::new(CapabilityRegistry::new()), &bus, Duration::from_secs(1));
        let event = Event::new("agent.mail.send", serde_json::json!({"event": "nope"}));
        assert!(dispatcher.handle(&event).await.is_err());
    }
}
