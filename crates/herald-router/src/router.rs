//! Confidence-gated routing of intents onto capability topics.

use std::sync::Arc;

use herald_bus::topic::validate_topic;
use herald_bus::{validate_segment, EventChannel};
use herald_core::config::RouterConfig;
use herald_core::events::{topics, DomainEvent};
use herald_core::types::{Intent, Timestamp};
use tracing::{info, warn};
use uuid::Uuid;

use crate::capability::CapabilityRegistry;
use crate::classifier::IntentClassifier;
use crate::error::RouterError;

/// What happened to one command.
#[derive(Debug, Clone)]
pub enum RouteOutcome {
    /// Published on `topic`; the capability response will carry
    /// `correlation_id`.
    Dispatched {
        topic: String,
        intent: Intent,
        correlation_id: Uuid,
    },
    /// Confidence was below the threshold; nothing was invoked.
    Clarification { intent: Intent, message: String },
    /// The target has no registered capability; nothing was invoked.
    Rejected { intent: Intent, reason: String },
}

impl RouteOutcome {
    pub fn intent(&self) -> &Intent {
        match self {
            RouteOutcome::Dispatched { intent, .. }
            | RouteOutcome::Clarification { intent, .. }
            | RouteOutcome::Rejected { intent, .. } => intent,
        }
    }

    /// Text shown to the user.
    pub fn user_message(&self) -> String {
        match self {
            RouteOutcome::Dispatched { intent, .. } => {
                format!("On it: {} via {}.", intent.action, intent.target)
            }
            RouteOutcome::Clarification { message, .. } => message.clone(),
            RouteOutcome::Rejected { reason, .. } => reason.clone(),
        }
    }
}

/// Stateless per call: context comes from the classifier's history window.
pub struct Router {
    bus: Arc<EventChannel>,
    registry: Arc<CapabilityRegistry>,
    classifier: Arc<IntentClassifier>,
    threshold: f64,
    namespace: String,
}

impl Router {
    pub fn new(
        bus: Arc<EventChannel>,
        registry: Arc<CapabilityRegistry>,
        classifier: Arc<IntentClassifier>,
        config: &RouterConfig,
    ) -> Self {
        Self {
            bus,
            registry,
            classifier,
            threshold: config.confidence_threshold,
            namespace: config.capability_namespace.clone(),
        }
    }

    pub fn classifier(&self) -> &Arc<IntentClassifier> {
        &self.classifier
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Classify `raw` in `context_id` and route the resulting intent.
    pub async fn handle(&self, raw: &str, context_id: &str) -> Result<RouteOutcome, RouterError> {
        let recent = self.classifier.recent_context(context_id).await;
        let targets = self.registry.targets();
        let intent = self
            .classifier
            .classify(raw, context_id, &recent, &targets)
            .await;
        self.classifier.record_turn(&intent).await;
        self.route(intent).await
    }

    /// Topic for an intent. The target must be registered and the action
    /// must fit in a single topic segment, so the dispatcher's
    /// `{namespace}.*.*` subscription always sees it.
    pub fn topic_for(&self, intent: &Intent) -> Result<String, RouterError> {
        if !self.registry.contains(&intent.target) {
            return Err(RouterError::UnknownTarget(intent.target.clone()));
        }
        if validate_segment(&intent.action).is_err() {
            return Err(RouterError::InvalidAction(intent.action.clone()));
        }
        let topic = topics::routed(
            &self.namespace,
            &intent.target.to_lowercase(),
            &intent.action,
        );
        validate_topic(&topic)?;
        Ok(topic)
    }

    /// Publish `intent` to its capability topic.
    ///
    /// Intents strictly below the threshold only produce a clarification
    /// request; an intent exactly at the threshold is routed.
    pub async fn route(&self, intent: Intent) -> Result<RouteOutcome, RouterError> {
        if intent.confidence < self.threshold {
            let message = format!(
                "I'm not sure I understood. Could you rephrase: '{}'?",
                intent.raw_input
            );
            info!(
                confidence = intent.confidence,
                threshold = self.threshold,
                "Confidence below threshold, asking for clarification"
            );
            self.bus
                .publish_event(&DomainEvent::ClarificationRequested {
                    raw_input: intent.raw_input.clone(),
                    context_id: intent.context_id.clone(),
                    confidence: intent.confidence,
                    message: message.clone(),
                    timestamp: Timestamp::now(),
                })
                .await?;
            return Ok(RouteOutcome::Clarification { intent, message });
        }

        let topic = match self.topic_for(&intent) {
            Ok(topic) => topic,
            Err(e) => {
                let reason = e.to_string();
                warn!(service = %intent.target, action = %intent.action, error = %e, "Intent cannot be routed");
                self.bus
                    .publish_event(&DomainEvent::RoutingFailed {
                        target: intent.target.clone(),
                        action: intent.action.clone(),
                        raw_input: intent.raw_input.clone(),
                        message: reason.clone(),
                        timestamp: Timestamp::now(),
                    })
                    .await?;
                return Ok(RouteOutcome::Rejected { intent, reason });
            }
        };

        let correlation_id = Uuid::new_v4();
        self.bus
            .publish_event(&DomainEvent::IntentRouted {
                topic: topic.clone(),
                intent: intent.clone(),
                correlation_id: Some(correlation_id),
                timestamp: Timestamp::now(),
            })
            .await?;
        info!(%topic, %correlation_id, "Intent routed");
        Ok(RouteOutcome::Dispatched {
            topic,
            intent,
            correlation_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::tests::MockCapability;
    use herald_bus::handler_fn;
    use herald_core::types::Parameters;
    use herald_core::Event;
    use std::sync::Mutex;

    struct Fixture {
        bus: Arc<EventChannel>,
        router: Router,
        seen: Arc<Mutex<Vec<Event>>>,
    }

    fn fixture() -> Fixture {
        let bus = Arc::new(EventChannel::new(64));
        let seen: Arc<Mutex<Vec<Event>>> = Arc::default();
        for pattern in ["agent.*.*", "router.clarification", "router.error"] {
            let sink = Arc::clone(&seen);
            bus.subscribe(
                pattern,
                handler_fn("recorder", move |event: Event| {
                    let sink = Arc::clone(&sink);
                    async move {
                        sink.lock().unwrap().push(event);
                        Ok(())
                    }
                }),
            )
            .unwrap();
        }
        let registry = Arc::new(CapabilityRegistry::new());
        registry.register(Arc::new(MockCapability::new("mail")));
        let config = RouterConfig::default();
        let classifier = Arc::new(IntentClassifier::new(&config));
        let router = Router::new(Arc::clone(&bus), registry, classifier, &config);
        bus.start().unwrap();
        Fixture { bus, router, seen }
    }

    fn intent(target: &str, confidence: f64) -> Intent {
        Intent::new("send", target, Parameters::new(), confidence, "ctx", "send it")
    }

    #[tokio::test]
    async fn test_below_threshold_only_clarifies() {
        let f = fixture();
        for confidence in [0.0, 0.3, 0.69, 0.699_999] {
            let outcome = f.router.route(intent("mail", confidence)).await.unwrap();
            assert!(matches!(outcome, RouteOutcome::Clarification { .. }));
        }
        f.bus.shutdown(true).await;
        let seen = f.seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert!(seen.iter().all(|e| e.topic == "router.clarification"));
    }

    #[tokio::test]
    async fn test_exactly_at_threshold_is_routed() {
        let f = fixture();
        let outcome = f.router.route(intent("mail", 0.7)).await.unwrap();
        match &outcome {
            RouteOutcome::Dispatched { topic, .. } => assert_eq!(topic, "agent.mail.send"),
            other => panic!("expected dispatch, got {:?}", other),
        }
        f.bus.shutdown(true).await;
        let seen = f.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].topic, "agent.mail.send");
        assert_eq!(seen[0].payload["intent"]["target"], "mail");
    }

    #[tokio::test]
    async fn test_unknown_target_emits_routing_error() {
        let f = fixture();
        let outcome = f.router.route(intent("fax", 0.95)).await.unwrap();
        match &outcome {
            RouteOutcome::Rejected { reason, .. } => {
                assert_eq!(reason, "I can't perform that action: unknown service 'fax'")
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        f.bus.shutdown(true).await;
        let seen = f.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].topic, "router.error");
        assert!(seen.iter().all(|e| !e.topic.starts_with("agent.")));
    }

    #[tokio::test]
    async fn test_multi_segment_action_is_rejected_not_dispatched() {
        let f = fixture();
        for action in ["mark.read", "*", "mark read"] {
            let intent = Intent::new(action, "mail", Parameters::new(), 0.95, "ctx", "mark it read");
            assert!(matches!(
                f.router.topic_for(&intent),
                Err(RouterError::InvalidAction(_))
            ));
            let outcome = f.router.route(intent).await.unwrap();
            match &outcome {
                RouteOutcome::Rejected { reason, .. } => {
                    assert!(reason.contains("not a valid action"), "reason was {}", reason)
                }
                other => panic!("expected rejection, got {:?}", other),
            }
        }
        f.bus.shutdown(true).await;
        let seen = f.seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|e| e.topic == "router.error"));
    }

    #[tokio::test]
    async fn test_handle_classifies_and_routes() {
        let f = fixture();
        let outcome = f
            .router
            .handle("send an email to bob@example.com", "ctx")
            .await
            .unwrap();
        assert!(matches!(outcome, RouteOutcome::Dispatched { .. }));
        assert_eq!(outcome.intent().parameters["recipient"], "bob@example.com");

        let outcome = f.router.handle("blah blah", "ctx").await.unwrap();
        assert!(matches!(outcome, RouteOutcome::Clarification { .. }));
        assert!(outcome.user_message().contains("rephrase"));
        f.bus.shutdown(true).await;
    }
}
