//! Capability boundary and registry.
//!
//! Every service integration (mail, chat, trackers, ...) implements the same
//! three-method contract. The registry resolves capabilities by target name
//! and applies authentication, timeouts and error classification uniformly.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use herald_core::types::Parameters;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::CapabilityError;

/// Actions served by `fetch`; everything else goes through `act`.
pub const FETCH_ACTIONS: &[&str] = &["fetch", "search", "read", "list"];

/// A service integration.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Target name used in topics, e.g. "mail".
    fn name(&self) -> &str;

    async fn authenticate(&self) -> Result<bool, CapabilityError>;

    async fn fetch(&self, params: &Parameters) -> Result<Vec<serde_json::Value>, CapabilityError>;

    async fn act(&self, action: &str, data: &Parameters) -> Result<bool, CapabilityError>;
}

/// Result of a successful invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityOutput {
    Records(Vec<serde_json::Value>),
    Acknowledged,
}

impl CapabilityOutput {
    /// JSON view merged into shared state and response payloads.
    ///
    /// Fields of the first record are lifted to the top level so later
    /// steps can reference them directly (`{{step.recipient}}`).
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            CapabilityOutput::Records(records) => {
                let mut out = serde_json::Map::new();
                if let Some(serde_json::Value::Object(first)) = records.first() {
                    for (k, v) in first {
                        out.insert(k.clone(), v.clone());
                    }
                }
                out.insert("count".into(), json!(records.len()));
                out.insert("records".into(), serde_json::Value::Array(records.clone()));
                serde_json::Value::Object(out)
            }
            CapabilityOutput::Acknowledged => json!({ "ok": true }),
        }
    }
}

struct Entry {
    capability: Arc<dyn Capability>,
    authenticated: AtomicBool,
}

/// Registry of capabilities keyed by target name.
#[derive(Default)]
pub struct CapabilityRegistry {
    entries: RwLock<BTreeMap<String, Arc<Entry>>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a capability under its own name.
    pub fn register(&self, capability: Arc<dyn Capability>) {
        let name = capability.name().to_lowercase();
        info!(capability = %name, "Capability registered");
        let entry = Arc::new(Entry {
            capability,
            authenticated: AtomicBool::new(false),
        });
        self.write().insert(name, entry);
    }

    pub fn get(&self, target: &str) -> Option<Arc<dyn Capability>> {
        self.read()
            .get(&target.to_lowercase())
            .map(|e| Arc::clone(&e.capability))
    }

    pub fn contains(&self, target: &str) -> bool {
        self.read().contains_key(&target.to_lowercase())
    }

    /// Registered target names, sorted.
    pub fn targets(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Invoke `action` on `target`, authenticating on first use.
    ///
    /// The whole call, authentication included, is bounded by `timeout`;
    /// expiry yields the retryable [`CapabilityError::Timeout`].
    pub async fn invoke(
        &self,
        target: &str,
        action: &str,
        params: &Parameters,
        timeout: Duration,
    ) -> Result<CapabilityOutput, CapabilityError> {
        let entry = self
            .read()
            .get(&target.to_lowercase())
            .cloned()
            .ok_or_else(|| CapabilityError::UnknownCapability(target.to_string()))?;

        let call = Self::call(&entry, action, params);
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(capability = target, action, timeout_ms = ms, "Capability call timed out");
                Err(CapabilityError::Timeout(ms))
            }
        }
    }

    async fn call(
        entry: &Entry,
        action: &str,
        params: &Parameters,
    ) -> Result<CapabilityOutput, CapabilityError> {
        let capability = &entry.capability;
        if !entry.authenticated.load(Ordering::Acquire) {
            if !capability.authenticate().await? {
                return Err(CapabilityError::Authentication(capability.name().to_string()));
            }
            entry.authenticated.store(true, Ordering::Release);
            debug!(capability = capability.name(), "Authenticated");
        }

        if FETCH_ACTIONS.contains(&action) {
            let mut query = params.clone();
            query
                .entry("action")
                .or_insert_with(|| serde_json::Value::String(action.to_string()));
            Ok(CapabilityOutput::Records(capability.fetch(&query).await?))
        } else if capability.act(action, params).await? {
            Ok(CapabilityOutput::Acknowledged)
        } else {
            Err(CapabilityError::Rejected {
                capability: capability.name().to_string(),
                action: action.to_string(),
            })
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<Entry>>> {
        self.entries.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Arc<Entry>>> {
        self.entries.write().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Scriptable capability used across this crate's tests.
    pub(crate) struct MockCapability {
        pub name: String,
        pub auth_ok: bool,
        pub auth_calls: AtomicUsize,
        pub act_calls: AtomicUsize,
        pub delay: Option<Duration>,
        pub act_result: Result<bool, CapabilityError>,
    }

    impl MockCapability {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                auth_ok: true,
                auth_calls: AtomicUsize::new(0),
                act_calls: AtomicUsize::new(0),
                delay: None,
                act_result: Ok(true),
            }
        }
    }

    #[async_trait]
    impl Capability for MockCapability {
        fn name(&self) -> &str {
            &self.name
        }

        async fn authenticate(&self) -> Result<bool, CapabilityError> {
            self.auth_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.auth_ok)
        }

        async fn fetch(
            &self,
            params: &Parameters,
        ) -> Result<Vec<serde_json::Value>, CapabilityError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(vec![json!({"subject": "Q3 report", "echo": params})])
        }

        async fn act(&self, _action: &str, _data: &Parameters) -> Result<bool, CapabilityError> {
            self.act_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.act_result.clone()
        }
    }

    const SECOND: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_register_and_lookup_case_insensitive() {
        let registry = CapabilityRegistry::new();
        registry.register(Arc::new(MockCapability::new("Mail")));
        registry.register(Arc::new(MockCapability::new("chat")));
        assert!(registry.contains("mail"));
        assert!(registry.contains("MAIL"));
        assert!(registry.get("chat").is_some());
        assert!(registry.get("fax").is_none());
        assert_eq!(registry.targets(), vec!["chat", "mail"]);
    }

    #[tokio::test]
    async fn test_invoke_authenticates_once() {
        let registry = CapabilityRegistry::new();
        let mock = Arc::new(MockCapability::new("mail"));
        registry.register(mock.clone());

        for _ in 0..3 {
            let out = registry
                .invoke("mail", "send", &Parameters::new(), SECOND)
                .await
                .unwrap();
            assert_eq!(out, CapabilityOutput::Acknowledged);
        }
        assert_eq!(mock.auth_calls.load(Ordering::SeqCst), 1);
        assert_eq!(mock.act_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fetch_actions_use_fetch() {
        let registry = CapabilityRegistry::new();
        registry.register(Arc::new(MockCapability::new("mail")));
        let out = registry
            .invoke("mail", "search", &Parameters::new(), SECOND)
            .await
            .unwrap();
        let value = out.to_value();
        assert_eq!(value["count"], 1);
        assert_eq!(value["subject"], "Q3 report");
        assert_eq!(value["records"][0]["echo"]["action"], "search");
    }

    #[tokio::test]
    async fn test_failed_authentication_is_not_retryable() {
        let registry = CapabilityRegistry::new();
        let mut mock = MockCapability::new("mail");
        mock.auth_ok = false;
        registry.register(Arc::new(mock));
        let err = registry
            .invoke("mail", "send", &Parameters::new(), SECOND)
            .await
            .unwrap_err();
        assert_eq!(err, CapabilityError::Authentication("mail".into()));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_act_false_is_rejected() {
        let registry = CapabilityRegistry::new();
        let mut mock = MockCapability::new("chat");
        mock.act_result = Ok(false);
        registry.register(Arc::new(mock));
        let err = registry
            .invoke("chat", "send", &Parameters::new(), SECOND)
            .await
            .unwrap_err();
        assert!(matches!(err, CapabilityError::Rejected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retryable() {
        let registry = CapabilityRegistry::new();
        let mut mock = MockCapability::new("mail");
        mock.delay = Some(Duration::from_secs(60));
        registry.register(Arc::new(mock));
        let err = registry
            .invoke("mail", "send", &Parameters::new(), Duration::from_millis(250))
            .await
            .unwrap_err();
        assert_eq!(err, CapabilityError::Timeout(250));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unknown_target() {
        let registry = CapabilityRegistry::new();
        let err = registry
            .invoke("fax", "send", &Parameters::new(), SECOND)
            .await
            .unwrap_err();
        assert_eq!(err, CapabilityError::UnknownCapability("fax".into()));
    }
}
