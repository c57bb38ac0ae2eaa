//! Subscriber interface.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use herald_core::Event;

use crate::error::HandlerError;

/// A subscriber invoked for every event whose topic matches its pattern.
///
/// Handlers run in an isolated task: a returned error or a panic is
/// reported on the `<component>.error` topic and does not affect other
/// subscribers of the same event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used when reporting failures.
    fn name(&self) -> &str;

    async fn handle(&self, event: &Event) -> Result<(), HandlerError>;
}

struct FnHandler<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        (self.f)(event.clone()).await
    }
}

/// Wrap an async closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handler_fn_invokes_closure() {
        let handler = handler_fn("echo", |event: Event| async move {
            if event.topic == "bad.topic" {
                Err(HandlerError::from("rejected"))
            } else {
                Ok(())
            }
        });
        assert_eq!(handler.name(), "echo");
        assert!(handler
            .handle(&Event::new("good.topic", serde_json::Value::Null))
            .await
            .is_ok());
        let err = handler
            .handle(&Event::new("bad.topic", serde_json::Value::Null))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "rejected");
    }
}
