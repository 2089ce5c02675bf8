//! Handler registry
//!
//! Maps event-facet names to dispatch functions, with an optional default
//! handler for unregistered names. Lookup order: exact qualified name,
//! then the short leaf name after the final dot, then the default handler,
//! then none.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::value::ValueMap;

/// Outcome of a handler call: `Ok(None)` means the handler declined the
/// payload ("not handled"), `Err` carries a failure message.
pub type HandlerResult = Result<Option<ValueMap>, String>;

type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// Type-erased handler: payload in, result out.
pub type EventHandler = Arc<dyn Fn(ValueMap) -> HandlerFuture + Send + Sync>;

/// Fallback handler receiving the facet name alongside the payload.
pub type DefaultHandler = Arc<dyn Fn(String, ValueMap) -> HandlerFuture + Send + Sync>;

/// Registry of event-facet handlers.
///
/// # Example
///
/// ```
/// use agentflow_core::registry::HandlerRegistry;
/// use agentflow_core::value::{Value, ValueMap};
///
/// let registry = HandlerRegistry::new();
/// registry.register("Fetch", |payload: ValueMap| async move {
///     let url = payload.get("url").and_then(|v| v.as_str()).unwrap_or("").to_string();
///     let mut result = ValueMap::new();
///     result.insert("body".to_string(), Value::from(format!("<{url}>")));
///     Ok(Some(result))
/// });
/// // Qualified lookups fall back to the short leaf name.
/// assert!(registry.has_handler("Fetch"));
/// assert!(registry.has_handler("osm.geo.Fetch"));
/// ```
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, EventHandler>>,
    default_handler: RwLock<Option<DefaultHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            default_handler: RwLock::new(None),
        }
    }

    /// Register a handler for an event facet name.
    pub fn register<F, Fut>(&self, event_type: &str, handler: F)
    where
        F: Fn(ValueMap) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: EventHandler = Arc::new(move |payload| Box::pin(handler(payload)));
        self.handlers
            .write()
            .insert(event_type.to_string(), handler);
    }

    /// Set the fallback handler for unregistered event types.
    pub fn set_default_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(String, ValueMap) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: DefaultHandler = Arc::new(move |name, payload| Box::pin(handler(name, payload)));
        *self.default_handler.write() = Some(handler);
    }

    /// Whether a specific, short-name, or default handler would serve this
    /// event type.
    pub fn has_handler(&self, event_type: &str) -> bool {
        let handlers = self.handlers.read();
        if handlers.contains_key(event_type) {
            return true;
        }
        if handlers.contains_key(short_name(event_type)) {
            return true;
        }
        self.default_handler.read().is_some()
    }

    /// All registered handler names.
    pub fn handler_names(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }

    /// Dispatch a payload: exact name, short name, default, or not handled.
    pub async fn handle(&self, event_type: &str, payload: ValueMap) -> HandlerResult {
        let handler = {
            let handlers = self.handlers.read();
            handlers
                .get(event_type)
                .or_else(|| handlers.get(short_name(event_type)))
                .cloned()
        };

        if let Some(handler) = handler {
            return handler(payload).await;
        }

        let default = self.default_handler.read().clone();
        if let Some(default) = default {
            return default(event_type.to_string(), payload).await;
        }

        Ok(None)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn short_name(event_type: &str) -> &str {
    event_type.rsplit('.').next().unwrap_or(event_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn payload(key: &str, value: impl Into<Value>) -> ValueMap {
        let mut map = ValueMap::new();
        map.insert(key.to_string(), value.into());
        map
    }

    #[tokio::test]
    async fn test_exact_lookup() {
        let registry = HandlerRegistry::new();
        registry.register("ns.Fetch", |payload: ValueMap| async move {
            Ok(Some(payload))
        });

        let result = registry
            .handle("ns.Fetch", payload("url", "x"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result["url"], Value::from("x"));
    }

    #[tokio::test]
    async fn test_short_name_fallback() {
        let registry = HandlerRegistry::new();
        registry.register("Fetch", |_payload: ValueMap| async move {
            Ok(Some(payload_static()))
        });

        // A qualified lookup falls through to the short leaf name.
        let result = registry
            .handle("osm.geo.Fetch", ValueMap::new())
            .await
            .unwrap();
        assert!(result.is_some());
    }

    fn payload_static() -> ValueMap {
        let mut map = ValueMap::new();
        map.insert("ok".to_string(), Value::Bool(true));
        map
    }

    #[tokio::test]
    async fn test_default_handler_chain() {
        let registry = HandlerRegistry::new();
        registry.set_default_handler(|name: String, _payload: ValueMap| async move {
            let mut result = ValueMap::new();
            result.insert("echo".to_string(), Value::from(name));
            Ok(Some(result))
        });

        let result = registry
            .handle("ns.Unknown", ValueMap::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result["echo"], Value::from("ns.Unknown"));
    }

    #[tokio::test]
    async fn test_no_handler_returns_none() {
        let registry = HandlerRegistry::new();
        assert!(!registry.has_handler("ghost"));
        let result = registry.handle("ghost", ValueMap::new()).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_handler_error_propagates() {
        let registry = HandlerRegistry::new();
        registry.register("Broken", |_payload: ValueMap| async move {
            Err("boom".to_string())
        });

        let result = registry.handle("Broken", ValueMap::new()).await;
        assert_eq!(result.unwrap_err(), "boom");
    }

    #[test]
    fn test_has_handler_with_default() {
        let registry = HandlerRegistry::new();
        assert!(!registry.has_handler("anything"));
        registry.set_default_handler(|_name, _payload| async move { Ok(None) });
        assert!(registry.has_handler("anything"));
    }
}
