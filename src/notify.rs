//! Out-of-band notifications from the host.
//!
//! Notifications are id-less messages in the reserved `notifications/`
//! namespace. They are delivered to subscribed handlers on the connection's
//! read loop, in arrival order. Handlers must return quickly: a slow handler
//! delays correlation of every reply queued behind it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::message::Params;

/// Reserved method namespace for host notifications.
pub const NOTIFICATION_PREFIX: &str = "notifications/";

/// Method used by the sidecar for log and progress messages.
pub const MESSAGE_NOTIFICATION: &str = "notifications/message";

/// A decoded host notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Params,
}

type Handler = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Fans notifications out to subscribed handlers.
#[derive(Default)]
pub struct NotificationRouter {
    handlers: Mutex<Vec<(u64, Handler)>>,
    next_id: AtomicU64,
}

impl NotificationRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `handler` for every routed notification.
    ///
    /// The handler stays registered until the returned [`Subscription`] is
    /// dropped.
    pub fn subscribe<F>(self: &Arc<Self>, handler: F) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().push((id, Arc::new(handler)));
        Subscription {
            router: Arc::downgrade(self),
            id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Deliver `notification` to every handler.
    ///
    /// Handlers are called outside the registry lock so they may subscribe or
    /// drop subscriptions themselves.
    pub(crate) fn route(&self, notification: &Notification) {
        if !notification.method.starts_with(NOTIFICATION_PREFIX) {
            debug!(
                "Dropping id-less message outside the notification namespace: {}",
                notification.method
            );
            return;
        }

        let handlers: Vec<Handler> = self
            .lock()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        if handlers.is_empty() {
            debug!("No subscribers, discarding {}", notification.method);
            return;
        }

        for handler in handlers {
            handler(notification);
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.lock().retain(|(handler_id, _)| *handler_id != id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(u64, Handler)>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Keeps a handler registered; dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the handler"]
pub struct Subscription {
    router: Weak<NotificationRouter>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(router) = self.router.upgrade() {
            router.unsubscribe(self.id);
        }
    }
}

/// Progress of a batch, as reported by `notifications/message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub level: String,
    pub message: String,
    pub current: u64,
    pub total: u64,
    pub percent: u64,
    pub step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl BatchProgress {
    /// Parse a batch progress event. Returns `None` for any other notification.
    pub fn from_notification(notification: &Notification) -> Option<Self> {
        if notification.method != MESSAGE_NOTIFICATION {
            return None;
        }
        let params = &notification.params;
        let data = params.get("data")?;
        if data.get("kind").and_then(Value::as_str) != Some("batch_progress") {
            return None;
        }

        fn text(value: Option<&Value>) -> String {
            value.and_then(Value::as_str).unwrap_or_default().to_string()
        }
        let number = |key: &str| data.get(key).and_then(Value::as_u64).unwrap_or(0);

        Some(Self {
            level: text(params.get("level")),
            message: text(params.get("message")),
            current: number("current"),
            total: number("total"),
            percent: number("percent"),
            step: text(data.get("step")),
            extra: data.get("extra").cloned(),
        })
    }

    pub fn is_error(&self) -> bool {
        self.level == "error"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn notification(method: &str, params: Value) -> Notification {
        Notification {
            method: method.to_string(),
            params: serde_json::from_value(params).unwrap(),
        }
    }

    #[test]
    fn test_route_in_order_to_all_handlers() {
        let router = NotificationRouter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let _first = router.subscribe(move |n| {
            sink.lock().unwrap().push(format!("a:{}", n.params["n"]));
        });
        let sink = Arc::clone(&seen);
        let _second = router.subscribe(move |n| {
            sink.lock().unwrap().push(format!("b:{}", n.params["n"]));
        });

        router.route(&notification(MESSAGE_NOTIFICATION, json!({"n": 1})));
        router.route(&notification(MESSAGE_NOTIFICATION, json!({"n": 2})));

        assert_eq!(*seen.lock().unwrap(), vec!["a:1", "b:1", "a:2", "b:2"]);
    }

    #[test]
    fn test_dropping_subscription_unsubscribes() {
        let router = NotificationRouter::new();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&count);
        let subscription = router.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        router.route(&notification(MESSAGE_NOTIFICATION, json!({})));
        drop(subscription);
        router.route(&notification(MESSAGE_NOTIFICATION, json!({})));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(router.subscriber_count(), 0);
    }

    #[test]
    fn test_no_subscribers_discards() {
        let router = NotificationRouter::new();
        router.route(&notification(MESSAGE_NOTIFICATION, json!({"level": "info"})));
        assert_eq!(router.subscriber_count(), 0);
    }

    #[test]
    fn test_outside_namespace_is_not_routed() {
        let router = NotificationRouter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let _sub = router.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        router.route(&notification("window/logMessage", json!({})));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_batch_progress_parse() {
        let n = notification(
            MESSAGE_NOTIFICATION,
            json!({
                "level": "info",
                "message": "Batch: 2/7 (29%) add_component_to_blueprint",
                "data": {
                    "kind": "batch_progress",
                    "current": 2,
                    "total": 7,
                    "percent": 29,
                    "step": "add_component_to_blueprint",
                    "request_id": "abc"
                }
            }),
        );
        let progress = BatchProgress::from_notification(&n).unwrap();
        assert_eq!(progress.current, 2);
        assert_eq!(progress.total, 7);
        assert_eq!(progress.percent, 29);
        assert_eq!(progress.step, "add_component_to_blueprint");
        assert!(!progress.is_error());
    }

    #[test]
    fn test_batch_progress_ignores_plain_messages() {
        let n = notification(
            MESSAGE_NOTIFICATION,
            json!({"level": "warn", "message": "falling back", "data": {}}),
        );
        assert_eq!(BatchProgress::from_notification(&n), None);
    }
}
