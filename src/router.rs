//! Push dispatch by message kind.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::core::{FeedMetrics, PushKind, PushMessage};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerResult = Result<(), HandlerError>;

type Handler = Arc<dyn Fn(&PushMessage) -> HandlerResult + Send + Sync>;

/// Token returned by [`MessageRouter::on`]; pass it to [`MessageRouter::off`] to unregister.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Maps push kinds to handlers invoked in registration order.
///
/// A handler that returns an error or panics is logged and counted; the remaining handlers for
/// the same message still run.
pub struct MessageRouter {
    handlers: RwLock<HashMap<PushKind, Vec<(HandlerId, Handler)>>>,
    next_id: AtomicU64,
    metrics: Arc<FeedMetrics>,
}

impl MessageRouter {
    pub fn new(metrics: Arc<FeedMetrics>) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            metrics,
        }
    }

    pub fn on<F>(&self, kind: PushKind, handler: F) -> HandlerId
    where
        F: Fn(&PushMessage) -> HandlerResult + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Returns `true` if the handler was registered for `kind`.
    pub fn off(&self, kind: PushKind, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        let Some(list) = handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(handler_id, _)| *handler_id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(&kind);
        }
        removed
    }

    pub fn handler_count(&self, kind: PushKind) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Invoke every handler for `message.kind`; returns how many completed successfully.
    pub fn dispatch(&self, message: &PushMessage) -> usize {
        // Snapshot so handlers may register or unregister without deadlocking.
        let handlers: Vec<(HandlerId, Handler)> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&message.kind)
            .cloned()
            .unwrap_or_default();

        if handlers.is_empty() {
            debug!(kind = %message.kind, "push without handlers");
            return 0;
        }

        let mut ok = 0;
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(message))) {
                Ok(Ok(())) => ok += 1,
                Ok(Err(err)) => {
                    warn!(kind = %message.kind, handler = id.0, error = %err, "push handler failed");
                    self.metrics.record_handler_error();
                    self.metrics
                        .record_error(message.kind.as_str(), &err.to_string());
                }
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".to_string());
                    warn!(kind = %message.kind, handler = id.0, panic = %reason, "push handler panicked");
                    self.metrics.record_handler_error();
                    self.metrics.record_error(message.kind.as_str(), &reason);
                }
            }
        }
        ok
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        let counts: HashMap<PushKind, usize> =
            handlers.iter().map(|(kind, list)| (*kind, list.len())).collect();
        f.debug_struct("MessageRouter")
            .field("handlers", &counts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn push(kind: PushKind) -> PushMessage {
        PushMessage {
            kind,
            data: json!({"height": 100}),
            timestamp: None,
        }
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let router = MessageRouter::new(Arc::new(FeedMetrics::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let seen = seen.clone();
            router.on(PushKind::BlockUpdate, move |_| {
                seen.lock().unwrap().push(tag);
                Ok(())
            });
        }

        assert_eq!(router.dispatch(&push(PushKind::BlockUpdate)), 2);
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(router.dispatch(&push(PushKind::Ledger)), 0);
    }

    #[test]
    fn failing_and_panicking_handlers_are_isolated() {
        let metrics = Arc::new(FeedMetrics::new());
        let router = MessageRouter::new(metrics.clone());
        let reached = Arc::new(Mutex::new(false));

        router.on(PushKind::Metrics, |_| Err("bad payload".into()));
        router.on(PushKind::Metrics, |_| panic!("handler bug"));
        let flag = reached.clone();
        router.on(PushKind::Metrics, move |_| {
            *flag.lock().unwrap() = true;
            Ok(())
        });

        assert_eq!(router.dispatch(&push(PushKind::Metrics)), 1);
        assert!(*reached.lock().unwrap());
        assert_eq!(metrics.snapshot().handler_errors, 2);
    }

    #[test]
    fn off_removes_only_the_given_handler() {
        let router = MessageRouter::new(Arc::new(FeedMetrics::new()));
        let a = router.on(PushKind::Gate, |_| Ok(()));
        let _b = router.on(PushKind::Gate, |_| Ok(()));

        assert!(router.off(PushKind::Gate, a));
        assert!(!router.off(PushKind::Gate, a));
        assert!(!router.off(PushKind::Receipt, a));
        assert_eq!(router.handler_count(PushKind::Gate), 1);
    }
}
