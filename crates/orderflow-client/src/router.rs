use crate::lock;
use orderflow_core::wire::{WorkflowEvent, MESSAGE_CHANNEL};
use orderflow_core::Envelope;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use tracing::{error, warn};

pub type Handler = Arc<dyn Fn(&RoutedEvent) -> anyhow::Result<()> + Send + Sync>;

type Registry = Mutex<HashMap<String, Vec<Handler>>>;

/// An inbound envelope together with its typed decoding, when the type is known.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedEvent {
    pub envelope: Envelope,
    pub event: Option<WorkflowEvent>,
}

impl RoutedEvent {
    /// Decode once at the routing boundary. A payload that does not fit its
    /// declared type is still routed, untyped.
    pub fn new(envelope: Envelope) -> Self {
        let event = match envelope.decode_event() {
            Ok(event) => event,
            Err(err) => {
                warn!(
                    event = "payload_decode_failed",
                    event_type = %envelope.event_type,
                    error = %err
                );
                None
            }
        };
        Self { envelope, event }
    }

    pub fn event_type(&self) -> &str {
        &self.envelope.event_type
    }
}

#[derive(Clone, Default)]
pub struct EventRouter {
    registry: Arc<Registry>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registering the same handler twice for one type is a no-op.
    pub fn subscribe(&self, event_type: impl Into<String>, handler: Handler) -> Subscription {
        let event_type = event_type.into();
        {
            let mut registry = lock(&self.registry);
            let handlers = registry.entry(event_type.clone()).or_default();
            if !handlers.iter().any(|existing| Arc::ptr_eq(existing, &handler)) {
                handlers.push(Arc::clone(&handler));
            }
        }
        Subscription {
            registry: Arc::downgrade(&self.registry),
            event_type,
            handler,
        }
    }

    pub fn subscribe_fn<F>(&self, event_type: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&RoutedEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(event_type, Arc::new(handler))
    }

    pub fn handler_count(&self, event_type: &str) -> usize {
        lock(&self.registry).get(event_type).map_or(0, Vec::len)
    }

    pub fn has_channel(&self, event_type: &str) -> bool {
        lock(&self.registry).contains_key(event_type)
    }

    /// Deliver to the envelope's own type, then to the `message` channel.
    /// Returns how many handlers ran without error.
    pub fn dispatch(&self, routed: &RoutedEvent) -> usize {
        let mut delivered = 0;
        delivered += self.dispatch_channel(routed.event_type(), routed);
        if routed.event_type() != MESSAGE_CHANNEL {
            delivered += self.dispatch_channel(MESSAGE_CHANNEL, routed);
        }
        delivered
    }

    fn dispatch_channel(&self, channel: &str, routed: &RoutedEvent) -> usize {
        let snapshot = match lock(&self.registry).get(channel) {
            Some(handlers) => handlers.clone(),
            None => return 0,
        };
        let mut delivered = 0;
        for handler in snapshot {
            if !self.is_registered(channel, &handler) {
                continue;
            }
            match panic::catch_unwind(AssertUnwindSafe(|| handler(routed))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(err)) => {
                    warn!(
                        event = "handler_failed",
                        channel = %channel,
                        event_type = %routed.event_type(),
                        error = %err
                    );
                }
                Err(_) => {
                    error!(
                        event = "handler_panicked",
                        channel = %channel,
                        event_type = %routed.event_type()
                    );
                }
            }
        }
        delivered
    }

    fn is_registered(&self, channel: &str, handler: &Handler) -> bool {
        lock(&self.registry)
            .get(channel)
            .is_some_and(|handlers| handlers.iter().any(|h| Arc::ptr_eq(h, handler)))
    }
}

/// Handle returned by [`EventRouter::subscribe`]. Dropping it keeps the
/// handler registered; call [`Subscription::unsubscribe`] to remove it.
#[derive(Clone)]
pub struct Subscription {
    registry: Weak<Registry>,
    event_type: String,
    handler: Handler,
}

impl Subscription {
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Remove exactly this handler; the channel entry goes once it is empty.
    pub fn unsubscribe(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = lock(&registry);
        if let Some(handlers) = registry.get_mut(&self.event_type) {
            handlers.retain(|existing| !Arc::ptr_eq(existing, &self.handler));
            if handlers.is_empty() {
                registry.remove(&self.event_type);
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("event_type", &self.event_type)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn routed(event_type: &str) -> RoutedEvent {
        RoutedEvent::new(Envelope::new(event_type, json!({"run_id": "run-1"})))
    }

    fn counting(counter: &Arc<AtomicUsize>) -> Handler {
        let counter = Arc::clone(counter);
        Arc::new(move |_: &RoutedEvent| -> anyhow::Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn delivers_to_type_and_message_channels() {
        let router = EventRouter::new();
        let typed = Arc::new(AtomicUsize::new(0));
        let wildcard = Arc::new(AtomicUsize::new(0));
        router.subscribe("payment_link", counting(&typed));
        let seen_type = Arc::new(Mutex::new(String::new()));
        let seen = Arc::clone(&seen_type);
        router.subscribe_fn(MESSAGE_CHANNEL, move |event| {
            *seen.lock().expect("lock") = event.event_type().to_string();
            Ok(())
        });
        router.subscribe(MESSAGE_CHANNEL, counting(&wildcard));

        assert_eq!(router.dispatch(&routed("payment_link")), 3);
        assert_eq!(typed.load(Ordering::SeqCst), 1);
        assert_eq!(wildcard.load(Ordering::SeqCst), 1);
        assert_eq!(*seen_type.lock().expect("lock"), "payment_link");

        router.dispatch(&routed("blockchain_tx"));
        assert_eq!(typed.load(Ordering::SeqCst), 1);
        assert_eq!(wildcard.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn same_handler_is_registered_once() {
        let router = EventRouter::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let handler = counting(&counter);
        let first = router.subscribe("step_update", Arc::clone(&handler));
        let _second = router.subscribe("step_update", Arc::clone(&handler));
        assert_eq!(router.handler_count("step_update"), 1);

        router.dispatch(&routed("step_update"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        first.unsubscribe();
        assert!(!router.has_channel("step_update"));
        router.dispatch(&routed("step_update"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_removes_only_that_handler() {
        let router = EventRouter::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        let sub_a = router.subscribe("error", counting(&a));
        router.subscribe("error", counting(&b));

        sub_a.unsubscribe();
        sub_a.unsubscribe();
        assert_eq!(router.handler_count("error"), 1);
        router.dispatch(&routed("error"));
        assert_eq!(a.load(Ordering::SeqCst), 0);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_handlers_do_not_starve_siblings() {
        let router = EventRouter::new();
        let counter = Arc::new(AtomicUsize::new(0));
        router.subscribe_fn("final_output", |_| anyhow::bail!("listener exploded"));
        router.subscribe_fn("final_output", |_| panic!("listener panicked"));
        router.subscribe("final_output", counting(&counter));
        router.subscribe(MESSAGE_CHANNEL, counting(&counter));

        assert_eq!(router.dispatch(&routed("final_output")), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn handlers_may_unsubscribe_during_dispatch() {
        let router = EventRouter::new();
        let calls = Arc::new(Mutex::new(Vec::<&'static str>::new()));

        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let own_slot = Arc::clone(&slot);
        let log = Arc::clone(&calls);
        let sub = router.subscribe_fn("phase_transition", move |_| {
            log.lock().expect("lock").push("self-removing");
            if let Some(sub) = own_slot.lock().expect("lock").take() {
                sub.unsubscribe();
            }
            Ok(())
        });
        *slot.lock().expect("lock") = Some(sub);

        for name in ["second", "third"] {
            let log = Arc::clone(&calls);
            router.subscribe_fn("phase_transition", move |_| {
                log.lock().expect("lock").push(name);
                Ok(())
            });
        }

        router.dispatch(&routed("phase_transition"));
        router.dispatch(&routed("phase_transition"));
        assert_eq!(
            *calls.lock().expect("lock"),
            vec!["self-removing", "second", "third", "second", "third"]
        );
    }

    #[test]
    fn handlers_may_subscribe_during_dispatch() {
        let router = EventRouter::new();
        let late = Arc::new(AtomicUsize::new(0));
        let inner_router = router.clone();
        let late_handler = counting(&late);
        router.subscribe_fn("heartbeat", move |_| {
            inner_router.subscribe("heartbeat", Arc::clone(&late_handler));
            Ok(())
        });

        router.dispatch(&routed("heartbeat"));
        assert_eq!(late.load(Ordering::SeqCst), 0);
        router.dispatch(&routed("heartbeat"));
        assert_eq!(late.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn malformed_payloads_are_routed_untyped() {
        let event = RoutedEvent::new(Envelope::new(
            "clarification_request",
            json!({"question": "missing id"}),
        ));
        assert!(event.event.is_none());
        let typed = RoutedEvent::new(Envelope::new("heartbeat", json!({})));
        assert!(matches!(typed.event, Some(WorkflowEvent::Heartbeat(_))));
    }
}
