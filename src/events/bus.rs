//! In-process event bus

use crate::core::context::RunContext;
use crate::events::event::{DomainEvent, EventType};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Subscriber for domain events
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used when logging delivery failures
    fn name(&self) -> &str {
        "anonymous"
    }

    async fn handle(&self, ctx: &RunContext, event: &DomainEvent) -> anyhow::Result<()>;
}

/// Adapter turning a synchronous closure into a handler
struct FnHandler<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&DomainEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, _ctx: &RunContext, event: &DomainEvent) -> anyhow::Result<()> {
        (self.f)(event)
    }
}

/// Handler that writes every event to the log
pub struct LoggingHandler;

#[async_trait]
impl EventHandler for LoggingHandler {
    fn name(&self) -> &str {
        "logging"
    }

    async fn handle(&self, ctx: &RunContext, event: &DomainEvent) -> anyhow::Result<()> {
        info!(
            event_id = %event.id,
            event_type = %event.event_type(),
            workflow_id = %event.workflow_id,
            trace_id = ctx.trace_id(),
            "Domain event"
        );
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Subscription {
    Type(EventType),
    All,
}

impl Subscription {
    fn matches(&self, event_type: EventType) -> bool {
        match self {
            Subscription::Type(t) => *t == event_type,
            Subscription::All => true,
        }
    }
}

/// Synchronous publish/subscribe of domain events.
///
/// Handlers are registered while the process starts up; the bus is then
/// shared read-only through an `Arc`.
#[derive(Default)]
pub struct EventBus {
    handlers: Vec<(Subscription, Arc<dyn EventHandler>)>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a handler to one event type
    pub fn subscribe(&mut self, event_type: EventType, handler: Arc<dyn EventHandler>) -> &mut Self {
        self.handlers.push((Subscription::Type(event_type), handler));
        self
    }

    /// Subscribe a handler to every event type
    pub fn subscribe_all(&mut self, handler: Arc<dyn EventHandler>) -> &mut Self {
        self.handlers.push((Subscription::All, handler));
        self
    }

    /// Subscribe a closure; `None` subscribes to every event type
    pub fn subscribe_fn<F>(&mut self, event_type: Option<EventType>, name: &str, f: F) -> &mut Self
    where
        F: Fn(&DomainEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let handler = Arc::new(FnHandler {
            name: name.to_string(),
            f,
        });
        let subscription = match event_type {
            Some(t) => Subscription::Type(t),
            None => Subscription::All,
        };
        self.handlers.push((subscription, handler));
        self
    }

    /// Handlers that would receive an event of this type
    pub fn handler_count(&self, event_type: EventType) -> usize {
        self.handlers
            .iter()
            .filter(|(s, _)| s.matches(event_type))
            .count()
    }

    /// Deliver an event to every matching handler, in registration order.
    ///
    /// A failing handler is logged and skipped. Returns how many handlers
    /// accepted the event.
    pub async fn publish(&self, ctx: &RunContext, event: &DomainEvent) -> usize {
        let event_type = event.event_type();
        let mut delivered = 0;

        for (subscription, handler) in &self.handlers {
            if !subscription.matches(event_type) {
                continue;
            }
            match handler.handle(ctx, event).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    handler = handler.name(),
                    event_type = %event_type,
                    event_id = %event.id,
                    error = %e,
                    "Event handler failed"
                ),
            }
        }

        debug!(event_type = %event_type, delivered, "Event published");
        delivered
    }
}
