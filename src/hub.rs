//! In-process event bus.
//!
//! Every operation reports progress here; the CLI, API handlers and tests
//! subscribe to follow along. Publishing never blocks: each subscriber reads
//! from its own cursor into a shared ring buffer, and a subscriber that falls
//! more than [`EVENT_BUFFER_SIZE`] events behind loses the oldest ones.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use facet::Facet;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::field::{Field, Visit};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

pub const EVENT_BUFFER_SIZE: usize = 1024;

const HUB_TARGET: &str = "mulch::hub";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Facet)]
#[repr(u8)]
pub enum Severity {
    Trace,
    Info,
    Warning,
    Error,
}

/// One published record. Shared between subscribers, never mutated.
#[derive(Debug, Clone, PartialEq, Facet)]
pub struct HubEvent {
    pub timestamp_us: u64,
    pub severity: Severity,
    /// Originating VM, empty for global events.
    pub vm: String,
    pub message: String,
}

impl HubEvent {
    pub fn new(severity: Severity, vm: &str, message: impl Into<String>) -> Self {
        let timestamp_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;
        Self {
            timestamp_us,
            severity,
            vm: vm.to_string(),
            message: message.into(),
        }
    }

    pub fn is_global(&self) -> bool {
        self.vm.is_empty()
    }
}

/// Cheap, cloneable handle to the process-wide hub.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    tx: broadcast::Sender<Arc<HubEvent>>,
    next_id: AtomicU64,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(HubInner {
                tx,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Join the bus. The subscription sees every event published after this
    /// call returns.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            rx: self.inner.tx.subscribe(),
            vm_filter: None,
            dropped: 0,
        }
    }

    /// Like [`subscribe`](Self::subscribe), keeping only events for `vm`
    /// and global events.
    pub fn subscribe_vm(&self, vm: &str) -> Subscription {
        let mut sub = self.subscribe();
        sub.vm_filter = Some(vm.to_string());
        sub
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        tracing::trace!(
            target: HUB_TARGET,
            id = subscription.id,
            dropped = subscription.dropped,
            "subscriber left"
        );
        drop(subscription);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.tx.receiver_count()
    }

    pub fn publish(&self, event: HubEvent) {
        match event.severity {
            Severity::Trace => tracing::debug!(target: HUB_TARGET, vm = %event.vm, "{}", event.message),
            Severity::Info => tracing::info!(target: HUB_TARGET, vm = %event.vm, "{}", event.message),
            Severity::Warning => tracing::warn!(target: HUB_TARGET, vm = %event.vm, "{}", event.message),
            Severity::Error => tracing::error!(target: HUB_TARGET, vm = %event.vm, "{}", event.message),
        }
        // No subscribers is not an error.
        let _ = self.inner.tx.send(Arc::new(event));
    }

    pub fn trace(&self, vm: &str, message: impl Into<String>) {
        self.publish(HubEvent::new(Severity::Trace, vm, message));
    }

    pub fn info(&self, vm: &str, message: impl Into<String>) {
        self.publish(HubEvent::new(Severity::Info, vm, message));
    }

    pub fn warning(&self, vm: &str, message: impl Into<String>) {
        self.publish(HubEvent::new(Severity::Warning, vm, message));
    }

    pub fn error(&self, vm: &str, message: impl Into<String>) {
        self.publish(HubEvent::new(Severity::Error, vm, message));
    }

    /// A tracing layer that forwards crate log events to this hub as global
    /// events.
    pub fn layer(&self) -> HubLayer {
        HubLayer { hub: self.clone() }
    }
}

pub struct Subscription {
    id: u64,
    rx: broadcast::Receiver<Arc<HubEvent>>,
    vm_filter: Option<String>,
    dropped: u64,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of events lost because this subscriber fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Next event in publish order, or `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<Arc<HubEvent>> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.wants(&event) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(n)) => self.dropped += n,
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Arc<HubEvent>> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.wants(&event) => return Some(event),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(n)) => self.dropped += n,
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    fn wants(&self, event: &HubEvent) -> bool {
        match &self.vm_filter {
            Some(vm) => event.is_global() || &event.vm == vm,
            None => true,
        }
    }
}

/// Forwards `tracing` events from the rest of the crate into the hub.
pub struct HubLayer {
    hub: Hub,
}

impl<S: tracing::Subscriber> Layer<S> for HubLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _cx: Context<'_, S>) {
        let meta = event.metadata();
        if meta.target() == HUB_TARGET || self.hub.subscriber_count() == 0 {
            return;
        }

        let severity = match *meta.level() {
            tracing::Level::TRACE | tracing::Level::DEBUG => Severity::Trace,
            tracing::Level::INFO => Severity::Info,
            tracing::Level::WARN => Severity::Warning,
            tracing::Level::ERROR => Severity::Error,
        };

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let (vm, message) = visitor.finish();
        let _ = self
            .hub
            .inner
            .tx
            .send(Arc::new(HubEvent::new(severity, &vm, message)));
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    vm: String,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn finish(self) -> (String, String) {
        let message = if self.fields.is_empty() {
            self.message
        } else {
            format!("{} {}", self.message, self.fields.join(" "))
        };
        (self.vm, message)
    }
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{value:?}"),
            "vm" => self.vm = format!("{value:?}").trim_matches('"').to_string(),
            name => self.fields.push(format!("{name}={value:?}")),
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "vm" => self.vm = value.to_string(),
            name => self.fields.push(format!("{name}={value}")),
        }
    }
}
