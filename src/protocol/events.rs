//! Typed observer lists
//!
//! Each event category keeps an ordered, bounded list of callbacks. A
//! callback that returns an error or panics is logged as a handler fault
//! and the remaining callbacks still run.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::warn;

use crate::core::{Error, PeerId, Result};
use super::batch::Batch;
use super::message::SlaveStatusReport;

/// Observer callback
pub type Handler<T> = Arc<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>;

/// Ordered callbacks for one event category
pub struct HandlerList<T> {
    category: &'static str,
    max_handlers: usize,
    handlers: RwLock<Vec<Handler<T>>>,
}

impl<T> HandlerList<T> {
    pub fn new(category: &'static str, max_handlers: usize) -> Self {
        HandlerList {
            category,
            max_handlers,
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Appends a callback; fails with `CapacityExceeded` when the list is full
    pub fn register<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write();
        if handlers.len() >= self.max_handlers {
            warn!(category = self.category, max = self.max_handlers, "Handler list full");
            return Err(Error::capacity(format!(
                "{} handlers limited to {}",
                self.category, self.max_handlers
            )));
        }
        handlers.push(Arc::new(handler));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls every handler in registration order
    ///
    /// Returns the number of handlers that faulted. The list lock is not held
    /// while callbacks run, so a callback may register further handlers.
    pub fn emit(&self, event: &T) -> usize {
        let handlers: Vec<Handler<T>> = self.handlers.read().clone();
        let mut faults = 0;

        for (index, handler) in handlers.iter().enumerate() {
            let fault = match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => Error::handler_fault(format!("{} handler {}: {:#}", self.category, index, e)),
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    Error::handler_fault(format!("{} handler {} panicked: {}", self.category, index, reason))
                }
            };
            faults += 1;
            warn!(error = %fault, "Observer failed");
        }

        faults
    }
}

impl<T> fmt::Debug for HandlerList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerList")
            .field("category", &self.category)
            .field("len", &self.len())
            .field("max_handlers", &self.max_handlers)
            .finish()
    }
}

/// A batch received from a peer
#[derive(Debug, Clone)]
pub struct BatchEvent {
    pub peer: PeerId,
    pub batch: Batch,
    /// Unix seconds at reception
    pub received_at: u64,
    /// Rows newly written to the store (zero for plain batches and redeliveries)
    pub stored: usize,
}

/// A status report received from a peer
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub peer: PeerId,
    pub report: SlaveStatusReport,
    pub received_at: u64,
}

/// Standard telemetry seen on the private channel
#[derive(Debug, Clone)]
pub struct TelemetryEvent {
    pub peer: PeerId,
    pub port: u16,
    pub payload: Bytes,
    pub received_at: u64,
}

/// A peer crossed the offline timeout
#[derive(Debug, Clone)]
pub struct PeerOfflineEvent {
    pub peer: PeerId,
    pub last_seen: u64,
}

/// Observer lists for every inbound event category
#[derive(Debug)]
pub struct EventHub {
    pub batches: HandlerList<BatchEvent>,
    pub statuses: HandlerList<StatusEvent>,
    pub telemetry: HandlerList<TelemetryEvent>,
    pub peer_offline: HandlerList<PeerOfflineEvent>,
}

impl EventHub {
    pub fn new(max_handlers: usize) -> Self {
        EventHub {
            batches: HandlerList::new("batch", max_handlers),
            statuses: HandlerList::new("status", max_handlers),
            telemetry: HandlerList::new("telemetry", max_handlers),
            peer_offline: HandlerList::new("peer_offline", max_handlers),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_handlers_run_in_order() {
        let list = HandlerList::<u32>::new("test", 4);
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in 0..3 {
            let sink = seen.clone();
            list.register(move |value: &u32| {
                sink.lock().push((tag, *value));
                Ok(())
            })
            .unwrap();
        }

        assert_eq!(list.emit(&9), 0);
        assert_eq!(*seen.lock(), vec![(0, 9), (1, 9), (2, 9)]);
    }

    #[test]
    fn test_capacity_bound() {
        let list = HandlerList::<u32>::new("test", 2);
        list.register(|_: &u32| Ok(())).unwrap();
        list.register(|_: &u32| Ok(())).unwrap();
        let err = list.register(|_: &u32| Ok(())).unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded(_)));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_faults_are_isolated() {
        let list = HandlerList::<u32>::new("test", 4);
        let calls = Arc::new(Mutex::new(0u32));

        list.register(|_: &u32| Err(anyhow::anyhow!("observer refused"))).unwrap();
        list.register(|_: &u32| -> anyhow::Result<()> { panic!("observer exploded") }).unwrap();
        let counter = calls.clone();
        list.register(move |_: &u32| {
            *counter.lock() += 1;
            Ok(())
        })
        .unwrap();

        assert_eq!(list.emit(&1), 2);
        assert_eq!(list.emit(&2), 2);
        assert_eq!(*calls.lock(), 2);
    }

    #[test]
    fn test_handler_may_register_during_emit() {
        let list = Arc::new(HandlerList::<u32>::new("test", 4));
        let inner = list.clone();
        list.register(move |_: &u32| {
            let _ = inner.register(|_: &u32| Ok(()));
            Ok(())
        })
        .unwrap();

        list.emit(&0);
        assert_eq!(list.len(), 2);
    }
}
