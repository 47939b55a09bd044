//! Post-merge fan-out to registered collaborators.
//!
//! Listeners run synchronously, in registration order, after every non-empty
//! merge. Each call is isolated: a listener that returns an error or panics is
//! logged and counted, and the remaining listeners still run. The merge that
//! triggered the notification is already committed either way.
//!
//! Listeners must be short and non-blocking; a slow listener delays the next
//! inbound message.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::delta::Delta;
use crate::replica::Replica;

/// A listener failed to handle a delta.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ListenerError {
    #[error("{0}")]
    Failed(String),
    #[error("listener panicked: {0}")]
    Panicked(String),
}

impl ListenerError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

/// A collaborator notified after each applied delta.
pub trait Listener: Send + Sync {
    fn on_delta(&self, delta: &Delta, replica: &Replica) -> Result<(), ListenerError>;
}

impl<F> Listener for F
where
    F: Fn(&Delta, &Replica) -> Result<(), ListenerError> + Send + Sync,
{
    fn on_delta(&self, delta: &Delta, replica: &Replica) -> Result<(), ListenerError> {
        self(delta, replica)
    }
}

/// Identifier handed out at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Outcome of one notification round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifyReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Per-listener counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerStats {
    pub id: ListenerId,
    pub name: String,
    pub invocations: u64,
    pub failures: u64,
}

struct Registration {
    id: ListenerId,
    name: String,
    listener: Box<dyn Listener>,
    invocations: AtomicU64,
    failures: AtomicU64,
}

/// Append-only list of listeners. Clones share the same list.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    entries: Arc<RwLock<Vec<Arc<Registration>>>>,
    next_id: Arc<AtomicU64>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a callback. There is no unregistration.
    pub fn register<F>(&self, name: impl Into<String>, callback: F) -> ListenerId
    where
        F: Fn(&Delta, &Replica) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.register_listener(name, callback)
    }

    /// Append a [`Listener`] implementation.
    pub fn register_listener(
        &self,
        name: impl Into<String>,
        listener: impl Listener + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let name = name.into();
        log::debug!("registered listener {name} ({id})");
        self.entries.write().push(Arc::new(Registration {
            id,
            name,
            listener: Box::new(listener),
            invocations: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }));
        id
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Invoke every listener with the applied delta.
    ///
    /// The list is copied first, so a listener may register another one; the
    /// newcomer is called from the next delta on.
    pub fn notify(&self, delta: &Delta, replica: &Replica) -> NotifyReport {
        let registrations: Vec<Arc<Registration>> = self.entries.read().clone();
        let mut report = NotifyReport::default();

        for registration in &registrations {
            registration.invocations.fetch_add(1, Ordering::Relaxed);
            match invoke(registration.listener.as_ref(), delta, replica) {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    registration.failures.fetch_add(1, Ordering::Relaxed);
                    report.failed += 1;
                    log::error!(
                        "listener {} ({}) failed: {err}",
                        registration.name,
                        registration.id
                    );
                }
            }
        }
        report
    }

    /// Counter snapshot, in registration order.
    pub fn stats(&self) -> Vec<ListenerStats> {
        self.entries
            .read()
            .iter()
            .map(|registration| ListenerStats {
                id: registration.id,
                name: registration.name.clone(),
                invocations: registration.invocations.load(Ordering::Relaxed),
                failures: registration.failures.load(Ordering::Relaxed),
            })
            .collect()
    }
}

fn invoke(listener: &dyn Listener, delta: &Delta, replica: &Replica) -> Result<(), ListenerError> {
    panic::catch_unwind(AssertUnwindSafe(|| listener.on_delta(delta, replica)))
        .unwrap_or_else(|payload| Err(ListenerError::Panicked(panic_message(payload.as_ref()))))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
