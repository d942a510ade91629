//! Event hook bus shared by the Coordinator, the Verification Controller and
//! the target executors.
//!
//! A host object owns a [`HookRegistry`] parameterized over its event payload
//! type and declares the closed set of event names it can fire. External
//! collaborators (CLI, reporter, remote driver) register listeners for those
//! names; listeners run synchronously in registration order. A listener error
//! is swallowed (and logged) unless the listener opts into `raise_error`; a
//! listener can report itself inactive to be skipped without unregistration.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced by the hook bus.
#[derive(Error, Debug)]
pub enum HookError {
    /// The event name is not part of the host object's declared event set.
    #[error("`{0}` is not a valid event hook")]
    InvalidEvent(String),

    /// A listener with `raise_error = true` failed.
    #[error("hook listener for `{event}` failed")]
    Listener {
        /// Event that was being dispatched.
        event: String,
        /// The listener's error.
        #[source]
        source: anyhow::Error,
    },
}

/// Payload types dispatched through a [`HookRegistry`].
///
/// Every payload value maps to exactly one declared event name.
pub trait HookEvent {
    /// The event name this payload is dispatched under.
    fn name(&self) -> &'static str;
}

/// A registered hook listener.
///
/// The default capability set is an always-active listener whose errors are
/// swallowed by the dispatcher.
pub trait EventListener<E>: Send + Sync {
    /// Inactive listeners are skipped at dispatch without unregistration.
    fn active(&self) -> bool {
        true
    }

    /// When true, an error from [`EventListener::on_event`] aborts dispatch.
    fn raise_error(&self) -> bool {
        false
    }

    /// Handle one event.
    fn on_event(&self, event: &E) -> anyhow::Result<()>;
}

struct FnListener<F>(F);

impl<E, F> EventListener<E> for FnListener<F>
where
    F: Fn(&E) -> anyhow::Result<()> + Send + Sync,
{
    fn on_event(&self, event: &E) -> anyhow::Result<()> {
        (self.0)(event)
    }
}

/// Named-event to listeners table.
pub struct HookRegistry<E> {
    events: &'static [&'static str],
    listeners: HashMap<&'static str, Vec<Arc<dyn EventListener<E>>>>,
}

impl<E: HookEvent> HookRegistry<E> {
    /// Create a registry over a closed set of event names.
    pub fn new(events: &'static [&'static str]) -> Self {
        Self {
            events,
            listeners: HashMap::new(),
        }
    }

    fn lookup(&self, event_name: &str) -> Result<&'static str, HookError> {
        self.events
            .iter()
            .find(|name| **name == event_name)
            .copied()
            .ok_or_else(|| HookError::InvalidEvent(event_name.to_string()))
    }

    /// Register a listener for `event_name`.
    ///
    /// Unknown event names are rejected immediately.
    pub fn register_hook(
        &mut self,
        event_name: &str,
        listener: Arc<dyn EventListener<E>>,
    ) -> Result<(), HookError> {
        let name = self.lookup(event_name)?;
        self.listeners.entry(name).or_default().push(listener);
        Ok(())
    }

    /// Register a plain closure as a listener.
    pub fn register_fn<F>(&mut self, event_name: &str, hook: F) -> Result<(), HookError>
    where
        F: Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register_hook(event_name, Arc::new(FnListener(hook)))
    }

    /// Dispatch an event to all of its listeners, in registration order.
    pub fn emit(&self, event: &E) -> Result<(), HookError> {
        let name = self.lookup(event.name())?;
        if let Some(listeners) = self.listeners.get(name) {
            for listener in listeners {
                if !listener.active() {
                    continue;
                }
                if let Err(error) = listener.on_event(event) {
                    if listener.raise_error() {
                        return Err(HookError::Listener {
                            event: name.to_string(),
                            source: error,
                        });
                    }
                    tracing::warn!(event = name, error = %error, "hook listener failed");
                }
            }
        }
        Ok(())
    }

    /// Number of listeners registered for an event.
    pub fn listener_count(&self, event_name: &str) -> usize {
        self.listeners.get(event_name).map_or(0, Vec::len)
    }
}
