//! Dispatch of decoded envelopes to per-kind handlers.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tower_proto::{BaseHeader, Envelope, MessageKind, Payload};

use crate::error::{panic_message, HandlerError};

/// A delivered message: the sender's header and its typed payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Received<T> {
    pub header: BaseHeader,
    pub payload: T,
}

type Handler = Arc<dyn Fn(&Envelope) -> Result<(), HandlerError> + Send + Sync>;

struct Slot {
    handler: Handler,
    once: bool,
}

/// Result of handing one envelope to the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    NoHandler,
    HandlerFailed,
}

/// At most one handler per [`MessageKind`]; registering again replaces it.
#[derive(Default)]
pub struct MessageRouter {
    handlers: Mutex<HashMap<MessageKind, Slot>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T, F>(&self, handler: F)
    where
        T: Payload,
        F: Fn(Received<T>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.insert::<T, F>(handler, false);
    }

    /// Like [`register`](Self::register), removed after its first delivery.
    pub fn register_once<T, F>(&self, handler: F)
    where
        T: Payload,
        F: Fn(Received<T>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.insert::<T, F>(handler, true);
    }

    /// Returns `true` if a handler was registered for `kind`.
    pub fn unregister(&self, kind: MessageKind) -> bool {
        self.slots().remove(&kind).is_some()
    }

    pub fn is_registered(&self, kind: MessageKind) -> bool {
        self.slots().contains_key(&kind)
    }

    fn insert<T, F>(&self, handler: F, once: bool)
    where
        T: Payload,
        F: Fn(Received<T>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(move |envelope: &Envelope| {
            match T::from_body(&envelope.body) {
                Some(payload) => handler(Received {
                    header: envelope.header,
                    payload: payload.clone(),
                }),
                None => Ok(()),
            }
        });
        let replaced = self.slots().insert(T::KIND, Slot { handler, once });
        if replaced.is_some() {
            log::debug!("router: replaced {} handler", T::KIND);
        }
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<MessageKind, Slot>> {
        self.handlers.lock().expect("router mutex poisoned")
    }

    /// Runs the handler for the envelope's kind, if any.
    ///
    /// Handler errors and panics are logged and reported as
    /// [`Dispatch::HandlerFailed`]; they never propagate.
    pub fn dispatch(&self, envelope: &Envelope) -> Dispatch {
        let kind = envelope.kind();
        let handler = {
            let mut slots = self.slots();
            match slots.get(&kind).map(|slot| slot.once) {
                None => None,
                Some(true) => slots.remove(&kind).map(|slot| slot.handler),
                Some(false) => slots.get(&kind).map(|slot| slot.handler.clone()),
            }
        };

        let Some(handler) = handler else {
            log::debug!(
                "router: no handler for {} from node {}",
                kind,
                envelope.header.node_num()
            );
            return Dispatch::NoHandler;
        };

        match catch_unwind(AssertUnwindSafe(|| handler(envelope))) {
            Ok(Ok(())) => Dispatch::Handled,
            Ok(Err(err)) => {
                log::warn!("router: {} handler failed: {}", kind, err);
                Dispatch::HandlerFailed
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                log::error!("router: {} handler panicked: {}", kind, message);
                Dispatch::HandlerFailed
            }
        }
    }
}
