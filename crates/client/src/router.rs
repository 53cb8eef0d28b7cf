//! Signal router.
//!
//! Routes each decoded envelope to the handler registered for its message
//! kind. Envelopes are dispatched one at a time in arrival order by a
//! dispatcher task; the receive loop only queues, so it keeps decrypting
//! while a handler is suspended.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use protocol::{Envelope, Message, MessageKind};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Boxed handler for one message kind.
pub type Handler = Arc<dyn Fn(Message) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Errors that can occur during routing.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// The frame is not a well-formed envelope.
    #[error("malformed envelope: {0}")]
    Malformed(#[from] protocol::ProtocolError),

    /// The dispatcher has stopped.
    #[error("router closed")]
    Closed,
}

/// Kind-to-handler table. Cheap to clone; clones share the table.
#[derive(Clone, Default)]
pub struct SignalRouter {
    handlers: Arc<RwLock<HashMap<MessageKind, Handler>>>,
}

impl SignalRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any previous handler.
    pub async fn register_handler<F, Fut>(&self, kind: MessageKind, handler: F)
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler = Arc::new(
            move |message| -> Pin<Box<dyn Future<Output = ()> + Send>> { Box::pin(handler(message)) },
        );
        if self.handlers.write().await.insert(kind, handler).is_some() {
            debug!(%kind, "replaced handler");
        }
    }

    /// Remove the handler for `kind`. Returns whether one was registered.
    pub async fn unregister_handler(&self, kind: MessageKind) -> bool {
        self.handlers.write().await.remove(&kind).is_some()
    }

    /// Run the handler for the envelope's kind.
    ///
    /// Returns `false` when no handler is registered; the envelope is dropped.
    pub async fn dispatch(&self, envelope: Envelope) -> bool {
        let kind = envelope.msg_type.kind();
        // Released before the handler runs so handlers may re-register
        let handler = self.handlers.read().await.get(&kind).cloned();

        match handler {
            Some(handler) => {
                trace!(%kind, "dispatching");
                handler(envelope.msg_type).await;
                true
            }
            None => {
                trace!(%kind, "no handler, dropping");
                false
            }
        }
    }

    /// Decode a plaintext frame and dispatch it.
    pub async fn dispatch_text(&self, text: &str) -> Result<bool, RouterError> {
        let envelope = Envelope::from_json(text)?;
        Ok(self.dispatch(envelope).await)
    }

    /// Start the sequential dispatcher.
    ///
    /// The task ends once every [`DispatchQueue`] clone is dropped and the
    /// queue has drained.
    pub fn spawn_dispatcher(&self) -> (DispatchQueue, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let router = self.clone();

        let task = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                router.dispatch(envelope).await;
            }
            debug!("dispatcher stopped");
        });

        (DispatchQueue { tx }, task)
    }
}

impl std::fmt::Debug for SignalRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalRouter").finish_non_exhaustive()
    }
}

/// Producer side of the dispatcher queue.
#[derive(Debug, Clone)]
pub struct DispatchQueue {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl DispatchQueue {
    /// Queue an envelope behind everything queued before it.
    pub fn push(&self, envelope: Envelope) -> Result<(), RouterError> {
        self.tx.send(envelope).map_err(|_| RouterError::Closed)
    }

    /// Decode and queue a plaintext frame.
    ///
    /// A malformed frame is reported and not queued; the queue stays usable.
    pub fn push_text(&self, text: &str) -> Result<(), RouterError> {
        match Envelope::from_json(text) {
            Ok(envelope) => self.push(envelope),
            Err(e) => {
                warn!(error = %e, "rejecting malformed envelope");
                Err(RouterError::Malformed(e))
            }
        }
    }
}
