use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::CommunicationError;
use crate::protocol::{Message, MessageKind};

use super::sender::{BlockingSender, Sender};

/// Registration side of a dispatcher.
pub trait MessageDispatchRegistry: Send + Sync {
    /// Registers the handler for one message kind, returning the one it
    /// replaced.
    fn set_handler(&self, kind: MessageKind, handler: Arc<dyn Sender>) -> Option<Arc<dyn Sender>>;

    /// Registers the responder for requests wrapping one message kind,
    /// returning the one it replaced.
    fn set_responder(
        &self,
        kind: MessageKind,
        responder: Arc<dyn BlockingSender>,
    ) -> Option<Arc<dyn BlockingSender>>;

    /// Adds a handler for messages nothing else claimed.
    fn add_fallback(&self, fallback: Arc<dyn Sender>);
}

/// Routes messages by exact kind to a handler or responder, and otherwise
/// through every fallback in registration order.
#[derive(Default)]
pub struct MessageDispatchSender {
    handlers: Mutex<HashMap<MessageKind, Arc<dyn Sender>>>,
    responders: Mutex<HashMap<MessageKind, Arc<dyn BlockingSender>>>,
    fallbacks: Mutex<Vec<Arc<dyn Sender>>>,
    shut_down: AtomicBool,
}

impl MessageDispatchSender {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn handler(&self, kind: MessageKind) -> Option<Arc<dyn Sender>> {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
    }

    fn responder(&self, kind: MessageKind) -> Option<Arc<dyn BlockingSender>> {
        self.responders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
    }

    fn fallbacks(&self) -> Vec<Arc<dyn Sender>> {
        self.fallbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl MessageDispatchRegistry for MessageDispatchSender {
    fn set_handler(&self, kind: MessageKind, handler: Arc<dyn Sender>) -> Option<Arc<dyn Sender>> {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, handler)
    }

    fn set_responder(
        &self,
        kind: MessageKind,
        responder: Arc<dyn BlockingSender>,
    ) -> Option<Arc<dyn BlockingSender>> {
        self.responders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, responder)
    }

    fn add_fallback(&self, fallback: Arc<dyn Sender>) {
        self.fallbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(fallback);
    }
}

#[async_trait]
impl Sender for MessageDispatchSender {
    async fn send(&self, message: Message) -> Result<(), CommunicationError> {
        if let Message::RequiringResponse(request) = &message
            && let Some(responder) = self.responder(request.message().kind())
        {
            return match responder.blocking_send(request.message().clone()).await {
                Ok(response) => request.send_response(response).await,
                Err(err) => {
                    if !request.is_response_sent()
                        && let Err(reply_err) = request.send_response(Message::NoResponse).await
                    {
                        debug!("Failed to answer request after responder error: {}", reply_err);
                    }
                    Err(err)
                }
            };
        }

        if let Some(handler) = self.handler(message.kind()) {
            return handler.send(message).await;
        }

        let mut failure = None;
        for fallback in self.fallbacks() {
            if let Err(err) = fallback.send(message.clone()).await {
                failure = Some(err);
            }
        }

        if let Message::RequiringResponse(request) = &message
            && !request.is_response_sent()
        {
            debug!(
                "No response sent for {} request, answering with no response",
                request.message().kind()
            );
            if let Err(err) = request.send_response(Message::NoResponse).await {
                warn!("Failed to send no response reply: {}", err);
                if failure.is_none() {
                    failure = Some(err);
                }
            }
        }

        failure.map_or(Ok(()), Err)
    }

    async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let handlers: Vec<_> = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let responders: Vec<_> = self
            .responders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        for handler in handlers {
            handler.shutdown().await;
        }
        for responder in responders {
            responder.shutdown().await;
        }
        for fallback in self.fallbacks() {
            fallback.shutdown().await;
        }
    }
}
