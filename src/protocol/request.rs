use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::communication::Sender;
use crate::error::CommunicationError;

use super::Message;

#[derive(Default)]
struct SlotState {
    responder: Option<Arc<dyn Sender>>,
    sent: bool,
}

/// Process-local response slot; clones share it.
#[derive(Clone, Default)]
struct ResponseSlot {
    state: Arc<Mutex<SlotState>>,
}

impl ResponseSlot {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ResponseSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ResponseSlot")
            .field("bound", &state.responder.is_some())
            .field("sent", &state.sent)
            .finish()
    }
}

/// A request that must be answered exactly once on the connection it
/// arrived on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRequiringResponse {
    message: Box<Message>,
    #[serde(skip)]
    slot: ResponseSlot,
}

impl MessageRequiringResponse {
    #[must_use]
    pub fn new(message: Message) -> Self {
        Self {
            message: Box::new(message),
            slot: ResponseSlot::default(),
        }
    }

    #[must_use]
    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn set_responder(&self, responder: Arc<dyn Sender>) {
        self.slot.lock().responder = Some(responder);
    }

    #[must_use]
    pub fn is_response_sent(&self) -> bool {
        self.slot.lock().sent
    }

    /// Sends the single permitted response through the bound responder.
    ///
    /// # Errors
    ///
    /// Returns an error when a response was already sent, when no responder
    /// is bound, or when the responder fails to deliver.
    pub async fn send_response(&self, response: Message) -> Result<(), CommunicationError> {
        let responder = {
            let mut state = self.slot.lock();
            if state.sent {
                return Err(CommunicationError::ResponseAlreadySent);
            }
            let responder = state
                .responder
                .clone()
                .ok_or(CommunicationError::NoResponder)?;
            state.sent = true;
            responder
        };
        responder.send(response).await
    }
}
