use std::fmt;
use std::ops::BitOr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::info;

use crate::communication::{MessageDispatchRegistry, Sender};
use crate::error::CommunicationError;
use crate::protocol::{Message, MessageKind, StartWorkers};

/// Set of console signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Signals(u8);

impl Signals {
    pub const START: Self = Self(1);
    pub const RESET: Self = Self(1 << 1);
    pub const STOP: Self = Self(1 << 2);
    pub const SHUTDOWN: Self = Self(1 << 3);
    pub const ANY: Self = Self(Self::START.0 | Self::RESET.0 | Self::STOP.0 | Self::SHUTDOWN.0);

    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[must_use]
    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for Signals {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for Signals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::START, "start"),
            (Self::RESET, "reset"),
            (Self::STOP, "stop"),
            (Self::SHUTDOWN, "shutdown"),
        ];
        let mut first = true;
        for (signal, name) in names {
            if self.intersects(signal) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct ListenerState {
    pending: Signals,
    last_checked: Signals,
    last_start: Option<StartWorkers>,
}

/// Turns console control messages into signals the agent run loop polls or
/// waits for.
///
/// Arriving signals stay pending until a
/// [`check_for_message`](Self::check_for_message) moves them into the
/// "last checked" set that [`received`](Self::received) queries.
pub struct ConsoleListener {
    state: Mutex<ListenerState>,
    notify: Arc<Notify>,
}

impl ConsoleListener {
    /// `notify` is woken whenever a signal arrives.
    #[must_use]
    pub fn new(notify: Arc<Notify>) -> Self {
        Self {
            state: Mutex::new(ListenerState::default()),
            notify,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ListenerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_received(&self, signal: Signals) {
        {
            let mut state = self.lock();
            state.pending = state.pending | signal;
        }
        self.notify.notify_waiters();
    }

    pub fn shutdown(&self) {
        self.set_received(Signals::SHUTDOWN);
    }

    /// Waits until any signal arrives, then checks for it.
    pub async fn wait_for_message(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.check_for_message(Signals::ANY) {
                return;
            }
            notified.await;
        }
    }

    /// Takes the pending signals matching `mask` and returns whether any
    /// were found. A pending shutdown stays pending unless `mask` holds it.
    pub fn check_for_message(&self, mask: Signals) -> bool {
        {
            let mut state = self.lock();
            let matched = state.pending.intersection(mask);
            state.last_checked = matched;
            state.pending = state.pending.without(matched);
        }
        self.received(mask | Signals::SHUTDOWN)
    }

    /// Forgets pending and last checked signals matching `mask`.
    pub fn discard_messages(&self, mask: Signals) {
        let mut state = self.lock();
        state.last_checked = state.last_checked.without(mask);
        state.pending = state.pending.without(mask);
    }

    /// Whether the last check found any signal in `mask`.
    #[must_use]
    pub fn received(&self, mask: Signals) -> bool {
        self.lock().last_checked.intersects(mask)
    }

    #[must_use]
    pub fn last_start_message(&self) -> Option<StartWorkers> {
        self.lock().last_start.clone()
    }

    /// Registers handlers for start, stop and reset messages.
    pub fn register_message_handlers(self: &Arc<Self>, registry: &dyn MessageDispatchRegistry) {
        let handlers = [
            (MessageKind::StartWorkers, Signals::START),
            (MessageKind::StopWorkers, Signals::STOP),
            (MessageKind::ResetWorkers, Signals::RESET),
        ];
        for (kind, signal) in handlers {
            registry.set_handler(
                kind,
                Arc::new(SignalHandler {
                    listener: Arc::clone(self),
                    signal,
                }),
            );
        }
    }
}

struct SignalHandler {
    listener: Arc<ConsoleListener>,
    signal: Signals,
}

#[async_trait]
impl Sender for SignalHandler {
    async fn send(&self, message: Message) -> Result<(), CommunicationError> {
        info!("received a {} message", self.signal);
        if let Message::StartWorkers(start) = message {
            self.listener.lock().last_start = Some(start);
        }
        self.listener.set_received(self.signal);
        Ok(())
    }

    /// Communication has ended; raise shutdown unless it is already pending.
    async fn shutdown(&self) {
        let already = self.listener.lock().pending.intersects(Signals::SHUTDOWN);
        if !already {
            info!("communication shut down");
            self.listener.set_received(Signals::SHUTDOWN);
        }
    }
}
