//! Correlation table.
//!
//! The only structure both the dispatcher and caller threads mutate. It maps
//! every outstanding message id to the state of its exchange and holds the
//! unsolicited-notification listeners. All access goes through one mutex;
//! listener callbacks are always invoked after the lock is released.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crossbeam_channel::Sender;
use log::debug;

use crate::protocol::{Message, MessageId, MessageIds, Response, ResponseKind};

use super::{ClientError, search::SearchState};

/// Callback for asynchronous deliveries.
///
/// Invoked on the dispatcher thread for every matching arrival, so it must
/// not block. After a connection failure it receives the error once.
pub type Listener = Arc<dyn Fn(Result<Message<Response>, ClientError>) + Send + Sync>;

pub(crate) type Reply = Result<Message<Response>, ClientError>;

/// Ids tried before giving up on finding a free one.
const ALLOCATION_ATTEMPTS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPhase {
    /// A caller is waiting on the search.
    Draining,
    /// Partial results were released; arrivals keep accumulating.
    Batched,
}

pub(crate) enum Entry {
    Pending {
        kind: ResponseKind,
        reply: Sender<Reply>,
    },
    Search {
        phase: SearchPhase,
        state: Arc<SearchState>,
    },
    Async {
        kind: ResponseKind,
        listener: Listener,
    },
}

impl Entry {
    fn kind(&self) -> ResponseKind {
        match self {
            Entry::Pending { kind, .. } | Entry::Async { kind, .. } => *kind,
            Entry::Search { .. } => ResponseKind::Search,
        }
    }
}

/// What happened to an inbound message.
pub(crate) enum Delivery {
    /// A waiting caller got its response.
    Completed,
    /// Deposited into a search still in progress.
    Deposited,
    /// Deposited into a search, which is now finished.
    Finished,
    /// The caller must hand the message to the listener once the lock is
    /// gone.
    Notify(Listener, Reply),
    /// Nobody owns the id.
    Unroutable,
}

#[derive(Default)]
struct TableState {
    entries: HashMap<MessageId, Entry>,
    notifications: Vec<(u64, Listener)>,
    next_listener: u64,
    closed: Option<ClientError>,
}

#[derive(Default)]
pub(crate) struct CorrelationTable {
    state: Mutex<TableState>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    // Nothing panics while holding the lock, so a poisoned state is intact.
    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `entry` under the next id from `ids` that is not in use.
    pub fn register_next(&self, ids: &MessageIds, entry: Entry) -> Result<MessageId, ClientError> {
        let mut state = self.lock();
        if let Some(reason) = &state.closed {
            return Err(reason.clone());
        }
        for _ in 0..ALLOCATION_ATTEMPTS {
            let id = ids.allocate();
            if !state.entries.contains_key(&id) {
                state.entries.insert(id, entry);
                return Ok(id);
            }
            debug!("message id {id} still outstanding, skipping");
        }
        Err(ClientError::IdsExhausted)
    }

    pub fn remove(&self, id: MessageId) -> bool {
        self.lock().entries.remove(&id).is_some()
    }

    /// Deregisters `id` and releases whoever waits on it with
    /// [`ClientError::Abandoned`].
    ///
    /// A search is failed before the lock is released, so a handle that
    /// finds itself deregistered always finds the error too.
    pub fn abandon(&self, id: MessageId) -> bool {
        let mut state = self.lock();
        match state.entries.remove(&id) {
            Some(Entry::Search { state: search, .. }) => {
                search.fail(ClientError::Abandoned { id });
                true
            }
            // Dropping the reply sender disconnects the waiting caller.
            Some(_) => true,
            None => false,
        }
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.lock().entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Decoder selection for the second decoding phase.
    pub fn response_kind(&self, id: MessageId) -> Option<ResponseKind> {
        self.lock().entries.get(&id).map(Entry::kind)
    }

    pub fn phase(&self, id: MessageId) -> Option<SearchPhase> {
        match self.lock().entries.get(&id) {
            Some(Entry::Search { phase, .. }) => Some(*phase),
            _ => None,
        }
    }

    /// Flips a search between draining and batched. Returns `false` when
    /// the search is no longer registered.
    pub fn set_phase(&self, id: MessageId, next: SearchPhase) -> bool {
        match self.lock().entries.get_mut(&id) {
            Some(Entry::Search { phase, .. }) => {
                *phase = next;
                true
            }
            _ => false,
        }
    }

    /// Routes a decoded message (or its decode failure) to the owner of `id`.
    pub fn deliver(&self, id: MessageId, message: Reply) -> Delivery {
        let mut state = self.lock();
        match state.entries.remove(&id) {
            None => Delivery::Unroutable,
            Some(Entry::Pending { reply, .. }) => {
                // The receiver is gone if the caller already gave up.
                let _ = reply.try_send(message);
                Delivery::Completed
            }
            Some(Entry::Search { phase, state: search }) => {
                if search.deposit(id, message) {
                    Delivery::Finished
                } else {
                    state.entries.insert(
                        id,
                        Entry::Search {
                            phase,
                            state: search,
                        },
                    );
                    Delivery::Deposited
                }
            }
            Some(Entry::Async { kind, listener }) => {
                let notify = Arc::clone(&listener);
                state.entries.insert(id, Entry::Async { kind, listener });
                Delivery::Notify(notify, message)
            }
        }
    }

    pub fn add_notification_listener(&self, listener: Listener) -> Result<u64, ClientError> {
        let mut state = self.lock();
        if let Some(reason) = &state.closed {
            return Err(reason.clone());
        }
        let token = state.next_listener;
        state.next_listener += 1;
        state.notifications.push((token, listener));
        Ok(token)
    }

    pub fn remove_notification_listener(&self, token: u64) -> bool {
        let mut state = self.lock();
        let before = state.notifications.len();
        state.notifications.retain(|(registered, _)| *registered != token);
        state.notifications.len() != before
    }

    pub fn notification_listeners(&self) -> Vec<Listener> {
        self.lock()
            .notifications
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }

    /// Fails every outstanding exchange with `reason` and refuses new ones.
    ///
    /// Returns the listeners that still need to hear about it. Only the first
    /// call has any effect.
    pub fn close(&self, reason: ClientError) -> Vec<Listener> {
        let mut state = self.lock();
        if state.closed.is_some() {
            return Vec::new();
        }
        state.closed = Some(reason.clone());

        let mut listeners = Vec::new();
        for (id, entry) in state.entries.drain() {
            match entry {
                Entry::Pending { reply, .. } => {
                    let _ = reply.try_send(Err(reason.clone()));
                }
                Entry::Search { state: search, .. } => search.fail(reason.clone()),
                Entry::Async { listener, .. } => listeners.push(listener),
            }
            debug!("failed outstanding message {id}: {reason}");
        }
        listeners.extend(state.notifications.drain(..).map(|(_, listener)| listener));
        listeners
    }

    pub fn closed_reason(&self) -> Option<ClientError> {
        self.lock().closed.clone()
    }
}
