use std::sync::Arc;

use log::debug;

use crate::protocol::MessageId;

use super::table::CorrelationTable;

#[derive(Debug, Clone, Copy)]
enum Key {
    Message(MessageId),
    Notification(u64),
}

/// Registration of an asynchronous listener.
///
/// The listener stays registered until the subscription is cancelled or
/// dropped.
pub struct Subscription {
    table: Arc<CorrelationTable>,
    key: Option<Key>,
}

impl Subscription {
    pub(crate) fn message(table: Arc<CorrelationTable>, id: MessageId) -> Self {
        Self {
            table,
            key: Some(Key::Message(id)),
        }
    }

    pub(crate) fn notification(table: Arc<CorrelationTable>, token: u64) -> Self {
        Self {
            table,
            key: Some(Key::Notification(token)),
        }
    }

    /// The id responses arrive under, or `None` for a notification listener.
    pub fn id(&self) -> Option<MessageId> {
        match self.key {
            Some(Key::Message(id)) => Some(id),
            _ => None,
        }
    }

    /// Deregisters the listener. Returns `false` if it was already gone,
    /// e.g. because the connection failed.
    pub fn cancel(mut self) -> bool {
        self.deregister()
    }

    fn deregister(&mut self) -> bool {
        let Some(key) = self.key.take() else {
            return false;
        };
        let removed = match key {
            Key::Message(id) => self.table.remove(id),
            Key::Notification(token) => self.table.remove_notification_listener(token),
        };
        if removed {
            debug!("deregistered {key:?}");
        }
        removed
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.deregister();
    }
}
