use std::{sync::Arc, time::Duration};

use thiserror::Error;

use crate::protocol::{CodecError, MessageId, OpTag, TransportError};

/// Errors surfaced to callers of a [`Connection`](super::Connection).
///
/// The type is `Clone` so a single connection failure can be handed to every
/// outstanding caller.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Transport(#[source] Arc<TransportError>),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("server disconnected: {diagnostic}")]
    Disconnected { diagnostic: String },

    #[error("message {id} timed out after {timeout:?}")]
    Timeout { id: MessageId, timeout: Duration },

    #[error("bad payload for message {id}: {source}")]
    Codec {
        id: MessageId,
        #[source]
        source: Arc<CodecError>,
    },

    #[error("message {id} was abandoned")]
    Abandoned { id: MessageId },

    #[error("no more search entries")]
    Exhausted,

    #[error("{tag:?} does not have a single response")]
    NotSynchronous { tag: OpTag },

    #[error("no free message id")]
    IdsExhausted,
}

impl ClientError {
    pub(crate) fn transport(err: TransportError) -> Self {
        Self::Transport(Arc::new(err))
    }

    pub(crate) fn codec(id: MessageId, err: CodecError) -> Self {
        Self::Codec {
            id,
            source: Arc::new(err),
        }
    }

    /// Local to one caller; retrying on the same connection is fine.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout { .. })
    }

    /// The connection is unusable and the consumer must reconnect.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ClientError::Transport(_)
                | ClientError::ConnectionClosed
                | ClientError::Disconnected { .. }
        )
    }
}
