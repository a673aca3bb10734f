use std::io::{self, Read, Write};

use bincode::{decode_from_std_read, encode_to_vec};
use log::trace;
use thiserror::Error;

use super::{
    Frame, Message, Payload,
    message::{WireConfig, wire_config},
};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to encode frame: {0}")]
    Serialize(#[from] bincode::error::EncodeError),
    #[error("failed to decode frame: {0}")]
    Deserialize(#[from] bincode::error::DecodeError),
    #[error("bad payload: {0}")]
    Codec(#[from] super::CodecError),
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Whether the peer went away, as opposed to sending garbage.
    pub fn is_disconnect(&self) -> bool {
        let kind = match self {
            TransportError::Io(err) => err.kind(),
            TransportError::Deserialize(bincode::error::DecodeError::Io { inner, .. }) => {
                inner.kind()
            }
            TransportError::Deserialize(bincode::error::DecodeError::UnexpectedEnd { .. }) => {
                return true;
            }
            _ => return false,
        };
        matches!(
            kind,
            io::ErrorKind::UnexpectedEof
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::NotConnected
        )
    }
}

/// Reads and writes [`Frame`]s over a byte stream.
///
/// The read and write halves of a connection each get their own transport,
/// so a reader never holds up a writer.
pub struct ProtocolTransport<T> {
    stream: T,
    config: WireConfig,
}

impl<T> ProtocolTransport<T> {
    pub fn new(stream: T) -> Self {
        Self {
            stream,
            config: wire_config(),
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }
}

impl<T: Write> ProtocolTransport<T> {
    /// Writes one frame in a single `write_all`.
    pub fn write_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let bytes = encode_to_vec(frame, self.config)?;
        trace!("writing {} byte frame for {}", bytes.len(), frame.id());
        self.stream.write_all(&bytes)?;
        self.stream.flush()?;
        Ok(())
    }

    pub fn write_message<P: Payload>(&mut self, message: &Message<P>) -> Result<(), TransportError> {
        let frame = message.to_frame()?;
        self.write_frame(&frame)
    }
}

impl<T: Read> ProtocolTransport<T> {
    /// Blocks until a whole frame has been read.
    pub fn read_frame(&mut self) -> Result<Frame, TransportError> {
        let frame: Frame = decode_from_std_read(&mut self.stream, self.config)?;
        trace!("read {:?} frame for {}", frame.tag(), frame.id());
        Ok(frame)
    }
}
