//! Message envelope and identifier allocation.
//!
//! Every exchange on a connection is a [`Message`]: a message id, a typed
//! operation payload and an ordered list of [`Control`]s. On the wire a
//! message travels as a [`Frame`], which keeps the payload as opaque bytes.
//!
//! # Two-phase decoding
//!
//! A response does not say which client-side operation it answers. The
//! dispatcher therefore decodes an inbound frame in two steps:
//!
//! 1. [`Frame`] is read off the stream, yielding the id and operation tag.
//! 2. The payload decoder is picked from the [`ResponseKind`] recorded for
//!    that id and [`Message::<Response>::from_frame`] finishes the decode.
//!
//! A failure in step 1 leaves the id unknown and is fatal for the connection;
//! a failure in step 2 is reported to whoever owns the id.
use std::{
    fmt,
    sync::atomic::{AtomicU32, Ordering},
};

use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint, Limit},
    decode_from_slice, encode_to_vec,
};
use thiserror::Error;

use super::{Control, Request, Response, ResponseKind};

/// Largest frame accepted from the wire.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Largest id a client may assign (`maxInt` in RFC 4511).
pub const MAX_MESSAGE_ID: u32 = i32::MAX as u32;

pub(crate) type WireConfig = Configuration<BigEndian, Fixint, Limit<MAX_FRAME_SIZE>>;

pub(crate) fn wire_config() -> WireConfig {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
        .with_limit::<MAX_FRAME_SIZE>()
}

/// Errors raised while turning payloads into bytes and back.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode payload: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("failed to decode payload: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("unexpected {tag:?} for a {expected:?} exchange")]
    UnexpectedResponse { tag: OpTag, expected: ResponseKind },

    #[error("{tag:?} is not a request")]
    NotARequest { tag: OpTag },

    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

pub(crate) fn encode_payload<T: Encode>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(encode_to_vec(value, wire_config())?)
}

pub(crate) fn decode_payload<T: Decode<()>>(bytes: &[u8]) -> Result<T, CodecError> {
    let (value, read) = decode_from_slice(bytes, wire_config())?;
    if read != bytes.len() {
        return Err(CodecError::TrailingBytes(bytes.len() - read));
    }
    Ok(value)
}

/// Client-assigned correlation id.
///
/// Id `0` is never assigned by a client; servers use it for unsolicited
/// notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct MessageId(u32);

impl MessageId {
    pub const UNSOLICITED: MessageId = MessageId(0);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub const fn is_unsolicited(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Connection-scoped id allocator.
///
/// Ids increase monotonically from 1 and wrap back to 1 after
/// [`MAX_MESSAGE_ID`]; zero is never handed out. The allocator does not know
/// which ids are still outstanding, the correlation table rejects those.
#[derive(Debug)]
pub struct MessageIds {
    next: AtomicU32,
}

impl MessageIds {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub(crate) fn starting_at(raw: u32) -> Self {
        Self {
            next: AtomicU32::new(raw.clamp(1, MAX_MESSAGE_ID)),
        }
    }

    /// Hands out the next id.
    pub fn allocate(&self) -> MessageId {
        let mut current = self.next.load(Ordering::Relaxed);
        loop {
            let following = if current >= MAX_MESSAGE_ID {
                1
            } else {
                current + 1
            };
            match self.next.compare_exchange_weak(
                current,
                following,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return MessageId(current),
                Err(actual) => current = actual,
            }
        }
    }

    /// Builds an outbound envelope under a freshly allocated id.
    pub fn envelope(&self, request: Request, controls: Vec<Control>) -> Message<Request> {
        Message::new(self.allocate(), request, controls)
    }
}

impl Default for MessageIds {
    fn default() -> Self {
        Self::new()
    }
}

/// Operation tag, named after the RFC 4511 `protocolOp` choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub enum OpTag {
    BindRequest,
    BindResponse,
    UnbindRequest,
    SearchRequest,
    SearchResultEntry,
    SearchResultDone,
    SearchResultReference,
    ModifyRequest,
    ModifyResponse,
    AddRequest,
    AddResponse,
    DelRequest,
    DelResponse,
    ModDnRequest,
    ModDnResponse,
    CompareRequest,
    CompareResponse,
    AbandonRequest,
    ExtendedRequest,
    ExtendedResponse,
}

impl OpTag {
    pub const fn is_request(self) -> bool {
        matches!(
            self,
            OpTag::BindRequest
                | OpTag::UnbindRequest
                | OpTag::SearchRequest
                | OpTag::ModifyRequest
                | OpTag::AddRequest
                | OpTag::DelRequest
                | OpTag::ModDnRequest
                | OpTag::CompareRequest
                | OpTag::AbandonRequest
                | OpTag::ExtendedRequest
        )
    }
}

/// Typed operation carried by a [`Message`].
pub trait Payload: Sized {
    fn op_tag(&self) -> OpTag;

    fn encode(&self) -> Result<Vec<u8>, CodecError>;
}

/// Wire representation of a message: header plus undecoded payload.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Frame {
    id: MessageId,
    tag: OpTag,
    payload: Vec<u8>,
    controls: Vec<Control>,
}

impl Frame {
    pub fn new(id: MessageId, tag: OpTag, payload: Vec<u8>, controls: Vec<Control>) -> Self {
        Self {
            id,
            tag,
            payload,
            controls,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn tag(&self) -> OpTag {
        self.tag
    }
}

/// A decoded envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Message<P> {
    id: MessageId,
    payload: P,
    controls: Vec<Control>,
}

impl<P: Payload> Message<P> {
    pub fn new(id: MessageId, payload: P, controls: Vec<Control>) -> Self {
        Self {
            id,
            payload,
            controls,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn op_tag(&self) -> OpTag {
        self.payload.op_tag()
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn controls(&self) -> &[Control] {
        &self.controls
    }

    pub fn into_parts(self) -> (P, Vec<Control>) {
        (self.payload, self.controls)
    }

    pub fn to_frame(&self) -> Result<Frame, CodecError> {
        Ok(Frame {
            id: self.id,
            tag: self.payload.op_tag(),
            payload: self.payload.encode()?,
            controls: self.controls.clone(),
        })
    }
}

impl Message<Response> {
    /// Second decoding phase for inbound messages.
    pub fn from_frame(frame: Frame, kind: ResponseKind) -> Result<Self, CodecError> {
        let payload = Response::decode(frame.tag, &frame.payload, kind)?;
        Ok(Self {
            id: frame.id,
            payload,
            controls: frame.controls,
        })
    }
}

impl Message<Request> {
    pub fn from_frame(frame: Frame) -> Result<Self, CodecError> {
        let payload = Request::decode(frame.tag, &frame.payload)?;
        Ok(Self {
            id: frame.id,
            payload,
            controls: frame.controls,
        })
    }
}
