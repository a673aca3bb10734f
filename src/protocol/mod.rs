//! Client-server communication protocol.
//!
//! This module defines the messages exchanged between a directory client and
//! a directory server: the [`Message`] envelope, the request and response
//! payloads, protocol [`Control`]s and the [`ProtocolTransport`] that moves
//! frames over a byte stream.
//!
//! # Overview
//!
//! Each exchange is an envelope of `{ message id, operation payload,
//! controls }`, mirroring RFC 4511's `LDAPMessage`. The client assigns ids
//! from a per-connection [`MessageIds`] counter; the server echoes the id on
//! every response so the client can correlate them. Id `0` is reserved for
//! unsolicited notifications.
//!
//! # Binary Format
//!
//! Frames are serialized with `bincode`:
//!
//! - Integers are big-endian with fixed width.
//! - A [`Frame`] carries the id, the operation tag, the payload as a
//!   length-prefixed byte string and the controls.
//! - The payload is itself a `bincode` encoding of the operation struct, so
//!   a frame can be read without knowing which operation it answers.
//! - No frame may exceed [`MAX_FRAME_SIZE`].
//!
//! The format is a stand-in for BER: the rest of the crate only relies on
//! [`ProtocolTransport::read_frame`], [`ProtocolTransport::write_frame`] and
//! the two-phase decode described in [`message`].
//!
//! # See Also
//!
//! - [`client`](crate::client): correlates responses back to callers.
mod control;
pub mod message;
mod request;
mod response;
mod transport;

pub use control::{
    ChangeTypes, Control, ENTRY_CHANGE_OID, EntryChange, PERSISTENT_SEARCH_OID,
};
pub use message::{
    CodecError, Frame, MAX_FRAME_SIZE, MAX_MESSAGE_ID, Message, MessageId, MessageIds, OpTag,
    Payload,
};
pub use request::{
    AddRequest, Attribute, Authentication, BindRequest, CompareRequest, DerefAliases,
    ExtendedRequest, Modification, ModifyDnRequest, ModifyOperation, ModifyRequest, Request,
    Scope, SearchRequest,
};
pub use response::{
    BindResponse, ExtendedResponse, LdapResult, NOTICE_OF_DISCONNECTION_OID, Outcome, Response,
    ResponseKind, ResultCode, SearchEntry,
};
pub use transport::{ProtocolTransport, TransportError};
