// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Envelopes and the copy-on-send protocol
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//!
//! PUBLIC API:
//!   - struct Envelope: message wrapper handed to `MailboxAddress::send`
//!   - enum EnvelopeKind / enum Contents: variant tag and receiver-side view
//!   - trait Copiable: duplication contract for object payloads
//!   - struct ByteStream: zero-copy reader over a shared immutable buffer
//!
//! SECURITY INVARIANTS:
//!   - The receiver only ever sees the copy made by `Envelope::copy`, never the
//!     sender's allocation (stream payloads share an immutable buffer instead)
//!   - Contents are readable only from the isolate recorded as receiver at send time
//!   - An envelope is addressed at most once

use core::any::{type_name, Any};
use core::fmt;
use std::io::{self, Read};
use std::sync::Arc;

use log::warn;
use thiserror::Error;

use crate::address::MailboxAddress;
use crate::config::CopyFailurePolicy;
use crate::isolate::Isolate;
use crate::{AddressId, Error, IsolateId, Result};

/// Failure reported by [`Copiable::duplicate`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{payload}: {reason}")]
pub struct CopyError {
    payload: &'static str,
    reason: String,
}

impl CopyError {
    /// Creates a copy error with a human readable reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self { payload: "payload", reason: reason.into() }
    }

    /// Returns the reason supplied by the payload.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Returns the type name of the payload that failed to copy.
    pub fn payload_type(&self) -> &'static str {
        self.payload
    }

    fn for_payload(mut self, payload: &'static str) -> Self {
        self.payload = payload;
        self
    }
}

/// Duplication contract for payloads carried by [`Envelope::object`].
///
/// `duplicate` must return a value that shares no reference with `self`:
/// anything reachable from the copy belongs to the receiving isolate alone.
/// Shared handles (`Arc`, `Rc`, channels) must be rebuilt, not cloned.
pub trait Copiable: Send + 'static {
    /// Produces an owned deep copy of `self`.
    fn duplicate(&self) -> core::result::Result<Self, CopyError>
    where
        Self: Sized;
}

impl Copiable for Vec<u8> {
    fn duplicate(&self) -> core::result::Result<Self, CopyError> {
        Ok(self.as_slice().to_vec())
    }
}

impl Copiable for String {
    fn duplicate(&self) -> core::result::Result<Self, CopyError> {
        Ok(self.as_str().to_owned())
    }
}

trait ErasedObject: Send {
    fn duplicate_boxed(&self) -> core::result::Result<Box<dyn ErasedObject>, CopyError>;
    fn as_any(&self) -> &(dyn Any + Send);
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T: Copiable> ErasedObject for T {
    fn duplicate_boxed(&self) -> core::result::Result<Box<dyn ErasedObject>, CopyError> {
        match self.duplicate() {
            Ok(copy) => Ok(Box::new(copy)),
            Err(err) => Err(err.for_payload(type_name::<T>())),
        }
    }

    fn as_any(&self) -> &(dyn Any + Send) {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// Reader over an immutable byte buffer shared between sender and receiver.
#[derive(Clone)]
pub struct ByteStream {
    buf: Arc<[u8]>,
    pos: usize,
    end: usize,
}

impl ByteStream {
    /// Wraps the whole buffer.
    pub fn new(buf: impl Into<Arc<[u8]>>) -> Self {
        let buf = buf.into();
        let end = buf.len();
        Self { buf, pos: 0, end }
    }

    /// Wraps `len` bytes of `buf` starting at `offset`.
    pub fn with_range(buf: impl Into<Arc<[u8]>>, offset: usize, len: usize) -> Result<Self> {
        let buf = buf.into();
        let end = check_range(buf.len(), offset, len)?;
        Ok(Self { buf, pos: offset, end })
    }

    /// Number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.end - self.pos
    }

    /// The unread bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[self.pos..self.end]
    }

    /// Returns `true` when both streams read from the same allocation.
    pub fn shares_buffer_with(&self, other: &ByteStream) -> bool {
        Arc::ptr_eq(&self.buf, &other.buf)
    }
}

impl Read for ByteStream {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let n = out.len().min(self.remaining());
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteStream").field("remaining", &self.remaining()).finish()
    }
}

fn check_range(buf_len: usize, offset: usize, len: usize) -> Result<usize> {
    match offset.checked_add(len) {
        Some(end) if end <= buf_len => Ok(end),
        _ => Err(Error::IllegalArgument(format!(
            "range {offset}+{len} exceeds buffer of {buf_len} bytes"
        ))),
    }
}

/// Variant tag of an [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    /// Byte array payload, deep-copied on send.
    Bytes,
    /// Shared byte stream payload, not copied on send.
    Stream,
    /// Object payload duplicated through [`Copiable`].
    Object,
    /// Reserved notice that the sending address was closed.
    AddressClosed,
}

/// Receiver-side view of an envelope's payload.
pub enum Contents<'a> {
    /// Bytes of a byte array envelope.
    Bytes(&'a [u8]),
    /// Fresh reader positioned at the start of a stream envelope.
    Stream(ByteStream),
    /// Object payload; `None` when delivered under `CopyFailurePolicy::DeliverEmpty`.
    Object(Option<&'a (dyn Any + Send)>),
    /// The address whose closure this envelope announces.
    AddressClosed(AddressId),
}

enum Payload {
    Bytes { buf: Vec<u8>, offset: usize, len: usize },
    Stream(ByteStream),
    Object { type_name: &'static str, value: Option<Box<dyn ErasedObject>> },
    AddressClosed,
}

#[derive(Clone)]
struct Stamp {
    to: MailboxAddress,
    receiver: IsolateId,
}

/// A message whose contents are copied, never shared, across isolates.
pub struct Envelope {
    stamp: Option<Stamp>,
    payload: Payload,
}

impl Envelope {
    /// Creates a byte array envelope over the whole buffer.
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        let buf = data.into();
        let len = buf.len();
        Self::unsent(Payload::Bytes { buf, offset: 0, len })
    }

    /// Creates a byte array envelope over `len` bytes of `data` starting at `offset`.
    pub fn byte_range(data: impl Into<Vec<u8>>, offset: usize, len: usize) -> Result<Self> {
        let buf = data.into();
        check_range(buf.len(), offset, len)?;
        Ok(Self::unsent(Payload::Bytes { buf, offset, len }))
    }

    /// Creates a stream envelope; the buffer is shared with the receiver, not copied.
    pub fn byte_stream(data: impl Into<Arc<[u8]>>) -> Self {
        Self::unsent(Payload::Stream(ByteStream::new(data)))
    }

    /// Creates an object envelope; the value is duplicated once on send.
    pub fn object<T: Copiable>(value: T) -> Self {
        Self::unsent(Payload::Object { type_name: type_name::<T>(), value: Some(Box::new(value)) })
    }

    pub(crate) fn close_notice() -> Self {
        Self::unsent(Payload::AddressClosed)
    }

    fn unsent(payload: Payload) -> Self {
        Self { stamp: None, payload }
    }

    /// Returns the variant tag.
    pub fn kind(&self) -> EnvelopeKind {
        match self.payload {
            Payload::Bytes { .. } => EnvelopeKind::Bytes,
            Payload::Stream(_) => EnvelopeKind::Stream,
            Payload::Object { .. } => EnvelopeKind::Object,
            Payload::AddressClosed => EnvelopeKind::AddressClosed,
        }
    }

    pub(crate) fn is_close_notice(&self) -> bool {
        matches!(self.payload, Payload::AddressClosed)
    }

    /// Returns `true` once the envelope has been sent.
    pub fn is_sent(&self) -> bool {
        self.stamp.is_some()
    }

    /// The address the envelope was sent through, or `None` before send.
    pub fn to_address(&self) -> Option<&MailboxAddress> {
        self.stamp.as_ref().map(|stamp| &stamp.to)
    }

    /// The address to use for replies, or `None` before send.
    ///
    /// The reply address may already be closed.
    pub fn reply_address(&self) -> Option<MailboxAddress> {
        self.to_address().and_then(MailboxAddress::reply_address)
    }

    /// The isolate allowed to read the contents, or `None` before send.
    pub fn receiver(&self) -> Option<IsolateId> {
        self.stamp.as_ref().map(|stamp| stamp.receiver)
    }

    /// Returns a view of the payload.
    pub fn contents(&self) -> Result<Contents<'_>> {
        let stamp = self.check_call_context()?;
        Ok(match &self.payload {
            Payload::Bytes { buf, offset, len } => Contents::Bytes(&buf[*offset..*offset + *len]),
            Payload::Stream(stream) => Contents::Stream(stream.clone()),
            Payload::Object { value, .. } => {
                Contents::Object(value.as_deref().map(|object| object.as_any()))
            }
            Payload::AddressClosed => Contents::AddressClosed(stamp.to.id()),
        })
    }

    /// Returns the bytes of a byte array envelope.
    pub fn data(&self) -> Result<&[u8]> {
        self.check_call_context()?;
        match &self.payload {
            Payload::Bytes { buf, offset, len } => Ok(&buf[*offset..*offset + *len]),
            _ => Err(self.wrong_kind(EnvelopeKind::Bytes)),
        }
    }

    /// Returns a reader over a stream envelope.
    pub fn stream(&self) -> Result<ByteStream> {
        self.check_call_context()?;
        match &self.payload {
            Payload::Stream(stream) => Ok(stream.clone()),
            _ => Err(self.wrong_kind(EnvelopeKind::Stream)),
        }
    }

    /// Borrows the payload of an object envelope as `T`.
    ///
    /// Returns `Ok(None)` when the envelope was delivered without contents.
    pub fn as_object<T: Copiable>(&self) -> Result<Option<&T>> {
        self.check_call_context()?;
        match &self.payload {
            Payload::Object { type_name: carried, value } => match value {
                None => Ok(None),
                Some(object) => object
                    .as_any()
                    .downcast_ref::<T>()
                    .map(Some)
                    .ok_or_else(|| mismatched_object::<T>(carried)),
            },
            _ => Err(self.wrong_kind(EnvelopeKind::Object)),
        }
    }

    /// Takes ownership of the payload of an object envelope.
    pub fn into_object<T: Copiable>(self) -> Result<Option<T>> {
        self.check_call_context()?;
        let kind = self.kind();
        match self.payload {
            Payload::Object { type_name: carried, value } => match value {
                None => Ok(None),
                Some(object) => object
                    .into_any()
                    .downcast::<T>()
                    .map(|boxed| Some(*boxed))
                    .map_err(|_| mismatched_object::<T>(carried)),
            },
            _ => Err(Error::illegal_state(format!("expected Object envelope, found {kind:?}"))),
        }
    }

    /// Verifies that the envelope was sent and that the calling isolate received it.
    fn check_call_context(&self) -> Result<&Stamp> {
        let stamp = self
            .stamp
            .as_ref()
            .ok_or_else(|| Error::access_violation("envelope has not been sent"))?;
        match Isolate::current_id() {
            Some(caller) if caller == stamp.receiver => Ok(stamp),
            Some(caller) => Err(Error::access_violation(format!(
                "{caller} is not the receiver of the envelope ({})",
                stamp.receiver
            ))),
            None => Err(Error::access_violation("no isolate is bound to the calling thread")),
        }
    }

    fn wrong_kind(&self, expected: EnvelopeKind) -> Error {
        Error::illegal_state(format!("expected {expected:?} envelope, found {:?}", self.kind()))
    }

    /// Addresses the envelope. Called once by `MailboxAddress::send`.
    pub(crate) fn stamp(&mut self, to: MailboxAddress, receiver: IsolateId) -> Result<()> {
        if self.stamp.is_some() {
            return Err(Error::illegal_state("envelope has already been sent"));
        }
        self.stamp = Some(Stamp { to, receiver });
        Ok(())
    }

    /// Produces the receiver-owned copy of a sent envelope.
    pub(crate) fn copy(&self, policy: CopyFailurePolicy) -> Result<Envelope> {
        let payload = match &self.payload {
            Payload::Bytes { buf, offset, len } => {
                Payload::Bytes { buf: buf[*offset..*offset + *len].to_vec(), offset: 0, len: *len }
            }
            Payload::Stream(stream) => Payload::Stream(stream.clone()),
            Payload::Object { type_name, value } => {
                let copied = match value {
                    None => None,
                    Some(object) => match object.duplicate_boxed() {
                        Ok(copy) => Some(copy),
                        Err(err) => match policy {
                            CopyFailurePolicy::Reject => return Err(err.into()),
                            CopyFailurePolicy::DeliverEmpty => {
                                warn!("mailbox: {type_name} contents dropped on copy: {err}");
                                None
                            }
                        },
                    },
                };
                Payload::Object { type_name: *type_name, value: copied }
            }
            Payload::AddressClosed => Payload::AddressClosed,
        };
        Ok(Envelope { stamp: self.stamp.clone(), payload })
    }
}

fn mismatched_object<T>(carried: &str) -> Error {
    Error::illegal_state(format!("object envelope carries {carried}, not {}", type_name::<T>()))
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("kind", &self.kind())
            .field("to", &self.to_address().map(MailboxAddress::id))
            .field("receiver", &self.receiver())
            .finish()
    }
}
