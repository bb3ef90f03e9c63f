//! Gateway message types.
//!
//! A [`Request`] stays mutable until the gateway assigns it a sequence
//! number. [`Reply`] and [`ErrorReply`] are created sealed and correlated to
//! the sequence of the request they answer.

use crate::error::ProtocolError;
use crate::headers::{Headers, Operation};
use crate::payload::Payload;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A correlation number. Zero means "no sequence".
pub type Sequence = u32;

/// Why a request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    InvalidUri,
    UnavailablePlugin,
    TargetNotFound,
    PathNotFound,
    Other,
    InternalError,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Reason::InvalidUri => "INVALID_URI",
            Reason::UnavailablePlugin => "UNAVAILABLE_PLUGIN",
            Reason::TargetNotFound => "TARGET_NOT_FOUND",
            Reason::PathNotFound => "PATH_NOT_FOUND",
            Reason::Other => "OTHER",
            Reason::InternalError => "INTERNAL_ERROR",
        };
        f.write_str(name)
    }
}

/// Message variant identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Request,
    Reply,
    Error,
}

/// A request travelling towards a target protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    sequence: Sequence,
    headers: Headers,
    payload: Payload,
}

impl Request {
    /// Create an unsequenced request.
    #[must_use]
    pub fn new(operation: Operation, path: impl Into<String>) -> Self {
        Self {
            sequence: 0,
            headers: Headers::new(operation, path),
            payload: Payload::default(),
        }
    }

    /// Set the payload while building the request.
    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Payload>) -> Self {
        if !self.is_sequenced() {
            self.payload = payload.into();
        }
        self
    }

    /// Get the sequence number, if assigned.
    #[must_use]
    pub fn sequence(&self) -> Option<Sequence> {
        (self.sequence != 0).then_some(self.sequence)
    }

    /// Check if the request has been sequenced.
    #[must_use]
    pub fn is_sequenced(&self) -> bool {
        self.sequence != 0
    }

    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Get mutable headers. Mutators fail once the request is sequenced.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Get the mutable payload. Mutators fail once the request is sequenced.
    pub fn payload_mut(&mut self) -> &mut Payload {
        &mut self.payload
    }

    /// Assign the sequence number and seal the request.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is already sequenced or `sequence` is zero.
    pub fn assign_sequence(&mut self, sequence: Sequence) -> Result<(), ProtocolError> {
        if self.is_sequenced() {
            return Err(ProtocolError::AlreadySequenced(self.sequence));
        }
        if sequence == 0 {
            return Err(ProtocolError::ReservedSequence);
        }
        self.sequence = sequence;
        self.headers.freeze();
        self.payload.freeze();
        Ok(())
    }

    /// Copy this request with a new route, keeping sequence and payload.
    ///
    /// The copy is sealed again if the original was.
    #[must_use]
    pub fn rerouted(&self, target: &str, path: &str) -> Self {
        let mut headers = self.headers.to_writable();
        // A fresh writable copy accepts both setters.
        let _ = headers.set_target(target);
        let _ = headers.set_path(path);
        if self.is_sequenced() {
            headers.freeze();
        }
        Self {
            sequence: self.sequence,
            headers,
            payload: self.payload.clone(),
        }
    }
}

/// A successful reply. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    sequence: Sequence,
    headers: Headers,
    payload: Payload,
}

impl Reply {
    /// Build a reply to `request`, copying its operation and route.
    #[must_use]
    pub fn to(request: &Request, payload: impl Into<Payload>) -> Self {
        ReplyBuilder::new(request).payload(payload).build()
    }

    /// Start building a reply to `request`.
    #[must_use]
    pub fn builder(request: &Request) -> ReplyBuilder {
        ReplyBuilder::new(request)
    }

    /// Start building an unsolicited reply, such as an observe notification.
    #[must_use]
    pub fn notification(operation: Operation, target: &str, path: &str) -> ReplyBuilder {
        let mut headers = Headers::new(operation, path);
        let _ = headers.set_target(target);
        ReplyBuilder {
            sequence: 0,
            headers,
            payload: Payload::default(),
        }
    }

    #[must_use]
    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Copy this reply correlated to another sequence.
    #[must_use]
    pub fn retagged(&self, sequence: Sequence) -> Self {
        Self {
            sequence,
            ..self.clone()
        }
    }
}

/// Builder for [`Reply`].
#[derive(Debug, Clone)]
pub struct ReplyBuilder {
    sequence: Sequence,
    headers: Headers,
    payload: Payload,
}

impl ReplyBuilder {
    fn new(request: &Request) -> Self {
        Self {
            sequence: request.sequence,
            headers: request.headers.to_writable(),
            payload: Payload::default(),
        }
    }

    #[must_use]
    pub fn payload(mut self, payload: impl Into<Payload>) -> Self {
        self.payload = payload.into();
        self
    }

    #[must_use]
    pub fn sequence(mut self, sequence: Sequence) -> Self {
        self.sequence = sequence;
        self
    }

    #[must_use]
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        let _ = self.headers.set_content_type(content_type);
        self
    }

    /// Set how long the reply may be served from cache.
    #[must_use]
    pub fn max_age(mut self, max_age: std::time::Duration) -> Self {
        let _ = self.headers.set_max_age(max_age);
        self
    }

    #[must_use]
    pub fn build(self) -> Reply {
        let Self {
            sequence,
            mut headers,
            mut payload,
        } = self;
        headers.freeze();
        payload.freeze();
        Reply {
            sequence,
            headers,
            payload,
        }
    }
}

/// A failed exchange, delivered through the reply path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReply {
    sequence: Sequence,
    headers: Headers,
    reason: Reason,
    failed: MessageKind,
    detail: Option<String>,
}

impl ErrorReply {
    /// Build an error answering `request`.
    #[must_use]
    pub fn for_request(request: &Request, reason: Reason) -> Self {
        let mut headers = request.headers.to_writable();
        headers.freeze();
        Self {
            sequence: request.sequence,
            headers,
            reason,
            failed: MessageKind::Request,
            detail: None,
        }
    }

    /// Build an error about a reply that could not be handled.
    #[must_use]
    pub fn for_reply(reply: &Reply, reason: Reason) -> Self {
        Self {
            sequence: reply.sequence,
            headers: reply.headers.clone(),
            reason,
            failed: MessageKind::Reply,
            detail: None,
        }
    }

    /// Attach a human readable detail.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    #[must_use]
    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    #[must_use]
    pub fn reason(&self) -> Reason {
        self.reason
    }

    /// The kind of message that failed.
    #[must_use]
    pub fn failed(&self) -> MessageKind {
        self.failed
    }

    #[must_use]
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// Copy this error correlated to another sequence.
    #[must_use]
    pub fn retagged(&self, sequence: Sequence) -> Self {
        Self {
            sequence,
            ..self.clone()
        }
    }
}

impl fmt::Display for ErrorReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?} #{})", self.reason, self.failed, self.sequence)?;
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

/// Any message that flows through the gateway pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Reply(Reply),
    Error(ErrorReply),
}

impl Message {
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Request(_) => MessageKind::Request,
            Message::Reply(_) => MessageKind::Reply,
            Message::Error(_) => MessageKind::Error,
        }
    }

    #[must_use]
    pub fn headers(&self) -> &Headers {
        match self {
            Message::Request(r) => r.headers(),
            Message::Reply(r) => r.headers(),
            Message::Error(e) => e.headers(),
        }
    }

    /// Get the sequence number, zero if the message is not correlated yet.
    #[must_use]
    pub fn sequence(&self) -> Sequence {
        match self {
            Message::Request(r) => r.sequence,
            Message::Reply(r) => r.sequence,
            Message::Error(e) => e.sequence,
        }
    }

    /// Check if the message answers a request.
    #[must_use]
    pub fn is_reply_like(&self) -> bool {
        matches!(self, Message::Reply(_) | Message::Error(_))
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Message::Request(request)
    }
}

impl From<Reply> for Message {
    fn from(reply: Reply) -> Self {
        Message::Reply(reply)
    }
}

impl From<ErrorReply> for Message {
    fn from(error: ErrorReply) -> Self {
        Message::Error(error)
    }
}
