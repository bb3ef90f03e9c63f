//! Capability-gated envelope.
//!
//! An envelope carries one message through the pipeline together with its
//! routing metadata. Every field is guarded by a grant list: the main token
//! may always read and write, any other token only the fields it was
//! granted. Only the main token may grant access or count hops.

use crate::subscription::ReplyTo;
use crate::token::{Token, TokenId};
use gateway_protocol::Message;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tenvis_gateway_plugin::ProtocolName;
use thiserror::Error;

/// Envelope fields guarded by grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Message,
    SourceProtocol,
    TargetProtocol,
    ReplyTo,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::Message => "message",
            Field::SourceProtocol => "source_protocol",
            Field::TargetProtocol => "target_protocol",
            Field::ReplyTo => "reply_to",
        };
        f.write_str(name)
    }
}

/// A metadata value written into an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtraInfo {
    SourceProtocol(ProtocolName),
    TargetProtocol(ProtocolName),
    ReplyTo(ReplyTo),
}

impl ExtraInfo {
    fn field(&self) -> Field {
        match self {
            ExtraInfo::SourceProtocol(_) => Field::SourceProtocol,
            ExtraInfo::TargetProtocol(_) => Field::TargetProtocol,
            ExtraInfo::ReplyTo(_) => Field::ReplyTo,
        }
    }
}

/// Envelope access errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The token holds no grant for the field.
    #[error("Access denied to {0}")]
    AccessDenied(Field),

    /// The operation needs the main token.
    #[error("Main token required to {0}")]
    NotMainToken(&'static str),
}

/// A message plus routing metadata.
pub struct Envelope {
    message: Message,
    hops: u32,
    main: TokenId,
    grants: HashMap<Field, HashSet<TokenId>>,
    source_protocol: Option<ProtocolName>,
    target_protocol: Option<ProtocolName>,
    reply_to: Option<ReplyTo>,
}

impl Envelope {
    /// Wrap a message. `main` becomes the envelope's main token.
    #[must_use]
    pub fn new(main: &Token, message: impl Into<Message>) -> Self {
        Self {
            message: message.into(),
            hops: 0,
            main: main.id(),
            grants: HashMap::new(),
            source_protocol: None,
            target_protocol: None,
            reply_to: None,
        }
    }

    /// Identity check against the main token.
    #[must_use]
    pub fn is_main_token(&self, token: &Token) -> bool {
        self.main == token.id()
    }

    /// Allow `token` to read and write `field`.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::NotMainToken`] unless `main` is the main token.
    pub fn grant(&mut self, main: &Token, token: &Token, field: Field) -> Result<(), EnvelopeError> {
        if !self.is_main_token(main) {
            return Err(EnvelopeError::NotMainToken("grant access"));
        }
        self.grants.entry(field).or_default().insert(token.id());
        Ok(())
    }

    /// Count one hop and return the new hop count.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::NotMainToken`] unless `main` is the main token.
    pub fn pass(&mut self, main: &Token) -> Result<u32, EnvelopeError> {
        if !self.is_main_token(main) {
            return Err(EnvelopeError::NotMainToken("count hops"));
        }
        self.hops += 1;
        Ok(self.hops)
    }

    /// Number of hops counted so far.
    #[must_use]
    pub fn hops(&self) -> u32 {
        self.hops
    }

    fn check(&self, token: &Token, field: Field) -> Result<(), EnvelopeError> {
        if self.is_main_token(token)
            || self
                .grants
                .get(&field)
                .is_some_and(|ids| ids.contains(&token.id()))
        {
            Ok(())
        } else {
            Err(EnvelopeError::AccessDenied(field))
        }
    }

    /// Read the message.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::AccessDenied`] without a grant.
    pub fn message(&self, token: &Token) -> Result<&Message, EnvelopeError> {
        self.check(token, Field::Message)?;
        Ok(&self.message)
    }

    /// Replace the message, keeping hops and metadata.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::AccessDenied`] without a grant.
    pub fn set_message(&mut self, token: &Token, message: impl Into<Message>) -> Result<(), EnvelopeError> {
        self.check(token, Field::Message)?;
        self.message = message.into();
        Ok(())
    }

    /// Take the message out of the envelope.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::AccessDenied`] without a grant.
    pub fn into_message(self, token: &Token) -> Result<Message, EnvelopeError> {
        self.check(token, Field::Message)?;
        Ok(self.message)
    }

    /// Write a metadata slot.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::AccessDenied`] without a grant for the slot.
    pub fn set_extra(&mut self, token: &Token, info: ExtraInfo) -> Result<(), EnvelopeError> {
        self.check(token, info.field())?;
        match info {
            ExtraInfo::SourceProtocol(p) => self.source_protocol = Some(p),
            ExtraInfo::TargetProtocol(p) => self.target_protocol = Some(p),
            ExtraInfo::ReplyTo(r) => self.reply_to = Some(r),
        }
        Ok(())
    }

    /// Protocol the message came from.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::AccessDenied`] without a grant.
    pub fn source_protocol(&self, token: &Token) -> Result<Option<&ProtocolName>, EnvelopeError> {
        self.check(token, Field::SourceProtocol)?;
        Ok(self.source_protocol.as_ref())
    }

    /// Protocol the message is routed to.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::AccessDenied`] without a grant.
    pub fn target_protocol(&self, token: &Token) -> Result<Option<&ProtocolName>, EnvelopeError> {
        self.check(token, Field::TargetProtocol)?;
        Ok(self.target_protocol.as_ref())
    }

    /// Fan-out set of a reply.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::AccessDenied`] without a grant.
    pub fn reply_to(&self, token: &Token) -> Result<Option<&ReplyTo>, EnvelopeError> {
        self.check(token, Field::ReplyTo)?;
        Ok(self.reply_to.as_ref())
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("kind", &self.message.kind())
            .field("sequence", &self.message.sequence())
            .field("hops", &self.hops)
            .finish_non_exhaustive()
    }
}
