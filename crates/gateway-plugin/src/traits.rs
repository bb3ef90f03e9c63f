//! Plugin contract for the gateway.
//!
//! These traits define the interface every protocol adapter implements,
//! allowing the routing core to stay protocol-agnostic.

use crate::settings::{Settings, SettingsError};
use async_trait::async_trait;
use gateway_protocol::{ErrorReply, ProtocolError, Reply, Request, Sequence};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

/// Unique name of the protocol a plugin speaks, e.g. `coap`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolName(String);

impl ProtocolName {
    /// Create a protocol name. Names are case-insensitive and stored lowercase.
    #[must_use]
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().to_ascii_lowercase())
    }

    /// Get the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProtocolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProtocolName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ProtocolName {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Plugin lifecycle errors.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The plugin failed to start.
    #[error("Start failed: {0}")]
    StartFailed(String),

    /// The plugin failed to stop.
    #[error("Stop failed: {0}")]
    StopFailed(String),

    /// Invalid plugin settings.
    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Errors returned by request and reply links.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The gateway side of the link is not wired yet.
    #[error("Link not ready")]
    NotReady,

    /// The gateway stopped or the link was closed.
    #[error("Link closed")]
    Closed,

    /// No reply arrived within the caller's timeout.
    #[error("No reply within {0:?}")]
    Timeout(Duration),

    /// The exchange failed with an error reply.
    #[error("Request failed: {0}")]
    Rejected(ErrorReply),

    /// The request could not be sequenced.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Outcome delivered to a pending request.
pub type ReplyOutcome = Result<Reply, ErrorReply>;

/// A reply that has not arrived yet.
///
/// Resolves exactly once, with the reply or the error correlated to the
/// request's sequence. Dropping it stops waiting without cancelling the
/// exchange.
#[derive(Debug)]
pub struct PendingReply {
    sequence: Sequence,
    receiver: oneshot::Receiver<ReplyOutcome>,
}

impl PendingReply {
    /// Create a pending reply for `sequence`.
    #[must_use]
    pub fn new(sequence: Sequence, receiver: oneshot::Receiver<ReplyOutcome>) -> Self {
        Self { sequence, receiver }
    }

    /// The sequence the gateway assigned to the request.
    #[must_use]
    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    /// Wait for the reply, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Timeout`] if nothing arrived in time,
    /// [`LinkError::Rejected`] for an error reply, or [`LinkError::Closed`]
    /// if the gateway dropped the exchange.
    pub async fn wait(self, timeout: Duration) -> Result<Reply, LinkError> {
        match tokio::time::timeout(timeout, self).await {
            Ok(outcome) => outcome,
            Err(_) => Err(LinkError::Timeout(timeout)),
        }
    }
}

impl Future for PendingReply {
    type Output = Result<Reply, LinkError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|result| match result {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(error)) => Err(LinkError::Rejected(error)),
            Err(_) => Err(LinkError::Closed),
        })
    }
}

/// Link given to server-capable plugins for submitting requests.
#[async_trait]
pub trait RequestLink: Send + Sync {
    /// Sequence `request` and route it through the gateway.
    ///
    /// Returns as soon as the request is accepted; await the returned
    /// [`PendingReply`] for the answer.
    async fn send(&self, request: Request) -> Result<PendingReply, LinkError>;
}

/// Link given to client-capable plugins for returning answers.
#[async_trait]
pub trait ReplyLink: Send + Sync {
    /// Return a reply, or an unsolicited observe notification.
    async fn send(&self, reply: Reply) -> Result<(), LinkError>;

    /// Return an error for a request.
    async fn error(&self, error: ErrorReply) -> Result<(), LinkError>;
}

/// Outbound side of a plugin: it talks to devices on behalf of the gateway.
pub trait ClientSide: Send + Sync {
    /// Called once at registration.
    fn set_reply_link(&self, link: Arc<dyn ReplyLink>);

    /// Handle a request routed to this protocol.
    ///
    /// Calls are serialized per plugin and must not block; answers go back
    /// through the reply link.
    fn handle_request(&self, request: Request);
}

/// Inbound side of a plugin: it accepts requests from external clients.
pub trait ServerSide: Send + Sync {
    /// Called once at registration.
    fn set_request_link(&self, link: Arc<dyn RequestLink>);

    /// Handle a reply pushed to a standing subscription of this protocol.
    fn handle_reply(&self, reply: Reply);
}

/// A protocol adapter.
///
/// Plugins are responsible for the underlying protocol (HTTP, CoAP,
/// MQTT, etc.) and expose a uniform interface to the gateway.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Get the protocol name, used as the URI scheme for this plugin.
    fn protocol(&self) -> ProtocolName;

    /// Get the plugin settings. They are locked before `start` is called.
    fn settings(&self) -> &Settings;

    /// Start the plugin.
    async fn start(&self) -> Result<(), PluginError>;

    /// Stop the plugin.
    async fn stop(&self) -> Result<(), PluginError>;

    /// Get the client side, if the plugin can act as an outbound client.
    fn client(&self) -> Option<&dyn ClientSide> {
        None
    }

    /// Get the server side, if the plugin can originate requests.
    fn server(&self) -> Option<&dyn ServerSide> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_protocol::{Operation, Reason};

    #[test]
    fn test_protocol_name_lowercase() {
        let name: ProtocolName = "CoAP".into();
        assert_eq!(name.as_str(), "coap");
        assert_eq!(name, ProtocolName::new("coap"));
    }

    #[tokio::test]
    async fn test_pending_reply_resolves() {
        let (tx, rx) = oneshot::channel();
        let pending = PendingReply::new(4, rx);
        assert_eq!(pending.sequence(), 4);

        let mut request = Request::new(Operation::Read, "/temp");
        request.assign_sequence(4).unwrap();
        tx.send(Ok(Reply::to(&request, "21.5"))).unwrap();

        let reply = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply.sequence(), 4);
    }

    #[tokio::test]
    async fn test_pending_reply_rejected() {
        let (tx, rx) = oneshot::channel();
        let mut request = Request::new(Operation::Read, "/temp");
        request.assign_sequence(9).unwrap();
        tx.send(Err(ErrorReply::for_request(&request, Reason::PathNotFound)))
            .unwrap();

        match PendingReply::new(9, rx).await {
            Err(LinkError::Rejected(error)) => assert_eq!(error.reason(), Reason::PathNotFound),
            other => panic!("Expected Rejected, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_reply_timeout() {
        let (_tx, rx) = oneshot::channel();
        let result = PendingReply::new(1, rx).wait(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(LinkError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_pending_reply_closed() {
        let (tx, rx) = oneshot::channel::<ReplyOutcome>();
        drop(tx);
        assert!(matches!(PendingReply::new(1, rx).await, Err(LinkError::Closed)));
    }
}
