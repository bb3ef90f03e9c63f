//! Pipeline stages and the forwarding graph.

use crate::envelope::{Envelope, EnvelopeError};
use async_trait::async_trait;
use gateway_protocol::MessageKind;
use std::collections::{HashMap, HashSet};
use std::fmt;
use thiserror::Error;

/// Named stages of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockId {
    CommunicationManager,
    InputController,
    InterconnectionController,
    OutputController,
}

impl BlockId {
    /// Every stage.
    pub const ALL: [BlockId; 4] = [
        BlockId::CommunicationManager,
        BlockId::InputController,
        BlockId::InterconnectionController,
        BlockId::OutputController,
    ];
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlockId::CommunicationManager => "communication-manager",
            BlockId::InputController => "input-controller",
            BlockId::InterconnectionController => "interconnection-controller",
            BlockId::OutputController => "output-controller",
        };
        f.write_str(name)
    }
}

/// Errors raised while a stage handles an envelope.
///
/// They are reported to the dispatcher, which logs them; nothing is
/// forwarded for the failing envelope.
#[derive(Debug, Error)]
pub enum RoutingError {
    /// A reply arrived for a URI nobody subscribed to.
    #[error("No subscription for {0}")]
    NoSubscription(String),

    /// A stage touched a field it holds no grant for.
    #[error("Envelope access failed: {0}")]
    Envelope(#[from] EnvelopeError),

    /// The message kind is not handled by this stage for this source.
    #[error("{block} cannot handle {kind:?} from {from}")]
    UnexpectedMessage {
        block: BlockId,
        from: BlockId,
        kind: MessageKind,
    },

    /// The stage never receives from this source.
    #[error("{block} does not accept envelopes from {from}")]
    UnexpectedSource { block: BlockId, from: BlockId },

    /// The envelope carries no source protocol.
    #[error("Envelope has no source protocol")]
    MissingSource,

    /// A routed request carries no target protocol.
    #[error("Envelope has no target protocol")]
    MissingTarget,

    /// A request reached the pipeline without a sequence.
    #[error("Request is not sequenced")]
    Unsequenced,

    /// The reply route does not form a URI.
    #[error("Invalid reply route: {0}")]
    InvalidReplyUri(String),
}

/// Static adjacency table of the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    edges: HashMap<BlockId, HashSet<BlockId>>,
}

impl PipelineGraph {
    /// The gateway's pipeline.
    #[must_use]
    pub fn standard() -> Self {
        use BlockId::*;

        let mut edges: HashMap<BlockId, HashSet<BlockId>> = HashMap::new();
        let mut link = |from: BlockId, to: BlockId| {
            edges.entry(from).or_default().insert(to);
        };
        link(CommunicationManager, InputController);
        link(CommunicationManager, InterconnectionController);
        link(InputController, InterconnectionController);
        link(InterconnectionController, CommunicationManager);
        link(InterconnectionController, OutputController);
        link(OutputController, CommunicationManager);

        Self { edges }
    }

    /// Check if `source` may forward to `target`.
    #[must_use]
    pub fn can_forward(&self, source: BlockId, target: BlockId) -> bool {
        self.edges
            .get(&source)
            .is_some_and(|targets| targets.contains(&target))
    }

    /// Stages reachable in one hop from `source`.
    pub fn successors(&self, source: BlockId) -> impl Iterator<Item = BlockId> + '_ {
        self.edges.get(&source).into_iter().flatten().copied()
    }
}

impl Default for PipelineGraph {
    fn default() -> Self {
        Self::standard()
    }
}

/// Hands envelopes to the next stage.
pub trait Forward: Send + Sync {
    /// Queue `envelope` for delivery from `source` to `target`.
    ///
    /// Returns immediately; illegal transitions are dropped by the
    /// dispatcher.
    fn forward(&self, source: BlockId, target: BlockId, envelope: Envelope);
}

/// A pipeline stage.
#[async_trait]
pub trait Block: Send + Sync {
    /// Get the stage identifier.
    fn id(&self) -> BlockId;

    /// Handle an envelope forwarded from `from`.
    async fn receive(
        &self,
        from: BlockId,
        envelope: Envelope,
        pipeline: &dyn Forward,
    ) -> Result<(), RoutingError>;
}
