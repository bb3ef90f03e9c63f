//! Input and output stages.
//!
//! They hold no state besides their token: the input controller admits
//! sequenced requests into the pipeline and the output controller admits
//! answers that carry a fan-out set.

use crate::block::{Block, BlockId, Forward, RoutingError};
use crate::envelope::Envelope;
use crate::token::Token;
use async_trait::async_trait;
use gateway_protocol::Message;
use tracing::trace;

/// First stage of the request path.
#[derive(Debug)]
pub struct InputController {
    token: Token,
}

impl InputController {
    pub(crate) fn new() -> Self {
        Self {
            token: Token::mint(),
        }
    }

    pub(crate) fn token(&self) -> &Token {
        &self.token
    }
}

#[async_trait]
impl Block for InputController {
    fn id(&self) -> BlockId {
        BlockId::InputController
    }

    async fn receive(
        &self,
        from: BlockId,
        envelope: Envelope,
        pipeline: &dyn Forward,
    ) -> Result<(), RoutingError> {
        if from != BlockId::CommunicationManager {
            return Err(RoutingError::UnexpectedSource {
                block: self.id(),
                from,
            });
        }

        match envelope.message(&self.token)? {
            Message::Request(request) => {
                let sequence = request.sequence().ok_or(RoutingError::Unsequenced)?;
                trace!(sequence, path = %request.headers().path(), "Request admitted");
            }
            other => {
                return Err(RoutingError::UnexpectedMessage {
                    block: self.id(),
                    from,
                    kind: other.kind(),
                })
            }
        }

        pipeline.forward(self.id(), BlockId::InterconnectionController, envelope);
        Ok(())
    }
}

/// Last stage of the reply path.
#[derive(Debug)]
pub struct OutputController {
    token: Token,
}

impl OutputController {
    pub(crate) fn new() -> Self {
        Self {
            token: Token::mint(),
        }
    }

    pub(crate) fn token(&self) -> &Token {
        &self.token
    }
}

#[async_trait]
impl Block for OutputController {
    fn id(&self) -> BlockId {
        BlockId::OutputController
    }

    async fn receive(
        &self,
        from: BlockId,
        envelope: Envelope,
        pipeline: &dyn Forward,
    ) -> Result<(), RoutingError> {
        if from != BlockId::InterconnectionController {
            return Err(RoutingError::UnexpectedSource {
                block: self.id(),
                from,
            });
        }

        let message = envelope.message(&self.token)?;
        if !message.is_reply_like() {
            return Err(RoutingError::UnexpectedMessage {
                block: self.id(),
                from,
                kind: message.kind(),
            });
        }
        let sequence = message.sequence();
        let targets = envelope
            .reply_to(&self.token)?
            .filter(|reply_to| !reply_to.is_empty())
            .map(|reply_to| reply_to.len())
            .ok_or_else(|| RoutingError::NoSubscription(format!("reply #{sequence}")))?;
        trace!(sequence, protocols = targets, "Reply admitted");

        pipeline.forward(self.id(), BlockId::CommunicationManager, envelope);
        Ok(())
    }
}
