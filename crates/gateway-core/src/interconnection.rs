//! Interconnection controller.
//!
//! Resolves the target of every request, keeps the subscription registry
//! and consults the reply cache. Requests are rewritten for their target
//! protocol and handed back to the communication manager; replies are
//! matched to their subscribers and handed to the output controller.

use crate::block::{Block, BlockId, Forward, RoutingError};
use crate::cache::ReplyCache;
use crate::envelope::{Envelope, ExtraInfo};
use crate::subscription::{ReplyTo, Subscriber, SubscriptionRegistry};
use crate::token::Token;
use async_trait::async_trait;
use bytes::Bytes;
use gateway_protocol::{ErrorReply, GatewayUri, Message, Operation, Reason, Reply, Sequence};
use std::sync::Arc;
use tenvis_gateway_plugin::ProtocolName;
use tracing::{debug, trace};

/// Routing stage between the input/output controllers and the manager.
pub struct InterconnectionController {
    token: Token,
    registry: SubscriptionRegistry,
    cache: Arc<dyn ReplyCache>,
}

impl InterconnectionController {
    pub(crate) fn new(cache: Arc<dyn ReplyCache>) -> Self {
        Self {
            token: Token::mint(),
            registry: SubscriptionRegistry::new(),
            cache,
        }
    }

    pub(crate) fn token(&self) -> &Token {
        &self.token
    }

    /// Get the subscription registry.
    #[must_use]
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    fn on_request(&self, mut envelope: Envelope, pipeline: &dyn Forward) -> Result<(), RoutingError> {
        let request = match envelope.message(&self.token)? {
            Message::Request(request) => request.clone(),
            other => {
                return Err(RoutingError::UnexpectedMessage {
                    block: self.id(),
                    from: BlockId::InputController,
                    kind: other.kind(),
                })
            }
        };
        let sequence = request.sequence().ok_or(RoutingError::Unsequenced)?;
        let source = envelope
            .source_protocol(&self.token)?
            .cloned()
            .ok_or(RoutingError::MissingSource)?;
        let operation = request.headers().operation();

        let uri = match GatewayUri::parse(request.headers().path()) {
            Ok(uri) => uri,
            Err(e) => {
                debug!(sequence, path = %request.headers().path(), error = %e, "Unresolvable request path");
                let error = ErrorReply::for_request(&request, Reason::InvalidUri).with_detail(e.to_string());
                return self.answer(envelope, error, &source, sequence, pipeline);
            }
        };
        let key = uri.to_string();

        match operation {
            Operation::Read => {
                if let Some(cached) = self.cache.lookup(&key) {
                    debug!(sequence, uri = %key, "Answered from cache");
                    return self.answer(envelope, cached.retagged(sequence), &source, sequence, pipeline);
                }
                self.registry.subscribe(&key, &source, Subscriber::Once(sequence));
            }
            Operation::Observe => {
                if self.registry.observe(&key, &source, sequence) {
                    debug!(sequence, uri = %key, "Already observed, waiting for next notification");
                    return Ok(());
                }
            }
            Operation::Unobserve => {
                let remaining = self.registry.unobserve(&key, &source, sequence);
                if remaining > 0 {
                    debug!(sequence, uri = %key, remaining, "Observers remain, unobserve answered locally");
                    let ack = Reply::to(&request, Bytes::new());
                    return self.answer(envelope, ack, &source, sequence, pipeline);
                }
            }
            Operation::Create | Operation::Update | Operation::Delete => {
                self.registry.subscribe(&key, &source, Subscriber::Once(sequence));
            }
        }

        let routed = request.rerouted(uri.authority(), &uri.path_and_query());
        envelope.set_message(&self.token, routed)?;
        envelope.set_extra(
            &self.token,
            ExtraInfo::TargetProtocol(ProtocolName::new(uri.scheme())),
        )?;
        trace!(sequence, uri = %key, operation = %operation, "Request routed");

        pipeline.forward(self.id(), BlockId::CommunicationManager, envelope);
        Ok(())
    }

    /// Answer a request without reaching the target.
    fn answer(
        &self,
        mut envelope: Envelope,
        message: impl Into<Message>,
        source: &ProtocolName,
        sequence: Sequence,
        pipeline: &dyn Forward,
    ) -> Result<(), RoutingError> {
        let mut reply_to = ReplyTo::new();
        reply_to.insert(source.clone(), vec![Subscriber::Once(sequence)]);

        envelope.set_message(&self.token, message)?;
        envelope.set_extra(&self.token, ExtraInfo::ReplyTo(reply_to))?;
        pipeline.forward(self.id(), BlockId::OutputController, envelope);
        Ok(())
    }

    fn on_reply(&self, mut envelope: Envelope, pipeline: &dyn Forward) -> Result<(), RoutingError> {
        let message = envelope.message(&self.token)?;
        if !message.is_reply_like() {
            return Err(RoutingError::UnexpectedMessage {
                block: self.id(),
                from: BlockId::CommunicationManager,
                kind: message.kind(),
            });
        }
        let source = envelope
            .source_protocol(&self.token)?
            .ok_or(RoutingError::MissingSource)?;

        let headers = message.headers();
        let key = GatewayUri::from_parts(source.as_str(), headers.target(), headers.path())
            .map_err(|e| RoutingError::InvalidReplyUri(e.to_string()))?
            .to_string();

        // Any fresh value reaches observers; errors stay with their caller.
        let include_standing = matches!(message, Message::Reply(_));
        let reply_to = self
            .registry
            .drain(&key, include_standing)
            .filter(|reply_to| !reply_to.is_empty())
            .ok_or_else(|| RoutingError::NoSubscription(key.clone()))?;

        match message {
            Message::Reply(reply) => self.cache.update(&key, reply),
            Message::Error(error) if error.headers().operation() == Operation::Observe => {
                // A failed OBSERVE leaves no standing entry behind.
                for protocol in reply_to.keys() {
                    self.registry.remove(&key, protocol, Subscriber::Standing);
                }
            }
            _ => {}
        }
        trace!(
            sequence = message.sequence(),
            uri = %key,
            protocols = reply_to.len(),
            "Reply matched"
        );

        envelope.set_extra(&self.token, ExtraInfo::ReplyTo(reply_to))?;
        pipeline.forward(self.id(), BlockId::OutputController, envelope);
        Ok(())
    }
}

#[async_trait]
impl Block for InterconnectionController {
    fn id(&self) -> BlockId {
        BlockId::InterconnectionController
    }

    async fn receive(
        &self,
        from: BlockId,
        envelope: Envelope,
        pipeline: &dyn Forward,
    ) -> Result<(), RoutingError> {
        match from {
            BlockId::InputController => self.on_request(envelope, pipeline),
            BlockId::CommunicationManager => self.on_reply(envelope, pipeline),
            _ => Err(RoutingError::UnexpectedSource {
                block: self.id(),
                from,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryCache, NoCache};
    use crate::envelope::Field;
    use gateway_protocol::Request;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records forwards and keeps the envelopes for inspection.
    #[derive(Default)]
    struct Recorder {
        forwarded: Mutex<Vec<(BlockId, Envelope)>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<(BlockId, Envelope)> {
            std::mem::take(&mut *self.forwarded.lock().unwrap())
        }
    }

    impl Forward for Recorder {
        fn forward(&self, source: BlockId, target: BlockId, envelope: Envelope) {
            assert_eq!(source, BlockId::InterconnectionController);
            self.forwarded.lock().unwrap().push((target, envelope));
        }
    }

    struct Fixture {
        main: Token,
        controller: InterconnectionController,
        recorder: Recorder,
    }

    impl Fixture {
        fn new(cache: Arc<dyn ReplyCache>) -> Self {
            Self {
                main: Token::mint(),
                controller: InterconnectionController::new(cache),
                recorder: Recorder::default(),
            }
        }

        fn wrap(&self, message: impl Into<Message>, source: &str) -> Envelope {
            let mut envelope = Envelope::new(&self.main, message);
            for field in [
                Field::Message,
                Field::SourceProtocol,
                Field::TargetProtocol,
                Field::ReplyTo,
            ] {
                envelope
                    .grant(&self.main, self.controller.token(), field)
                    .unwrap();
            }
            envelope
                .set_extra(&self.main, ExtraInfo::SourceProtocol(source.into()))
                .unwrap();
            envelope
        }

        async fn request(&self, operation: Operation, path: &str, sequence: Sequence) {
            self.request_from("http", operation, path, sequence).await;
        }

        async fn request_from(
            &self,
            source: &str,
            operation: Operation,
            path: &str,
            sequence: Sequence,
        ) {
            let mut request = Request::new(operation, path);
            request.assign_sequence(sequence).unwrap();
            let envelope = self.wrap(request, source);
            self.controller
                .receive(BlockId::InputController, envelope, &self.recorder)
                .await
                .unwrap();
        }

        async fn reply(&self, reply: Reply) -> Result<(), RoutingError> {
            let envelope = self.wrap(reply, "coap");
            self.controller
                .receive(BlockId::CommunicationManager, envelope, &self.recorder)
                .await
        }
    }

    fn target_reply(operation: Operation, path: &str, sequence: Sequence) -> Reply {
        let mut request = Request::new(operation, path);
        request.headers_mut().set_target("dev").unwrap();
        request.assign_sequence(sequence).unwrap();
        Reply::builder(&request)
            .payload("20")
            .max_age(Duration::from_secs(60))
            .build()
    }

    #[tokio::test]
    async fn test_request_rewritten_for_target() {
        let fx = Fixture::new(Arc::new(NoCache));
        fx.request(Operation::Read, "/coap/dev/temp?b=2&a=1", 1).await;

        let mut forwarded = fx.recorder.take();
        let (target, envelope) = forwarded.pop().unwrap();
        assert_eq!(target, BlockId::CommunicationManager);
        assert_eq!(
            envelope.target_protocol(&fx.main).unwrap(),
            Some(&ProtocolName::new("coap"))
        );
        let headers = envelope.message(&fx.main).unwrap().headers();
        assert_eq!(headers.target(), "dev");
        assert_eq!(headers.path(), "/temp?a=1&b=2");
        assert!(fx.controller.registry().contains("coap://dev/temp?a=1&b=2"));
    }

    #[tokio::test]
    async fn test_invalid_uri_answered_directly() {
        let fx = Fixture::new(Arc::new(NoCache));
        fx.request(Operation::Read, "not-a-route", 5).await;

        let (target, envelope) = fx.recorder.take().pop().unwrap();
        assert_eq!(target, BlockId::OutputController);
        match envelope.message(&fx.main).unwrap() {
            Message::Error(error) => {
                assert_eq!(error.reason(), Reason::InvalidUri);
                assert_eq!(error.sequence(), 5);
            }
            other => panic!("Expected error, got {:?}", other),
        }
        let reply_to = envelope.reply_to(&fx.main).unwrap().unwrap();
        assert_eq!(
            reply_to.get(&ProtocolName::new("http")),
            Some(&vec![Subscriber::Once(5)])
        );
    }

    #[tokio::test]
    async fn test_reply_fans_out_to_subscribers() {
        let fx = Fixture::new(Arc::new(NoCache));
        fx.request(Operation::Read, "/coap/dev/temp", 1).await;
        fx.request(Operation::Read, "/coap/dev/temp", 2).await;
        fx.recorder.take();

        fx.reply(target_reply(Operation::Read, "/temp", 1)).await.unwrap();
        let (target, envelope) = fx.recorder.take().pop().unwrap();
        assert_eq!(target, BlockId::OutputController);
        let reply_to = envelope.reply_to(&fx.main).unwrap().unwrap();
        assert_eq!(
            reply_to.get(&ProtocolName::new("http")),
            Some(&vec![Subscriber::Once(1), Subscriber::Once(2)])
        );

        // Nobody is left waiting.
        let result = fx.reply(target_reply(Operation::Read, "/temp", 1)).await;
        assert!(matches!(result, Err(RoutingError::NoSubscription(_))));
        assert!(fx.recorder.take().is_empty());
    }

    #[tokio::test]
    async fn test_warm_cache_skips_target() {
        let fx = Fixture::new(Arc::new(MemoryCache::default()));
        fx.request(Operation::Read, "/coap/dev/temp", 1).await;
        fx.reply(target_reply(Operation::Read, "/temp", 1)).await.unwrap();
        fx.recorder.take();

        fx.request(Operation::Read, "/coap/dev/temp", 9).await;
        let (target, envelope) = fx.recorder.take().pop().unwrap();
        assert_eq!(target, BlockId::OutputController);
        let message = envelope.message(&fx.main).unwrap();
        assert!(matches!(message, Message::Reply(_)));
        assert_eq!(message.sequence(), 9);
        assert!(!fx.controller.registry().contains("coap://dev/temp"));
    }

    #[tokio::test]
    async fn test_observe_forwarded_once() {
        let fx = Fixture::new(Arc::new(NoCache));
        fx.request(Operation::Observe, "/coap/dev/temp", 0x8000_0001).await;
        assert_eq!(fx.recorder.take().len(), 1);

        fx.request_from("mqtt", Operation::Observe, "/coap/dev/temp", 0x8000_0002)
            .await;
        assert!(fx.recorder.take().is_empty());

        // The mqtt observer remains after the first UNOBSERVE: answered locally.
        fx.request(Operation::Unobserve, "/coap/dev/temp", 0x8000_0003).await;
        let (target, envelope) = fx.recorder.take().pop().unwrap();
        assert_eq!(target, BlockId::OutputController);
        assert_eq!(envelope.message(&fx.main).unwrap().sequence(), 0x8000_0003);

        // The last one reaches the target.
        fx.request_from("mqtt", Operation::Unobserve, "/coap/dev/temp", 0x8000_0004)
            .await;
        let (target, _) = fx.recorder.take().pop().unwrap();
        assert_eq!(target, BlockId::CommunicationManager);
    }

    #[tokio::test]
    async fn test_update_reply_reaches_observers() {
        let fx = Fixture::new(Arc::new(NoCache));
        fx.request(Operation::Observe, "/coap/dev/temp", 0x8000_0001).await;
        fx.reply(target_reply(Operation::Observe, "/temp", 0x8000_0001))
            .await
            .unwrap();
        fx.request_from("mqtt", Operation::Update, "/coap/dev/temp", 7).await;
        fx.recorder.take();

        fx.reply(target_reply(Operation::Update, "/temp", 7)).await.unwrap();
        let (target, envelope) = fx.recorder.take().pop().unwrap();
        assert_eq!(target, BlockId::OutputController);
        let reply_to = envelope.reply_to(&fx.main).unwrap().unwrap();
        assert_eq!(
            reply_to.get(&ProtocolName::new("http")),
            Some(&vec![Subscriber::Standing])
        );
        assert_eq!(
            reply_to.get(&ProtocolName::new("mqtt")),
            Some(&vec![Subscriber::Once(7)])
        );
        assert!(fx.controller.registry().contains("coap://dev/temp"));
    }

    #[tokio::test]
    async fn test_error_reply_drains_one_shots_only() {
        let fx = Fixture::new(Arc::new(NoCache));
        fx.request(Operation::Observe, "/coap/dev/temp", 0x8000_0001).await;
        fx.recorder.take();

        let mut request = Request::new(Operation::Observe, "/temp");
        request.headers_mut().set_target("dev").unwrap();
        request.assign_sequence(0x8000_0001).unwrap();
        let error = ErrorReply::for_request(&request, Reason::PathNotFound);
        let envelope = fx.wrap(error, "coap");
        fx.controller
            .receive(BlockId::CommunicationManager, envelope, &fx.recorder)
            .await
            .unwrap();

        let (_, envelope) = fx.recorder.take().pop().unwrap();
        let reply_to = envelope.reply_to(&fx.main).unwrap().unwrap();
        assert_eq!(
            reply_to.get(&ProtocolName::new("http")),
            Some(&vec![Subscriber::Once(0x8000_0001)])
        );
        // The failed observation is forgotten.
        assert!(!fx.controller.registry().contains("coap://dev/temp"));
    }
}
