//! Communication manager.
//!
//! The manager owns the plugin registry and the pipeline. It sequences
//! requests coming from server-side plugins, wraps every message in an
//! envelope, dispatches forwarding work on a bounded set of tasks and
//! correlates replies with the requests waiting for them.

use crate::block::{Block, BlockId, Forward, PipelineGraph, RoutingError};
use crate::cache::{NoCache, ReplyCache};
use crate::controllers::{InputController, OutputController};
use crate::envelope::{Envelope, EnvelopeError, ExtraInfo, Field};
use crate::interconnection::InterconnectionController;
use crate::sequence::Sequencer;
use crate::sink::{sink, Link, SinkError, DEFAULT_READY_TIMEOUT};
use crate::subscription::{Subscriber, SubscriptionRegistry, SubscriptionStats};
use crate::token::Token;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use gateway_protocol::{ErrorReply, Message, MessageKind, Reason, Reply, Request, Sequence};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tenvis_gateway_plugin::{
    LinkError, PendingReply, Plugin, PluginError, ProtocolName, ReplyLink, ReplyOutcome,
    RequestLink,
};
use thiserror::Error;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, error, info, trace, warn};

/// Manager errors.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// A plugin with the same protocol name is registered.
    #[error("Protocol already registered: {0}")]
    AlreadyRegistered(ProtocolName),

    /// The plugin exposes neither a client nor a server side.
    #[error("Plugin {0} has no client or server side")]
    NoCapability(ProtocolName),

    /// The operation is not allowed in the current state.
    #[error("Manager is {0}")]
    InvalidState(&'static str),

    /// A plugin failed a lifecycle step.
    #[error("Plugin {protocol} failed: {source}")]
    Plugin {
        protocol: ProtocolName,
        #[source]
        source: PluginError,
    },

    /// A plugin link could not be wired.
    #[error("Link error: {0}")]
    Sink(#[from] SinkError),
}

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Maximum number of forwards processed concurrently.
    pub max_in_flight: usize,
    /// Bounded wait for a plugin link to become ready.
    pub link_ready_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 256,
            link_ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

const CREATED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

fn state_name(state: u8) -> &'static str {
    match state {
        CREATED => "created",
        RUNNING => "running",
        _ => "stopped",
    }
}

/// Values a plugin hands to the manager.
enum Inbound {
    Request(Request),
    Answer(Message),
}

/// Values the manager hands to a plugin.
enum Outbound {
    Request(Request),
    Push(Reply),
}

type PendingMap = DashMap<Sequence, oneshot::Sender<ReplyOutcome>>;

struct PluginEntry {
    plugin: Arc<dyn Plugin>,
    pending: Arc<PendingMap>,
    link: Link<Outbound, Inbound>,
}

#[derive(Debug, Default)]
struct Counters {
    forwarded: AtomicU64,
    dropped: AtomicU64,
    faults: AtomicU64,
    unmatched: AtomicU64,
}

struct Inner {
    main: Token,
    graph: PipelineGraph,
    sequencer: Sequencer,
    input: InputController,
    interconnection: InterconnectionController,
    output: OutputController,
    plugins: DashMap<ProtocolName, Arc<PluginEntry>>,
    permits: Arc<Semaphore>,
    state: AtomicU8,
    counters: Counters,
    config: ManagerConfig,
}

impl Inner {
    fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }
}

/// Snapshot of manager statistics.
#[derive(Debug, Clone, Default)]
pub struct ManagerStats {
    /// Registered plugins.
    pub plugins: usize,
    /// Requests waiting for a reply.
    pub pending_replies: usize,
    /// Subscription registry statistics.
    pub subscriptions: SubscriptionStats,
    /// Envelopes delivered to a stage.
    pub forwarded: u64,
    /// Envelopes dropped by the dispatcher.
    pub dropped: u64,
    /// Stage failures.
    pub faults: u64,
    /// One-shot replies with no waiting request.
    pub unmatched: u64,
}

/// The gateway's routing hub.
///
/// Cloning is cheap; clones share the same registry and pipeline.
#[derive(Clone)]
pub struct CommunicationManager {
    inner: Arc<Inner>,
}

impl CommunicationManager {
    /// Create a manager without a reply cache.
    #[must_use]
    pub fn new(config: ManagerConfig) -> Self {
        Self::with_cache(config, Arc::new(NoCache))
    }

    /// Create a manager whose interconnection controller uses `cache`.
    #[must_use]
    pub fn with_cache(config: ManagerConfig, cache: Arc<dyn ReplyCache>) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        Self {
            inner: Arc::new(Inner {
                main: Token::mint(),
                graph: PipelineGraph::standard(),
                sequencer: Sequencer::new(),
                input: InputController::new(),
                interconnection: InterconnectionController::new(cache),
                output: OutputController::new(),
                plugins: DashMap::new(),
                permits,
                state: AtomicU8::new(CREATED),
                counters: Counters::default(),
                config,
            }),
        }
    }

    /// Register a plugin and wire its links.
    ///
    /// # Errors
    ///
    /// Returns an error if the manager already started, the protocol is
    /// taken, or the plugin has neither side.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime: the plugin's link spawns
    /// its consumer task here.
    pub fn register(&self, plugin: Arc<dyn Plugin>) -> Result<(), ManagerError> {
        let inner = &self.inner;
        let state = inner.state();
        if state != CREATED {
            return Err(ManagerError::InvalidState(state_name(state)));
        }

        let protocol = plugin.protocol();
        if plugin.client().is_none() && plugin.server().is_none() {
            return Err(ManagerError::NoCapability(protocol));
        }

        let vacant = match inner.plugins.entry(protocol.clone()) {
            Entry::Occupied(_) => return Err(ManagerError::AlreadyRegistered(protocol)),
            Entry::Vacant(vacant) => vacant,
        };

        let (manager_link, plugin_link) = sink::<Outbound, Inbound>(
            format!("plugin:{protocol}"),
            inner.config.link_ready_timeout,
        );

        let manager = Arc::downgrade(&self.inner);
        let source = protocol.clone();
        manager_link.set_listener(move |inbound: Inbound| {
            let inner = manager.upgrade().ok_or("manager dropped")?;
            CommunicationManager { inner }.accept(&source, inbound);
            Ok(())
        })?;

        let weak_plugin = Arc::downgrade(&plugin);
        plugin_link.set_listener(move |outbound: Outbound| {
            let plugin = weak_plugin.upgrade().ok_or("plugin dropped")?;
            match outbound {
                Outbound::Request(request) => plugin
                    .client()
                    .ok_or("plugin has no client side")?
                    .handle_request(request),
                Outbound::Push(reply) => plugin
                    .server()
                    .ok_or("plugin has no server side")?
                    .handle_reply(reply),
            }
            Ok(())
        })?;

        let pending: Arc<PendingMap> = Arc::new(DashMap::new());
        if let Some(server) = plugin.server() {
            server.set_request_link(Arc::new(GatewayRequestLink {
                manager: Arc::downgrade(&self.inner),
                pending: pending.clone(),
                link: plugin_link.clone(),
            }));
        }
        if let Some(client) = plugin.client() {
            client.set_reply_link(Arc::new(GatewayReplyLink { link: plugin_link }));
        }

        info!(
            protocol = %protocol,
            client = plugin.client().is_some(),
            server = plugin.server().is_some(),
            "Plugin registered"
        );
        vacant.insert(Arc::new(PluginEntry {
            plugin,
            pending,
            link: manager_link,
        }));
        Ok(())
    }

    /// Lock every plugin's settings and start all plugins.
    ///
    /// Each plugin starts on its own task. If any start fails, the manager
    /// is stopped and the first failure returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the manager is not freshly created, settings are
    /// invalid, or a plugin fails to start.
    pub async fn start(&self) -> Result<(), ManagerError> {
        let inner = &self.inner;
        let state = inner.state();
        if state != CREATED {
            return Err(ManagerError::InvalidState(state_name(state)));
        }

        let entries = self.entries();
        for entry in &entries {
            entry
                .plugin
                .settings()
                .lock()
                .map_err(|e| ManagerError::Plugin {
                    protocol: entry.plugin.protocol(),
                    source: e.into(),
                })?;
        }

        if inner
            .state
            .compare_exchange(CREATED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ManagerError::InvalidState(state_name(inner.state())));
        }

        let starts = entries.iter().map(|entry| {
            let plugin = entry.plugin.clone();
            lifecycle(plugin, |plugin| async move { plugin.start().await })
        });

        let mut failure = None;
        for outcome in join_all(starts).await {
            if let Err(e) = outcome {
                error!(error = %e, "Plugin start failed");
                failure.get_or_insert(e);
            }
        }

        if let Some(e) = failure {
            if let Err(stop_error) = self.stop().await {
                warn!(error = %stop_error, "Cleanup after failed start did not complete");
            }
            return Err(e);
        }
        info!(plugins = entries.len(), "Communication manager started");
        Ok(())
    }

    /// Stop forwarding and stop every plugin.
    ///
    /// Waiting requests resolve with [`LinkError::Closed`]. A stopped
    /// manager cannot be started again.
    ///
    /// # Errors
    ///
    /// Returns the first plugin stop failure.
    pub async fn stop(&self) -> Result<(), ManagerError> {
        if self.inner.state.swap(STOPPED, Ordering::AcqRel) == STOPPED {
            return Ok(());
        }

        let entries = self.entries();
        for entry in &entries {
            entry.link.close();
        }

        let stops = entries.iter().map(|entry| {
            let plugin = entry.plugin.clone();
            lifecycle(plugin, |plugin| async move { plugin.stop().await })
        });

        let mut failure = None;
        for outcome in join_all(stops).await {
            if let Err(e) = outcome {
                warn!(error = %e, "Plugin stop failed");
                failure.get_or_insert(e);
            }
        }

        for entry in &entries {
            entry.pending.clear();
        }
        info!("Communication manager stopped");
        failure.map_or(Ok(()), Err)
    }

    /// Check if the manager accepts traffic.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.state() == RUNNING
    }

    /// Registered protocol names, sorted.
    #[must_use]
    pub fn protocols(&self) -> Vec<ProtocolName> {
        let mut protocols: Vec<_> = self.inner.plugins.iter().map(|e| e.key().clone()).collect();
        protocols.sort();
        protocols
    }

    /// Get the subscription registry.
    #[must_use]
    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        self.inner.interconnection.registry()
    }

    /// Get a statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        let inner = &self.inner;
        ManagerStats {
            plugins: inner.plugins.len(),
            pending_replies: inner.plugins.iter().map(|e| e.pending.len()).sum(),
            subscriptions: inner.interconnection.registry().stats(),
            forwarded: inner.counters.forwarded.load(Ordering::Relaxed),
            dropped: inner.counters.dropped.load(Ordering::Relaxed),
            faults: inner.counters.faults.load(Ordering::Relaxed),
            unmatched: inner.counters.unmatched.load(Ordering::Relaxed),
        }
    }

    fn entries(&self) -> Vec<Arc<PluginEntry>> {
        self.inner.plugins.iter().map(|e| e.value().clone()).collect()
    }

    fn entry(&self, protocol: &ProtocolName) -> Option<Arc<PluginEntry>> {
        self.inner.plugins.get(protocol).map(|e| e.value().clone())
    }

    /// Wrap a message coming from `source` with the stage grants.
    fn wrap(&self, message: impl Into<Message>, source: &ProtocolName) -> Result<Envelope, EnvelopeError> {
        let inner = &self.inner;
        let main = &inner.main;
        let mut envelope = Envelope::new(main, message);

        envelope.grant(main, inner.input.token(), Field::Message)?;
        for field in [
            Field::Message,
            Field::SourceProtocol,
            Field::TargetProtocol,
            Field::ReplyTo,
        ] {
            envelope.grant(main, inner.interconnection.token(), field)?;
        }
        envelope.grant(main, inner.output.token(), Field::Message)?;
        envelope.grant(main, inner.output.token(), Field::ReplyTo)?;

        envelope.set_extra(main, ExtraInfo::SourceProtocol(source.clone()))?;
        Ok(envelope)
    }

    /// Take a value a plugin sent over its link into the pipeline.
    fn accept(&self, protocol: &ProtocolName, inbound: Inbound) {
        let (message, target) = match inbound {
            Inbound::Request(request) => (Message::Request(request), BlockId::InputController),
            Inbound::Answer(message) => (message, BlockId::InterconnectionController),
        };
        match self.wrap(message, protocol) {
            Ok(envelope) => self.forward(BlockId::CommunicationManager, target, envelope),
            Err(e) => error!(protocol = %protocol, error = %e, "Failed to wrap message"),
        }
    }

    /// Validate a transition and count the hop.
    fn admit(&self, source: BlockId, target: BlockId, envelope: &mut Envelope) -> Result<u32, &'static str> {
        let main = &self.inner.main;
        if !envelope.is_main_token(main) {
            return Err("foreign envelope");
        }
        if !self.inner.graph.can_forward(source, target) {
            return Err("transition not in pipeline graph");
        }
        let hops = envelope.pass(main).map_err(|_| "hop count refused")?;

        if target == BlockId::CommunicationManager {
            let kind = envelope
                .message(main)
                .map(Message::kind)
                .map_err(|_| "message unreadable")?;
            let expected = match source {
                BlockId::InterconnectionController => hops == 3 && kind == MessageKind::Request,
                BlockId::OutputController => (hops == 3 || hops == 4) && kind != MessageKind::Request,
                _ => false,
            };
            if !expected {
                return Err("unexpected hop count or message kind");
            }
        }
        Ok(hops)
    }

    async fn dispatch(&self, source: BlockId, target: BlockId, mut envelope: Envelope) {
        let inner = &self.inner;
        let hops = match self.admit(source, target, &mut envelope) {
            Ok(hops) => hops,
            Err(reason) => {
                inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(from = %source, to = %target, hops = envelope.hops(), reason, "Envelope dropped");
                return;
            }
        };
        inner.counters.forwarded.fetch_add(1, Ordering::Relaxed);
        trace!(from = %source, to = %target, hops, "Forwarding");

        let block: &dyn Block = match target {
            BlockId::InputController => &inner.input,
            BlockId::InterconnectionController => &inner.interconnection,
            BlockId::OutputController => &inner.output,
            BlockId::CommunicationManager => self,
        };
        if let Err(e) = block.receive(source, envelope, self).await {
            inner.counters.faults.fetch_add(1, Ordering::Relaxed);
            warn!(block = %target, from = %source, error = %e, "Routing fault");
        }
    }

    /// Hand a routed request to the target plugin.
    async fn deliver_request(&self, envelope: Envelope, pipeline: &dyn Forward) -> Result<(), RoutingError> {
        let main = &self.inner.main;
        let target = envelope
            .target_protocol(main)?
            .cloned()
            .ok_or(RoutingError::MissingTarget)?;
        let request = match envelope.into_message(main)? {
            Message::Request(request) => request,
            other => {
                return Err(RoutingError::UnexpectedMessage {
                    block: BlockId::CommunicationManager,
                    from: BlockId::InterconnectionController,
                    kind: other.kind(),
                })
            }
        };

        let delivered = match self.entry(&target) {
            Some(entry) if entry.plugin.client().is_some() => entry
                .link
                .send(Outbound::Request(request.clone()))
                .await
                .map_err(|e| e.to_string()),
            Some(_) => Err("plugin has no client side".to_string()),
            None => Err("no plugin registered".to_string()),
        };

        match delivered {
            Ok(()) => {
                trace!(protocol = %target, sequence = request.sequence(), "Request delivered");
                Ok(())
            }
            Err(detail) => {
                debug!(protocol = %target, sequence = request.sequence(), detail = %detail, "Target unavailable");
                let error = ErrorReply::for_request(&request, Reason::UnavailablePlugin)
                    .with_detail(format!("{target}: {detail}"));
                let envelope = self.wrap(error, &target)?;
                pipeline.forward(
                    BlockId::CommunicationManager,
                    BlockId::InterconnectionController,
                    envelope,
                );
                Ok(())
            }
        }
    }

    /// Deliver an answer to every subscriber in its fan-out set.
    async fn fan_out(&self, envelope: Envelope) -> Result<(), RoutingError> {
        let main = &self.inner.main;
        let reply_to = envelope.reply_to(main)?.cloned().unwrap_or_default();
        let message = envelope.into_message(main)?;

        for (protocol, mut subscribers) in reply_to {
            let Some(entry) = self.entry(&protocol) else {
                warn!(protocol = %protocol, "Reply for unregistered protocol");
                continue;
            };

            // One-shot entries first, so a resolved request suppresses the
            // standing push for the same protocol.
            subscribers.sort_by_key(|s| matches!(s, Subscriber::Standing));
            let mut answered = false;
            for subscriber in subscribers {
                match subscriber {
                    Subscriber::Once(sequence) => {
                        answered |= self.resolve(&protocol, &entry, sequence, &message);
                    }
                    Subscriber::Standing => {
                        if answered {
                            continue;
                        }
                        let (Message::Reply(reply), Some(_)) = (&message, entry.plugin.server()) else {
                            continue;
                        };
                        if let Err(e) = entry.link.send(Outbound::Push(reply.clone())).await {
                            debug!(protocol = %protocol, error = %e, "Standing push failed");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Resolve the pending request `sequence` of `protocol`.
    fn resolve(&self, protocol: &ProtocolName, entry: &PluginEntry, sequence: Sequence, message: &Message) -> bool {
        let Some((_, sender)) = entry.pending.remove(&sequence) else {
            self.inner.counters.unmatched.fetch_add(1, Ordering::Relaxed);
            debug!(protocol = %protocol, sequence, "No pending request for reply");
            return false;
        };
        let outcome = match message {
            Message::Reply(reply) => Ok(reply.retagged(sequence)),
            Message::Error(error) => Err(error.retagged(sequence)),
            Message::Request(_) => return false,
        };
        if sender.send(outcome).is_err() {
            self.inner.counters.unmatched.fetch_add(1, Ordering::Relaxed);
            debug!(protocol = %protocol, sequence, "Caller stopped waiting, reply dropped");
        }
        true
    }
}

impl Forward for CommunicationManager {
    fn forward(&self, source: BlockId, target: BlockId, envelope: Envelope) {
        if !self.is_running() {
            self.inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(from = %source, to = %target, "Manager not running, envelope dropped");
            return;
        }

        let manager = self.clone();
        tokio::spawn(async move {
            let Ok(_permit) = manager.inner.permits.clone().acquire_owned().await else {
                return;
            };
            manager.dispatch(source, target, envelope).await;
        });
    }
}

#[async_trait]
impl Block for CommunicationManager {
    fn id(&self) -> BlockId {
        BlockId::CommunicationManager
    }

    async fn receive(
        &self,
        from: BlockId,
        envelope: Envelope,
        pipeline: &dyn Forward,
    ) -> Result<(), RoutingError> {
        match from {
            BlockId::InterconnectionController => self.deliver_request(envelope, pipeline).await,
            BlockId::OutputController => self.fan_out(envelope).await,
            _ => Err(RoutingError::UnexpectedSource {
                block: self.id(),
                from,
            }),
        }
    }
}

/// Run a lifecycle step of `plugin` on its own task.
async fn lifecycle<F, Fut>(plugin: Arc<dyn Plugin>, step: F) -> Result<(), ManagerError>
where
    F: FnOnce(Arc<dyn Plugin>) -> Fut,
    Fut: std::future::Future<Output = Result<(), PluginError>> + Send + 'static,
{
    let protocol = plugin.protocol();
    tokio::spawn(step(plugin))
        .await
        .unwrap_or_else(|e| Err(PluginError::Other(e.to_string())))
        .map_err(|source| ManagerError::Plugin { protocol, source })
}

fn link_error(error: SinkError) -> LinkError {
    match error {
        SinkError::NotReady(_) => LinkError::NotReady,
        SinkError::AlreadySet | SinkError::Closed => LinkError::Closed,
    }
}

/// Request link handed to server-side plugins.
struct GatewayRequestLink {
    manager: Weak<Inner>,
    pending: Arc<PendingMap>,
    link: Link<Inbound, Outbound>,
}

#[async_trait]
impl RequestLink for GatewayRequestLink {
    async fn send(&self, mut request: Request) -> Result<PendingReply, LinkError> {
        let inner = self.manager.upgrade().ok_or(LinkError::Closed)?;
        match inner.state() {
            RUNNING => {}
            CREATED => return Err(LinkError::NotReady),
            _ => return Err(LinkError::Closed),
        }

        let sequence = if request.headers().operation().is_observe_family() {
            inner.sequencer.next_observe()
        } else {
            inner.sequencer.next_normal()
        };
        drop(inner);
        request.assign_sequence(sequence)?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(sequence, tx);
        if let Err(e) = self.link.send(Inbound::Request(request)).await {
            self.pending.remove(&sequence);
            return Err(link_error(e));
        }
        Ok(PendingReply::new(sequence, rx))
    }
}

/// Reply link handed to client-side plugins.
struct GatewayReplyLink {
    link: Link<Inbound, Outbound>,
}

#[async_trait]
impl ReplyLink for GatewayReplyLink {
    async fn send(&self, reply: Reply) -> Result<(), LinkError> {
        self.link
            .send(Inbound::Answer(reply.into()))
            .await
            .map_err(link_error)
    }

    async fn error(&self, error: ErrorReply) -> Result<(), LinkError> {
        self.link
            .send(Inbound::Answer(error.into()))
            .await
            .map_err(link_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use gateway_protocol::Operation;
    use std::sync::OnceLock;
    use std::sync::Mutex;
    use tenvis_gateway_plugin::memory::{SETTING_MAX_AGE_SECS, SETTING_NOTIFY_ON_UPDATE};
    use tenvis_gateway_plugin::{ClientSide, MemoryOrigin, MemoryTarget, Settings};

    const WAIT: Duration = Duration::from_secs(2);

    struct Gateway {
        manager: CommunicationManager,
        target: Arc<MemoryTarget>,
        http: Arc<MemoryOrigin>,
        mqtt: Arc<MemoryOrigin>,
    }

    async fn gateway(cache: Arc<dyn ReplyCache>) -> Gateway {
        let manager = CommunicationManager::with_cache(ManagerConfig::default(), cache);
        let target = Arc::new(MemoryTarget::new("coap"));
        target.insert("dev", "/temp", "20");
        target.settings().set(SETTING_MAX_AGE_SECS, 60i64).unwrap();
        let http = Arc::new(MemoryOrigin::new("http"));
        let mqtt = Arc::new(MemoryOrigin::new("mqtt"));

        manager.register(target.clone()).unwrap();
        manager.register(http.clone()).unwrap();
        manager.register(mqtt.clone()).unwrap();
        manager.start().await.unwrap();

        Gateway {
            manager,
            target,
            http,
            mqtt,
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    async fn call(origin: &MemoryOrigin, operation: Operation, path: &str) -> Result<Reply, LinkError> {
        origin
            .request(Request::new(operation, path))
            .await?
            .wait(WAIT)
            .await
    }

    fn rejected(result: Result<Reply, LinkError>) -> Reason {
        match result {
            Err(LinkError::Rejected(error)) => error.reason(),
            other => panic!("Expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_round_trip() {
        let gw = gateway(Arc::new(NoCache)).await;

        let pending = gw
            .http
            .request(Request::new(Operation::Read, "/coap/dev/temp"))
            .await
            .unwrap();
        let sequence = pending.sequence();
        assert!(!crate::sequence::is_observe(sequence));

        let reply = pending.wait(WAIT).await.unwrap();
        assert_eq!(reply.sequence(), sequence);
        assert_eq!(&reply.payload().as_bytes()[..], b"20");
        assert_eq!(gw.manager.stats().pending_replies, 0);
        assert_eq!(gw.manager.stats().dropped, 0);
    }

    #[tokio::test]
    async fn test_crud_through_gateway() {
        let gw = gateway(Arc::new(NoCache)).await;

        let created = Request::new(Operation::Create, "/coap/dev/led").with_payload("off");
        gw.http.request(created).await.unwrap().wait(WAIT).await.unwrap();
        assert_eq!(gw.target.resource("dev", "/led").as_deref(), Some(&b"off"[..]));

        let updated = Request::new(Operation::Update, "coap://dev/led").with_payload("on");
        gw.http.request(updated).await.unwrap().wait(WAIT).await.unwrap();
        assert_eq!(gw.target.resource("dev", "/led").as_deref(), Some(&b"on"[..]));

        call(&gw.http, Operation::Delete, "/coap/dev/led").await.unwrap();
        assert_eq!(
            rejected(call(&gw.http, Operation::Read, "/coap/dev/led").await),
            Reason::PathNotFound
        );
    }

    #[tokio::test]
    async fn test_invalid_uri_rejected() {
        let gw = gateway(Arc::new(NoCache)).await;
        assert_eq!(
            rejected(call(&gw.http, Operation::Read, "temp").await),
            Reason::InvalidUri
        );
    }

    #[tokio::test]
    async fn test_unavailable_plugin() {
        let gw = gateway(Arc::new(NoCache)).await;
        assert_eq!(
            rejected(call(&gw.http, Operation::Read, "/zigbee/dev/temp").await),
            Reason::UnavailablePlugin
        );
        // Server-only plugins cannot be targeted.
        assert_eq!(
            rejected(call(&gw.http, Operation::Read, "/mqtt/broker/temp").await),
            Reason::UnavailablePlugin
        );
    }

    #[tokio::test]
    async fn test_warm_cache_never_reaches_target() {
        let gw = gateway(Arc::new(MemoryCache::default())).await;

        call(&gw.http, Operation::Read, "/coap/dev/temp").await.unwrap();
        assert_eq!(gw.target.received(Operation::Read), 1);

        let pending = gw
            .mqtt
            .request(Request::new(Operation::Read, "/coap/dev/temp"))
            .await
            .unwrap();
        let sequence = pending.sequence();
        let reply = pending.wait(WAIT).await.unwrap();

        assert_eq!(reply.sequence(), sequence);
        assert_eq!(&reply.payload().as_bytes()[..], b"20");
        assert_eq!(gw.target.received(Operation::Read), 1);
    }

    #[tokio::test]
    async fn test_observe_lifecycle_reaches_target_once_each() {
        let gw = gateway(Arc::new(NoCache)).await;
        let uri = "coap://dev/temp";

        let first = call(&gw.http, Operation::Observe, "/coap/dev/temp").await.unwrap();
        assert!(crate::sequence::is_observe(first.sequence()));
        assert_eq!(&first.payload().as_bytes()[..], b"20");

        // Swallowed: answered by the next notification.
        let second = gw
            .mqtt
            .request(Request::new(Operation::Observe, "/coap/dev/temp"))
            .await
            .unwrap();
        let subscriptions = gw.manager.clone();
        eventually(|| subscriptions.subscriptions().observer_count(uri) == 2).await;

        gw.target.notify("dev", "/temp", "21").await.unwrap();
        let second = second.wait(WAIT).await.unwrap();
        assert_eq!(&second.payload().as_bytes()[..], b"21");

        let pushed = gw.http.next_pushed(WAIT).await.unwrap();
        assert_eq!(&pushed.payload().as_bytes()[..], b"21");
        assert_eq!(gw.mqtt.pushed_count(), 0);
        assert_eq!(gw.target.received(Operation::Observe), 1);

        // mqtt still observes: answered locally.
        call(&gw.http, Operation::Unobserve, "/coap/dev/temp").await.unwrap();
        assert_eq!(gw.target.received(Operation::Unobserve), 0);

        call(&gw.mqtt, Operation::Unobserve, "/coap/dev/temp").await.unwrap();
        assert_eq!(gw.target.received(Operation::Unobserve), 1);
        assert!(!gw.target.is_observed("dev", "/temp"));
        assert!(!gw.manager.subscriptions().contains(uri));
    }

    #[tokio::test]
    async fn test_update_ack_pushed_to_observers() {
        let manager = CommunicationManager::new(ManagerConfig::default());
        let target = Arc::new(MemoryTarget::new("coap"));
        target.insert("dev", "/temp", "20");
        target.settings().set(SETTING_NOTIFY_ON_UPDATE, false).unwrap();
        let http = Arc::new(MemoryOrigin::new("http"));
        let mqtt = Arc::new(MemoryOrigin::new("mqtt"));
        manager.register(target.clone()).unwrap();
        manager.register(http.clone()).unwrap();
        manager.register(mqtt.clone()).unwrap();
        manager.start().await.unwrap();

        call(&http, Operation::Observe, "/coap/dev/temp").await.unwrap();

        let update = Request::new(Operation::Update, "/coap/dev/temp").with_payload("22");
        let ack = mqtt.request(update).await.unwrap().wait(WAIT).await.unwrap();
        assert_eq!(ack.headers().operation(), Operation::Update);

        // No notification from the target: the ack itself reaches the observer.
        let pushed = http.next_pushed(WAIT).await.unwrap();
        assert_eq!(pushed.headers().operation(), Operation::Update);
        assert_eq!(mqtt.pushed_count(), 0);
        assert_eq!(target.resource("dev", "/temp").as_deref(), Some(&b"22"[..]));
        assert!(manager.subscriptions().contains("coap://dev/temp"));
    }

    /// Keeps every request and never answers on its own.
    struct Holding {
        settings: Settings,
        link: OnceLock<Arc<dyn ReplyLink>>,
        held: Mutex<Vec<Request>>,
    }

    #[async_trait]
    impl Plugin for Holding {
        fn protocol(&self) -> ProtocolName {
            ProtocolName::new("hold")
        }

        fn settings(&self) -> &Settings {
            &self.settings
        }

        async fn start(&self) -> Result<(), PluginError> {
            Ok(())
        }

        async fn stop(&self) -> Result<(), PluginError> {
            Ok(())
        }

        fn client(&self) -> Option<&dyn ClientSide> {
            Some(self)
        }
    }

    impl ClientSide for Holding {
        fn set_reply_link(&self, link: Arc<dyn ReplyLink>) {
            let _ = self.link.set(link);
        }

        fn handle_request(&self, request: Request) {
            self.held.lock().unwrap().push(request);
        }
    }

    #[tokio::test]
    async fn test_late_reply_after_caller_timeout_is_counted() {
        let manager = CommunicationManager::new(ManagerConfig::default());
        let origin = Arc::new(MemoryOrigin::new("http"));
        let holding = Arc::new(Holding {
            settings: Settings::new(),
            link: OnceLock::new(),
            held: Mutex::new(Vec::new()),
        });
        manager.register(origin.clone()).unwrap();
        manager.register(holding.clone()).unwrap();
        manager.start().await.unwrap();

        let pending = origin
            .request(Request::new(Operation::Read, "/hold/dev/x"))
            .await
            .unwrap();
        let result = pending.wait(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(LinkError::Timeout(_))));

        let watched = holding.clone();
        eventually(|| watched.held.lock().unwrap().len() == 1).await;
        assert_eq!(manager.stats().pending_replies, 1);

        let held = holding.held.lock().unwrap().pop().unwrap();
        let link = holding.link.get().cloned().unwrap();
        link.send(Reply::to(&held, "late")).await.unwrap();

        let watched = manager.clone();
        eventually(|| watched.stats().unmatched == 1).await;
        assert_eq!(manager.stats().pending_replies, 0);
        assert_eq!(manager.stats().faults, 0);
        assert_eq!(origin.pushed_count(), 0);
    }

    /// Answers every request twice.
    struct EchoTwice {
        settings: Settings,
        link: OnceLock<Arc<dyn ReplyLink>>,
    }

    #[async_trait]
    impl Plugin for EchoTwice {
        fn protocol(&self) -> ProtocolName {
            ProtocolName::new("echo")
        }

        fn settings(&self) -> &Settings {
            &self.settings
        }

        async fn start(&self) -> Result<(), PluginError> {
            Ok(())
        }

        async fn stop(&self) -> Result<(), PluginError> {
            Ok(())
        }

        fn client(&self) -> Option<&dyn ClientSide> {
            Some(self)
        }
    }

    impl ClientSide for EchoTwice {
        fn set_reply_link(&self, link: Arc<dyn ReplyLink>) {
            let _ = self.link.set(link);
        }

        fn handle_request(&self, request: Request) {
            let link = self.link.get().cloned().unwrap();
            tokio::spawn(async move {
                let reply = Reply::to(&request, "pong");
                link.send(reply.clone()).await.unwrap();
                link.send(reply).await.unwrap();
            });
        }
    }

    #[tokio::test]
    async fn test_duplicate_reply_resolves_once() {
        let manager = CommunicationManager::new(ManagerConfig::default());
        let origin = Arc::new(MemoryOrigin::new("http"));
        manager.register(origin.clone()).unwrap();
        manager
            .register(Arc::new(EchoTwice {
                settings: Settings::new(),
                link: OnceLock::new(),
            }))
            .unwrap();
        manager.start().await.unwrap();

        let reply = call(&origin, Operation::Read, "/echo/host/ping").await.unwrap();
        assert_eq!(&reply.payload().as_bytes()[..], b"pong");

        // The second copy finds no subscriber and is reported, not delivered.
        let watched = manager.clone();
        eventually(|| watched.stats().faults == 1).await;
        assert_eq!(manager.stats().pending_replies, 0);
        assert_eq!(origin.pushed_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests() {
        let gw = gateway(Arc::new(NoCache)).await;
        for i in 0..50 {
            gw.target.insert("dev", &format!("/r{i}"), format!("v{i}"));
        }

        let calls = (0..50).map(|i| {
            let http = gw.http.clone();
            async move {
                let reply = call(&http, Operation::Read, &format!("/coap/dev/r{i}"))
                    .await
                    .unwrap();
                assert_eq!(reply.payload().as_bytes(), format!("v{i}").as_bytes());
                reply.sequence()
            }
        });
        let mut sequences = join_all(calls).await;
        sequences.sort_unstable();
        sequences.dedup();
        assert_eq!(sequences.len(), 50);
    }

    #[tokio::test]
    async fn test_registration_rules() {
        let manager = CommunicationManager::new(ManagerConfig::default());
        manager.register(Arc::new(MemoryTarget::new("coap"))).unwrap();
        assert!(matches!(
            manager.register(Arc::new(MemoryTarget::new("CoAP"))),
            Err(ManagerError::AlreadyRegistered(_))
        ));
        manager.register(Arc::new(MemoryOrigin::new("http"))).unwrap();
        assert_eq!(
            manager.protocols(),
            vec![ProtocolName::new("coap"), ProtocolName::new("http")]
        );

        manager.start().await.unwrap();
        assert!(matches!(
            manager.register(Arc::new(MemoryOrigin::new("mqtt"))),
            Err(ManagerError::InvalidState("running"))
        ));
    }

    #[tokio::test]
    async fn test_settings_locked_on_start() {
        let manager = CommunicationManager::new(ManagerConfig::default());
        let target = Arc::new(MemoryTarget::new("coap"));
        manager.register(target.clone()).unwrap();

        assert!(!target.settings().is_locked());
        manager.start().await.unwrap();
        assert!(target.settings().is_locked());
        assert!(target.is_running());
    }

    /// Fails both to start and to stop.
    struct Broken {
        settings: Settings,
    }

    #[async_trait]
    impl Plugin for Broken {
        fn protocol(&self) -> ProtocolName {
            ProtocolName::new("broken")
        }

        fn settings(&self) -> &Settings {
            &self.settings
        }

        async fn start(&self) -> Result<(), PluginError> {
            Err(PluginError::Other("device missing".to_string()))
        }

        async fn stop(&self) -> Result<(), PluginError> {
            Err(PluginError::Other("device still missing".to_string()))
        }

        fn client(&self) -> Option<&dyn ClientSide> {
            Some(self)
        }
    }

    impl ClientSide for Broken {
        fn set_reply_link(&self, _link: Arc<dyn ReplyLink>) {}

        fn handle_request(&self, _request: Request) {}
    }

    #[tokio::test]
    async fn test_failed_start_stops_everything() {
        let manager = CommunicationManager::new(ManagerConfig::default());
        let target = Arc::new(MemoryTarget::new("coap"));
        manager.register(target.clone()).unwrap();
        manager
            .register(Arc::new(Broken {
                settings: Settings::new(),
            }))
            .unwrap();

        // The start failure is reported, not the failed cleanup.
        match manager.start().await {
            Err(ManagerError::Plugin { protocol, source }) => {
                assert_eq!(protocol, ProtocolName::new("broken"));
                assert!(source.to_string().contains("device missing"));
            }
            other => panic!("Expected plugin failure, got {:?}", other),
        }
        assert!(!manager.is_running());
        assert!(!target.is_running());
        assert!(matches!(
            manager.start().await,
            Err(ManagerError::InvalidState("stopped"))
        ));
    }

    #[tokio::test]
    async fn test_stop_rejects_requests() {
        let gw = gateway(Arc::new(NoCache)).await;
        gw.manager.stop().await.unwrap();

        assert!(!gw.manager.is_running());
        assert!(!gw.target.is_running());
        let result = gw
            .http
            .request(Request::new(Operation::Read, "/coap/dev/temp"))
            .await;
        assert!(matches!(result, Err(LinkError::Closed)));
        assert!(matches!(
            gw.manager.start().await,
            Err(ManagerError::InvalidState("stopped"))
        ));
    }

    #[tokio::test]
    async fn test_request_before_start_not_ready() {
        let manager = CommunicationManager::new(ManagerConfig::default());
        let origin = Arc::new(MemoryOrigin::new("http"));
        manager.register(origin.clone()).unwrap();

        let result = origin
            .request(Request::new(Operation::Read, "/coap/dev/temp"))
            .await;
        assert!(matches!(result, Err(LinkError::NotReady)));
    }

    /// Build an envelope that has travelled `hops` hops.
    fn travelled(manager: &CommunicationManager, message: impl Into<Message>, hops: u32) -> Envelope {
        let main = &manager.inner.main;
        let mut envelope = Envelope::new(main, message);
        for _ in 0..hops {
            envelope.pass(main).unwrap();
        }
        envelope
    }

    #[test]
    fn test_admit_follows_graph() {
        let manager = CommunicationManager::new(ManagerConfig::default());
        let graph = PipelineGraph::standard();

        let mut request = Request::new(Operation::Read, "/coap/dev/temp");
        request.assign_sequence(1).unwrap();
        let reply = Reply::to(&request, "20");

        for source in BlockId::ALL {
            for target in BlockId::ALL {
                // Envelopes that satisfy the manager's hop rules.
                let mut envelope = match source {
                    BlockId::OutputController => travelled(&manager, reply.clone(), 2),
                    _ => travelled(&manager, request.clone(), 2),
                };
                let admitted = manager.admit(source, target, &mut envelope).is_ok();
                assert_eq!(
                    admitted,
                    graph.can_forward(source, target),
                    "{source} -> {target}"
                );
            }
        }
    }

    #[test]
    fn test_admit_rejections() {
        let manager = CommunicationManager::new(ManagerConfig::default());
        let mut request = Request::new(Operation::Read, "/coap/dev/temp");
        request.assign_sequence(1).unwrap();
        let reply = Reply::to(&request, "20");

        // Foreign main token.
        let mut foreign = Envelope::new(&Token::mint(), request.clone());
        assert!(manager
            .admit(BlockId::CommunicationManager, BlockId::InputController, &mut foreign)
            .is_err());

        // Request back at the manager after the wrong number of hops.
        let mut early = travelled(&manager, request.clone(), 1);
        assert!(manager
            .admit(BlockId::InterconnectionController, BlockId::CommunicationManager, &mut early)
            .is_err());

        // Replies may arrive after three or four hops, not five.
        let mut direct = travelled(&manager, reply.clone(), 3);
        assert_eq!(
            manager.admit(BlockId::OutputController, BlockId::CommunicationManager, &mut direct),
            Ok(4)
        );
        let mut late = travelled(&manager, reply.clone(), 4);
        assert!(manager
            .admit(BlockId::OutputController, BlockId::CommunicationManager, &mut late)
            .is_err());

        // A request never leaves through the output controller.
        let mut wrong_kind = travelled(&manager, request, 2);
        assert!(manager
            .admit(BlockId::OutputController, BlockId::CommunicationManager, &mut wrong_kind)
            .is_err());
    }
}
