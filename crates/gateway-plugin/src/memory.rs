//! In-memory plugins.
//!
//! [`MemoryTarget`] is a client-capable plugin serving a resource map, and
//! [`MemoryOrigin`] is a server-capable plugin that submits requests and
//! collects observe notifications. Neither touches the network; they back
//! the default server configuration, the benches and the routing tests.

use crate::settings::{SettingSpec, Settings};
use crate::traits::{
    ClientSide, LinkError, PendingReply, Plugin, PluginError, ProtocolName, ReplyLink,
    RequestLink, ServerSide,
};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use gateway_protocol::{ErrorReply, Operation, Reason, Reply, Request};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, trace, warn};

/// Setting: seconds a READ reply may be cached, 0 disables the hint.
pub const SETTING_MAX_AGE_SECS: &str = "max_age_secs";

/// Setting: push a notification to observers after every UPDATE.
pub const SETTING_NOTIFY_ON_UPDATE: &str = "notify_on_update";

/// Per-operation request counters.
#[derive(Debug, Default)]
struct OperationCounters {
    counts: DashMap<Operation, usize>,
}

impl OperationCounters {
    fn record(&self, operation: Operation) {
        *self.counts.entry(operation).or_insert(0) += 1;
    }

    fn get(&self, operation: Operation) -> usize {
        self.counts.get(&operation).map(|c| *c).unwrap_or(0)
    }
}

fn resource_key(target: &str, path: &str) -> String {
    format!("{target}{path}")
}

/// A client-capable plugin serving resources from memory.
pub struct MemoryTarget {
    protocol: ProtocolName,
    settings: Settings,
    resources: DashMap<String, Bytes>,
    observed: DashSet<String>,
    counters: OperationCounters,
    reply_link: OnceLock<Arc<dyn ReplyLink>>,
    running: AtomicBool,
}

impl MemoryTarget {
    /// Create a target plugin speaking `protocol`.
    #[must_use]
    pub fn new(protocol: impl Into<ProtocolName>) -> Self {
        Self {
            protocol: protocol.into(),
            settings: Settings::new()
                .declare(
                    SETTING_MAX_AGE_SECS,
                    SettingSpec::integer().range(0, 86_400).default_value(0i64),
                )
                .declare(
                    SETTING_NOTIFY_ON_UPDATE,
                    SettingSpec::bool().default_value(true),
                ),
            resources: DashMap::new(),
            observed: DashSet::new(),
            counters: OperationCounters::default(),
            reply_link: OnceLock::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Seed a resource at `target` + `path`.
    pub fn insert(&self, target: &str, path: &str, value: impl Into<Bytes>) {
        self.resources.insert(resource_key(target, path), value.into());
    }

    /// Get the current value of a resource.
    #[must_use]
    pub fn resource(&self, target: &str, path: &str) -> Option<Bytes> {
        self.resources
            .get(&resource_key(target, path))
            .map(|v| v.clone())
    }

    /// Number of requests received with `operation`.
    #[must_use]
    pub fn received(&self, operation: Operation) -> usize {
        self.counters.get(operation)
    }

    /// Check if a resource currently has observers.
    #[must_use]
    pub fn is_observed(&self, target: &str, path: &str) -> bool {
        self.observed.contains(&resource_key(target, path))
    }

    /// Check if the plugin is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Update a resource and push a notification to its observers.
    ///
    /// # Errors
    ///
    /// Returns an error if the reply link is not wired or closed.
    pub async fn notify(
        &self,
        target: &str,
        path: &str,
        value: impl Into<Bytes>,
    ) -> Result<(), LinkError> {
        let value = value.into();
        self.resources
            .insert(resource_key(target, path), value.clone());
        let link = self.reply_link.get().ok_or(LinkError::NotReady)?;
        let notification = Reply::notification(Operation::Observe, target, path)
            .payload(value)
            .build();
        link.send(notification).await
    }

    fn max_age(&self) -> Option<Duration> {
        match self.settings.get_integer(SETTING_MAX_AGE_SECS) {
            Some(secs) if secs > 0 => Some(Duration::from_secs(secs.unsigned_abs())),
            _ => None,
        }
    }

    /// Compute the answer for a request, plus an optional notification.
    fn answer(&self, request: &Request) -> (Result<Reply, ErrorReply>, Option<Reply>) {
        let headers = request.headers();
        let key = resource_key(headers.target(), headers.path());
        let not_found = || ErrorReply::for_request(request, Reason::PathNotFound).with_detail(key.clone());

        match headers.operation() {
            Operation::Read => match self.resources.get(&key) {
                Some(value) => {
                    let mut builder = Reply::builder(request).payload(value.clone());
                    if let Some(max_age) = self.max_age() {
                        builder = builder.max_age(max_age);
                    }
                    (Ok(builder.build()), None)
                }
                None => (Err(not_found()), None),
            },
            Operation::Create => {
                self.resources
                    .insert(key.clone(), request.payload().as_bytes().clone());
                (Ok(Reply::to(request, Bytes::new())), None)
            }
            Operation::Update => {
                let Some(mut value) = self.resources.get_mut(&key) else {
                    return (Err(not_found()), None);
                };
                *value = request.payload().as_bytes().clone();
                let notification = (self.observed.contains(&key)
                    && self.settings.get_bool(SETTING_NOTIFY_ON_UPDATE).unwrap_or(true))
                .then(|| {
                    Reply::notification(Operation::Observe, headers.target(), headers.path())
                        .payload(value.clone())
                        .build()
                });
                (Ok(Reply::to(request, Bytes::new())), notification)
            }
            Operation::Delete => match self.resources.remove(&key) {
                Some(_) => {
                    self.observed.remove(&key);
                    (Ok(Reply::to(request, Bytes::new())), None)
                }
                None => (Err(not_found()), None),
            },
            Operation::Observe => match self.resources.get(&key) {
                Some(value) => {
                    self.observed.insert(key.clone());
                    (Ok(Reply::to(request, value.clone())), None)
                }
                None => (Err(not_found()), None),
            },
            Operation::Unobserve => {
                self.observed.remove(&key);
                (Ok(Reply::to(request, Bytes::new())), None)
            }
        }
    }
}

#[async_trait]
impl Plugin for MemoryTarget {
    fn protocol(&self) -> ProtocolName {
        self.protocol.clone()
    }

    fn settings(&self) -> &Settings {
        &self.settings
    }

    async fn start(&self) -> Result<(), PluginError> {
        self.running.store(true, Ordering::Release);
        info!(protocol = %self.protocol, resources = self.resources.len(), "Memory target started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), PluginError> {
        self.running.store(false, Ordering::Release);
        info!(protocol = %self.protocol, "Memory target stopped");
        Ok(())
    }

    fn client(&self) -> Option<&dyn ClientSide> {
        Some(self)
    }
}

impl ClientSide for MemoryTarget {
    fn set_reply_link(&self, link: Arc<dyn ReplyLink>) {
        if self.reply_link.set(link).is_err() {
            warn!(protocol = %self.protocol, "Reply link already set");
        }
    }

    fn handle_request(&self, request: Request) {
        let operation = request.headers().operation();
        self.counters.record(operation);
        trace!(
            protocol = %self.protocol,
            operation = %operation,
            path = %request.headers().path(),
            "Handling request"
        );

        let Some(link) = self.reply_link.get().cloned() else {
            warn!(protocol = %self.protocol, "Request dropped, reply link not set");
            return;
        };

        let (answer, notification) = self.answer(&request);
        tokio::spawn(async move {
            let sent = match answer {
                Ok(reply) => link.send(reply).await,
                Err(error) => link.error(error).await,
            };
            if let Err(e) = sent {
                debug!(error = %e, "Failed to return answer");
                return;
            }
            if let Some(notification) = notification {
                if let Err(e) = link.send(notification).await {
                    debug!(error = %e, "Failed to push notification");
                }
            }
        });
    }
}

/// A server-capable plugin that originates requests from code.
pub struct MemoryOrigin {
    protocol: ProtocolName,
    settings: Settings,
    request_link: OnceLock<Arc<dyn RequestLink>>,
    pushed_tx: mpsc::UnboundedSender<Reply>,
    pushed_rx: Mutex<mpsc::UnboundedReceiver<Reply>>,
    pushed_count: AtomicUsize,
}

impl MemoryOrigin {
    /// Create an origin plugin speaking `protocol`.
    #[must_use]
    pub fn new(protocol: impl Into<ProtocolName>) -> Self {
        let (pushed_tx, pushed_rx) = mpsc::unbounded_channel();
        Self {
            protocol: protocol.into(),
            settings: Settings::new(),
            request_link: OnceLock::new(),
            pushed_tx,
            pushed_rx: Mutex::new(pushed_rx),
            pushed_count: AtomicUsize::new(0),
        }
    }

    /// Submit a request through the gateway.
    ///
    /// # Errors
    ///
    /// Returns an error if the plugin is not registered or the gateway
    /// refused the request.
    pub async fn request(&self, request: Request) -> Result<PendingReply, LinkError> {
        let link = self.request_link.get().ok_or(LinkError::NotReady)?;
        link.send(request).await
    }

    /// Number of standing replies received so far.
    #[must_use]
    pub fn pushed_count(&self) -> usize {
        self.pushed_count.load(Ordering::Acquire)
    }

    /// Wait for the next standing reply.
    pub async fn next_pushed(&self, timeout: Duration) -> Option<Reply> {
        let mut rx = self.pushed_rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }
}

#[async_trait]
impl Plugin for MemoryOrigin {
    fn protocol(&self) -> ProtocolName {
        self.protocol.clone()
    }

    fn settings(&self) -> &Settings {
        &self.settings
    }

    async fn start(&self) -> Result<(), PluginError> {
        info!(protocol = %self.protocol, "Memory origin started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), PluginError> {
        info!(protocol = %self.protocol, "Memory origin stopped");
        Ok(())
    }

    fn server(&self) -> Option<&dyn ServerSide> {
        Some(self)
    }
}

impl ServerSide for MemoryOrigin {
    fn set_request_link(&self, link: Arc<dyn RequestLink>) {
        if self.request_link.set(link).is_err() {
            warn!(protocol = %self.protocol, "Request link already set");
        }
    }

    fn handle_reply(&self, reply: Reply) {
        trace!(protocol = %self.protocol, path = %reply.headers().path(), "Standing reply");
        self.pushed_count.fetch_add(1, Ordering::AcqRel);
        let _ = self.pushed_tx.send(reply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingLink {
        replies: StdMutex<Vec<Reply>>,
        errors: StdMutex<Vec<ErrorReply>>,
    }

    #[async_trait]
    impl ReplyLink for RecordingLink {
        async fn send(&self, reply: Reply) -> Result<(), LinkError> {
            self.replies.lock().unwrap().push(reply);
            Ok(())
        }

        async fn error(&self, error: ErrorReply) -> Result<(), LinkError> {
            self.errors.lock().unwrap().push(error);
            Ok(())
        }
    }

    fn sequenced(operation: Operation, path: &str, payload: &'static str) -> Request {
        let mut request = Request::new(operation, path).with_payload(payload);
        request.headers_mut().set_target("dev").unwrap();
        request.assign_sequence(1).unwrap();
        request
    }

    #[test]
    fn test_crud_answers() {
        let target = MemoryTarget::new("coap");

        let (answer, _) = target.answer(&sequenced(Operation::Read, "/led", ""));
        assert_eq!(answer.unwrap_err().reason(), Reason::PathNotFound);

        let (answer, _) = target.answer(&sequenced(Operation::Create, "/led", "off"));
        assert!(answer.is_ok());
        assert_eq!(target.resource("dev", "/led").as_deref(), Some(&b"off"[..]));

        let (answer, _) = target.answer(&sequenced(Operation::Update, "/led", "on"));
        assert!(answer.is_ok());

        let (answer, _) = target.answer(&sequenced(Operation::Read, "/led", ""));
        assert_eq!(&answer.unwrap().payload().as_bytes()[..], b"on");

        let (answer, _) = target.answer(&sequenced(Operation::Delete, "/led", ""));
        assert!(answer.is_ok());
        assert!(target.resource("dev", "/led").is_none());
    }

    #[test]
    fn test_update_notifies_observers() {
        let target = MemoryTarget::new("coap");
        target.insert("dev", "/temp", "20");

        let (_, notification) = target.answer(&sequenced(Operation::Update, "/temp", "21"));
        assert!(notification.is_none());

        let (answer, _) = target.answer(&sequenced(Operation::Observe, "/temp", ""));
        assert_eq!(&answer.unwrap().payload().as_bytes()[..], b"21");
        assert!(target.is_observed("dev", "/temp"));

        let (_, notification) = target.answer(&sequenced(Operation::Update, "/temp", "22"));
        let notification = notification.unwrap();
        assert_eq!(notification.headers().operation(), Operation::Observe);
        assert_eq!(notification.sequence(), 0);
        assert_eq!(&notification.payload().as_bytes()[..], b"22");

        target.answer(&sequenced(Operation::Unobserve, "/temp", ""));
        assert!(!target.is_observed("dev", "/temp"));
    }

    #[test]
    fn test_max_age_hint() {
        let target = MemoryTarget::new("coap");
        target.settings().set(SETTING_MAX_AGE_SECS, 30i64).unwrap();
        target.insert("dev", "/temp", "20");

        let (answer, _) = target.answer(&sequenced(Operation::Read, "/temp", ""));
        assert_eq!(
            answer.unwrap().headers().max_age(),
            Some(Duration::from_secs(30))
        );
    }

    #[tokio::test]
    async fn test_handle_request_replies_through_link() {
        let target = MemoryTarget::new("coap");
        let link = Arc::new(RecordingLink::default());
        target.set_reply_link(link.clone());
        target.insert("dev", "/temp", "20");

        target.handle_request(sequenced(Operation::Read, "/temp", ""));
        target.handle_request(sequenced(Operation::Read, "/missing", ""));

        for _ in 0..100 {
            if link.replies.lock().unwrap().len() == 1 && link.errors.lock().unwrap().len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(link.replies.lock().unwrap().len(), 1);
        assert_eq!(link.errors.lock().unwrap().len(), 1);
        assert_eq!(target.received(Operation::Read), 2);
    }

    #[tokio::test]
    async fn test_origin_without_link() {
        let origin = MemoryOrigin::new("http");
        let result = origin.request(Request::new(Operation::Read, "/coap/dev/temp")).await;
        assert!(matches!(result, Err(LinkError::NotReady)));

        let request = sequenced(Operation::Read, "/temp", "");
        origin.handle_reply(Reply::to(&request, "1"));
        assert_eq!(origin.pushed_count(), 1);
        assert!(origin.next_pushed(Duration::from_millis(10)).await.is_some());
    }
}
