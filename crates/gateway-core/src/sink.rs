//! Serialized two-way event bus.
//!
//! A sink joins two [`Link`]s. A value sent on one link is delivered to the
//! listener of the other link. One consumer task per sink runs every
//! delivery in submission order, so deliveries never overlap, in either
//! direction.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, trace, warn};

/// Default bounded wait for both listeners to be registered.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Sink errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SinkError {
    /// Both listeners were not registered in time.
    #[error("Sink not ready after {0:?}")]
    NotReady(Duration),

    /// The link already has a listener.
    #[error("Listener already set")]
    AlreadySet,

    /// The sink was closed.
    #[error("Sink closed")]
    Closed,
}

/// Result of a listener invocation. Errors are logged and discarded.
pub type ListenerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

type Listener<T> = Arc<dyn Fn(T) -> ListenerResult + Send + Sync>;
type Delivery = Box<dyn FnOnce() + Send>;

struct Shared {
    name: Arc<str>,
    ready_timeout: Duration,
    /// Number of registered listeners, 0 to 2.
    listeners: watch::Sender<u8>,
    closed: AtomicBool,
}

/// One end of a sink. Sends `S`, receives `R`.
pub struct Link<S, R> {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Delivery>,
    own: Arc<OnceLock<Listener<R>>>,
    peer: Arc<OnceLock<Listener<S>>>,
}

/// Create a sink and spawn its consumer task.
///
/// Must be called within a tokio runtime.
pub fn sink<A, B>(name: impl Into<Arc<str>>, ready_timeout: Duration) -> (Link<A, B>, Link<B, A>)
where
    A: Send + 'static,
    B: Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
    let (listeners, _) = watch::channel(0u8);
    let shared = Arc::new(Shared {
        name: name.into(),
        ready_timeout,
        listeners,
        closed: AtomicBool::new(false),
    });

    let consumer = shared.clone();
    tokio::spawn(async move {
        while let Some(delivery) = rx.recv().await {
            if consumer.closed.load(Ordering::Acquire) {
                break;
            }
            delivery();
        }
        debug!(sink = %consumer.name, "Sink consumer stopped");
    });

    let a_listener: Arc<OnceLock<Listener<B>>> = Arc::new(OnceLock::new());
    let b_listener: Arc<OnceLock<Listener<A>>> = Arc::new(OnceLock::new());

    let a = Link {
        shared: shared.clone(),
        tx: tx.clone(),
        own: a_listener.clone(),
        peer: b_listener.clone(),
    };
    let b = Link {
        shared,
        tx,
        own: b_listener,
        peer: a_listener,
    };
    (a, b)
}

impl<S, R> Link<S, R>
where
    S: Send + 'static,
    R: Send + 'static,
{
    /// Register the listener for values sent by the other link.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::AlreadySet`] on a second call.
    pub fn set_listener<F>(&self, listener: F) -> Result<(), SinkError>
    where
        F: Fn(R) -> ListenerResult + Send + Sync + 'static,
    {
        self.own
            .set(Arc::new(listener))
            .map_err(|_| SinkError::AlreadySet)?;
        self.shared.listeners.send_modify(|n| *n += 1);
        trace!(sink = %self.shared.name, "Listener registered");
        Ok(())
    }

    /// Queue a value for the other link's listener.
    ///
    /// Waits up to the ready timeout for both listeners to be registered.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::NotReady`] if the listeners are still missing
    /// after the wait, or [`SinkError::Closed`] after [`Link::close`].
    pub async fn send(&self, value: S) -> Result<(), SinkError> {
        self.ready().await?;

        let peer = self.peer.clone();
        let name = self.shared.name.clone();
        let delivery: Delivery = Box::new(move || {
            if let Some(listener) = peer.get() {
                deliver(&name, listener, value);
            }
        });
        self.tx.send(delivery).map_err(|_| SinkError::Closed)
    }

    async fn ready(&self) -> Result<(), SinkError> {
        if self.is_closed() {
            return Err(SinkError::Closed);
        }
        let mut rx = self.shared.listeners.subscribe();
        let timeout = self.shared.ready_timeout;
        let waited = tokio::time::timeout(timeout, async move {
            rx.wait_for(|n| *n >= 2).await.map(|_| ())
        })
        .await;

        match waited {
            Ok(Ok(())) if !self.is_closed() => Ok(()),
            Ok(_) => Err(SinkError::Closed),
            Err(_) => {
                warn!(sink = %self.shared.name, timeout = ?timeout, "Sink not ready");
                Err(SinkError::NotReady(timeout))
            }
        }
    }

    /// Close the sink. Queued deliveries are discarded and later sends fail.
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            // Wake the consumer so it observes the flag.
            let _ = self.tx.send(Box::new(|| {}));
            debug!(sink = %self.shared.name, "Sink closed");
        }
    }

    /// Check if the sink was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl<S, R> Clone for Link<S, R> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            tx: self.tx.clone(),
            own: self.own.clone(),
            peer: self.peer.clone(),
        }
    }
}

impl<S, R> fmt::Debug for Link<S, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("sink", &self.shared.name)
            .field("listener_set", &self.own.get().is_some())
            .field("closed", &self.shared.closed.load(Ordering::Relaxed))
            .finish()
    }
}

fn deliver<T>(sink: &str, listener: &Listener<T>, value: T) {
    match catch_unwind(AssertUnwindSafe(|| listener(value))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(sink = %sink, error = %e, "Listener failed"),
        Err(_) => error!(sink = %sink, "Listener panicked"),
    }
}
