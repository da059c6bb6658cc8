//! Pull-based, cancellable view over push-style event sources.
//!
//! [`EventStream`] turns bus subscriptions (or an interval producer) into a
//! [`Stream`] of payloads for a single consumer. Subscription is deferred
//! until the first poll, so a stream that is never read never touches the
//! bus.
//!
//! Incoming payloads are buffered in an unbounded queue so a fast
//! publisher never blocks. A stalled consumer therefore grows the queue
//! without limit; operations are cancelled on disconnect, which bounds the
//! exposure to the lifetime of a connection.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use futures_util::Stream;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::bus::{Callback, PubSubEngine, SubscriptionHandle};
use crate::error::PubSubError;

/// Item carried by the bridge queue.
#[derive(Debug)]
enum Signal {
    Event(Value),
    /// Terminal sentinel; the stream ends when it is dequeued.
    End,
}

/// Builds the payload of the `n`-th interval tick (starting at 1).
pub type TickPayload = Arc<dyn Fn(u64) -> Value + Send + Sync>;

/// Payload predicate applied by [`EventStream::filter`].
pub type PayloadFilter = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

enum Source {
    Topics {
        engine: Arc<dyn PubSubEngine>,
        topics: Vec<String>,
    },
    Interval {
        period: Duration,
        limit: Option<u64>,
        payload: TickPayload,
    },
}

/// State shared between the stream and its [`StreamCloser`]s.
struct Shared {
    closed: AtomicBool,
    queue: mpsc::UnboundedSender<Signal>,
    handles: Mutex<Vec<SubscriptionHandle>>,
    engine: Option<Arc<dyn PubSubEngine>>,
    producer: CancellationToken,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.queue.send(Signal::End);
        self.producer.cancel();
        let handles = std::mem::take(&mut *self.handles.lock());
        if let Some(engine) = &self.engine {
            for handle in handles {
                engine.unsubscribe(handle);
            }
        }
    }

    /// Records a fresh subscription, or drops it at once if the stream was
    /// closed while the subscribe call was in flight.
    fn register(&self, handle: SubscriptionHandle) {
        let mut handles = self.handles.lock();
        if self.is_closed() {
            drop(handles);
            if let Some(engine) = &self.engine {
                engine.unsubscribe(handle);
            }
            return;
        }
        handles.push(handle);
    }
}

/// Bridges push-style event sources into a pull-based [`Stream`] of
/// payloads.
///
/// The stream ends after [`close`](Self::close) (or a
/// [`StreamCloser::close`] from another task); a closed stream cannot be
/// restarted. Dropping the stream closes it and releases its bus
/// subscriptions.
pub struct EventStream {
    shared: Arc<Shared>,
    rx: mpsc::UnboundedReceiver<Signal>,
    source: Option<Source>,
    starting: Option<BoxFuture<'static, ()>>,
    filter: Option<PayloadFilter>,
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("closed", &self.shared.is_closed())
            .field("started", &self.source.is_none())
            .field("subscriptions", &self.shared.handles.lock().len())
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

impl EventStream {
    fn with_source(source: Source) -> Self {
        let engine = match &source {
            Source::Topics { engine, .. } => Some(Arc::clone(engine)),
            Source::Interval { .. } => None,
        };
        let (queue, rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                closed: AtomicBool::new(false),
                queue,
                handles: Mutex::new(Vec::new()),
                engine,
                producer: CancellationToken::new(),
            }),
            rx,
            source: Some(source),
            starting: None,
            filter: None,
        }
    }

    /// Creates a stream over every payload published on `topics`.
    pub fn topics<I, S>(engine: Arc<dyn PubSubEngine>, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_source(Source::Topics {
            engine,
            topics: topics.into_iter().map(Into::into).collect(),
        })
    }

    /// Creates a stream fed by a producer task that emits `payload(n)` every
    /// `period`, ending after `limit` ticks when a limit is given.
    ///
    /// The first tick fires one full `period` after the first poll.
    pub fn interval<F>(period: Duration, limit: Option<u64>, payload: F) -> Self
    where
        F: Fn(u64) -> Value + Send + Sync + 'static,
    {
        Self::with_source(Source::Interval {
            period,
            limit,
            payload: Arc::new(payload),
        })
    }

    /// Only yields payloads for which `predicate` returns `true`.
    #[must_use]
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(predicate));
        self
    }

    /// Returns a handle that can close this stream from another task.
    #[must_use]
    pub fn closer(&self) -> StreamCloser {
        StreamCloser {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Ends the stream and releases every bus subscription it holds.
    ///
    /// Idempotent. A pending poll resolves to end-of-stream.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Returns `true` once the stream has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    fn start(&self, source: Source) -> BoxFuture<'static, ()> {
        let shared = Arc::clone(&self.shared);
        match source {
            Source::Topics { engine, topics } => Box::pin(subscribe_all(engine, topics, shared)),
            Source::Interval {
                period,
                limit,
                payload,
            } => {
                tokio::spawn(produce_ticks(period, limit, payload, shared));
                Box::pin(async {})
            }
        }
    }
}

impl Stream for EventStream {
    type Item = Value;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.shared.is_closed() {
                return Poll::Ready(None);
            }
            if let Some(source) = this.source.take() {
                this.starting = Some(this.start(source));
            }
            if let Some(starting) = this.starting.as_mut() {
                ready!(starting.as_mut().poll(cx));
                this.starting = None;
                continue;
            }
            match ready!(this.rx.poll_recv(cx)) {
                Some(Signal::Event(payload)) => {
                    if this.filter.as_ref().is_none_or(|keep| keep(&payload)) {
                        return Poll::Ready(Some(payload));
                    }
                }
                Some(Signal::End) | None => return Poll::Ready(None),
            }
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Cloneable handle that closes an [`EventStream`] from outside its
/// consumer.
#[derive(Clone)]
pub struct StreamCloser {
    shared: Arc<Shared>,
}

impl fmt::Debug for StreamCloser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCloser")
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

impl StreamCloser {
    /// Closes the stream. See [`EventStream::close`].
    pub fn close(&self) {
        self.shared.close();
    }

    /// Returns `true` once the stream has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

async fn subscribe_all(engine: Arc<dyn PubSubEngine>, topics: Vec<String>, shared: Arc<Shared>) {
    for topic in topics {
        if shared.is_closed() {
            return;
        }
        let queue = shared.queue.clone();
        let callback: Callback = Arc::new(move |payload: &Value| -> Result<(), PubSubError> {
            queue
                .send(Signal::Event(payload.clone()))
                .map_err(|_| PubSubError::Callback("event stream dropped".to_string()))
        });
        match engine.subscribe(&topic, callback).await {
            Ok(handle) => shared.register(handle),
            Err(err) => {
                tracing::warn!(%topic, error = %err, "event stream subscription failed");
                shared.close();
                return;
            }
        }
    }
}

async fn produce_ticks(
    period: Duration,
    limit: Option<u64>,
    payload: TickPayload,
    shared: Arc<Shared>,
) {
    if limit == Some(0) {
        let _ = shared.queue.send(Signal::End);
        return;
    }
    let start = tokio::time::Instant::now() + period;
    let mut ticker = tokio::time::interval_at(start, period);
    let mut count: u64 = 0;
    loop {
        tokio::select! {
            () = shared.producer.cancelled() => return,
            _ = ticker.tick() => {
                count = count.saturating_add(1);
                if shared.queue.send(Signal::Event(payload(count))).is_err() {
                    return;
                }
                if limit.is_some_and(|limit| count >= limit) {
                    let _ = shared.queue.send(Signal::End);
                    return;
                }
            }
        }
    }
}
