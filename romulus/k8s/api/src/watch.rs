use futures::prelude::*;
use kube::runtime::watcher::{self, Event};
use std::pin::Pin;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type EventStream<T> = Pin<Box<dyn Stream<Item = watcher::Result<Event<T>>> + Send + 'static>>;

type Connect<T> = Box<dyn FnMut() -> EventStream<T> + Send + 'static>;

type OnError = Box<dyn Fn(&watcher::Error) + Send + Sync + 'static>;

/// Connection state of a [`Watch`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    /// No stream is open.
    Disconnected,

    /// A stream was opened and has not yet produced an event.
    Connecting,

    /// The stream is producing events.
    Watching,
}

/// A watch that reconnects after failures until it is shut down.
///
/// Each failure or end of stream drops the underlying stream and waits for the
/// reconnect delay before opening a new one. A new stream re-lists, so
/// consumers observe a fresh `Init` .. `InitDone` sequence.
///
/// With a relist interval, a healthy stream is also replaced once the
/// interval elapses, so that every live object is observed again.
pub struct Watch<T> {
    state: State,
    connect: Connect<T>,
    rx: Option<EventStream<T>>,
    failed: bool,
    reconnect_delay: time::Duration,
    relist_interval: Option<time::Duration>,
    relist_at: Option<time::Instant>,
    shutdown: CancellationToken,
    on_error: Option<OnError>,
    span: tracing::Span,
}

// === impl Watch ===

impl<T: Send + 'static> Watch<T> {
    pub const DEFAULT_RECONNECT_DELAY: time::Duration = time::Duration::from_secs(1);

    pub fn new<F, S>(mut connect: F, shutdown: CancellationToken) -> Self
    where
        F: FnMut() -> S + Send + 'static,
        S: Stream<Item = watcher::Result<Event<T>>> + Send + 'static,
    {
        Self {
            state: State::Disconnected,
            connect: Box::new(move || connect().boxed()),
            rx: None,
            failed: false,
            reconnect_delay: Self::DEFAULT_RECONNECT_DELAY,
            relist_interval: None,
            relist_at: None,
            shutdown,
            on_error: None,
            span: tracing::Span::current(),
        }
    }

    pub fn with_reconnect_delay(mut self, delay: time::Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Reopens the stream every `interval`, even when it is healthy.
    pub fn with_relist_interval(mut self, interval: time::Duration) -> Self {
        self.relist_interval = Some(interval);
        self
    }

    /// Registers a callback that observes every watch failure.
    pub fn on_error(mut self, f: impl Fn(&watcher::Error) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn instrument(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Receives the next event, reconnecting as needed.
    ///
    /// Returns `None` once shutdown has been signaled.
    pub async fn recv(&mut self) -> Option<Event<T>> {
        loop {
            if self.shutdown.is_cancelled() {
                self.disconnect();
                return None;
            }

            if self.rx.is_none() {
                if self.failed {
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => continue,
                        _ = time::sleep(self.reconnect_delay) => {}
                    }
                }
                debug!(parent: &self.span, "Connecting");
                self.rx = Some((self.connect)());
                self.relist_at = self.relist_interval.map(|i| time::Instant::now() + i);
                self.state = State::Connecting;
                continue;
            }

            let relist_due = relist(self.relist_at);
            let next = match self.rx.as_mut() {
                Some(rx) => tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => continue,
                    _ = relist_due => {
                        debug!(parent: &self.span, "Relisting");
                        self.disconnect();
                        self.failed = false;
                        continue;
                    }
                    ev = rx.next() => ev,
                },
                None => continue,
            };

            match next {
                Some(Ok(ev)) => {
                    if self.state == State::Connecting {
                        info!(parent: &self.span, "Watching");
                        self.state = State::Watching;
                    }
                    return Some(ev);
                }
                Some(Err(error)) => {
                    warn!(parent: &self.span, %error, "Watch failed");
                    if let Some(on_error) = self.on_error.as_ref() {
                        on_error(&error);
                    }
                    self.fail();
                }
                None => {
                    info!(parent: &self.span, "Watch stream ended");
                    self.fail();
                }
            }
        }
    }

    /// Converts the watch into a stream that ends on shutdown.
    pub fn into_stream(self) -> impl Stream<Item = Event<T>> + Send + 'static {
        stream::unfold(self, |mut watch| async move {
            let ev = watch.recv().await?;
            Some((ev, watch))
        })
    }

    fn fail(&mut self) {
        self.disconnect();
        self.failed = true;
    }

    fn disconnect(&mut self) {
        self.rx = None;
        self.relist_at = None;
        self.state = State::Disconnected;
    }
}

async fn relist(at: Option<time::Instant>) {
    match at {
        Some(at) => time::sleep_until(at).await,
        None => future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    fn failure() -> watcher::Error {
        watcher::Error::NoResourceVersion
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_failure() {
        let connects = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        let mut watch = Watch::<u32>::new(
            {
                let connects = connects.clone();
                move || {
                    let n = connects.fetch_add(1, Ordering::SeqCst) as u32;
                    stream::iter(vec![Ok(Event::Apply(n)), Err(failure())])
                }
            },
            shutdown.clone(),
        )
        .on_error({
            let errors = errors.clone();
            move |_| {
                errors.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert_eq!(watch.state(), State::Disconnected);
        assert!(matches!(watch.recv().await, Some(Event::Apply(0))));
        assert_eq!(watch.state(), State::Watching);

        // The failure drops the stream; the next event comes from a new
        // connection after the reconnect delay.
        let start = time::Instant::now();
        assert!(matches!(watch.recv().await, Some(Event::Apply(1))));
        assert!(start.elapsed() >= Watch::<u32>::DEFAULT_RECONNECT_DELAY);
        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn relists_periodically() {
        let connects = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();
        let interval = time::Duration::from_secs(3600);

        let mut watch = Watch::<u32>::new(
            {
                let connects = connects.clone();
                move || {
                    let n = connects.fetch_add(1, Ordering::SeqCst) as u32;
                    stream::iter(vec![
                        Ok(Event::Init),
                        Ok(Event::InitApply(n)),
                        Ok(Event::InitDone),
                    ])
                    .chain(stream::pending())
                }
            },
            shutdown.clone(),
        )
        .with_relist_interval(interval);

        assert!(matches!(watch.recv().await, Some(Event::Init)));
        assert!(matches!(watch.recv().await, Some(Event::InitApply(0))));
        assert!(matches!(watch.recv().await, Some(Event::InitDone)));

        // The healthy stream is replaced once the interval elapses, without
        // waiting for the reconnect delay.
        let start = time::Instant::now();
        assert!(matches!(watch.recv().await, Some(Event::Init)));
        assert_eq!(start.elapsed(), interval);
        assert!(matches!(watch.recv().await, Some(Event::InitApply(1))));
        assert_eq!(connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_ends_stream() {
        let shutdown = CancellationToken::new();
        let watch = Watch::<u32>::new(
            || stream::pending::<watcher::Result<Event<u32>>>(),
            shutdown.clone(),
        );
        let mut stream = Box::pin(watch.into_stream());

        let next = tokio::spawn(async move { stream.next().await });
        tokio::task::yield_now().await;
        shutdown.cancel();
        assert!(next.await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_reconnect_delay() {
        let shutdown = CancellationToken::new();
        let mut watch = Watch::<u32>::new(|| stream::iter(vec![Err(failure())]), shutdown.clone())
            .with_reconnect_delay(time::Duration::from_secs(3600));

        let handle = tokio::spawn(async move { watch.recv().await.is_none() });
        tokio::task::yield_now().await;
        shutdown.cancel();
        assert!(handle.await.unwrap());
    }
}
