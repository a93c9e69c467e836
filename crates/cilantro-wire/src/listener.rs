//! Receive loop.
//!
//! One loop per socket pulls multipart messages from the socket's
//! [`FrameSource`], runs them through the socket's [`AdmissionFilter`] and
//! hands admitted messages to the registered [`FrameHandler`].
//!
//! ```text
//! Starting ──► Listening ──► Stopped   (shutdown signal or socket closed)
//!                   │
//!                   └──────► Faulted   (too many consecutive receive faults)
//! ```
//!
//! Receive faults are logged at error level and retried after a backoff. A
//! successful receive resets the fault counter. The underlying socket is
//! released on every exit path, including when the loop's future is dropped.

use crate::backoff::Backoff;
use crate::error::WireError;
use crate::filter::{AdmissionFilter, AdmitAll};
use crate::message::Multipart;
use crate::raw::FrameSource;
use crate::socket::TransportSocket;
use cilantro_types::config::ListenerSettings;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Receives every admitted message, together with the handler key given at
/// registration.
pub trait FrameHandler: Send {
    fn handle(&mut self, frames: Multipart, handler_key: Option<&str>);
}

impl<F> FrameHandler for F
where
    F: FnMut(Multipart, Option<&str>) + Send,
{
    fn handle(&mut self, frames: Multipart, handler_key: Option<&str>) {
        self(frames, handler_key)
    }
}

/// Lifecycle of a [`ReceiveLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenState {
    Starting,
    Listening,
    Stopped,
    Faulted,
}

/// How the loop reacts to consecutive receive faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultPolicy {
    /// Faults tolerated in a row before giving up. 0 means never give up.
    pub max_consecutive_faults: u32,
    pub backoff: Backoff,
}

impl Default for FaultPolicy {
    fn default() -> Self {
        Self {
            max_consecutive_faults: 10,
            backoff: Backoff::new(50, 5_000),
        }
    }
}

impl FaultPolicy {
    /// Keep retrying forever.
    pub fn unbounded() -> Self {
        Self {
            max_consecutive_faults: 0,
            ..Self::default()
        }
    }

    fn exhausted(&self, faults: u32) -> bool {
        self.max_consecutive_faults > 0 && faults > self.max_consecutive_faults
    }
}

impl From<&ListenerSettings> for FaultPolicy {
    fn from(settings: &ListenerSettings) -> Self {
        Self {
            max_consecutive_faults: settings.max_consecutive_faults,
            backoff: Backoff::new(settings.fault_backoff_min_ms, settings.fault_backoff_max_ms),
        }
    }
}

/// Closes the socket when dropped.
struct SocketGuard(Arc<TransportSocket>);

impl Drop for SocketGuard {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// The long-running receive task of one socket.
pub struct ReceiveLoop {
    socket: Arc<TransportSocket>,
    source: Box<dyn FrameSource>,
    handler: Box<dyn FrameHandler>,
    handler_key: Option<String>,
    filter: Box<dyn AdmissionFilter>,
    policy: FaultPolicy,
    startup_delay: Duration,
}

impl ReceiveLoop {
    pub(crate) fn new(
        socket: Arc<TransportSocket>,
        source: Box<dyn FrameSource>,
        handler: Box<dyn FrameHandler>,
        handler_key: Option<String>,
    ) -> Self {
        Self {
            socket,
            source,
            handler,
            handler_key,
            filter: Box::new(AdmitAll),
            policy: FaultPolicy::default(),
            startup_delay: Duration::ZERO,
        }
    }

    pub fn with_filter(mut self, filter: impl AdmissionFilter + 'static) -> Self {
        self.filter = Box::new(filter);
        self
    }

    pub fn with_policy(mut self, policy: FaultPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Pause before the first receive. Zero just yields once.
    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    /// Apply the `[listener]` config section.
    pub fn with_settings(self, settings: &ListenerSettings) -> Self {
        self.with_policy(FaultPolicy::from(settings))
            .with_startup_delay(Duration::from_millis(settings.startup_delay_ms))
    }

    pub fn socket(&self) -> &Arc<TransportSocket> {
        &self.socket
    }

    /// Run until `shutdown` flips to true (or its sender is dropped), the
    /// socket closes, or the fault policy gives up. Returns the final state.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> ListenState {
        let _guard = SocketGuard(Arc::clone(&self.socket));
        let name = self.socket.name().to_string();
        debug!(socket = %name, state = ?ListenState::Starting, "Receive loop starting");

        if *shutdown.borrow() {
            return ListenState::Stopped;
        }
        let delay = self.startup_delay;
        let startup = async move {
            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(delay).await;
            }
        };
        tokio::select! {
            _ = startup => {}
            _ = shutdown.changed() => {
                info!(socket = %name, "Receive loop stopped before listening");
                return ListenState::Stopped;
            }
        }

        info!(socket = %name, state = ?ListenState::Listening, "Receive loop listening");
        let mut faults: u32 = 0;

        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    info!(socket = %name, "Receive loop stopped");
                    return ListenState::Stopped;
                }
                received = self.source.recv_multipart() => received,
            };

            match received {
                Ok(mut frames) => {
                    faults = 0;
                    if self.filter.admit(&self.socket, &mut frames) {
                        self.handler.handle(frames, self.handler_key.as_deref());
                    }
                }
                Err(WireError::ConnectionClosed) => {
                    info!(socket = %name, "Socket closed, receive loop stopped");
                    return ListenState::Stopped;
                }
                Err(e) => {
                    faults = faults.saturating_add(1);
                    error!(socket = %name, error = %e, faults, "Receive fault");
                    if self.policy.exhausted(faults) {
                        error!(
                            socket = %name,
                            faults,
                            "Too many consecutive receive faults, giving up"
                        );
                        return ListenState::Faulted;
                    }
                    let delay = self.policy.backoff.delay(faults - 1);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {
                            warn!(socket = %name, "Receive loop stopped while backing off");
                            return ListenState::Stopped;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::command::ConnectArgs;
    use crate::error::WireResult;
    use crate::filter::TopicFilter;
    use crate::message::three_frame;
    use crate::socket::tests::{harness_with, RawOp, RecordingSocket};
    use crate::socket::SocketIdentity;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    pub(crate) struct ChannelSource(mpsc::UnboundedReceiver<WireResult<Multipart>>);

    #[async_trait]
    impl FrameSource for ChannelSource {
        async fn recv_multipart(&mut self) -> WireResult<Multipart> {
            self.0.recv().await.unwrap_or(Err(WireError::ConnectionClosed))
        }
    }

    pub(crate) fn channel_source() -> (mpsc::UnboundedSender<WireResult<Multipart>>, ChannelSource) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, ChannelSource(rx))
    }

    struct Fixture {
        tx: mpsc::UnboundedSender<WireResult<Multipart>>,
        received: Arc<Mutex<Vec<(Multipart, Option<String>)>>>,
        log: Arc<Mutex<Vec<RawOp>>>,
        receive_loop: ReceiveLoop,
    }

    fn fixture(key: Option<&str>) -> Fixture {
        let (tx, source) = channel_source();
        let mut raw = RecordingSocket::default();
        raw.source = Some(Box::new(source));
        let h = harness_with(SocketIdentity::new("listener"), raw);
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let receive_loop = h
            .socket
            .add_handler(
                move |frames: Multipart, key: Option<&str>| {
                    sink.lock()
                        .unwrap()
                        .push((frames, key.map(str::to_string)));
                },
                key.map(str::to_string),
            )
            .unwrap();
        Fixture {
            tx,
            received,
            log: h.log,
            receive_loop,
        }
    }

    fn fast_policy(max: u32) -> FaultPolicy {
        FaultPolicy {
            max_consecutive_faults: max,
            backoff: Backoff::new(1, 2),
        }
    }

    fn fault() -> WireResult<Multipart> {
        Err(WireError::Framing("bad frame".into()))
    }

    #[tokio::test]
    async fn test_dispatches_with_handler_key() {
        let f = fixture(Some("blocks"));
        f.tx.send(Ok(three_frame("a", "b", "c"))).unwrap();
        f.tx.send(Ok(three_frame("d", "e", "f"))).unwrap();
        drop(f.tx);

        let (_stop, shutdown) = watch::channel(false);
        let state = f.receive_loop.run(shutdown).await;
        assert_eq!(state, ListenState::Stopped);

        let received = f.received.lock().unwrap();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].0, three_frame("a", "b", "c"));
        assert_eq!(received[1].1.as_deref(), Some("blocks"));
    }

    #[tokio::test]
    async fn test_idles_until_traffic() {
        let f = fixture(None);
        let (_stop, shutdown) = watch::channel(false);
        let mut task = tokio_test::task::spawn(f.receive_loop.run(shutdown));

        // Startup yield, then an empty source.
        let _ = task.poll();
        tokio_test::assert_pending!(task.poll());
        assert!(f.received.lock().unwrap().is_empty());

        f.tx.send(Ok(three_frame("a", "b", "c"))).unwrap();
        assert!(task.is_woken());
        tokio_test::assert_pending!(task.poll());
        assert_eq!(f.received.lock().unwrap().len(), 1);

        drop(f.tx);
        assert_eq!(tokio_test::assert_ready!(task.poll()), ListenState::Stopped);
    }

    #[tokio::test]
    async fn test_filter_drops_unadmitted() {
        let f = fixture(None);
        f.tx.send(Ok(three_frame("blk-1", "t", "p"))).unwrap();
        f.tx.send(Ok(three_frame("tx-1", "t", "p"))).unwrap();
        drop(f.tx);

        let (_stop, shutdown) = watch::channel(false);
        let state = f
            .receive_loop
            .with_filter(TopicFilter::new(["blk"]))
            .run(shutdown)
            .await;
        assert_eq!(state, ListenState::Stopped);
        let received = f.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0[0], bytes::Bytes::from_static(b"blk-1"));
    }

    #[tokio::test]
    async fn test_faults_are_survived_and_reset() {
        let f = fixture(None);
        f.tx.send(fault()).unwrap();
        f.tx.send(fault()).unwrap();
        f.tx.send(Ok(three_frame("a", "b", "c"))).unwrap();
        f.tx.send(fault()).unwrap();
        f.tx.send(fault()).unwrap();
        f.tx.send(Ok(three_frame("d", "e", "f"))).unwrap();
        drop(f.tx);

        let (_stop, shutdown) = watch::channel(false);
        let state = f
            .receive_loop
            .with_policy(fast_policy(2))
            .run(shutdown)
            .await;
        assert_eq!(state, ListenState::Stopped);
        assert_eq!(f.received.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_persistent_faults_escalate() {
        let f = fixture(None);
        for _ in 0..3 {
            f.tx.send(fault()).unwrap();
        }
        f.tx.send(Ok(three_frame("never", "b", "c"))).unwrap();

        let (_stop, shutdown) = watch::channel(false);
        let state = f
            .receive_loop
            .with_policy(fast_policy(2))
            .run(shutdown)
            .await;
        assert_eq!(state, ListenState::Faulted);
        assert!(f.received.lock().unwrap().is_empty());
        assert_eq!(f.log.lock().unwrap().last(), Some(&RawOp::Close));
    }

    #[tokio::test]
    async fn test_shutdown_stops_and_releases_socket() {
        let f = fixture(None);
        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(f.receive_loop.run(shutdown));
        f.tx.send(Ok(three_frame("a", "b", "c"))).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        stop.send(true).unwrap();
        assert_eq!(task.await.unwrap(), ListenState::Stopped);
        assert_eq!(f.received.lock().unwrap().len(), 1);
        assert_eq!(f.log.lock().unwrap().last(), Some(&RawOp::Close));
    }

    #[tokio::test]
    async fn test_already_shut_down_never_listens() {
        let f = fixture(None);
        f.tx.send(Ok(three_frame("a", "b", "c"))).unwrap();
        let (_stop, shutdown) = watch::channel(true);
        assert_eq!(f.receive_loop.run(shutdown).await, ListenState::Stopped);
        assert!(f.received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_aborted_loop_releases_socket() {
        let f = fixture(None);
        let (_stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(f.receive_loop.run(shutdown));
        tokio::time::sleep(Duration::from_millis(20)).await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(f.log.lock().unwrap().last(), Some(&RawOp::Close));
    }

    #[tokio::test]
    async fn test_settings_map_to_policy() {
        let settings = ListenerSettings {
            startup_delay_ms: 0,
            max_consecutive_faults: 0,
            fault_backoff_min_ms: 5,
            fault_backoff_max_ms: 10,
        };
        let policy = FaultPolicy::from(&settings);
        assert!(!policy.exhausted(u32::MAX));
        assert_eq!(policy.backoff.delay(5), Duration::from_millis(10));

        // The socket keeps working while a loop is configured.
        let f = fixture(None);
        let receive_loop = f.receive_loop.with_settings(&settings);
        receive_loop
            .socket()
            .connect(ConnectArgs::tcp(9000).ip("10.0.0.2"))
            .unwrap();
    }
}
