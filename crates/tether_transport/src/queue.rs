//! Outbound package queue.
//!
//! Writes from many tasks are serialized through a single consumer so frames
//! never interleave on the socket. The consumer respects the stream's lock
//! flag: while locked, the head of the queue waits and nothing behind it
//! moves.

use crate::error::{TransportError, TransportResult};
use crate::shutdown::Shutdown;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tether_sync_protocol::WirePackage;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Notifications emitted by a stream and its queue.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A queued package was written to the socket.
    PackageSent(WirePackage),
    /// The connection was found dead. Emitted at most once per stream.
    ConnectionLost,
    /// A queued package could not be written.
    Error(String),
}

/// Where the queue consumer writes to.
pub trait PackageSink: Send + Sync + 'static {
    /// Returns true while the underlying connection is usable.
    fn is_connected(&self) -> bool;

    /// Watch over the lock flag. `true` means writes must wait.
    fn lock_state(&self) -> watch::Receiver<bool>;

    /// Writes one package. Returns false on failure.
    fn write_package(&self, package: &WirePackage) -> impl Future<Output = bool> + Send;
}

/// Producer handle of an outbound queue.
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    tx: mpsc::UnboundedSender<WirePackage>,
    depth: Arc<AtomicUsize>,
}

impl OutboundQueue {
    /// Spawns the consumer and returns the producer handle.
    pub fn spawn<S: PackageSink>(
        sink: Arc<S>,
        events: mpsc::UnboundedSender<StreamEvent>,
        shutdown: Shutdown,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let handle = tokio::spawn(consume(sink, rx, events, shutdown, Arc::clone(&depth)));
        (Self { tx, depth }, handle)
    }

    /// Appends a package.
    pub fn push(&self, package: WirePackage) -> TransportResult<()> {
        self.depth.fetch_add(1, Ordering::SeqCst);
        self.tx.send(package).map_err(|_| {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            TransportError::Closed
        })
    }

    /// Packages accepted but not yet handled.
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Returns true if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn wait_unlocked(lock: &mut watch::Receiver<bool>) {
    while *lock.borrow_and_update() {
        if lock.changed().await.is_err() {
            return;
        }
    }
}

async fn consume<S: PackageSink>(
    sink: Arc<S>,
    mut rx: mpsc::UnboundedReceiver<WirePackage>,
    events: mpsc::UnboundedSender<StreamEvent>,
    mut shutdown: Shutdown,
    depth: Arc<AtomicUsize>,
) {
    let mut lock = sink.lock_state();
    loop {
        let package = tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            next = rx.recv() => match next {
                Some(package) => package,
                None => break,
            },
        };

        let ready = tokio::select! {
            biased;
            _ = shutdown.wait() => false,
            _ = wait_unlocked(&mut lock) => true,
        };
        if !ready {
            break;
        }

        if !sink.is_connected() {
            warn!(package_id = %package.id, "dropping queued package: not connected");
        } else if sink.write_package(&package).await {
            debug!(package_id = %package.id, "package sent");
            let _ = events.send(StreamEvent::PackageSent(package));
        } else {
            warn!(package_id = %package.id, "dropping queued package: write failed");
            let _ = events.send(StreamEvent::Error(format!(
                "failed to write package {}",
                package.id
            )));
        }
        depth.fetch_sub(1, Ordering::SeqCst);
    }
    debug!("outbound queue stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::shutdown_channel;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tether_sync_protocol::FetchSpec;

    struct RecordingSink {
        connected: AtomicBool,
        fail: AtomicBool,
        lock: watch::Sender<bool>,
        written: Mutex<Vec<WirePackage>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                connected: AtomicBool::new(true),
                fail: AtomicBool::new(false),
                lock: watch::channel(false).0,
                written: Mutex::new(Vec::new()),
            })
        }
    }

    impl PackageSink for RecordingSink {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn lock_state(&self) -> watch::Receiver<bool> {
            self.lock.subscribe()
        }

        async fn write_package(&self, package: &WirePackage) -> bool {
            if self.fail.load(Ordering::SeqCst) {
                return false;
            }
            self.written.lock().push(package.clone());
            true
        }
    }

    fn package(n: u32) -> WirePackage {
        WirePackage::fetch(FetchSpec::new("Person").with_page(n, 0))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn preserves_order_and_reports_sent() {
        let sink = RecordingSink::new();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (_trigger, shutdown) = shutdown_channel();
        let (queue, _) = OutboundQueue::spawn(Arc::clone(&sink), events_tx, shutdown);

        let packages: Vec<_> = (0..20).map(package).collect();
        for p in &packages {
            queue.push(p.clone()).unwrap();
        }
        settle().await;

        assert_eq!(*sink.written.lock(), packages);
        assert!(queue.is_empty());
        for p in &packages {
            assert_eq!(events.recv().await, Some(StreamEvent::PackageSent(p.clone())));
        }
    }

    #[tokio::test]
    async fn lock_holds_head_of_line() {
        let sink = RecordingSink::new();
        let (events_tx, _events) = mpsc::unbounded_channel();
        let (_trigger, shutdown) = shutdown_channel();
        let (queue, _) = OutboundQueue::spawn(Arc::clone(&sink), events_tx, shutdown);

        sink.lock.send_replace(true);
        queue.push(package(1)).unwrap();
        queue.push(package(2)).unwrap();
        settle().await;
        assert!(sink.written.lock().is_empty());
        assert_eq!(queue.len(), 2);

        sink.lock.send_replace(false);
        settle().await;
        assert_eq!(sink.written.lock().len(), 2);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn failed_write_drops_item_and_continues() {
        let sink = RecordingSink::new();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (_trigger, shutdown) = shutdown_channel();
        let (queue, _) = OutboundQueue::spawn(Arc::clone(&sink), events_tx, shutdown);

        sink.fail.store(true, Ordering::SeqCst);
        queue.push(package(1)).unwrap();
        settle().await;
        assert!(matches!(events.recv().await, Some(StreamEvent::Error(_))));

        sink.fail.store(false, Ordering::SeqCst);
        let second = package(2);
        queue.push(second.clone()).unwrap();
        settle().await;
        assert_eq!(*sink.written.lock(), vec![second]);
    }

    #[tokio::test]
    async fn disconnected_sink_drops_without_writing() {
        let sink = RecordingSink::new();
        sink.connected.store(false, Ordering::SeqCst);
        let (events_tx, _events) = mpsc::unbounded_channel();
        let (_trigger, shutdown) = shutdown_channel();
        let (queue, _) = OutboundQueue::spawn(Arc::clone(&sink), events_tx, shutdown);

        queue.push(package(1)).unwrap();
        settle().await;
        assert!(sink.written.lock().is_empty());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn shutdown_stops_consumer() {
        let sink = RecordingSink::new();
        let (events_tx, _events) = mpsc::unbounded_channel();
        let (trigger, shutdown) = shutdown_channel();
        let (queue, handle) = OutboundQueue::spawn(Arc::clone(&sink), events_tx, shutdown);

        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(queue.push(package(1)), Err(TransportError::Closed)));
    }
}
