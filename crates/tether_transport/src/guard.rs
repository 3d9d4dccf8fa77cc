//! Connection liveness guard.
//!
//! A peer that vanishes without a clean shutdown leaves the socket looking
//! healthy until the next write fails. The guard probes periodically and
//! reports the loss exactly once.

use crate::config::GuardConfig;
use crate::shutdown::{shutdown_channel, Shutdown, ShutdownTrigger};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Something the guard can watch.
pub trait Liveness: Send + Sync + 'static {
    /// Returns false if the connection is dead.
    fn probe(&self) -> impl Future<Output = bool> + Send;

    /// Called once when a probe fails.
    fn connection_lost(&self);
}

/// Non-destructive liveness probe of a TCP socket.
///
/// Peeks one byte, waiting at most `poll_timeout` for readability. A socket
/// with nothing to read is alive; an orderly shutdown (zero-byte peek) or an
/// error means it is dead.
///
/// A peer that dies without sending FIN or RST (power loss, a dropped link)
/// still reads as alive here. That case only surfaces when a later write or
/// read on the stream fails.
pub async fn probe_socket(socket: &TcpStream, poll_timeout: Duration) -> bool {
    let mut byte = [0u8; 1];
    match tokio::time::timeout(poll_timeout, socket.peek(&mut byte)).await {
        Err(_) => true,
        Ok(Ok(0)) => false,
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            trace!(error = %e, "peek failed");
            false
        }
    }
}

/// Periodic liveness prober.
#[derive(Debug)]
pub struct ConnectionGuard {
    config: GuardConfig,
    task: Mutex<Option<(ShutdownTrigger, JoinHandle<()>)>>,
}

impl ConnectionGuard {
    /// Creates a disarmed guard.
    pub fn new(config: GuardConfig) -> Self {
        Self {
            config,
            task: Mutex::new(None),
        }
    }

    /// Starts probing `target`. Returns false if already armed.
    ///
    /// The probe loop ends on the first failed probe, on [`disarm`], or when
    /// `shutdown` fires.
    ///
    /// [`disarm`]: ConnectionGuard::disarm
    pub fn arm<L: Liveness>(&self, target: Arc<L>, mut shutdown: Shutdown) -> bool {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|(_, handle)| !handle.is_finished()) {
            return false;
        }

        let (trigger, mut disarmed) = shutdown_channel();
        let config = self.config.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.wait() => {}
                _ = disarmed.wait() => {}
                _ = probe_loop(target.as_ref(), &config) => {}
            }
        });
        *task = Some((trigger, handle));
        true
    }

    /// Stops probing.
    pub fn disarm(&self) {
        if let Some((trigger, _)) = self.task.lock().take() {
            trigger.trigger();
        }
    }

    /// Returns true while the probe loop is running.
    pub fn is_armed(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.disarm();
    }
}

async fn probe_loop<L: Liveness>(target: &L, config: &GuardConfig) {
    tokio::time::sleep(config.first_probe).await;
    loop {
        if !target.probe().await {
            debug!("liveness probe failed");
            target.connection_lost();
            return;
        }
        tokio::time::sleep(config.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeTarget {
        dead: AtomicBool,
        probes: AtomicUsize,
        lost: AtomicUsize,
    }

    impl Liveness for FakeTarget {
        async fn probe(&self) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            !self.dead.load(Ordering::SeqCst)
        }

        fn connection_lost(&self) {
            self.lost.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fast() -> GuardConfig {
        GuardConfig::default()
            .with_first_probe(Duration::from_millis(10))
            .with_interval(Duration::from_millis(10))
            .with_poll_timeout(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn reports_loss_exactly_once() {
        let target = Arc::new(FakeTarget::default());
        let guard = ConnectionGuard::new(fast());
        let (_trigger, shutdown) = shutdown_channel();

        assert!(guard.arm(Arc::clone(&target), shutdown.clone()));
        assert!(!guard.arm(Arc::clone(&target), shutdown));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(target.probes.load(Ordering::SeqCst) >= 2);
        assert_eq!(target.lost.load(Ordering::SeqCst), 0);

        target.dead.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(target.lost.load(Ordering::SeqCst), 1);
        assert!(!guard.is_armed());
    }

    #[tokio::test]
    async fn disarm_stops_probing() {
        let target = Arc::new(FakeTarget::default());
        let guard = ConnectionGuard::new(fast());
        let (_trigger, shutdown) = shutdown_channel();
        guard.arm(Arc::clone(&target), shutdown);

        tokio::time::sleep(Duration::from_millis(30)).await;
        guard.disarm();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let probes = target.probes.load(Ordering::SeqCst);
        target.dead.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(target.probes.load(Ordering::SeqCst), probes);
        assert_eq!(target.lost.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn shutdown_stops_probing() {
        let target = Arc::new(FakeTarget::default());
        let guard = ConnectionGuard::new(fast());
        let (trigger, shutdown) = shutdown_channel();
        guard.arm(Arc::clone(&target), shutdown);
        trigger.trigger();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!guard.is_armed());
    }

    #[tokio::test]
    async fn probe_detects_closed_peer() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let client = client.unwrap();
        let (server, _) = accepted.unwrap();

        assert!(probe_socket(&client, Duration::from_millis(20)).await);
        drop(server);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!probe_socket(&client, Duration::from_millis(200)).await);
    }
}
