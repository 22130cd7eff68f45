use crate::error::{DisconnectReason, Result};
use async_trait::async_trait;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Reconnecting,
}

/// Sent by a connection's reader when its stream ends.
#[derive(Debug, Clone)]
pub struct DisconnectSignal {
    pub generation: u64,
    pub reason: DisconnectReason,
}

/// What the supervisor drives: something that can build a fresh connection.
#[async_trait]
pub trait Reconnect: Send + Sync {
    async fn reconnect(&self) -> Result<()>;

    /// Generation of the most recent connection.
    fn generation(&self) -> u64;

    fn is_shutting_down(&self) -> bool;
}

/// Fixed-interval, unbounded reconnection.
pub struct Supervisor {
    interval: Duration,
    state: Arc<RwLock<SupervisorState>>,
}

impl Supervisor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Arc::new(RwLock::new(SupervisorState::Idle)),
        }
    }

    pub fn state_handle(&self) -> Arc<RwLock<SupervisorState>> {
        self.state.clone()
    }

    pub fn spawn(
        self,
        target: Weak<dyn Reconnect>,
        signals: mpsc::UnboundedReceiver<DisconnectSignal>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(target, signals))
    }

    async fn run(self, target: Weak<dyn Reconnect>, mut signals: mpsc::UnboundedReceiver<DisconnectSignal>) {
        while let Some(signal) = signals.recv().await {
            if !self.should_handle(&target, &signal).await {
                continue;
            }

            *self.state.write().await = SupervisorState::Reconnecting;
            info!(
                "Disconnected ({}), reconnecting every {:?}",
                signal.reason, self.interval
            );

            let mut attempt = 0u32;
            loop {
                tokio::time::sleep(self.interval).await;

                let Some(client) = target.upgrade() else {
                    return;
                };
                if client.is_shutting_down() {
                    return;
                }

                attempt += 1;
                match client.reconnect().await {
                    Ok(()) => {
                        info!("Reconnected after {} attempt(s)", attempt);
                        break;
                    }
                    Err(e) => warn!("Reconnect attempt {} failed: {}", attempt, e),
                }
            }

            *self.state.write().await = SupervisorState::Idle;
        }
        debug!("Reconnect supervisor stopped");
    }

    async fn should_handle(&self, target: &Weak<dyn Reconnect>, signal: &DisconnectSignal) -> bool {
        if *self.state.read().await == SupervisorState::Reconnecting {
            return false;
        }
        let Some(client) = target.upgrade() else {
            return false;
        };
        if client.is_shutting_down() {
            return false;
        }
        if signal.generation != client.generation() {
            debug!(
                "Ignoring disconnect of stale connection {} (current {})",
                signal.generation,
                client.generation()
            );
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TetherError;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
    use tokio::time::Instant;

    struct Flaky {
        failures_left: AtomicU32,
        generation: AtomicU64,
        attempts: std::sync::Mutex<Vec<Instant>>,
        shutting_down: AtomicBool,
    }

    impl Flaky {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures_left: AtomicU32::new(failures),
                generation: AtomicU64::new(0),
                attempts: std::sync::Mutex::new(Vec::new()),
                shutting_down: AtomicBool::new(false),
            })
        }

        fn attempts(&self) -> Vec<Instant> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Reconnect for Flaky {
        async fn reconnect(&self) -> Result<()> {
            self.attempts.lock().unwrap().push(Instant::now());
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(TetherError::Connection("refused".to_string()));
            }
            self.generation.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn generation(&self) -> u64 {
            self.generation.load(Ordering::SeqCst)
        }

        fn is_shutting_down(&self) -> bool {
            self.shutting_down.load(Ordering::SeqCst)
        }
    }

    fn signal(generation: u64) -> DisconnectSignal {
        DisconnectSignal {
            generation,
            reason: DisconnectReason::ServerClosed,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_at_fixed_interval_until_success() {
        let target = Flaky::new(2);
        let interval = Duration::from_secs(30);
        let supervisor = Supervisor::new(interval);
        let state = supervisor.state_handle();
        let (tx, rx) = mpsc::unbounded_channel();
        let weak: Weak<dyn Reconnect> = Arc::downgrade(&target) as Weak<Flaky>;
        let _handle = supervisor.spawn(weak, rx);

        let start = Instant::now();
        tx.send(signal(0)).unwrap();
        tokio::time::sleep(Duration::from_secs(100)).await;

        let attempts = target.attempts();
        assert_eq!(attempts.len(), 3);
        assert!(attempts[0] - start >= interval);
        for pair in attempts.windows(2) {
            assert!(pair[1] - pair[0] >= interval);
            assert!(pair[1] - pair[0] < interval + Duration::from_secs(1));
        }
        assert_eq!(*state.read().await, SupervisorState::Idle);
        assert_eq!(target.generation(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_and_stale_signals_ignored() {
        let target = Flaky::new(0);
        let supervisor = Supervisor::new(Duration::from_secs(5));
        let (tx, rx) = mpsc::unbounded_channel();
        let weak: Weak<dyn Reconnect> = Arc::downgrade(&target) as Weak<Flaky>;
        let _handle = supervisor.spawn(weak, rx);

        tx.send(signal(0)).unwrap();
        tx.send(signal(0)).unwrap();
        tx.send(signal(0)).unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(target.attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_retries() {
        let target = Flaky::new(u32::MAX);
        let supervisor = Supervisor::new(Duration::from_secs(1));
        let (tx, rx) = mpsc::unbounded_channel();
        let weak: Weak<dyn Reconnect> = Arc::downgrade(&target) as Weak<Flaky>;
        let handle = supervisor.spawn(weak, rx);

        tx.send(signal(0)).unwrap();
        tokio::time::sleep(Duration::from_millis(3500)).await;
        target.shutting_down.store(true, Ordering::SeqCst);
        handle.await.unwrap();

        assert_eq!(target.attempts().len(), 3);
    }
}
