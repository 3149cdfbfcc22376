//! Control loop
//!
//! One task ticks the controller: it reconnects while disconnected and runs
//! position broadcasts and liveness sweeps while ready. Both periodic duties
//! share the tick so registry writes never interleave. `Error` is left alone;
//! only [`initialize`](MasterController::initialize) leaves it.

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::core::{Error, Result};
use crate::protocol::ControllerState;
use crate::util::unix_now;
use super::MasterController;

const TICK: Duration = Duration::from_secs(1);

/// Next due times of the periodic duties
struct Schedule {
    next_position: Instant,
    next_sweep: Instant,
}

impl MasterController {
    /// Runs until [`shutdown`](MasterController::shutdown) is called
    pub async fn run(&self) -> Result<()> {
        if self.is_shut_down() {
            return Ok(());
        }

        let mut ticker = interval(TICK.min(self.config.peers.sweep_interval.max(Duration::from_millis(100))));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let start = Instant::now();
        let mut schedule = Schedule {
            next_position: start,
            next_sweep: start + self.config.peers.sweep_interval,
        };

        info!(state = %self.state.current(), "Control loop started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.state.current() {
                ControllerState::Ready => self.run_periodic(&mut schedule),
                ControllerState::Disconnected => {
                    if self.config.reconnect.enabled && !self.reconnect_exhausted.load(Ordering::SeqCst) {
                        if !self.reconnect().await {
                            self.reconnect_exhausted.store(true, Ordering::SeqCst);
                        }
                    }
                }
                ControllerState::Connecting | ControllerState::VerifyingKey | ControllerState::Error => {}
            }
        }

        info!("Control loop stopped");
        Ok(())
    }

    fn run_periodic(&self, schedule: &mut Schedule) {
        let now = Instant::now();
        let position = &self.config.position;

        if position.broadcast_enabled && now >= schedule.next_position {
            schedule.next_position = now + position.broadcast_interval;
            if let Err(e) = self.engine.send_position(None, None, None) {
                warn!(error = %e, "Scheduled position broadcast failed");
            }
        }

        if now >= schedule.next_sweep {
            schedule.next_sweep = now + self.config.peers.sweep_interval;
            let offline = self.engine.sweep(unix_now());
            debug!(offline, "Liveness sweep");
        }
    }

    /// Tries to reach `Ready` again with a fixed backoff
    ///
    /// Returns false once the attempts are used up, on shutdown, or when the
    /// device identity cannot be verified. The last case stays in `Error`.
    async fn reconnect(&self) -> bool {
        let policy = &self.config.reconnect;
        for attempt in 1..=policy.max_attempts {
            if self.cancel.is_cancelled() {
                return false;
            }

            info!(attempt, max_attempts = policy.max_attempts, "Reconnecting to device");
            match self.connect_once().await {
                Ok(()) => return true,
                Err(e @ Error::IdentityMismatch(_)) => {
                    error!(attempt, error = %e, "Device identity unresolved; not retrying");
                    return false;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Reconnect attempt failed");
                    if let Err(e) = self
                        .state
                        .transition_from(ControllerState::Error, ControllerState::Disconnected)
                    {
                        error!(error = %e, "Failed to reset controller state");
                    }
                }
            }

            if attempt < policy.max_attempts {
                tokio::select! {
                    _ = self.cancel.cancelled() => return false,
                    _ = sleep(policy.backoff) => {}
                }
            }
        }

        error!(
            attempts = policy.max_attempts,
            "Giving up on reconnecting; controller stays disconnected until initialized again"
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::{Config, PeerId, POSITION_PORT_NUM};
    use crate::network::{MemoryTransport, Transport};
    use crate::storage::SqliteStore;

    fn controller(config: Config) -> (Arc<MemoryTransport>, Arc<MasterController>) {
        let memory = MemoryTransport::new(PeerId::new("!0000cafe").unwrap());
        let store = Arc::new(SqliteStore::open_in_memory(32).unwrap());
        let controller = MasterController::new(config, memory.clone(), store).unwrap();
        (memory, Arc::new(controller))
    }

    fn spawn_loop(controller: &Arc<MasterController>) -> tokio::task::JoinHandle<Result<()>> {
        let controller = controller.clone();
        tokio::spawn(async move { controller.run().await })
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_link_loss() {
        let config = Config::builder().reconnect(true, 3, Duration::from_secs(5)).build();
        let (memory, controller) = controller(config);
        controller.initialize().await.unwrap();
        let handle = spawn_loop(&controller);

        memory.drop_link();
        assert_eq!(controller.state(), ControllerState::Disconnected);

        sleep(Duration::from_secs(3)).await;
        assert!(controller.is_ready());
        assert_eq!(memory.connect_attempts(), 2);

        controller.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let config = Config::builder().reconnect(true, 3, Duration::from_secs(5)).build();
        let (memory, controller) = controller(config);
        controller.initialize().await.unwrap();
        let handle = spawn_loop(&controller);

        memory.refuse_connects(100);
        memory.drop_link();

        sleep(Duration::from_secs(60)).await;
        assert_eq!(controller.state(), ControllerState::Disconnected);
        assert_eq!(memory.connect_attempts(), 4);

        controller.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_state_is_not_retried() {
        let config = Config::builder().reconnect(true, 3, Duration::from_secs(5)).build();
        let (memory, controller) = controller(config);
        memory.refuse_connects(1);

        assert!(controller.initialize().await.is_err());
        let handle = spawn_loop(&controller);

        sleep(Duration::from_secs(60)).await;
        assert_eq!(controller.state(), ControllerState::Error);
        assert_eq!(memory.connect_attempts(), 1);

        controller.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_failure_on_reconnect_is_terminal() {
        let config = Config::builder()
            .private_key("AQIDBA==")
            .reconnect(true, 3, Duration::from_secs(5))
            .build();
        let memory = MemoryTransport::new(PeerId::new("!0000cafe").unwrap());
        memory.set_device_key(Some(vec![1, 2, 3, 4]));
        let provisioner = Arc::new(memory.provisioner().ignoring());
        let store = Arc::new(SqliteStore::open_in_memory(32).unwrap());
        let controller = Arc::new(
            MasterController::new(config, memory.clone(), store)
                .unwrap()
                .with_provisioner(provisioner.clone()),
        );
        controller.initialize().await.unwrap();
        let handle = spawn_loop(&controller);

        // The device comes back with a different key after the link drops
        memory.set_device_key(Some(vec![9]));
        memory.drop_link();

        sleep(Duration::from_secs(60)).await;
        assert_eq!(controller.state(), ControllerState::Error);
        assert_eq!(provisioner.calls(), 1);
        assert_eq!(memory.connect_attempts(), 3);
        assert!(!memory.is_connected());

        controller.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedules_position_broadcast() {
        let config = Config::builder()
            .fixed_position(47.0, 8.0, 400, Duration::from_secs(10))
            .build();
        let (memory, controller) = controller(config);
        controller.initialize().await.unwrap();
        let handle = spawn_loop(&controller);

        sleep(Duration::from_secs(25)).await;
        controller.shutdown();
        handle.await.unwrap().unwrap();

        let positions = memory
            .sent()
            .into_iter()
            .filter(|p| p.port == POSITION_PORT_NUM && p.destination.is_none())
            .count();
        assert!(positions >= 2, "expected periodic broadcasts, got {}", positions);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_loop() {
        let (memory, controller) = controller(Config::default());
        controller.initialize().await.unwrap();
        let handle = spawn_loop(&controller);

        let remote = controller.clone();
        tokio::spawn(async move { remote.shutdown() }).await.unwrap();
        controller.shutdown();

        handle.await.unwrap().unwrap();
        assert!(!memory.is_connected());
        assert!(controller.run().await.is_ok());
    }
}
