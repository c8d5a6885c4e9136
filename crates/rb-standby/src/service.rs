//! Leader election protocol.
//!
//! Every replica runs a [`StandbyService`]. On each refresh tick the service
//! either extends its lease (when primary) or tries to acquire the lock
//! (when not). Role changes are published on a watch channel; subscribers
//! use the Standby → Primary transition as the promotion hook to run their
//! become-primary work before acting on the new role.
//!
//! A lock provider outage never changes the role: a primary keeps serving on
//! its unexpired lease, a standby is never promoted speculatively.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::error::{Result, StandbyError};
use crate::lock::LeaseLock;

/// Role of this replica relative to the leader lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// This instance holds the lock and drives the pipeline.
    Primary,
    /// Another instance holds the lock.
    Standby,
    /// No election round has completed yet.
    Unknown,
}

/// Configuration for the standby service.
#[derive(Debug, Clone)]
pub struct StandbyConfig {
    /// Lease TTL on the leader lock.
    pub lock_ttl: Duration,
    /// How often to refresh or attempt acquisition. Must be strictly less
    /// than half the TTL so two refreshes can fail before the lease expires.
    pub refresh_interval: Duration,
    /// Unique identifier for this instance.
    pub instance_id: String,
}

impl Default for StandbyConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
            refresh_interval: Duration::from_secs(10),
            instance_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Leader election service.
pub struct StandbyService {
    config: StandbyConfig,
    lock: Arc<dyn LeaseLock>,
    is_primary: AtomicBool,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    role_tx: watch::Sender<Role>,
    role_rx: watch::Receiver<Role>,
}

impl StandbyService {
    pub fn new(config: StandbyConfig, lock: Arc<dyn LeaseLock>) -> Result<Self> {
        if config.refresh_interval * 2 >= config.lock_ttl {
            return Err(StandbyError::Config(
                "refresh interval must be strictly less than half the lock TTL".to_string(),
            ));
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        let (role_tx, role_rx) = watch::channel(Role::Unknown);

        Ok(Self {
            config,
            lock,
            is_primary: AtomicBool::new(false),
            running: AtomicBool::new(false),
            shutdown_tx,
            role_tx,
            role_rx,
        })
    }

    /// Synchronous, non-blocking primary check.
    pub fn is_primary(&self) -> bool {
        self.is_primary.load(Ordering::SeqCst)
    }

    /// Current role.
    pub fn role(&self) -> Role {
        *self.role_rx.borrow()
    }

    /// Subscribe to role changes.
    pub fn subscribe(&self) -> watch::Receiver<Role> {
        self.role_rx.clone()
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    /// Start the election loop.
    pub fn start(self: Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(StandbyError::AlreadyRunning);
        }

        info!(
            instance_id = %self.config.instance_id,
            ttl_ms = %self.config.lock_ttl.as_millis(),
            refresh_ms = %self.config.refresh_interval.as_millis(),
            "Starting standby service"
        );

        let service = Arc::clone(&self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(service.config.refresh_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        service.election_tick().await;
                    }
                    _ = shutdown_rx.recv() => {
                        service.release_if_held().await;
                        break;
                    }
                }
            }

            info!(instance_id = %service.config.instance_id, "Standby service stopped");
        });

        Ok(())
    }

    /// One election round: extend the lease when primary, otherwise try to
    /// take the lock.
    async fn election_tick(&self) {
        if self.is_primary() {
            match self.lock.refresh(self.config.lock_ttl).await {
                Ok(true) => {
                    debug!(instance_id = %self.config.instance_id, "Extended leader lease");
                }
                Ok(false) => {
                    warn!(instance_id = %self.config.instance_id, "Leader lease was taken over");
                    self.set_role(Role::Standby);
                }
                Err(e) => {
                    // The lease may still be valid; hold the role until the
                    // provider answers again or another instance takes over.
                    warn!(error = %e, "Lock provider unreachable during refresh, keeping current role");
                }
            }
        } else {
            match self.lock.try_acquire(self.config.lock_ttl).await {
                Ok(true) => {
                    info!(instance_id = %self.config.instance_id, "Acquired leader lock");
                    self.set_role(Role::Primary);
                }
                Ok(false) => {
                    self.set_role(Role::Standby);
                }
                Err(e) => {
                    warn!(error = %e, "Lock provider unreachable during acquisition, keeping current role");
                }
            }
        }
    }

    async fn release_if_held(&self) {
        if !self.is_primary() {
            return;
        }

        match self.lock.release().await {
            Ok(true) => {
                info!(instance_id = %self.config.instance_id, "Released leader lock");
            }
            Ok(false) => {
                debug!(instance_id = %self.config.instance_id, "Leader lock already gone at release");
            }
            Err(e) => {
                // The TTL bounds how long the lock outlives us.
                warn!(error = %e, "Failed to release leader lock, lease will expire on its own");
            }
        }

        self.set_role(Role::Standby);
    }

    fn set_role(&self, role: Role) {
        let was_primary = self
            .is_primary
            .swap(role == Role::Primary, Ordering::SeqCst);
        let is_now_primary = role == Role::Primary;

        self.role_tx.send_if_modified(|current| {
            if *current == role {
                false
            } else {
                *current = role;
                true
            }
        });

        if was_primary != is_now_primary {
            if is_now_primary {
                info!(instance_id = %self.config.instance_id, "Became primary");
            } else {
                warn!(instance_id = %self.config.instance_id, "Lost primary role");
            }
        }
    }

    /// Stop the election loop, releasing the lock if held.
    pub fn shutdown(&self) {
        info!(instance_id = %self.config.instance_id, "Stopping standby service");
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Instant;

    /// In-memory lease lock shared between test instances. Leases expire by
    /// wall clock so a crashed owner is simulated by simply not refreshing.
    struct SharedLease {
        state: Mutex<Option<(String, Instant)>>,
    }

    impl SharedLease {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(None),
            })
        }
    }

    struct MockLock {
        lease: Arc<SharedLease>,
        id: String,
        fail: AtomicBool,
    }

    impl MockLock {
        fn new(lease: Arc<SharedLease>, id: &str) -> Arc<Self> {
            Arc::new(Self {
                lease,
                id: id.to_string(),
                fail: AtomicBool::new(false),
            })
        }

        fn set_unreachable(&self, unreachable: bool) {
            self.fail.store(unreachable, Ordering::SeqCst);
        }

        fn check(&self) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                Err(StandbyError::Connection("mock outage".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl LeaseLock for MockLock {
        async fn try_acquire(&self, ttl: Duration) -> Result<bool> {
            self.check()?;
            let mut state = self.lease.state.lock().unwrap();
            match &*state {
                Some((_, expires)) if *expires > Instant::now() => Ok(false),
                _ => {
                    *state = Some((self.id.clone(), Instant::now() + ttl));
                    Ok(true)
                }
            }
        }

        async fn refresh(&self, ttl: Duration) -> Result<bool> {
            self.check()?;
            let mut state = self.lease.state.lock().unwrap();
            match &*state {
                Some((owner, expires)) if *owner == self.id && *expires > Instant::now() => {
                    *state = Some((self.id.clone(), Instant::now() + ttl));
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn release(&self) -> Result<bool> {
            self.check()?;
            let mut state = self.lease.state.lock().unwrap();
            match &*state {
                Some((owner, _)) if *owner == self.id => {
                    *state = None;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }
    }

    fn service(lock: Arc<MockLock>, ttl_ms: u64, refresh_ms: u64) -> Arc<StandbyService> {
        let config = StandbyConfig {
            lock_ttl: Duration::from_millis(ttl_ms),
            refresh_interval: Duration::from_millis(refresh_ms),
            instance_id: "test".to_string(),
        };
        Arc::new(StandbyService::new(config, lock).unwrap())
    }

    #[test]
    fn rejects_refresh_interval_at_half_ttl() {
        let lease = SharedLease::new();
        let lock = MockLock::new(lease, "a");
        let config = StandbyConfig {
            lock_ttl: Duration::from_secs(20),
            refresh_interval: Duration::from_secs(10),
            instance_id: "a".to_string(),
        };
        assert!(matches!(
            StandbyService::new(config, lock),
            Err(StandbyError::Config(_))
        ));
    }

    #[tokio::test]
    async fn acquires_free_lock_and_becomes_primary() {
        let lease = SharedLease::new();
        let lock = MockLock::new(lease, "a");
        let svc = service(lock, 1000, 100);

        assert_eq!(svc.role(), Role::Unknown);
        svc.election_tick().await;
        assert!(svc.is_primary());
        assert_eq!(svc.role(), Role::Primary);
    }

    #[tokio::test]
    async fn second_instance_stays_standby() {
        let lease = SharedLease::new();
        let alpha = service(MockLock::new(Arc::clone(&lease), "alpha"), 1000, 100);
        let beta = service(MockLock::new(lease, "beta"), 1000, 100);

        alpha.election_tick().await;
        beta.election_tick().await;

        assert!(alpha.is_primary());
        assert!(!beta.is_primary());
        assert_eq!(beta.role(), Role::Standby);
    }

    #[tokio::test]
    async fn denied_refresh_demotes_to_standby() {
        let lease = SharedLease::new();
        let alpha_lock = MockLock::new(Arc::clone(&lease), "alpha");
        let alpha = service(alpha_lock, 1000, 100);

        alpha.election_tick().await;
        assert!(alpha.is_primary());

        // Another instance steals the lease out from under alpha.
        lease.state.lock().unwrap().replace((
            "beta".to_string(),
            Instant::now() + Duration::from_secs(1),
        ));

        alpha.election_tick().await;
        assert!(!alpha.is_primary());
        assert_eq!(alpha.role(), Role::Standby);
    }

    #[tokio::test]
    async fn provider_outage_keeps_current_role() {
        let lease = SharedLease::new();
        let lock = MockLock::new(Arc::clone(&lease), "alpha");
        let svc = service(Arc::clone(&lock), 1000, 100);

        svc.election_tick().await;
        assert!(svc.is_primary());

        lock.set_unreachable(true);
        svc.election_tick().await;
        // Still primary: the lease may well be alive.
        assert!(svc.is_primary());

        // A standby is likewise never promoted while the provider is down.
        let standby_lock = MockLock::new(lease, "beta");
        standby_lock.set_unreachable(true);
        let standby = service(standby_lock, 1000, 100);
        standby.election_tick().await;
        assert_eq!(standby.role(), Role::Unknown);
    }

    #[tokio::test]
    async fn failover_after_lease_expiry() {
        let lease = SharedLease::new();
        let alpha = service(MockLock::new(Arc::clone(&lease), "alpha"), 250, 50);
        let beta = service(MockLock::new(lease, "beta"), 250, 50);

        // Alpha takes the lock, then "crashes": it never refreshes again.
        alpha.election_tick().await;
        assert!(alpha.is_primary());

        beta.election_tick().await;
        assert!(!beta.is_primary());

        // Once alpha's lease expires, beta's next round wins.
        tokio::time::sleep(Duration::from_millis(300)).await;
        beta.election_tick().await;
        assert!(beta.is_primary());
    }

    #[tokio::test]
    async fn shutdown_releases_held_lock() {
        let lease = SharedLease::new();
        let alpha = service(MockLock::new(Arc::clone(&lease), "alpha"), 1000, 100);
        let beta = service(MockLock::new(Arc::clone(&lease), "beta"), 1000, 100);

        alpha.election_tick().await;
        assert!(alpha.is_primary());

        alpha.release_if_held().await;
        assert!(!alpha.is_primary());

        // The lock is free immediately, no TTL wait needed.
        beta.election_tick().await;
        assert!(beta.is_primary());
    }

    #[tokio::test]
    async fn role_watch_notifies_promotion() {
        let lease = SharedLease::new();
        let svc = service(MockLock::new(lease, "alpha"), 1000, 100);
        let mut rx = svc.subscribe();

        svc.election_tick().await;

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Role::Primary);
    }
}
