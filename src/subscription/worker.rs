//! Background renewal of the tracked subscription.
//!
//! Each tick loads the persisted record and then creates, renews or leaves the
//! subscription alone according to the [`RenewalPolicy`]. A failed renewal
//! falls back to a create within the same tick. Failures never end the loop;
//! they are logged and retried on the next tick.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::manager::{ManagerError, SubscriptionManager, SubscriptionTarget};
use super::{format_expiration, Subscription};
use crate::config::RenewalPolicy;

/// Observable result of one renewal tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum TickOutcome {
    /// No usable record existed; a new subscription was created.
    Created(Subscription),
    /// The subscription was inside the renewal window and got extended.
    Renewed(Subscription),
    /// Renewal was rejected and a replacement subscription was created.
    Recreated(Subscription),
    /// Still outside the renewal window.
    Unchanged(Subscription),
    /// A remote call failed; the next tick retries.
    Failed(String),
    /// The record could not be read or written.
    StorageFailed(String),
}

impl TickOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Created(_) => "created",
            Self::Renewed(_) => "renewed",
            Self::Recreated(_) => "recreated",
            Self::Unchanged(_) => "unchanged",
            Self::Failed(_) => "failed",
            Self::StorageFailed(_) => "storage_failed",
        }
    }

    pub fn subscription(&self) -> Option<&Subscription> {
        match self {
            Self::Created(s) | Self::Renewed(s) | Self::Recreated(s) | Self::Unchanged(s) => {
                Some(s)
            }
            Self::Failed(_) | Self::StorageFailed(_) => None,
        }
    }

    fn from_error(error: ManagerError) -> Self {
        match error {
            ManagerError::Storage(inner) => Self::StorageFailed(inner.to_string()),
            remote @ ManagerError::Remote(_) => Self::Failed(remote.to_string()),
        }
    }
}

pub struct RenewalWorker {
    manager: Arc<SubscriptionManager>,
    target: SubscriptionTarget,
    policy: RenewalPolicy,
}

impl RenewalWorker {
    pub fn new(
        manager: Arc<SubscriptionManager>,
        target: SubscriptionTarget,
        policy: RenewalPolicy,
    ) -> Self {
        Self {
            manager,
            target,
            policy,
        }
    }

    pub fn policy(&self) -> &RenewalPolicy {
        &self.policy
    }

    /// Runs one check-and-act iteration.
    pub async fn tick(&self) -> TickOutcome {
        let outcome = self.evaluate().await;
        match &outcome {
            TickOutcome::Unchanged(subscription) => debug!(
                outcome = outcome.label(),
                subscription_id = %subscription.id,
                expiration = %format_expiration(subscription.expiration),
                "renewal tick"
            ),
            TickOutcome::Created(subscription)
            | TickOutcome::Renewed(subscription)
            | TickOutcome::Recreated(subscription) => info!(
                outcome = outcome.label(),
                subscription_id = %subscription.id,
                expiration = %format_expiration(subscription.expiration),
                "renewal tick"
            ),
            TickOutcome::Failed(reason) => warn!(
                outcome = outcome.label(),
                error = %reason,
                "renewal tick failed; retrying next tick"
            ),
            TickOutcome::StorageFailed(reason) => error!(
                outcome = outcome.label(),
                error = %reason,
                "renewal tick could not access the subscription record"
            ),
        }
        outcome
    }

    async fn evaluate(&self) -> TickOutcome {
        let current = match self.manager.load_current() {
            Ok(current) => current,
            Err(error) => return TickOutcome::from_error(error),
        };

        let Some(current) = current else {
            info!("no active subscription; creating one");
            return match self.manager.create(&self.target, self.policy.ttl).await {
                Ok(subscription) => TickOutcome::Created(subscription),
                Err(error) => TickOutcome::from_error(error),
            };
        };

        let remaining = current.remaining_at(self.manager.clock().now());
        if remaining >= self.policy.renewal_window {
            return TickOutcome::Unchanged(current);
        }

        info!(
            subscription_id = %current.id,
            remaining_minutes = remaining.num_minutes(),
            "subscription inside renewal window; renewing"
        );
        match self.manager.renew(&current.id, self.policy.ttl).await {
            Ok(subscription) => TickOutcome::Renewed(subscription),
            Err(error @ ManagerError::Storage(_)) => TickOutcome::from_error(error),
            Err(ManagerError::Remote(_)) => {
                info!(
                    subscription_id = %current.id,
                    "renewal rejected; creating replacement subscription"
                );
                match self.manager.create(&self.target, self.policy.ttl).await {
                    Ok(subscription) => TickOutcome::Recreated(subscription),
                    Err(error) => TickOutcome::from_error(error),
                }
            }
        }
    }

    /// Starts the loop on the runtime. It runs until the handle is shut down
    /// or dropped.
    pub fn spawn(self) -> RenewalHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let wake = Arc::new(Notify::new());

        let task = tokio::spawn(self.run(shutdown_rx, outcome_tx, wake.clone()));

        RenewalHandle {
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            wake,
            outcomes: outcome_rx,
        }
    }

    async fn run(
        self,
        mut shutdown_rx: mpsc::Receiver<()>,
        outcome_tx: watch::Sender<Option<TickOutcome>>,
        wake: Arc<Notify>,
    ) {
        info!(
            check_interval_minutes = self.policy.check_interval.num_minutes(),
            renewal_window_minutes = self.policy.renewal_window.num_minutes(),
            ttl_minutes = self.policy.ttl.num_minutes(),
            "subscription renewal worker started"
        );
        if !self.policy.tolerates_missed_check() {
            warn!(
                check_interval_minutes = self.policy.check_interval.num_minutes(),
                renewal_window_minutes = self.policy.renewal_window.num_minutes(),
                "only one check falls inside the renewal window; a single failed renewal can let the subscription lapse"
            );
        }
        let interval = self.policy.check_interval_std();

        loop {
            let outcome = self.tick().await;
            outcome_tx.send_replace(Some(outcome));

            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = wake.notified() => {}
                _ = sleep(interval) => {}
            }
        }

        info!("subscription renewal worker stopped");
    }
}

/// Control side of a spawned [`RenewalWorker`].
pub struct RenewalHandle {
    task: Option<JoinHandle<()>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    wake: Arc<Notify>,
    outcomes: watch::Receiver<Option<TickOutcome>>,
}

impl RenewalHandle {
    /// Cuts the current sleep short so the next tick runs immediately.
    pub fn tick_now(&self) {
        self.wake.notify_one();
    }

    /// Latest tick outcomes; `changed()` resolves after every tick.
    pub fn outcomes(&self) -> watch::Receiver<Option<TickOutcome>> {
        self.outcomes.clone()
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(task) = self.task.take() {
            if let Err(error) = task.await {
                warn!(error = %error, "renewal worker task ended abnormally");
            }
        }
    }
}

impl Drop for RenewalHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use chrono::{Duration, TimeZone, Utc};
    use uuid::Uuid;

    use super::{RenewalWorker, TickOutcome};
    use crate::config::RenewalPolicy;
    use crate::subscription::clock::ManualClock;
    use crate::subscription::testing::MockApi;
    use crate::subscription::{
        Clock, SubscriptionManager, SubscriptionStore, SubscriptionTarget,
    };

    struct Fixture {
        api: Arc<MockApi>,
        clock: Arc<ManualClock>,
        manager: Arc<SubscriptionManager>,
        dir: PathBuf,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    fn fixture() -> Fixture {
        let dir = std::env::temp_dir().join(format!("mailwatch-worker-test-{}", Uuid::new_v4()));
        let api = Arc::new(MockApi::default());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 10, 18, 0, 0, 0).unwrap(),
        ));
        let manager = Arc::new(SubscriptionManager::new(
            api.clone(),
            SubscriptionStore::new(dir.join("subscription.json")),
            clock.clone(),
        ));
        Fixture {
            api,
            clock,
            manager,
            dir,
        }
    }

    fn worker(fx: &Fixture) -> RenewalWorker {
        RenewalWorker::new(
            fx.manager.clone(),
            SubscriptionTarget::inbox(
                "owner@example.com",
                "https://hooks.example.test/webhook",
                "s3cret",
            ),
            RenewalPolicy::default(),
        )
    }

    #[tokio::test]
    async fn first_tick_creates_when_nothing_is_persisted() {
        let fx = fixture();
        let outcome = worker(&fx).tick().await;
        let TickOutcome::Created(created) = outcome else {
            panic!("expected create, got {outcome:?}");
        };
        assert_eq!(created.expiration, fx.clock.now() + Duration::days(2));
    }

    #[tokio::test]
    async fn tick_outside_window_does_nothing_remote() {
        let fx = fixture();
        let worker = worker(&fx);
        worker.tick().await;

        fx.clock.advance(Duration::hours(6));
        assert!(matches!(worker.tick().await, TickOutcome::Unchanged(_)));
        assert_eq!(fx.api.calls(), vec!["create:1".to_string()]);
    }

    #[tokio::test]
    async fn window_boundary_is_exclusive() {
        let fx = fixture();
        let worker = worker(&fx);
        worker.tick().await;

        // 12h remaining is not < 12h.
        fx.clock.advance(Duration::hours(36));
        assert!(matches!(worker.tick().await, TickOutcome::Unchanged(_)));

        fx.clock.advance(Duration::seconds(1));
        assert!(matches!(worker.tick().await, TickOutcome::Renewed(_)));
    }

    #[tokio::test]
    async fn failed_renew_recreates_in_same_tick() {
        let fx = fixture();
        let worker = worker(&fx);
        let TickOutcome::Created(original) = worker.tick().await else {
            panic!("expected initial create");
        };

        fx.clock.advance(Duration::hours(42));
        fx.api.set_fail_renew(true);
        let outcome = worker.tick().await;
        let TickOutcome::Recreated(replacement) = outcome else {
            panic!("expected recreate, got {outcome:?}");
        };

        assert_ne!(replacement.id, original.id);
        assert_eq!(
            fx.api.calls(),
            vec![
                "create:1".to_string(),
                format!("renew:{}", original.id),
                "create:2".to_string()
            ]
        );
        let stored = fx.manager.store().load().expect("load").expect("stored");
        assert_eq!(stored.id, replacement.id);
        assert_eq!(stored.expiration, fx.clock.now() + Duration::days(2));
    }

    #[tokio::test]
    async fn remote_failures_are_reported_and_retried_next_tick() {
        let fx = fixture();
        let worker = worker(&fx);
        fx.api.set_fail_create(true);
        assert!(matches!(worker.tick().await, TickOutcome::Failed(_)));
        assert!(fx.manager.store().load().expect("load").is_none());

        fx.api.set_fail_create(false);
        assert!(matches!(worker.tick().await, TickOutcome::Created(_)));
    }

    #[tokio::test]
    async fn malformed_record_triggers_create() {
        let fx = fixture();
        std::fs::create_dir_all(&fx.dir).expect("create dir");
        std::fs::write(fx.manager.store().path(), "not json").expect("write garbage");

        assert!(matches!(worker(&fx).tick().await, TickOutcome::Created(_)));
    }

    #[tokio::test]
    async fn spawned_loop_ticks_on_demand_and_stops_on_shutdown() {
        let fx = fixture();
        let handle = worker(&fx).spawn();
        let mut outcomes = handle.outcomes();

        tokio::time::timeout(StdDuration::from_secs(5), outcomes.changed())
            .await
            .expect("first tick within timeout")
            .expect("worker alive");
        assert!(matches!(
            outcomes.borrow_and_update().as_ref(),
            Some(TickOutcome::Created(_))
        ));

        fx.clock.advance(Duration::hours(43));
        handle.tick_now();
        tokio::time::timeout(StdDuration::from_secs(5), outcomes.changed())
            .await
            .expect("second tick within timeout")
            .expect("worker alive");
        assert!(matches!(
            outcomes.borrow_and_update().as_ref(),
            Some(TickOutcome::Renewed(_))
        ));

        tokio::time::timeout(StdDuration::from_secs(5), handle.shutdown())
            .await
            .expect("shutdown does not wait out the sleep");
        assert_eq!(fx.api.renews.load(Ordering::SeqCst), 1);
    }
}
