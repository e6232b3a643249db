use std::sync::Arc;

use chrono::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::store::{StoredRecord, SubscriptionStore};
use super::{
    format_expiration, Clock, NewSubscription, StoreError, Subscription, SubscriptionApi,
    CHANGE_TYPE_CREATED,
};

/// Longest lifetime Graph accepts for mail subscriptions.
pub const MAX_SUBSCRIPTION_TTL_MINUTES: i64 = 4230;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("remote subscription call failed: {0:#}")]
    Remote(anyhow::Error),

    #[error("subscription record storage failed: {0}")]
    Storage(#[from] StoreError),
}

impl ManagerError {
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

/// What a new subscription should watch and where notifications go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionTarget {
    pub resource: String,
    pub notification_url: String,
    pub client_state: String,
}

impl SubscriptionTarget {
    /// Inbox of one mailbox, the resource the monitor watches by default.
    pub fn inbox(user_email: &str, notification_url: &str, client_state: &str) -> Self {
        Self {
            resource: format!("users/{user_email}/mailFolders('Inbox')/messages"),
            notification_url: notification_url.to_string(),
            client_state: client_state.to_string(),
        }
    }
}

/// Owner of the single tracked subscription.
///
/// Every mutation of the persisted record goes through this type. Mutating
/// operations are serialized so a manual command cannot interleave with the
/// renewal worker between the remote call and the write.
pub struct SubscriptionManager {
    api: Arc<dyn SubscriptionApi>,
    store: SubscriptionStore,
    clock: Arc<dyn Clock>,
    write_guard: Mutex<()>,
}

impl SubscriptionManager {
    pub fn new(
        api: Arc<dyn SubscriptionApi>,
        store: SubscriptionStore,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            api,
            store,
            clock,
            write_guard: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &SubscriptionStore {
        &self.store
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub async fn create(
        &self,
        target: &SubscriptionTarget,
        ttl: Duration,
    ) -> Result<Subscription, ManagerError> {
        let _guard = self.write_guard.lock().await;

        let request = NewSubscription {
            change_type: CHANGE_TYPE_CREATED.to_string(),
            notification_url: target.notification_url.clone(),
            resource: target.resource.clone(),
            expiration: self.clock.now() + bounded_ttl(ttl),
            client_state: target.client_state.clone(),
        };

        let subscription = match self.api.create_subscription(&request).await {
            Ok(subscription) => subscription,
            Err(error) => {
                warn!(
                    resource = %target.resource,
                    error = %format!("{error:#}"),
                    "subscription create failed"
                );
                return Err(ManagerError::Remote(error));
            }
        };

        if let Err(error) = self.store.save(&subscription) {
            warn!(
                subscription_id = %subscription.id,
                error = %error,
                "could not persist created subscription; deleting it remotely"
            );
            if let Err(delete_error) = self.api.delete_subscription(&subscription.id).await {
                warn!(
                    subscription_id = %subscription.id,
                    error = %format!("{delete_error:#}"),
                    "cleanup of unpersisted subscription failed"
                );
            }
            return Err(ManagerError::Storage(error));
        }
        info!(
            subscription_id = %subscription.id,
            expiration = %format_expiration(subscription.expiration),
            "subscription created"
        );
        Ok(subscription)
    }

    pub async fn renew(
        &self,
        subscription_id: &str,
        ttl: Duration,
    ) -> Result<Subscription, ManagerError> {
        let _guard = self.write_guard.lock().await;

        let expiration = self.clock.now() + bounded_ttl(ttl);
        let subscription = match self
            .api
            .renew_subscription(subscription_id, expiration)
            .await
        {
            Ok(subscription) => subscription,
            Err(error) => {
                warn!(
                    subscription_id,
                    error = %format!("{error:#}"),
                    "subscription renewal failed"
                );
                return Err(ManagerError::Remote(error));
            }
        };

        self.store.save(&subscription)?;
        info!(
            subscription_id = %subscription.id,
            expiration = %format_expiration(subscription.expiration),
            "subscription renewed"
        );
        Ok(subscription)
    }

    /// Deletes the remote subscription. The local record is only dropped once
    /// the remote side confirmed, so a failed delete can be retried by id.
    pub async fn delete(&self, subscription_id: &str) -> Result<(), ManagerError> {
        let _guard = self.write_guard.lock().await;

        if let Err(error) = self.api.delete_subscription(subscription_id).await {
            warn!(
                subscription_id,
                error = %format!("{error:#}"),
                "subscription delete failed"
            );
            return Err(ManagerError::Remote(error));
        }

        let tracks_other = matches!(
            self.store.read()?,
            StoredRecord::Present(ref stored) if stored.id != subscription_id
        );
        if tracks_other {
            info!(
                subscription_id,
                "subscription deleted; persisted record belongs to another subscription"
            );
        } else {
            self.store.remove()?;
            info!(subscription_id, "subscription deleted");
        }
        Ok(())
    }

    /// The persisted subscription if it has not expired yet. Purely local.
    ///
    /// An expired record stays on disk; the next create overwrites it.
    pub fn load_current(&self) -> Result<Option<Subscription>, ManagerError> {
        let Some(subscription) = self.store.load()? else {
            return Ok(None);
        };

        if subscription.is_active_at(self.clock.now()) {
            Ok(Some(subscription))
        } else {
            Ok(None)
        }
    }
}

fn bounded_ttl(ttl: Duration) -> Duration {
    let max = Duration::minutes(MAX_SUBSCRIPTION_TTL_MINUTES);
    if ttl > max {
        warn!(
            requested_minutes = ttl.num_minutes(),
            max_minutes = MAX_SUBSCRIPTION_TTL_MINUTES,
            "subscription ttl exceeds service maximum; clamping"
        );
        max
    } else {
        ttl
    }
}
