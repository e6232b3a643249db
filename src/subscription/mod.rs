use std::fmt::{Display, Formatter};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub mod clock;
pub mod manager;
pub mod store;
pub mod worker;

pub use clock::{Clock, SystemClock};
pub use manager::{ManagerError, SubscriptionManager, SubscriptionTarget};
pub use store::{StoreError, SubscriptionStore};
pub use worker::{RenewalHandle, RenewalWorker, TickOutcome};

/// Change type requested for new inbox messages.
pub const CHANGE_TYPE_CREATED: &str = "created";

/// A change-notification subscription as returned by Graph and persisted locally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subscription {
    pub id: String,
    pub resource: String,
    #[serde(
        rename = "changeType",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub change_type: Option<String>,
    #[serde(
        rename = "expirationDateTime",
        serialize_with = "serialize_utc_z",
        deserialize_with = "deserialize_utc_lenient"
    )]
    pub expiration: DateTime<Utc>,
    #[serde(rename = "notificationUrl")]
    pub notification_url: String,
    #[serde(rename = "clientState", default)]
    pub client_state: String,
}

impl Subscription {
    /// True while the remote service still honors the subscription.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration > now
    }

    pub fn remaining_at(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.expiration.signed_duration_since(now)
    }
}

impl Display for Subscription {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}) expires {}",
            self.id,
            self.resource,
            format_expiration(self.expiration)
        )
    }
}

/// Body of a subscription create request.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NewSubscription {
    #[serde(rename = "changeType")]
    pub change_type: String,
    #[serde(rename = "notificationUrl")]
    pub notification_url: String,
    pub resource: String,
    #[serde(rename = "expirationDateTime", serialize_with = "serialize_utc_z")]
    pub expiration: DateTime<Utc>,
    #[serde(rename = "clientState")]
    pub client_state: String,
}

/// Remote side of the subscription lifecycle.
///
/// Implementations return `Err` for any non-success response; the manager
/// decides what a failure means for local state.
#[async_trait]
pub trait SubscriptionApi: Send + Sync {
    async fn create_subscription(&self, request: &NewSubscription) -> anyhow::Result<Subscription>;

    async fn renew_subscription(
        &self,
        subscription_id: &str,
        expiration: DateTime<Utc>,
    ) -> anyhow::Result<Subscription>;

    async fn delete_subscription(&self, subscription_id: &str) -> anyhow::Result<()>;
}

pub fn format_expiration(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn serialize_utc_z<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format_expiration(*value))
}

fn deserialize_utc_lenient<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_expiration(&raw).map_err(serde::de::Error::custom)
}

/// Parses an expiration timestamp. Offsets are honored; a naive timestamp is
/// taken as UTC.
pub fn parse_expiration(raw: &str) -> Result<DateTime<Utc>, String> {
    let value = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|error| format!("invalid expirationDateTime '{value}': {error}"))
}
