use std::path::PathBuf;
use std::time::Duration as StdDuration;

use chrono::Duration;
use clap::Args;
use thiserror::Error;

use crate::auth::{
    parse_token_cache_key_hex, GraphCredentials, TokenCacheSettings, TOKEN_CACHE_KEY_BYTES,
};
use crate::subscription::manager::MAX_SUBSCRIPTION_TTL_MINUTES;
use crate::subscription::SubscriptionTarget;

pub const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";
pub const SUBSCRIPTION_FILE_NAME: &str = "subscription.json";
pub const TOKEN_CACHE_FILE_NAME: &str = "token_cache.json";

const DEFAULT_TTL_MINUTES: i64 = 2 * 24 * 60;
const DEFAULT_RENEWAL_WINDOW_MINUTES: i64 = 12 * 60;
const DEFAULT_CHECK_INTERVAL_MINUTES: i64 = 6 * 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {flag} ({env})")]
    Missing {
        flag: &'static str,
        env: &'static str,
    },

    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Timing rules for keeping the subscription alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalPolicy {
    /// Lifetime requested on every create and renew.
    pub ttl: Duration,
    /// Renew once the remaining lifetime drops below this.
    pub renewal_window: Duration,
    /// Pause between renewal checks.
    pub check_interval: Duration,
}

impl Default for RenewalPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::minutes(DEFAULT_TTL_MINUTES),
            renewal_window: Duration::minutes(DEFAULT_RENEWAL_WINDOW_MINUTES),
            check_interval: Duration::minutes(DEFAULT_CHECK_INTERVAL_MINUTES),
        }
    }
}

impl RenewalPolicy {
    pub fn from_minutes(
        ttl: i64,
        renewal_window: i64,
        check_interval: i64,
    ) -> Result<Self, ConfigError> {
        let policy = Self {
            ttl: Duration::minutes(ttl),
            renewal_window: Duration::minutes(renewal_window),
            check_interval: Duration::minutes(check_interval),
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Whether a failed renewal is retried by the check that lands at the
    /// latest on the expiration instant.
    pub fn tolerates_missed_check(&self) -> bool {
        self.check_interval * 2 <= self.renewal_window
    }

    /// A subscription nearing expiry must be seen by at least one check
    /// inside the window, so the interval has to be shorter than the window,
    /// and the window shorter than the lifetime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl <= Duration::zero()
            || self.renewal_window <= Duration::zero()
            || self.check_interval <= Duration::zero()
        {
            return Err(ConfigError::Invalid(
                "subscription ttl, renewal window and check interval must be positive".to_string(),
            ));
        }
        if self.ttl > Duration::minutes(MAX_SUBSCRIPTION_TTL_MINUTES) {
            return Err(ConfigError::Invalid(format!(
                "subscription ttl of {} minutes exceeds the {MAX_SUBSCRIPTION_TTL_MINUTES} minute maximum",
                self.ttl.num_minutes()
            )));
        }
        if self.check_interval >= self.renewal_window {
            return Err(ConfigError::Invalid(format!(
                "check interval ({}m) must be shorter than renewal window ({}m)",
                self.check_interval.num_minutes(),
                self.renewal_window.num_minutes()
            )));
        }
        if self.renewal_window >= self.ttl {
            return Err(ConfigError::Invalid(format!(
                "renewal window ({}m) must be shorter than subscription ttl ({}m)",
                self.renewal_window.num_minutes(),
                self.ttl.num_minutes()
            )));
        }
        Ok(())
    }

    pub fn check_interval_std(&self) -> StdDuration {
        self.check_interval.to_std().unwrap_or(StdDuration::ZERO)
    }
}

/// Settings shared by every subcommand. Each flag falls back to an
/// environment variable.
#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    /// Azure AD tenant id
    #[arg(long, env = "MAILWATCH_TENANT_ID", global = true)]
    pub tenant_id: Option<String>,

    /// Application (client) id
    #[arg(long, env = "MAILWATCH_CLIENT_ID", global = true)]
    pub client_id: Option<String>,

    /// Application client secret
    #[arg(long, env = "MAILWATCH_CLIENT_SECRET", global = true, hide_env_values = true)]
    pub client_secret: Option<String>,

    /// Mailbox to read and watch
    #[arg(long, env = "MAILWATCH_USER_EMAIL", global = true)]
    pub user_email: Option<String>,

    /// Public URL Graph posts notifications to
    #[arg(long, env = "MAILWATCH_NOTIFICATION_URL", global = true)]
    pub notification_url: Option<String>,

    /// Shared secret echoed in every notification
    #[arg(long, env = "MAILWATCH_CLIENT_STATE", global = true, hide_env_values = true)]
    pub client_state: Option<String>,

    #[arg(long, env = "MAILWATCH_WEBHOOK_HOST", default_value = "127.0.0.1", global = true)]
    pub webhook_host: String,

    #[arg(long, env = "MAILWATCH_WEBHOOK_PORT", default_value_t = 5000, global = true)]
    pub webhook_port: u16,

    /// Directory holding the subscription record and token cache
    #[arg(long, env = "MAILWATCH_STATE_DIR", global = true)]
    pub state_dir: Option<PathBuf>,

    #[arg(long, env = "MAILWATCH_SUBSCRIPTION_TTL_MINUTES", default_value_t = DEFAULT_TTL_MINUTES, global = true)]
    pub ttl_minutes: i64,

    #[arg(long, env = "MAILWATCH_RENEWAL_WINDOW_MINUTES", default_value_t = DEFAULT_RENEWAL_WINDOW_MINUTES, global = true)]
    pub renewal_window_minutes: i64,

    #[arg(long, env = "MAILWATCH_CHECK_INTERVAL_MINUTES", default_value_t = DEFAULT_CHECK_INTERVAL_MINUTES, global = true)]
    pub check_interval_minutes: i64,

    /// Upper bound on each Graph request
    #[arg(long, env = "MAILWATCH_HTTP_TIMEOUT_SECONDS", default_value_t = 30, global = true)]
    pub http_timeout_seconds: u64,

    /// 64 hex characters; enables the encrypted on-disk token cache
    #[arg(long, env = "MAILWATCH_TOKEN_CACHE_KEY", global = true, hide_env_values = true)]
    pub token_cache_key: Option<String>,

    #[arg(long, env = "MAILWATCH_GRAPH_API_BASE", default_value = GRAPH_API_BASE, global = true)]
    pub graph_api_base: String,

    #[arg(long, env = "MAILWATCH_GRAPH_TOKEN_URL", global = true)]
    pub graph_token_url: Option<String>,
}

impl ConfigArgs {
    pub fn credentials(&self) -> Result<GraphCredentials, ConfigError> {
        Ok(GraphCredentials {
            tenant_id: required(&self.tenant_id, "--tenant-id", "MAILWATCH_TENANT_ID")?,
            client_id: required(&self.client_id, "--client-id", "MAILWATCH_CLIENT_ID")?,
            client_secret: required(
                &self.client_secret,
                "--client-secret",
                "MAILWATCH_CLIENT_SECRET",
            )?,
        })
    }

    pub fn user_email(&self) -> Result<String, ConfigError> {
        required(&self.user_email, "--user-email", "MAILWATCH_USER_EMAIL")
    }

    pub fn client_state(&self) -> Result<String, ConfigError> {
        required(&self.client_state, "--client-state", "MAILWATCH_CLIENT_STATE")
    }

    pub fn subscription_target(&self) -> Result<SubscriptionTarget, ConfigError> {
        let notification_url = required(
            &self.notification_url,
            "--notification-url",
            "MAILWATCH_NOTIFICATION_URL",
        )?;
        if !notification_url.starts_with("https://") {
            return Err(ConfigError::Invalid(format!(
                "notification url must be https, got '{notification_url}'"
            )));
        }
        Ok(SubscriptionTarget::inbox(
            &self.user_email()?,
            &notification_url,
            &self.client_state()?,
        ))
    }

    pub fn policy(&self) -> Result<RenewalPolicy, ConfigError> {
        RenewalPolicy::from_minutes(
            self.ttl_minutes,
            self.renewal_window_minutes,
            self.check_interval_minutes,
        )
    }

    /// Listen address as `host:port`. Host names are resolved when binding.
    pub fn webhook_addr(&self) -> Result<String, ConfigError> {
        let host = self.webhook_host.trim();
        if host.is_empty() || host.chars().any(char::is_whitespace) {
            return Err(ConfigError::Invalid(format!(
                "webhook host '{}' is not a valid host name or IP address",
                self.webhook_host
            )));
        }
        // Bare IPv6 literals need brackets before a port can follow.
        if host.contains(':') && !host.starts_with('[') {
            Ok(format!("[{host}]:{}", self.webhook_port))
        } else {
            Ok(format!("{host}:{}", self.webhook_port))
        }
    }

    pub fn http_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.http_timeout_seconds.max(1))
    }

    pub fn token_cache_key(&self) -> Result<Option<[u8; TOKEN_CACHE_KEY_BYTES]>, ConfigError> {
        non_empty(&self.token_cache_key)
            .map(|value| {
                parse_token_cache_key_hex(&value).map_err(|_| {
                    ConfigError::Invalid(
                        "MAILWATCH_TOKEN_CACHE_KEY must be 64 hex characters (32 bytes)"
                            .to_string(),
                    )
                })
            })
            .transpose()
    }

    pub fn state_dir(&self) -> Result<PathBuf, ConfigError> {
        if let Some(dir) = &self.state_dir {
            return Ok(dir.clone());
        }
        let home = dirs::home_dir()
            .ok_or_else(|| ConfigError::Invalid("failed to determine home directory".to_string()))?;
        Ok(home.join(".mailwatch"))
    }

    pub fn subscription_path(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.state_dir()?.join(SUBSCRIPTION_FILE_NAME))
    }

    pub fn token_cache_path(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.state_dir()?.join(TOKEN_CACHE_FILE_NAME))
    }

    pub fn token_url(&self, tenant_id: &str) -> String {
        non_empty(&self.graph_token_url).unwrap_or_else(|| {
            format!("https://login.microsoftonline.com/{tenant_id}/oauth2/v2.0/token")
        })
    }

    pub fn api_base(&self) -> String {
        self.graph_api_base.trim().trim_end_matches('/').to_string()
    }
}

/// Settings for the long-running monitor, resolved and validated together.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub credentials: GraphCredentials,
    pub user_email: String,
    pub target: SubscriptionTarget,
    pub policy: RenewalPolicy,
    pub webhook_addr: String,
    pub http_timeout: StdDuration,
    pub token_url: String,
    pub api_base: String,
    pub token_cache: TokenCacheSettings,
    pub subscription_path: PathBuf,
}

impl ConfigArgs {
    pub fn token_cache_settings(&self) -> Result<TokenCacheSettings, ConfigError> {
        Ok(TokenCacheSettings {
            path: Some(self.token_cache_path()?),
            key: self.token_cache_key()?,
        })
    }

    pub fn monitor_config(&self) -> Result<MonitorConfig, ConfigError> {
        let credentials = self.credentials()?;
        let token_url = self.token_url(&credentials.tenant_id);
        Ok(MonitorConfig {
            user_email: self.user_email()?,
            target: self.subscription_target()?,
            policy: self.policy()?,
            webhook_addr: self.webhook_addr()?,
            http_timeout: self.http_timeout(),
            token_url,
            api_base: self.api_base(),
            token_cache: self.token_cache_settings()?,
            subscription_path: self.subscription_path()?,
            credentials,
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn required(
    value: &Option<String>,
    flag: &'static str,
    env: &'static str,
) -> Result<String, ConfigError> {
    non_empty(value).ok_or(ConfigError::Missing { flag, env })
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use clap::Parser;

    use super::{ConfigArgs, ConfigError, RenewalPolicy};

    #[derive(Debug, Parser)]
    struct TestCli {
        #[command(flatten)]
        config: ConfigArgs,
    }

    fn parse(args: &[&str]) -> ConfigArgs {
        let mut argv = vec!["mailwatch"];
        argv.extend_from_slice(args);
        TestCli::try_parse_from(argv).expect("parse args").config
    }

    #[test]
    fn default_policy_matches_graph_guidance() {
        let policy = RenewalPolicy::default();
        assert_eq!(policy.ttl, Duration::days(2));
        assert_eq!(policy.renewal_window, Duration::hours(12));
        assert_eq!(policy.check_interval, Duration::hours(6));
        policy.validate().expect("default policy is valid");
        assert!(policy.tolerates_missed_check());
    }

    #[test]
    fn interval_just_under_window_has_no_retry_slack() {
        let tight = RenewalPolicy::from_minutes(2880, 720, 719).expect("valid policy");
        assert!(!tight.tolerates_missed_check());
        let halved = RenewalPolicy::from_minutes(2880, 720, 360).expect("valid policy");
        assert!(halved.tolerates_missed_check());
    }

    #[test]
    fn policy_rejects_interval_not_shorter_than_window() {
        let error = RenewalPolicy::from_minutes(2880, 720, 720).expect_err("interval == window");
        assert!(matches!(error, ConfigError::Invalid(_)));
        assert!(RenewalPolicy::from_minutes(2880, 720, 721).is_err());
        assert!(RenewalPolicy::from_minutes(2880, 720, 719).is_ok());
    }

    #[test]
    fn policy_rejects_ttl_over_service_maximum_and_non_positive_values() {
        assert!(RenewalPolicy::from_minutes(4231, 720, 360).is_err());
        assert!(RenewalPolicy::from_minutes(4230, 720, 360).is_ok());
        assert!(RenewalPolicy::from_minutes(0, 720, 360).is_err());
        assert!(RenewalPolicy::from_minutes(2880, 720, 0).is_err());
        assert!(RenewalPolicy::from_minutes(600, 720, 360).is_err());
    }

    #[test]
    fn missing_credentials_name_flag_and_env() {
        let args = parse(&["--tenant-id", "tenant-a", "--client-id", "client-a"]);
        let error = args.credentials().expect_err("secret missing");
        assert_eq!(
            error,
            ConfigError::Missing {
                flag: "--client-secret",
                env: "MAILWATCH_CLIENT_SECRET"
            }
        );
        assert!(error.to_string().contains("MAILWATCH_CLIENT_SECRET"));
    }

    #[test]
    fn subscription_target_requires_https_notification_url() {
        let args = parse(&[
            "--user-email",
            "owner@example.com",
            "--client-state",
            "s3cret",
            "--notification-url",
            "http://insecure.example.test/webhook",
        ]);
        assert!(matches!(
            args.subscription_target(),
            Err(ConfigError::Invalid(_))
        ));

        let args = parse(&[
            "--user-email",
            "owner@example.com",
            "--client-state",
            "s3cret",
            "--notification-url",
            "https://hooks.example.test/webhook",
        ]);
        let target = args.subscription_target().expect("target");
        assert_eq!(
            target.resource,
            "users/owner@example.com/mailFolders('Inbox')/messages"
        );
        assert_eq!(target.client_state, "s3cret");
    }

    #[test]
    fn paths_live_under_state_dir() {
        let args = parse(&["--state-dir", "/tmp/mailwatch-state"]);
        assert_eq!(
            args.subscription_path().expect("subscription path"),
            std::path::PathBuf::from("/tmp/mailwatch-state/subscription.json")
        );
        assert_eq!(
            args.token_cache_path().expect("token cache path"),
            std::path::PathBuf::from("/tmp/mailwatch-state/token_cache.json")
        );
    }

    #[test]
    fn token_cache_key_must_be_32_hex_bytes() {
        let args = parse(&["--token-cache-key", "abcd"]);
        assert!(args.token_cache_key().is_err());

        let args = parse(&[
            "--token-cache-key",
            "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff",
        ]);
        assert!(args.token_cache_key().expect("parse key").is_some());
    }

    #[test]
    fn monitor_config_collects_every_setting() {
        let args = parse(&[
            "--tenant-id",
            "tenant-a",
            "--client-id",
            "client-a",
            "--client-secret",
            "secret-a",
            "--user-email",
            "owner@example.com",
            "--client-state",
            "s3cret",
            "--notification-url",
            "https://hooks.example.test/webhook",
            "--state-dir",
            "/tmp/mailwatch-state",
            "--webhook-port",
            "8080",
        ]);
        let config = args.monitor_config().expect("monitor config");
        assert_eq!(config.credentials.tenant_id, "tenant-a");
        assert_eq!(config.webhook_addr, "127.0.0.1:8080");
        assert_eq!(config.policy, RenewalPolicy::default());
        assert!(config.token_cache.key.is_none());
        assert_eq!(
            config.subscription_path,
            std::path::PathBuf::from("/tmp/mailwatch-state/subscription.json")
        );

        let invalid = parse(&[
            "--tenant-id",
            "tenant-a",
            "--client-id",
            "client-a",
            "--client-secret",
            "secret-a",
            "--user-email",
            "owner@example.com",
            "--client-state",
            "s3cret",
            "--notification-url",
            "https://hooks.example.test/webhook",
            "--check-interval-minutes",
            "720",
        ]);
        assert!(matches!(
            invalid.monitor_config(),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn token_url_defaults_to_tenant_authority() {
        let args = parse(&[]);
        assert_eq!(
            args.token_url("tenant-a"),
            "https://login.microsoftonline.com/tenant-a/oauth2/v2.0/token"
        );
        assert_eq!(args.api_base(), "https://graph.microsoft.com/v1.0");
        assert_eq!(args.webhook_addr().expect("addr"), "127.0.0.1:5000");
    }

    #[test]
    fn webhook_host_accepts_names_and_ipv6_literals() {
        let named = parse(&["--webhook-host", "localhost"]);
        assert_eq!(named.webhook_addr().expect("addr"), "localhost:5000");

        let v6 = parse(&["--webhook-host", "::1", "--webhook-port", "8443"]);
        assert_eq!(v6.webhook_addr().expect("addr"), "[::1]:8443");

        let bracketed = parse(&["--webhook-host", "[::]"]);
        assert_eq!(bracketed.webhook_addr().expect("addr"), "[::]:5000");

        for host in ["", "  ", "bad host"] {
            assert!(matches!(
                parse(&["--webhook-host", host]).webhook_addr(),
                Err(ConfigError::Invalid(_))
            ));
        }
    }
}
