//! Configuration for the realtime client.

use secrecy::SecretString;

use crate::realtime::client::RealtimeClientError;
use crate::retry::RetrySchedule;

/// Hub URL used when no configuration key provides one.
pub const DEFAULT_AUDIT_HUB_URL: &str = "https://localhost:5001/hubs/audit";

/// Keys consulted for the hub URL, in precedence order.
pub const HUB_URL_KEYS: [&str; 3] = [
    "SignalR:AuditHubUrl",
    "Realtime:AuditHubUrl",
    "Realtime:HubUrl",
];
/// Key holding a comma-separated retry schedule in milliseconds.
pub const RETRY_SCHEDULE_KEY: &str = "Realtime:RetryScheduleMs";
/// Key holding the API key sent with websocket upgrades.
pub const API_KEY_KEY: &str = "Realtime:ApiKey";

/// Settings for a [`RealtimeClient`](crate::realtime::client::RealtimeClient).
#[derive(Clone, Debug)]
pub struct RealtimeOptions {
    /// Endpoint of the audit event hub.
    pub hub_url: String,
    /// Waits applied before successive connect attempts.
    pub retry_schedule: RetrySchedule,
    /// Optional API key for transports that authenticate.
    pub api_key: Option<SecretString>,
}

impl Default for RealtimeOptions {
    fn default() -> Self {
        Self {
            hub_url: DEFAULT_AUDIT_HUB_URL.to_string(),
            retry_schedule: RetrySchedule::default(),
            api_key: None,
        }
    }
}

impl RealtimeOptions {
    /// Resolves options through a key lookup, falling back to defaults.
    ///
    /// Blank values are treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, RealtimeClientError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let mut options = Self::default();
        if let Some(url) = HUB_URL_KEYS.iter().find_map(|key| read(*key)) {
            options.hub_url = url;
        }
        if let Some(list) = read(RETRY_SCHEDULE_KEY) {
            options.retry_schedule = RetrySchedule::from_millis_list(&list)?;
        }
        if let Some(api_key) = read(API_KEY_KEY) {
            options.api_key = Some(SecretString::new(api_key));
        }

        validate_hub_url(&options.hub_url)?;
        Ok(options)
    }

    /// Resolves options from environment variables.
    ///
    /// Each key maps to an upper-cased variable with `:` replaced by `__`,
    /// so `SignalR:AuditHubUrl` is read from `SIGNALR__AUDITHUBURL`.
    pub fn from_env() -> Result<Self, RealtimeClientError> {
        Self::from_lookup(|key| std::env::var(env_var_name(key)).ok())
    }

    /// Sets the hub URL.
    pub fn with_hub_url(mut self, hub_url: impl Into<String>) -> Self {
        self.hub_url = hub_url.into().trim().to_string();
        self
    }

    /// Sets the retry schedule.
    pub fn with_retry_schedule(mut self, retry_schedule: RetrySchedule) -> Self {
        self.retry_schedule = retry_schedule;
        self
    }

    /// Sets the API key.
    pub fn with_api_key(mut self, api_key: SecretString) -> Self {
        self.api_key = Some(api_key);
        self
    }
}

/// Environment variable name for a configuration key.
pub fn env_var_name(key: &str) -> String {
    key.replace(':', "__").to_ascii_uppercase()
}

pub(crate) fn validate_hub_url(url: &str) -> Result<(), RealtimeClientError> {
    if url.trim().is_empty() {
        return Err(RealtimeClientError::InvalidConfig(
            "hub url must not be empty".to_string(),
        ));
    }
    Ok(())
}
