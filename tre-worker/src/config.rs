use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tre_orchestrator::channel::{
    ChannelOptions, AIRLOCK_STATUS_QUEUE, DEPLOYMENT_STATUS_QUEUE, RESOURCE_REQUEST_QUEUE,
};
use tre_orchestrator::resource::Properties;
use tre_orchestrator::{HistoryPolicy, RepositoryOptions, RetryPolicy};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Directory of template JSON files registered at startup
    #[serde(default = "default_templates_dir")]
    pub templates_dir: Option<PathBuf>,

    /// Identifier of this TRE, stamped on every resource as `tre_id`
    #[serde(default = "default_tre_id")]
    pub tre_id: Option<String>,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_lease")]
    pub lease_secs: u64,

    #[serde(default = "default_max_delivery_count")]
    pub max_delivery_count: u32,

    #[serde(default = "default_retry_attempts")]
    pub retry_max_attempts: u32,

    #[serde(default = "default_retry_initial_backoff")]
    pub retry_initial_backoff_ms: u64,

    #[serde(default = "default_retry_max_backoff")]
    pub retry_max_backoff_ms: u64,

    /// Inline history entries kept per resource; unset keeps everything
    #[serde(default = "default_history_keep")]
    pub history_keep: Option<usize>,

    #[serde(default = "default_template_cache_ttl")]
    pub template_cache_ttl_secs: u64,

    #[serde(default = "default_page_size")]
    pub query_page_size: u32,

    #[serde(default = "default_resource_request_queue")]
    pub resource_request_queue: String,

    #[serde(default = "default_deployment_status_queue")]
    pub deployment_status_queue: String,

    #[serde(default = "default_airlock_status_queue")]
    pub airlock_status_queue: String,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("TRE_DB_PATH") {
        return PathBuf::from(path);
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".tre").join("worker").join("tre.db")
}

fn default_templates_dir() -> Option<PathBuf> {
    std::env::var("TRE_TEMPLATES_DIR").ok().map(PathBuf::from)
}

fn default_tre_id() -> Option<String> {
    std::env::var("TRE_ID").ok().filter(|id| !id.is_empty())
}

fn default_poll_interval() -> u64 {
    env_parse("TRE_POLL_INTERVAL_MS").unwrap_or(1000)
}

fn default_lease() -> u64 {
    env_parse("TRE_LEASE_SECS").unwrap_or(60)
}

fn default_max_delivery_count() -> u32 {
    env_parse("TRE_MAX_DELIVERY_COUNT").unwrap_or(10)
}

fn default_retry_attempts() -> u32 {
    env_parse("TRE_RETRY_MAX_ATTEMPTS").unwrap_or(5)
}

fn default_retry_initial_backoff() -> u64 {
    env_parse("TRE_RETRY_INITIAL_BACKOFF_MS").unwrap_or(50)
}

fn default_retry_max_backoff() -> u64 {
    env_parse("TRE_RETRY_MAX_BACKOFF_MS").unwrap_or(2000)
}

fn default_history_keep() -> Option<usize> {
    env_parse("TRE_HISTORY_KEEP")
}

fn default_template_cache_ttl() -> u64 {
    env_parse("TRE_TEMPLATE_CACHE_TTL_SECS").unwrap_or(300) // 5 minutes
}

fn default_page_size() -> u32 {
    env_parse("TRE_QUERY_PAGE_SIZE").unwrap_or(100)
}

fn default_resource_request_queue() -> String {
    std::env::var("TRE_RESOURCE_REQUEST_QUEUE")
        .unwrap_or_else(|_| RESOURCE_REQUEST_QUEUE.to_string())
}

fn default_deployment_status_queue() -> String {
    std::env::var("TRE_DEPLOYMENT_STATUS_QUEUE")
        .unwrap_or_else(|_| DEPLOYMENT_STATUS_QUEUE.to_string())
}

fn default_airlock_status_queue() -> String {
    std::env::var("TRE_AIRLOCK_STATUS_QUEUE").unwrap_or_else(|_| AIRLOCK_STATUS_QUEUE.to_string())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            templates_dir: default_templates_dir(),
            tre_id: default_tre_id(),
            poll_interval_ms: default_poll_interval(),
            lease_secs: default_lease(),
            max_delivery_count: default_max_delivery_count(),
            retry_max_attempts: default_retry_attempts(),
            retry_initial_backoff_ms: default_retry_initial_backoff(),
            retry_max_backoff_ms: default_retry_max_backoff(),
            history_keep: default_history_keep(),
            template_cache_ttl_secs: default_template_cache_ttl(),
            query_page_size: default_page_size(),
            resource_request_queue: default_resource_request_queue(),
            deployment_status_queue: default_deployment_status_queue(),
            airlock_status_queue: default_airlock_status_queue(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Reject settings the worker cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_delivery_count == 0 {
            anyhow::bail!("max_delivery_count must be at least 1");
        }
        if self.query_page_size == 0 {
            anyhow::bail!("query_page_size must be at least 1");
        }
        if self.retry_initial_backoff_ms > self.retry_max_backoff_ms {
            anyhow::bail!(
                "retry_initial_backoff_ms ({}) exceeds retry_max_backoff_ms ({})",
                self.retry_initial_backoff_ms,
                self.retry_max_backoff_ms
            );
        }
        let queues = [
            &self.resource_request_queue,
            &self.deployment_status_queue,
            &self.airlock_status_queue,
        ];
        if queues.iter().any(|q| q.is_empty()) {
            anyhow::bail!("queue names must not be empty");
        }
        if queues[0] == queues[1] || queues[0] == queues[2] || queues[1] == queues[2] {
            anyhow::bail!("resource request and status queues must be distinct");
        }
        Ok(())
    }

    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            lease: Duration::from_secs(self.lease_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_delivery_count: self.max_delivery_count,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_attempts,
            Duration::from_millis(self.retry_initial_backoff_ms),
            Duration::from_millis(self.retry_max_backoff_ms),
        )
    }

    pub fn history_policy(&self) -> HistoryPolicy {
        match self.history_keep {
            Some(keep) => HistoryPolicy::Capped { keep },
            None => HistoryPolicy::Unbounded,
        }
    }

    pub fn repository_options(&self) -> RepositoryOptions {
        let mut system_properties = Properties::new();
        if let Some(tre_id) = &self.tre_id {
            system_properties.insert("tre_id".to_string(), tre_id.clone().into());
        }

        RepositoryOptions {
            history: self.history_policy(),
            page_size: self.query_page_size,
            system_properties,
            retry: self.retry_policy(),
        }
    }

    pub fn template_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.template_cache_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(overrides: serde_json::Value) -> Config {
        serde_json::from_value(overrides).unwrap()
    }

    #[test]
    fn test_explicit_values_override_defaults() {
        let config = config(json!({
            "db_path": "/data/tre.db",
            "tre_id": "mytre",
            "poll_interval_ms": 25,
            "history_keep": 10,
            "retry_max_attempts": 3,
            "retry_initial_backoff_ms": 10,
            "retry_max_backoff_ms": 100
        }));

        assert_eq!(config.db_path, PathBuf::from("/data/tre.db"));
        assert_eq!(config.channel_options().poll_interval, Duration::from_millis(25));
        assert_eq!(config.history_policy(), HistoryPolicy::Capped { keep: 10 });

        let options = config.repository_options();
        assert_eq!(options.system_properties["tre_id"], json!("mytre"));
        assert_eq!(options.retry.max_attempts, 3);
        assert_eq!(options.retry.backoff_for(5), Duration::from_millis(100));
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let zero_deliveries = config(json!({"max_delivery_count": 0}));
        assert!(zero_deliveries.validate().is_err());

        let backwards_backoff = config(json!({
            "retry_initial_backoff_ms": 5000,
            "retry_max_backoff_ms": 100
        }));
        assert!(backwards_backoff.validate().is_err());

        let shared_queue = config(json!({
            "resource_request_queue": "q",
            "deployment_status_queue": "q"
        }));
        assert!(shared_queue.validate().is_err());
    }

    #[test]
    fn test_unset_history_keep_is_unbounded() {
        let config = config(json!({"history_keep": null}));
        assert_eq!(config.history_policy(), HistoryPolicy::Unbounded);
    }
}
