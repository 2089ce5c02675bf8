//! Worker configuration

use serde::{Deserialize, Serialize};

/// Configuration for the worker service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Server group for logical organization.
    pub server_group: String,

    /// Service name recorded on the server registration.
    pub service_name: String,

    /// Server name; defaults to the hostname.
    pub server_name: String,

    /// Qualified event-facet names this worker claims. Empty means every
    /// name the handler registry can serve.
    pub topics: Vec<String>,

    /// Task queue partition to poll.
    pub task_list: String,

    pub poll_interval_ms: u64,
    pub heartbeat_interval_ms: u64,

    /// Lock TTL for claimed steps and tasks.
    pub lock_duration_ms: i64,

    /// Interval of the background lock-extension tick.
    pub lock_extend_interval_ms: u64,

    /// Maximum concurrent work items.
    pub max_concurrent: usize,

    /// Graceful shutdown drain limit.
    pub shutdown_timeout_ms: u64,

    /// Base HTTP status port; auto-increments when in use.
    pub http_port: u16,
    pub http_max_port_attempts: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            server_group: "default".to_string(),
            service_name: "afl-runner".to_string(),
            server_name: default_server_name(),
            topics: Vec::new(),
            task_list: "default".to_string(),
            poll_interval_ms: 2000,
            heartbeat_interval_ms: 10_000,
            lock_duration_ms: 60_000,
            lock_extend_interval_ms: 20_000,
            max_concurrent: 5,
            shutdown_timeout_ms: 30_000,
            http_port: 8080,
            http_max_port_attempts: 20,
        }
    }
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server_group(mut self, group: impl Into<String>) -> Self {
        self.server_group = group.into();
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !name.is_empty() {
            self.server_name = name;
        }
        self
    }

    pub fn with_topics(mut self, topics: Vec<String>) -> Self {
        self.topics = topics;
        self
    }

    pub fn with_task_list(mut self, task_list: impl Into<String>) -> Self {
        self.task_list = task_list.into();
        self
    }

    pub fn with_poll_interval_ms(mut self, interval: u64) -> Self {
        self.poll_interval_ms = interval;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_lock_duration_ms(mut self, duration: i64) -> Self {
        self.lock_duration_ms = duration;
        self
    }

    pub fn with_http_port(mut self, port: u16) -> Self {
        self.http_port = port;
        self
    }
}

fn default_server_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Optional TOML file loaded via `--config`: store connection plus worker
/// overrides.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    /// PostgreSQL connection string; absent means the in-memory store.
    pub database_url: Option<String>,

    #[serde(default)]
    pub worker: WorkerOverrides,
}

#[derive(Debug, Default, Deserialize)]
pub struct WorkerOverrides {
    pub server_group: Option<String>,
    pub service_name: Option<String>,
    pub task_list: Option<String>,
    pub topics: Option<Vec<String>>,
    pub poll_interval_ms: Option<u64>,
    pub max_concurrent: Option<usize>,
    pub lock_duration_ms: Option<i64>,
}

impl FileConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Overlay the file's worker settings onto a config.
    pub fn apply(&self, config: &mut WorkerConfig) {
        let overrides = &self.worker;
        if let Some(group) = &overrides.server_group {
            config.server_group = group.clone();
        }
        if let Some(name) = &overrides.service_name {
            config.service_name = name.clone();
        }
        if let Some(task_list) = &overrides.task_list {
            config.task_list = task_list.clone();
        }
        if let Some(topics) = &overrides.topics {
            config.topics = topics.clone();
        }
        if let Some(interval) = overrides.poll_interval_ms {
            config.poll_interval_ms = interval;
        }
        if let Some(max) = overrides.max_concurrent {
            config.max_concurrent = max.max(1);
        }
        if let Some(duration) = overrides.lock_duration_ms {
            config.lock_duration_ms = duration;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.server_group, "default");
        assert_eq!(config.service_name, "afl-runner");
        assert!(!config.server_name.is_empty());
        assert_eq!(config.task_list, "default");
        assert_eq!(config.max_concurrent, 5);
        assert_eq!(config.lock_duration_ms, 60_000);
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.http_max_port_attempts, 20);
    }

    #[test]
    fn test_builder() {
        let config = WorkerConfig::new()
            .with_server_group("geo")
            .with_server_name("worker-7")
            .with_topics(vec!["osm.geo.Fetch".to_string()])
            .with_task_list("geo-tasks")
            .with_max_concurrent(0);

        assert_eq!(config.server_group, "geo");
        assert_eq!(config.server_name, "worker-7");
        assert_eq!(config.topics, vec!["osm.geo.Fetch"]);
        assert_eq!(config.task_list, "geo-tasks");
        // Clamped to at least one worker.
        assert_eq!(config.max_concurrent, 1);
    }

    #[test]
    fn test_empty_server_name_keeps_hostname() {
        let config = WorkerConfig::new().with_server_name("");
        assert!(!config.server_name.is_empty());
    }

    #[test]
    fn test_file_config_overlay() {
        let file: FileConfig = toml::from_str(
            r#"
            database_url = "postgres://localhost/afl"

            [worker]
            server_group = "geo"
            task_list = "geo-tasks"
            max_concurrent = 8
            "#,
        )
        .unwrap();

        let mut config = WorkerConfig::default();
        file.apply(&mut config);

        assert_eq!(file.database_url.as_deref(), Some("postgres://localhost/afl"));
        assert_eq!(config.server_group, "geo");
        assert_eq!(config.task_list, "geo-tasks");
        assert_eq!(config.max_concurrent, 8);
        // Untouched fields keep their defaults.
        assert_eq!(config.poll_interval_ms, 2000);
    }
}
