use anyhow::{Context, bail};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::Cli;
use crate::filter::{AnnotationFilter, DEFAULT_ANNOTATION};
use crate::sink::{DEFAULT_GC_INTERVAL, DEFAULT_QUEUE_SIZE, SinkConfig};
use crate::template::PathTemplate;
use crate::writer::{DEFAULT_TTL, ExpiryPolicy};

/// Effective settings after merging defaults, the config file and flags.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub target: PathBuf,
    pub pattern: String,
    pub listen: String,
    pub verbose: bool,
    pub queue_size: usize,
    /// seconds
    pub writer_ttl: u64,
    /// seconds
    pub gc_interval: u64,
    pub writer_expiry: ExpiryPolicy,
    pub filter_annotation: String,
    pub tag_header: String,
    /// bytes, 0 disables the limit
    pub max_body_size: usize,
    /// seconds
    pub shutdown_timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: PathBuf::from("records"),
            pattern: "%date%/%kubernetes_namespace_name%.json".to_string(),
            listen: "0.0.0.0:9095".to_string(),
            verbose: false,
            queue_size: DEFAULT_QUEUE_SIZE,
            writer_ttl: DEFAULT_TTL.as_secs(),
            gc_interval: DEFAULT_GC_INTERVAL.as_secs(),
            writer_expiry: ExpiryPolicy::default(),
            filter_annotation: DEFAULT_ANNOTATION.to_string(),
            tag_header: "X-Fluent-Tag".to_string(),
            max_body_size: 0,
            shutdown_timeout: 10,
        }
    }
}

impl Config {
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply(cli);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    fn apply(&mut self, cli: &Cli) {
        if let Some(target) = &cli.target {
            self.target = target.clone();
        }
        if let Some(pattern) = &cli.pattern {
            self.pattern = pattern.clone();
        }
        if let Some(listen) = &cli.listen {
            self.listen = listen.clone();
        }
        self.verbose |= cli.verbose;
        if let Some(queue_size) = cli.queue_size {
            self.queue_size = queue_size;
        }
        if let Some(ttl) = cli.writer_ttl {
            self.writer_ttl = ttl;
        }
        if let Some(interval) = cli.gc_interval {
            self.gc_interval = interval;
        }
        if let Some(expiry) = cli.writer_expiry {
            self.writer_expiry = expiry;
        }
        if let Some(annotation) = &cli.filter_annotation {
            self.filter_annotation = annotation.clone();
        }
        if let Some(header) = &cli.tag_header {
            self.tag_header = header.clone();
        }
        if let Some(bytes) = cli.max_body_size {
            self.max_body_size = bytes;
        }
        if let Some(timeout) = cli.shutdown_timeout {
            self.shutdown_timeout = timeout;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pattern.trim().is_empty() {
            bail!("Pattern must not be empty");
        }
        if self.queue_size == 0 {
            bail!("Queue size must be at least 1");
        }
        if self.writer_ttl == 0 {
            bail!("Writer TTL must be at least one second");
        }
        if self.gc_interval == 0 {
            bail!("GC interval must be at least one second");
        }
        self.listen_addr()?;
        Ok(())
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listen
            .parse()
            .with_context(|| format!("Invalid listen address '{}'", self.listen))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }

    pub fn sink_config(&self) -> SinkConfig {
        SinkConfig {
            queue_size: self.queue_size,
            writer_ttl: Duration::from_secs(self.writer_ttl),
            gc_interval: Duration::from_secs(self.gc_interval),
            expiry: self.writer_expiry,
        }
    }

    pub fn template(&self) -> PathTemplate {
        PathTemplate::new(&self.target, &self.pattern)
    }

    pub fn filter(&self) -> AnnotationFilter {
        AnnotationFilter::new(&self.filter_annotation)
    }
}
