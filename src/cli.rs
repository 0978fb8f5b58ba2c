use clap::Parser;
use std::path::PathBuf;

use crate::writer::ExpiryPolicy;

/// Flags left unset fall back to the config file, then to built-in defaults.
#[derive(Parser, Debug, Default)]
#[command(name = "bunker")]
#[command(about = "Receive log records from a forwarder and append them to templated JSON files")]
pub struct Cli {
    /// Path to where incoming records should be written to
    #[arg(long)]
    pub target: Option<PathBuf>,

    /// Filename pattern to group records into files
    #[arg(long)]
    pub pattern: Option<String>,

    /// Address and port to listen on
    #[arg(long)]
    pub listen: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long)]
    pub verbose: bool,

    /// Number of queued records before producers have to wait
    #[arg(long)]
    pub queue_size: Option<usize>,

    /// Seconds a file stays open before it becomes eligible for closing
    #[arg(long, value_name = "SECONDS")]
    pub writer_ttl: Option<u64>,

    /// Seconds between scans for expired files
    #[arg(long, value_name = "SECONDS")]
    pub gc_interval: Option<u64>,

    /// Whether writes push back a file's expiry
    #[arg(long, value_enum)]
    pub writer_expiry: Option<ExpiryPolicy>,

    /// Annotation that excludes a pod's records when set to "ignore"
    #[arg(long)]
    pub filter_annotation: Option<String>,

    /// Request header carrying the forwarder's tag
    #[arg(long)]
    pub tag_header: Option<String>,

    /// Largest accepted ingest body in bytes, 0 for no limit
    #[arg(long, value_name = "BYTES")]
    pub max_body_size: Option<usize>,

    /// Seconds to wait for in-flight requests on shutdown
    #[arg(long, value_name = "SECONDS")]
    pub shutdown_timeout: Option<u64>,

    /// YAML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}
