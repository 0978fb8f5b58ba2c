use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single log line as shipped by the forwarder, enriched with pod metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub log: String,
    #[serde(default)]
    pub kubernetes: KubernetesMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesMetadata {
    pub pod_name: String,
    pub namespace_name: String,
    pub pod_id: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub host: String,
    pub container_name: String,
    pub docker_id: String,
}

/// Records submitted together in one request. Only exists in transit.
#[derive(Debug, Clone, Default)]
pub struct Payload {
    pub tag: String,
    pub records: Vec<Record>,
}

impl Payload {
    pub fn new(tag: impl Into<String>, records: Vec<Record>) -> Self {
        Self {
            tag: tag.into(),
            records,
        }
    }
}
