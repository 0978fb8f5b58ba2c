use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::LazyLock;

use crate::types::{KubernetesMetadata, Record};

/// Characters a substituted value may keep; everything else becomes `_`.
static FS_SANITISER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9_,;. -]").expect("static regex"));

static LABEL_SANITISER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9_]").expect("static regex"));

/// Maps records onto files below a target directory.
///
/// The pattern is literal text with `%name%` placeholders. Unknown placeholders
/// are kept verbatim, empty values turn into `NO_<NAME>` so a path segment can
/// never collapse.
#[derive(Debug, Clone)]
pub struct PathTemplate {
    root: PathBuf,
    pattern: String,
}

impl PathTemplate {
    pub fn new(root: impl Into<PathBuf>, pattern: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            pattern: pattern.into(),
        }
    }

    /// Resolve the destination file for a record.
    pub fn resolve(&self, record: &Record, tag: &str) -> PathBuf {
        let relative = self.render(record, tag);
        self.root.join(relative.trim_start_matches('/'))
    }

    /// Render the pattern without joining it to the target root.
    pub fn render(&self, record: &Record, tag: &str) -> String {
        substitute(&self.pattern, &replacements(record, tag))
    }
}

/// Build the placeholder table for one record.
pub fn replacements(record: &Record, tag: &str) -> HashMap<String, String> {
    let mut table = HashMap::new();

    add_replacement(&mut table, "year", &record.date.format("%Y").to_string());
    add_replacement(&mut table, "month", &record.date.format("%m").to_string());
    add_replacement(&mut table, "dayofmonth", &record.date.format("%d").to_string());
    add_replacement(&mut table, "date", &record.date.format("%Y-%m-%d").to_string());
    add_replacement(&mut table, "tag", tag);

    add_metadata_replacements(&mut table, &record.kubernetes);
    table
}

fn add_metadata_replacements(table: &mut HashMap<String, String>, meta: &KubernetesMetadata) {
    add_replacement(table, "kubernetes_pod_name", &meta.pod_name);
    add_replacement(table, "kubernetes_namespace_name", &meta.namespace_name);
    add_replacement(table, "kubernetes_pod_id", &meta.pod_id);
    add_replacement(table, "kubernetes_host", &meta.host);
    add_replacement(table, "kubernetes_container_name", &meta.container_name);
    add_replacement(table, "kubernetes_docker_id", &meta.docker_id);

    for (key, value) in &meta.labels {
        let key = label_placeholder(key);
        add_replacement(table, &format!("label_{key}"), value);
        add_replacement(table, &format!("kubernetes_label_{key}"), value);
    }
}

/// Lower-case a label key and replace anything outside `[a-z0-9_]` with `_`.
pub fn label_placeholder(key: &str) -> String {
    LABEL_SANITISER
        .replace_all(&key.to_lowercase(), "_")
        .into_owned()
}

/// Make a value safe to use inside a single path segment.
pub fn sanitize_value(value: &str) -> String {
    let cleaned = FS_SANITISER.replace_all(value, "_").into_owned();
    // "." and ".." would still walk the directory tree
    if cleaned.chars().all(|c| c == '.') {
        return "_".repeat(cleaned.len());
    }
    cleaned
}

fn add_replacement(table: &mut HashMap<String, String>, name: &str, value: &str) {
    let value = if value.is_empty() {
        format!("NO_{}", name.to_uppercase())
    } else {
        sanitize_value(value)
    };

    // two label keys may sanitize to the same name; the first one wins
    table.entry(name.to_string()).or_insert(value);
}

/// Single left-to-right pass; substituted text is never scanned again.
fn substitute(pattern: &str, table: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut rest = pattern;

    while let Some(start) = rest.find('%') {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 1..];

        let known = tail
            .find('%')
            .and_then(|end| table.get(&tail[..end]).map(|value| (end, value)));

        match known {
            Some((end, value)) => {
                out.push_str(value);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('%');
                rest = tail;
            }
        }
    }

    out.push_str(rest);
    out
}
