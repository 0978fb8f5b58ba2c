use crate::types::Record;

pub const DEFAULT_ANNOTATION: &str = "xrstf.de/bunker";

/// Pods opt out of shipping by setting this annotation to `ignore`.
#[derive(Debug, Clone)]
pub struct AnnotationFilter {
    annotation: String,
}

impl AnnotationFilter {
    pub fn new(annotation: impl Into<String>) -> Self {
        Self {
            annotation: annotation.into(),
        }
    }

    pub fn include(&self, record: &Record) -> bool {
        record
            .kubernetes
            .annotations
            .get(&self.annotation)
            .is_none_or(|value| value != "ignore")
    }
}

impl Default for AnnotationFilter {
    fn default() -> Self {
        Self::new(DEFAULT_ANNOTATION)
    }
}
