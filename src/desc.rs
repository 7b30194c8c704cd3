//! Event descriptors
//!
//! A descriptor is the immutable identity of an event: its name, metric
//! type, ordered label list and supported resolutions. Label order is part
//! of the identity because it determines positional field encoding.

use crate::error::DescError;
use crate::types::{MetricType, Resolution};

/// Immutable event metadata
///
/// Validation happens at construction; an invalid descriptor carries its
/// error instead of panicking, and the query planner rejects it.
#[derive(Debug, Clone)]
pub struct Desc {
    name: String,
    kind: MetricType,
    labels: Vec<String>,
    resolutions: Vec<Resolution>,
    error: Option<DescError>,
}

impl Desc {
    /// Create a descriptor, recording any validation error on it
    pub fn new(
        kind: MetricType,
        name: impl Into<String>,
        labels: Vec<String>,
        resolutions: Vec<Resolution>,
    ) -> Self {
        let name = name.into();
        let error = validate(&name, &labels);
        Self {
            name,
            kind,
            labels,
            resolutions,
            error,
        }
    }

    /// Shorthand for an [`MetricType::Increment`] descriptor
    pub fn counter(
        name: impl Into<String>,
        labels: Vec<String>,
        resolutions: Vec<Resolution>,
    ) -> Self {
        Self::new(MetricType::Increment, name, labels, resolutions)
    }

    /// Canonical event name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Metric type controlling how gathered counts are stored
    pub fn kind(&self) -> MetricType {
        self.kind
    }

    /// Declared labels in positional order
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Supported resolutions
    pub fn resolutions(&self) -> &[Resolution] {
        &self.resolutions
    }

    /// Validation error recorded at construction, if any
    pub fn error(&self) -> Option<&DescError> {
        self.error.as_ref()
    }

    /// True when `label` is declared on this descriptor
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    /// Resolve a supported resolution by name
    pub fn resolution(&self, name: &str) -> Option<&Resolution> {
        self.resolutions.iter().find(|r| r.name() == name)
    }
}

fn validate(name: &str, labels: &[String]) -> Option<DescError> {
    if name.is_empty() {
        return Some(DescError::EmptyName);
    }
    for (i, label) in labels.iter().enumerate() {
        if label.is_empty() {
            return Some(DescError::EmptyLabel);
        }
        if labels[..i].contains(label) {
            return Some(DescError::DuplicateLabel(label.clone()));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_desc() {
        let desc = Desc::counter(
            "foo",
            vec!["bar".into(), "baz".into()],
            vec![Resolution::daily()],
        );
        assert_eq!(desc.name(), "foo");
        assert!(desc.error().is_none());
        assert!(desc.has_label("bar"));
        assert!(!desc.has_label("qux"));
        assert!(desc.resolution("daily").is_some());
        assert!(desc.resolution("hourly").is_none());
    }

    #[test]
    fn test_desc_without_resolutions() {
        let desc = Desc::counter("foo", vec![], vec![]);
        assert!(desc.error().is_none());
        assert!(desc.resolutions().is_empty());
        assert!(desc.resolution("daily").is_none());
    }

    #[test]
    fn test_duplicate_label_is_recorded() {
        let desc = Desc::counter("foo", vec!["a".into(), "a".into()], vec![]);
        assert_eq!(desc.error(), Some(&DescError::DuplicateLabel("a".into())));
    }

    #[test]
    fn test_empty_name_is_recorded() {
        let desc = Desc::counter("", vec![], vec![]);
        assert_eq!(desc.error(), Some(&DescError::EmptyName));
    }

    #[test]
    fn test_empty_label_is_recorded() {
        let desc = Desc::counter("foo", vec!["".into()], vec![]);
        assert_eq!(desc.error(), Some(&DescError::EmptyLabel));
    }
}
