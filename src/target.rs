use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A set of labels, keyed by label name. `BTreeMap` keeps iteration order
/// deterministic within a single emission.
pub type Labels = BTreeMap<String, String>;

/// The label holding the `<host>:<port>` address of a scrape target. A
/// target without it is not scrapable.
pub const ADDRESS_LABEL: &str = "__address__";

/// TargetGroup is a set of targets with a common set of labels.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct TargetGroup {
    /// An identifier that describes the group of targets within its
    /// provider. A provider re-emitting a group under the same source
    /// replaces the previous emission; an empty `targets` list with a
    /// non-empty source means the source no longer has any targets.
    #[serde(default)]
    pub source: String,

    /// Targets, each identified by its label set.
    #[serde(default)]
    pub targets: Vec<Labels>,

    /// Labels common across all targets in the group.
    #[serde(default)]
    pub labels: Labels,
}

impl TargetGroup {
    /// A group carrying only its identity, used to clear all previously
    /// emitted targets of `source`.
    pub fn empty(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Default::default()
        }
    }
}

/// Replace every character outside `[a-zA-Z0-9_]` with an underscore so the
/// result is a valid label name.
pub fn sanitize_label_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize() {
        assert_eq!(sanitize_label_name("foo_bar"), "foo_bar");
        assert_eq!(sanitize_label_name("app.kubernetes.io/name"), "app_kubernetes_io_name");
        assert_eq!(sanitize_label_name("0-leading"), "0_leading");
        assert_eq!(sanitize_label_name(""), "");
    }

    #[test]
    fn empty_group_keeps_identity() {
        let group = TargetGroup::empty("pod/ns/name");
        assert_eq!(group.source, "pod/ns/name");
        assert!(group.targets.is_empty());
        assert!(group.labels.is_empty());
        assert_ne!(group, TargetGroup::default());
    }
}
