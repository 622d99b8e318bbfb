use crate::ObjectMeta;
use std::collections::BTreeMap;

pub type Map = BTreeMap<String, String>;

/// Selects the cluster objects that are reconciled.
///
/// Every pair must match one of the object's labels. When annotation
/// matching is enabled, a pair may also be satisfied by an annotation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector {
    match_labels: Map,
    match_annotations: bool,
}

// === impl Selector ===

impl Selector {
    pub fn from_map(map: Map) -> Self {
        Self {
            match_labels: map,
            match_annotations: false,
        }
    }

    pub fn with_annotations(mut self, enabled: bool) -> Self {
        self.match_annotations = enabled;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty()
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.match_labels
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn matches(&self, meta: &ObjectMeta) -> bool {
        for (k, v) in self.match_labels.iter() {
            if meta.labels.as_ref().and_then(|l| l.get(k)) == Some(v) {
                continue;
            }
            if self.match_annotations
                && meta.annotations.as_ref().and_then(|a| a.get(k)) == Some(v)
            {
                continue;
            }
            return false;
        }

        true
    }

    /// Renders the selector as an API label selector, so that watches can be
    /// filtered server-side. Annotation matching can't be expressed this way.
    pub fn label_selector(&self) -> Option<String> {
        if self.match_annotations || self.match_labels.is_empty() {
            return None;
        }
        let pairs = self
            .match_labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>();
        Some(pairs.join(","))
    }
}

impl std::iter::FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self::from_map(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}
