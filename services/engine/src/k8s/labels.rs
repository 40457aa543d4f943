//! Label selectors.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Operator of a set-based selector requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// A single set-based requirement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabelRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

impl LabelRequirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            SelectorOperator::In => value.is_some_and(|v| self.values.contains(v)),
            SelectorOperator::NotIn => value.map_or(true, |v| !self.values.contains(v)),
            SelectorOperator::Exists => value.is_some(),
            SelectorOperator::DoesNotExist => value.is_none(),
        }
    }
}

/// Matches objects by label.
///
/// All `match_labels` pairs and all requirements must hold. An empty
/// selector matches nothing; the engine never wants "every pod".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub requirements: Vec<LabelRequirement>,
}

impl LabelSelector {
    /// Selector requiring exactly the given label pairs.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            match_labels: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            requirements: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        if self.is_empty() {
            return false;
        }

        let pairs_match = self
            .match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v));

        pairs_match && self.requirements.iter().all(|r| r.matches(labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_empty_selector_matches_nothing() {
        let selector = LabelSelector::default();
        assert!(!selector.matches(&labels(&[("app", "web")])));
        assert!(!selector.matches(&BTreeMap::new()));
    }

    #[test]
    fn test_match_labels() {
        let selector = LabelSelector::from_pairs([("app", "web"), ("tier", "frontend")]);
        assert!(selector.matches(&labels(&[
            ("app", "web"),
            ("tier", "frontend"),
            ("extra", "x")
        ])));
        assert!(!selector.matches(&labels(&[("app", "web")])));
    }

    #[rstest]
    #[case(SelectorOperator::In, &["a", "b"], Some("a"), true)]
    #[case(SelectorOperator::In, &["a", "b"], Some("c"), false)]
    #[case(SelectorOperator::In, &["a"], None, false)]
    #[case(SelectorOperator::NotIn, &["a"], Some("b"), true)]
    #[case(SelectorOperator::NotIn, &["a"], None, true)]
    #[case(SelectorOperator::NotIn, &["a"], Some("a"), false)]
    #[case(SelectorOperator::Exists, &[], Some("x"), true)]
    #[case(SelectorOperator::Exists, &[], None, false)]
    #[case(SelectorOperator::DoesNotExist, &[], None, true)]
    fn test_requirements(
        #[case] operator: SelectorOperator,
        #[case] values: &[&str],
        #[case] actual: Option<&str>,
        #[case] expected: bool,
    ) {
        let selector = LabelSelector {
            match_labels: BTreeMap::new(),
            requirements: vec![LabelRequirement {
                key: "env".to_string(),
                operator,
                values: values.iter().map(|v| v.to_string()).collect(),
            }],
        };

        let mut object_labels = BTreeMap::new();
        if let Some(v) = actual {
            object_labels.insert("env".to_string(), v.to_string());
        }

        assert_eq!(selector.matches(&object_labels), expected);
    }
}
