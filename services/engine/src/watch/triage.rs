//! Attribution of cluster objects to resources.
//!
//! Strategies are tried in order; the first match wins.

use std::collections::{BTreeMap, HashMap};

use tend_id::{ObjectUid, ResourceName};

use crate::k8s::LabelSelector;

/// Result of a successful triage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriageMatch {
    pub resource: ResourceName,
    /// Deployed object matched, or `None` for a selector match.
    pub ancestor: Option<ObjectUid>,
}

/// A resource's additional pod selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraSelector {
    pub resource: ResourceName,
    pub selector: LabelSelector,
}

/// What is known about the object being triaged.
#[derive(Debug, Clone, Copy)]
pub struct TriageInput<'a> {
    /// The object's own UID followed by its owners, nearest first.
    pub chain: &'a [ObjectUid],
    /// Labels, when the strategy set may match on them.
    pub labels: Option<&'a BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Copy)]
pub enum MatchStrategy<'a> {
    /// First UID in the chain that some resource deployed.
    OwnerChain {
        deployed: &'a HashMap<ObjectUid, ResourceName>,
    },
    /// First extra selector matching the object's labels.
    ExtraSelectors { selectors: &'a [ExtraSelector] },
}

impl MatchStrategy<'_> {
    pub fn evaluate(&self, input: &TriageInput<'_>) -> Option<TriageMatch> {
        match self {
            MatchStrategy::OwnerChain { deployed } => {
                input.chain.iter().find_map(|uid| {
                    deployed.get(uid).map(|resource| TriageMatch {
                        resource: resource.clone(),
                        ancestor: Some(uid.clone()),
                    })
                })
            }
            MatchStrategy::ExtraSelectors { selectors } => {
                let labels = input.labels?;
                selectors
                    .iter()
                    .find(|s| s.selector.matches(labels))
                    .map(|s| TriageMatch {
                        resource: s.resource.clone(),
                        ancestor: None,
                    })
            }
        }
    }
}

pub fn triage(strategies: &[MatchStrategy<'_>], input: &TriageInput<'_>) -> Option<TriageMatch> {
    strategies.iter().find_map(|s| s.evaluate(input))
}
