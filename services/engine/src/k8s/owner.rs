//! Owner-chain resolution.

use async_trait::async_trait;
use tend_id::ObjectUid;

use super::object::{ObjectMeta, ObjectRef};
use crate::error::ClientError;

/// An object and the tree of objects that own it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRefTree {
    pub object: ObjectRef,
    pub owners: Vec<ObjectRefTree>,
}

impl ObjectRefTree {
    pub fn leaf(object: ObjectRef) -> Self {
        Self {
            object,
            owners: Vec::new(),
        }
    }

    /// Every UID in the tree, the object itself first and then owners
    /// ordered from nearest to farthest. Each UID appears once.
    pub fn uids(&self) -> Vec<ObjectUid> {
        let mut result: Vec<ObjectUid> = Vec::new();
        let mut level: Vec<&ObjectRefTree> = vec![self];

        while !level.is_empty() {
            let mut next = Vec::new();
            for tree in level {
                if !result.contains(&tree.object.uid) {
                    result.push(tree.object.uid.clone());
                }
                next.extend(tree.owners.iter());
            }
            level = next;
        }

        result
    }
}

/// Resolves owner chains (Pod -> ReplicaSet -> Deployment ...).
#[async_trait]
pub trait OwnerFetcher: Send + Sync {
    /// Owner tree of an object whose metadata is already in hand.
    async fn owner_tree_of(
        &self,
        meta: &ObjectMeta,
        kind: &str,
    ) -> Result<ObjectRefTree, ClientError>;

    /// Owner tree of an object known only by reference.
    async fn owner_tree_of_ref(&self, object: &ObjectRef) -> Result<ObjectRefTree, ClientError>;
}
