//! Snapshot chain kept per volume.
//!
//! Snapshots form a chain ending at the live head, `volume-head`. Deleting a
//! snapshot only marks it removed; purge later coalesces removed snapshots
//! into their child. The head's direct parent cannot be coalesced while the
//! head still writes on top of it, so it stays in the chain marked removed.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use holdfast_id::SnapshotId;
use serde::{Deserialize, Serialize};

use crate::error::{ManagerError, Result};

pub const VOLUME_HEAD: &str = "volume-head";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub name: String,
    /// Empty for the oldest snapshot.
    pub parent: String,
    pub children: Vec<String>,
    pub removed: bool,
    pub user_created: bool,
    pub created: DateTime<Utc>,
    pub size: u64,
    pub labels: BTreeMap<String, String>,
}

impl Snapshot {
    fn head() -> Self {
        Self {
            name: VOLUME_HEAD.to_string(),
            parent: String::new(),
            children: Vec::new(),
            removed: false,
            user_created: false,
            created: Utc::now(),
            size: 0,
            labels: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotChain {
    snapshots: BTreeMap<String, Snapshot>,
}

impl Default for SnapshotChain {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotChain {
    pub fn new() -> Self {
        let mut snapshots = BTreeMap::new();
        snapshots.insert(VOLUME_HEAD.to_string(), Snapshot::head());
        Self { snapshots }
    }

    /// Inserts a snapshot between the head and its current parent.
    pub fn create(
        &mut self,
        name: Option<String>,
        labels: BTreeMap<String, String>,
        user_created: bool,
        size: u64,
    ) -> Result<Snapshot> {
        let name = name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| SnapshotId::new().to_string());
        if name == VOLUME_HEAD || self.snapshots.contains_key(&name) {
            return Err(ManagerError::AlreadyExists {
                kind: "snapshot",
                name,
            });
        }

        let old_parent = self.head().parent.clone();
        if let Some(parent) = self.snapshots.get_mut(&old_parent) {
            for child in parent.children.iter_mut() {
                if child == VOLUME_HEAD {
                    *child = name.clone();
                }
            }
        }

        let snapshot = Snapshot {
            name: name.clone(),
            parent: old_parent,
            children: vec![VOLUME_HEAD.to_string()],
            removed: false,
            user_created,
            created: Utc::now(),
            size,
            labels,
        };
        self.snapshots.insert(name.clone(), snapshot.clone());
        if let Some(head) = self.snapshots.get_mut(VOLUME_HEAD) {
            head.parent = name;
        }
        Ok(snapshot)
    }

    pub fn get(&self, name: &str) -> Result<&Snapshot> {
        self.snapshots
            .get(name)
            .ok_or_else(|| ManagerError::not_found("snapshot", name))
    }

    /// All snapshots including the head, oldest first.
    pub fn list(&self) -> Vec<Snapshot> {
        let mut list: Vec<Snapshot> = self.snapshots.values().cloned().collect();
        list.sort_by(|a, b| {
            (a.name == VOLUME_HEAD)
                .cmp(&(b.name == VOLUME_HEAD))
                .then(a.created.cmp(&b.created))
                .then(a.name.cmp(&b.name))
        });
        list
    }

    pub fn head(&self) -> &Snapshot {
        // The head is inserted on construction and never removed.
        &self.snapshots[VOLUME_HEAD]
    }

    pub fn mark_removed(&mut self, name: &str) -> Result<()> {
        if name == VOLUME_HEAD {
            return Err(ManagerError::invalid_argument("cannot delete volume-head"));
        }
        let snapshot = self
            .snapshots
            .get_mut(name)
            .ok_or_else(|| ManagerError::not_found("snapshot", name))?;
        snapshot.removed = true;
        Ok(())
    }

    /// Removed snapshots that can be coalesced now.
    pub fn purgeable(&self) -> Vec<String> {
        let head_parent = &self.head().parent;
        self.snapshots
            .values()
            .filter(|s| s.removed && s.name != *head_parent && s.children.len() <= 1)
            .map(|s| s.name.clone())
            .collect()
    }

    /// Coalesces every purgeable snapshot into its child and returns the
    /// removed names.
    pub fn purge(&mut self) -> Vec<String> {
        let mut removed = Vec::new();
        loop {
            let Some(name) = self.purgeable().into_iter().next() else {
                break;
            };
            let Some(snapshot) = self.snapshots.remove(&name) else {
                break;
            };

            if let Some(parent) = self.snapshots.get_mut(&snapshot.parent) {
                parent.children.retain(|c| *c != name);
                parent.children.extend(snapshot.children.iter().cloned());
            }
            for child_name in &snapshot.children {
                if let Some(child) = self.snapshots.get_mut(child_name) {
                    child.parent = snapshot.parent.clone();
                    child.size += snapshot.size;
                }
            }
            removed.push(name);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(chain: &mut SnapshotChain, name: &str) -> Snapshot {
        chain
            .create(Some(name.to_string()), BTreeMap::new(), true, 4096)
            .unwrap()
    }

    #[test]
    fn test_create_links_before_head() {
        let mut chain = SnapshotChain::new();
        snap(&mut chain, "s1");
        snap(&mut chain, "s2");

        assert_eq!(chain.head().parent, "s2");
        assert_eq!(chain.get("s2").unwrap().parent, "s1");
        assert_eq!(chain.get("s1").unwrap().children, vec!["s2".to_string()]);
        assert_eq!(chain.get("s2").unwrap().children, vec![VOLUME_HEAD.to_string()]);
    }

    #[test]
    fn test_generated_names_are_unique() {
        let mut chain = SnapshotChain::new();
        let a = chain.create(None, BTreeMap::new(), true, 0).unwrap();
        let b = chain.create(Some(String::new()), BTreeMap::new(), true, 0).unwrap();
        assert_ne!(a.name, b.name);
        assert!(chain.create(Some(a.name), BTreeMap::new(), true, 0).is_err());
    }

    #[test]
    fn test_head_cannot_be_removed() {
        let mut chain = SnapshotChain::new();
        assert!(chain.mark_removed(VOLUME_HEAD).is_err());
        assert!(chain.mark_removed("missing").is_err());
    }

    #[test]
    fn test_purge_keeps_head_parent() {
        let mut chain = SnapshotChain::new();
        snap(&mut chain, "s1");
        snap(&mut chain, "s2");
        chain.mark_removed("s1").unwrap();
        chain.mark_removed("s2").unwrap();

        let removed = chain.purge();
        assert_eq!(removed, vec!["s1".to_string()]);
        let s2 = chain.get("s2").unwrap();
        assert!(s2.removed);
        assert!(s2.parent.is_empty());
        assert_eq!(s2.size, 8192);

        // Once a newer snapshot exists, s2 can be coalesced too.
        snap(&mut chain, "s3");
        assert_eq!(chain.purge(), vec!["s2".to_string()]);
        assert_eq!(chain.list().len(), 2);
        assert!(chain.get("s3").unwrap().parent.is_empty());
    }

    #[test]
    fn test_list_puts_head_last() {
        let mut chain = SnapshotChain::new();
        snap(&mut chain, "s1");
        let names: Vec<String> = chain.list().into_iter().map(|s| s.name).collect();
        assert_eq!(names.last().map(String::as_str), Some(VOLUME_HEAD));
    }
}
