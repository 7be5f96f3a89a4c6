//! Index of branch records for one conversation tree.
//!
//! Lookups degrade gracefully: a message may name a branch that has not been
//! loaded yet (created concurrently elsewhere), in which case a placeholder
//! name is synthesized instead of failing.

use std::collections::{HashMap, HashSet};

use tracing::warn;

use crate::types::{Branch, BranchLink};

#[derive(Debug, Default, Clone)]
pub struct BranchGraph {
    branches: HashMap<String, Branch>,
    /// Registration order, for stable listing.
    order: Vec<String>,
}

impl BranchGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a branch record. Returns `true` if the id was new.
    ///
    /// A record that would make a branch its own ancestor is refused, which
    /// keeps the graph a forest.
    pub fn register(&mut self, branch: Branch) -> bool {
        if self.would_cycle(&branch) {
            warn!(
                branch_id = %branch.id,
                parent = %branch.parent_conversation_id,
                "refusing branch that would create a cycle"
            );
            return false;
        }

        let is_new = !self.branches.contains_key(&branch.id);
        if is_new {
            self.order.push(branch.id.clone());
        }
        self.branches.insert(branch.id.clone(), branch);
        is_new
    }

    pub fn get(&self, branch_id: &str) -> Option<&Branch> {
        self.branches.get(branch_id)
    }

    pub fn contains(&self, branch_id: &str) -> bool {
        self.branches.contains_key(branch_id)
    }

    /// Display name for a branch, or `"Branch {id}"` when unknown.
    pub fn resolve_name(&self, branch_id: &str) -> String {
        match self.branches.get(branch_id) {
            Some(branch) => branch.name.clone(),
            None => format!("Branch {}", branch_id),
        }
    }

    /// Resolve a message's fork ids to navigation targets.
    pub fn links_for(&self, branch_ids: &[String]) -> Vec<BranchLink> {
        branch_ids
            .iter()
            .map(|id| BranchLink {
                id: id.clone(),
                name: self.resolve_name(id),
            })
            .collect()
    }

    /// Branches forked from the given message, in registration order.
    pub fn children_of(&self, message_id: &str) -> Vec<&Branch> {
        self.iter()
            .filter(|b| b.parent_message_id == message_id)
            .collect()
    }

    /// Chain of registered branches leading to `branch_id`, root-most first
    /// and ending with the branch itself. Empty if the branch is unknown.
    pub fn ancestry(&self, branch_id: &str) -> Vec<&Branch> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = self.branches.get(branch_id);
        while let Some(branch) = current {
            if !seen.insert(branch.id.as_str()) {
                break;
            }
            chain.push(branch);
            current = self.branches.get(&branch.parent_conversation_id);
        }
        chain.reverse();
        chain
    }

    pub fn iter(&self) -> impl Iterator<Item = &Branch> {
        self.order.iter().filter_map(|id| self.branches.get(id))
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    fn would_cycle(&self, branch: &Branch) -> bool {
        if branch.parent_conversation_id == branch.id {
            return true;
        }
        self.ancestry(&branch.parent_conversation_id)
            .iter()
            .any(|ancestor| ancestor.id == branch.id)
    }
}
