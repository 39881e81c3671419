use std::collections::HashMap;

use anyhow::anyhow;

use crate::algorithms;
use crate::error::{LibError, Result};
use crate::invariants;
use crate::models::{Group, GroupId, HierarchyEdge, HierarchyViolation, SubtreeNode};
use crate::store::{HierarchyBackend, HierarchyRead};

/// Deepest subtree returned as a nested tree. Deeper hierarchies are still readable through
/// `descendants`.
pub const MAX_SUBTREE_DEPTH: usize = 256;

#[derive(Clone)]
pub struct HierarchyQuery<B> {
    backend: B,
}

impl<B: HierarchyBackend> HierarchyQuery<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub async fn get_group(&self, id: GroupId) -> Result<Group> {
        let mut reader = self.backend.reader();
        require_group(&mut reader, id).await
    }

    pub async fn parent(&self, id: GroupId) -> Result<Option<HierarchyEdge>> {
        let mut reader = self.backend.reader();
        require_group(&mut reader, id).await?;
        reader.parent(id).await
    }

    pub async fn children(&self, id: GroupId) -> Result<Vec<Group>> {
        let mut reader = self.backend.reader();
        require_group(&mut reader, id).await?;
        reader.children(id).await
    }

    /// `id` followed by its ancestors.
    pub async fn path_to_root(&self, id: GroupId) -> Result<Vec<GroupId>> {
        let mut reader = self.backend.reader();
        require_group(&mut reader, id).await?;
        reader.path_to_root(id).await
    }

    /// Ancestors nearest first, without `id` itself.
    pub async fn ancestors(&self, id: GroupId) -> Result<Vec<Group>> {
        let mut reader = self.backend.reader();
        require_group(&mut reader, id).await?;
        let path = reader.path_to_root(id).await?;
        reader.groups(&path[1..]).await
    }

    /// Everything below `id`, shallowest first.
    pub async fn descendants(&self, id: GroupId) -> Result<Vec<Group>> {
        let mut reader = self.backend.reader();
        require_group(&mut reader, id).await?;
        let ids = reader
            .descendant_edges(id)
            .await?
            .into_iter()
            .map(|edge| edge.child_id)
            .collect::<Vec<_>>();
        reader.groups(&ids).await
    }

    pub async fn subtree(&self, id: GroupId) -> Result<SubtreeNode> {
        let mut reader = self.backend.reader();
        let root = require_group(&mut reader, id).await?;
        let edges = reader.descendant_edges(id).await?;
        let depth = algorithms::subtree_depth(id, &edges);
        if depth > MAX_SUBTREE_DEPTH {
            return Err(LibError::invalid(
                "Subtree is too deep to return as a tree",
                anyhow!(
                    "subtree of {} is {} levels deep, limit is {}",
                    id,
                    depth,
                    MAX_SUBTREE_DEPTH
                ),
            ));
        }
        let ids = edges.iter().map(|edge| edge.child_id).collect::<Vec<_>>();
        let groups = reader
            .groups(&ids)
            .await?
            .into_iter()
            .map(|group| (group.id, group))
            .collect::<HashMap<_, _>>();
        Ok(algorithms::build_subtree(root, &groups, &edges))
    }

    /// Every invariant the committed state currently breaks. Empty when healthy.
    pub async fn audit(&self) -> Result<Vec<HierarchyViolation>> {
        let mut reader = self.backend.reader();
        let groups = reader.all_groups().await?;
        let edges = reader.all_edges().await?;
        let violations = invariants::forest_invariant_violations(&groups, &edges);
        if !violations.is_empty() {
            tracing::error!(count = violations.len(), "hierarchy audit found violations");
        }
        Ok(violations)
    }
}

async fn require_group<R: HierarchyRead>(reader: &mut R, id: GroupId) -> Result<Group> {
    reader.group(id).await?.ok_or_else(|| {
        LibError::not_found("Group not found", anyhow!("group {} does not exist", id))
    })
}
