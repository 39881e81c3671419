use std::collections::{HashMap, HashSet};

use crate::algorithms;
use crate::error::{LibError, Result};
use crate::models::{DeletePolicy, Group, GroupId, GroupType, HierarchyEdge, HierarchyViolation};

/// State read inside the attaching transaction.
#[derive(Debug, Clone, Copy)]
pub struct AttachCheck<'a> {
    pub child: &'a Group,
    pub parent_id: GroupId,
    pub current_parent: Option<GroupId>,
    /// `parent_id` followed by its ancestors, nearest first.
    pub parent_path: &'a [GroupId],
}

pub fn create_violations(group_type: GroupType, existing_root_count: i64) -> Vec<HierarchyViolation> {
    let mut violations = Vec::new();
    if group_type.is_root() && existing_root_count > 0 {
        violations.push(HierarchyViolation::RootAlreadyExists {
            existing_root_count,
        });
    }
    violations
}

pub fn ensure_create(group_type: GroupType, existing_root_count: i64) -> Result<()> {
    first_as_error(create_violations(group_type, existing_root_count))
}

/// Every rule the proposed edge breaks, in reporting order:
/// root-as-child, single parent, cycle.
pub fn attach_violations(check: &AttachCheck<'_>) -> Vec<HierarchyViolation> {
    let child_id = check.child.id;
    let mut violations = Vec::new();

    if check.child.group_type.is_root() {
        violations.push(HierarchyViolation::RootCannotBeChild { child_id });
    }

    if let Some(existing_parent) = check.current_parent {
        violations.push(HierarchyViolation::ChildAlreadyHasParent {
            child_id,
            parent_id: existing_parent,
        });
    }

    if child_id == check.parent_id || check.parent_path.contains(&child_id) {
        violations.push(HierarchyViolation::CycleDetected {
            child_id,
            parent_id: check.parent_id,
        });
    }

    violations
}

pub fn ensure_attach(check: &AttachCheck<'_>) -> Result<()> {
    first_as_error(attach_violations(check))
}

pub fn delete_violations(
    group_id: GroupId,
    child_count: usize,
    policy: DeletePolicy,
) -> Vec<HierarchyViolation> {
    match policy {
        DeletePolicy::Reject if child_count > 0 => {
            vec![HierarchyViolation::GroupHasChildren {
                group_id,
                child_count,
            }]
        }
        _ => Vec::new(),
    }
}

pub fn ensure_delete(group_id: GroupId, child_count: usize, policy: DeletePolicy) -> Result<()> {
    first_as_error(delete_violations(group_id, child_count, policy))
}

/// Audits a complete snapshot of both stores.
pub fn forest_invariant_violations(
    groups: &[Group],
    edges: &[HierarchyEdge],
) -> Vec<HierarchyViolation> {
    let by_id: HashMap<GroupId, &Group> = groups.iter().map(|group| (group.id, group)).collect();
    let mut violations = Vec::new();

    let root_count = groups
        .iter()
        .filter(|group| group.group_type.is_root())
        .count() as i64;
    if root_count > 1 {
        violations.push(HierarchyViolation::RootAlreadyExists {
            existing_root_count: root_count,
        });
    }

    let mut parents: HashMap<GroupId, GroupId> = HashMap::with_capacity(edges.len());
    for edge in edges {
        let missing = [edge.child_id, edge.parent_id]
            .into_iter()
            .find(|id| !by_id.contains_key(id));
        if let Some(missing_id) = missing {
            violations.push(HierarchyViolation::UnknownGroupReference {
                child_id: edge.child_id,
                parent_id: edge.parent_id,
                missing_id,
            });
            continue;
        }

        if by_id
            .get(&edge.child_id)
            .is_some_and(|child| child.group_type.is_root())
        {
            violations.push(HierarchyViolation::RootCannotBeChild {
                child_id: edge.child_id,
            });
        }

        if let Some(existing) = parents.insert(edge.child_id, edge.parent_id) {
            violations.push(HierarchyViolation::ChildAlreadyHasParent {
                child_id: edge.child_id,
                parent_id: existing,
            });
        }
    }

    let cyclic: HashSet<GroupId> = algorithms::cyclic_nodes(groups, edges)
        .into_iter()
        .collect();
    if let Some(edge) = edges
        .iter()
        .find(|edge| cyclic.contains(&edge.child_id) && cyclic.contains(&edge.parent_id))
    {
        violations.push(HierarchyViolation::CycleDetected {
            child_id: edge.child_id,
            parent_id: edge.parent_id,
        });
    }

    violations
}

pub fn ensure_forest_invariants(groups: &[Group], edges: &[HierarchyEdge]) -> Result<()> {
    first_as_error(forest_invariant_violations(groups, edges))
}

fn first_as_error(violations: Vec<HierarchyViolation>) -> Result<()> {
    match violations.into_iter().next() {
        Some(first) => Err(LibError::violation(first)),
        None => Ok(()),
    }
}
