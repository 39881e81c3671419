use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LibError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub Uuid);

impl GroupId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GroupId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::from_str(s).map(Self)
    }
}

impl From<Uuid> for GroupId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GroupType {
    Root,
    #[default]
    OrganizationalUnit,
}

impl GroupType {
    pub const fn as_db_value(self) -> &'static str {
        match self {
            GroupType::Root => "root",
            GroupType::OrganizationalUnit => "organizational_unit",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "root" => Some(GroupType::Root),
            "organizational_unit" => Some(GroupType::OrganizationalUnit),
            _ => None,
        }
    }

    pub const fn is_root(self) -> bool {
        matches!(self, GroupType::Root)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    #[serde(rename = "type")]
    pub group_type: GroupType,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HierarchyEdge {
    pub child_id: GroupId,
    pub parent_id: GroupId,
    /// Child name as it was when the edge was created.
    pub child_label: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtreeNode {
    pub group: Group,
    pub children: Vec<SubtreeNode>,
}

impl SubtreeNode {
    /// Pre-order ids of every node in the tree, starting with this one.
    pub fn ids(&self) -> Vec<GroupId> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            out.push(node.group.id);
            for child in node.children.iter().rev() {
                stack.push(child);
            }
        }
        out
    }
}

impl Drop for SubtreeNode {
    fn drop(&mut self) {
        let mut pending = std::mem::take(&mut self.children);
        while let Some(mut node) = pending.pop() {
            pending.append(&mut node.children);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HierarchyViolation {
    RootAlreadyExists {
        existing_root_count: i64,
    },
    RootCannotBeChild {
        child_id: GroupId,
    },
    ChildAlreadyHasParent {
        child_id: GroupId,
        parent_id: GroupId,
    },
    CycleDetected {
        child_id: GroupId,
        parent_id: GroupId,
    },
    GroupHasChildren {
        group_id: GroupId,
        child_count: usize,
    },
    UnknownGroupReference {
        child_id: GroupId,
        parent_id: GroupId,
        missing_id: GroupId,
    },
}

impl HierarchyViolation {
    pub const fn error_code(&self) -> &'static str {
        match self {
            HierarchyViolation::RootAlreadyExists { .. } => "hierarchy_root_already_exists",
            HierarchyViolation::RootCannotBeChild { .. } => "hierarchy_root_cannot_be_child",
            HierarchyViolation::ChildAlreadyHasParent { .. } => {
                "hierarchy_child_already_has_parent"
            }
            HierarchyViolation::CycleDetected { .. } => "hierarchy_cycle_detected",
            HierarchyViolation::GroupHasChildren { .. } => "hierarchy_group_has_children",
            HierarchyViolation::UnknownGroupReference { .. } => {
                "hierarchy_unknown_group_reference"
            }
        }
    }

    pub const fn public_message(&self) -> &'static str {
        match self {
            HierarchyViolation::RootAlreadyExists { .. } => {
                "Cannot add a root group when one already exists."
            }
            HierarchyViolation::RootCannotBeChild { .. } => {
                "Cannot add a root group as a child group."
            }
            HierarchyViolation::ChildAlreadyHasParent { .. } => "Group already has a parent",
            HierarchyViolation::CycleDetected { .. } => {
                "Attaching this group would create a cycle"
            }
            HierarchyViolation::GroupHasChildren { .. } => "Group still has child groups",
            HierarchyViolation::UnknownGroupReference { .. } => {
                "Edge references a group that does not exist"
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    /// Refuse to delete a group that still has children.
    #[default]
    Reject,
    /// Delete the group together with its whole subtree.
    Cascade,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedGroups {
    /// Deepest groups first, the requested group last.
    pub deleted_ids: Vec<GroupId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub former_parent_id: Option<GroupId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOperation {
    GroupCreated,
    ChildAttached,
    ChildDetached,
    GroupDeleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HierarchyChange {
    pub operation: ChangeOperation,
    pub affected_ids: Vec<GroupId>,
    pub committed_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupPayload {
    pub name: String,
    #[serde(rename = "type", default)]
    pub group_type: GroupType,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachChildPayload {
    pub parent_id: GroupId,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteGroupQuery {
    pub cascade: Option<bool>,
}

impl DeleteGroupQuery {
    pub fn policy(&self) -> DeletePolicy {
        if self.cascade.unwrap_or(false) {
            DeletePolicy::Cascade
        } else {
            DeletePolicy::Reject
        }
    }
}

impl CreateGroupPayload {
    pub fn new(name: impl Into<String>, group_type: GroupType) -> Self {
        Self {
            name: name.into(),
            group_type,
        }
    }

    /// Validates the payload and assigns the new group its identifier.
    pub fn normalize(self) -> Result<Group> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(LibError::invalid(
                "Group name is required",
                anyhow!("empty group name"),
            ));
        }

        Ok(Group {
            id: GroupId::new_v4(),
            name,
            group_type: self.group_type,
            created_at: Utc::now().naive_utc(),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn normalize_group_trims_name_and_assigns_id() {
        let first = CreateGroupPayload::new("  Finance  ", GroupType::OrganizationalUnit)
            .normalize()
            .expect("payload should normalize");
        let second = CreateGroupPayload::new("Finance", GroupType::OrganizationalUnit)
            .normalize()
            .expect("payload should normalize");

        assert_eq!(first.name, "Finance");
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn normalize_group_rejects_blank_name() {
        let err = CreateGroupPayload::new("   ", GroupType::Root)
            .normalize()
            .expect_err("blank name should fail");
        assert_eq!(err.public, "Group name is required");
    }

    #[test]
    fn create_payload_defaults_to_organizational_unit() {
        let payload: CreateGroupPayload =
            serde_json::from_value(json!({"name": "Ops"})).expect("valid payload");
        assert_eq!(payload.group_type, GroupType::OrganizationalUnit);

        let payload: CreateGroupPayload =
            serde_json::from_value(json!({"name": "Top", "type": "root"})).expect("valid payload");
        assert_eq!(payload.group_type, GroupType::Root);
    }

    #[test]
    fn group_type_db_values_match_serde_names() {
        for group_type in [GroupType::Root, GroupType::OrganizationalUnit] {
            let serialized = serde_json::to_value(group_type).expect("serializes");
            assert_eq!(serialized, json!(group_type.as_db_value()));
            assert_eq!(GroupType::from_db_value(group_type.as_db_value()), Some(group_type));
        }
        assert_eq!(GroupType::from_db_value("team"), None);
    }

    #[test]
    fn violations_serialize_with_type_tag() {
        let child_id = GroupId(Uuid::nil());
        let value = serde_json::to_value(HierarchyViolation::RootCannotBeChild { child_id })
            .expect("serializes");
        assert_eq!(
            value,
            json!({"type": "root_cannot_be_child", "child_id": Uuid::nil()})
        );
    }

    #[test]
    fn delete_query_maps_to_policy() {
        assert_eq!(DeleteGroupQuery::default().policy(), DeletePolicy::Reject);
        let query = DeleteGroupQuery {
            cascade: Some(true),
        };
        assert_eq!(query.policy(), DeletePolicy::Cascade);
    }
}
