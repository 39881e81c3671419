use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::CoordinatorConfig;
use crate::coordinator::HierarchyCoordinator;
use crate::error::Result;
use crate::events::ChangeSink;
use crate::models::{
    CreateGroupPayload, DeletePolicy, DeletedGroups, Group, GroupId, HierarchyEdge,
    HierarchyViolation, SubtreeNode,
};
use crate::permissions::{self, HierarchyAction, Principal};
use crate::query::HierarchyQuery;
use crate::store::HierarchyBackend;

/// Tool-friendly hierarchy actions.
///
/// Callers must provide a trusted `principal` sourced from validated auth/session state,
/// not from model/tool arguments.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum HierarchyOperation {
    CreateGroup {
        payload: CreateGroupPayload,
    },
    AttachChild {
        child_id: GroupId,
        parent_id: GroupId,
    },
    DetachChild {
        child_id: GroupId,
    },
    DeleteGroup {
        group_id: GroupId,
        #[serde(default)]
        policy: DeletePolicy,
    },
    GetGroup {
        group_id: GroupId,
    },
    GetParent {
        group_id: GroupId,
    },
    Children {
        group_id: GroupId,
    },
    Ancestors {
        group_id: GroupId,
    },
    Descendants {
        group_id: GroupId,
    },
    GetSubtree {
        group_id: GroupId,
    },
    Audit,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum HierarchyOperationResult {
    Group { group: Group },
    Groups { groups: Vec<Group> },
    Edge { edge: HierarchyEdge },
    Parent { edge: Option<HierarchyEdge> },
    Subtree { tree: SubtreeNode },
    Deleted { deleted: DeletedGroups },
    Audit { violations: Vec<HierarchyViolation> },
}

/// Mutations through the coordinator, reads through the query service, one principal check
/// per call.
#[derive(Clone)]
pub struct HierarchyService<B> {
    coordinator: HierarchyCoordinator<B>,
    query: HierarchyQuery<B>,
}

impl<B: HierarchyBackend> HierarchyService<B> {
    pub fn new(backend: B, config: CoordinatorConfig) -> Self {
        Self {
            query: HierarchyQuery::new(backend.clone()),
            coordinator: HierarchyCoordinator::new(backend, config),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ChangeSink>) -> Self {
        self.coordinator = self.coordinator.with_sink(sink);
        self
    }

    pub fn coordinator(&self) -> &HierarchyCoordinator<B> {
        &self.coordinator
    }

    pub fn query(&self) -> &HierarchyQuery<B> {
        &self.query
    }

    pub async fn execute(
        &self,
        principal: &Principal,
        operation: HierarchyOperation,
    ) -> Result<HierarchyOperationResult> {
        match operation {
            HierarchyOperation::CreateGroup { payload } => {
                let group = self.create_group(principal, payload).await?;
                Ok(HierarchyOperationResult::Group { group })
            }
            HierarchyOperation::AttachChild {
                child_id,
                parent_id,
            } => {
                let edge = self.attach_child(principal, child_id, parent_id).await?;
                Ok(HierarchyOperationResult::Edge { edge })
            }
            HierarchyOperation::DetachChild { child_id } => {
                let edge = self.detach_child(principal, child_id).await?;
                Ok(HierarchyOperationResult::Edge { edge })
            }
            HierarchyOperation::DeleteGroup { group_id, policy } => {
                let deleted = self.delete_group(principal, group_id, policy).await?;
                Ok(HierarchyOperationResult::Deleted { deleted })
            }
            HierarchyOperation::GetGroup { group_id } => {
                let group = self.get_group(principal, group_id).await?;
                Ok(HierarchyOperationResult::Group { group })
            }
            HierarchyOperation::GetParent { group_id } => {
                let edge = self.parent(principal, group_id).await?;
                Ok(HierarchyOperationResult::Parent { edge })
            }
            HierarchyOperation::Children { group_id } => {
                let groups = self.children(principal, group_id).await?;
                Ok(HierarchyOperationResult::Groups { groups })
            }
            HierarchyOperation::Ancestors { group_id } => {
                let groups = self.ancestors(principal, group_id).await?;
                Ok(HierarchyOperationResult::Groups { groups })
            }
            HierarchyOperation::Descendants { group_id } => {
                let groups = self.descendants(principal, group_id).await?;
                Ok(HierarchyOperationResult::Groups { groups })
            }
            HierarchyOperation::GetSubtree { group_id } => {
                let tree = self.subtree(principal, group_id).await?;
                Ok(HierarchyOperationResult::Subtree { tree })
            }
            HierarchyOperation::Audit => {
                let violations = self.audit(principal).await?;
                Ok(HierarchyOperationResult::Audit { violations })
            }
        }
    }

    pub async fn create_group(
        &self,
        principal: &Principal,
        payload: CreateGroupPayload,
    ) -> Result<Group> {
        self.coordinator.create_group(principal, payload).await
    }

    pub async fn attach_child(
        &self,
        principal: &Principal,
        child_id: GroupId,
        parent_id: GroupId,
    ) -> Result<HierarchyEdge> {
        self.coordinator
            .attach_child(principal, child_id, parent_id)
            .await
    }

    pub async fn detach_child(
        &self,
        principal: &Principal,
        child_id: GroupId,
    ) -> Result<HierarchyEdge> {
        self.coordinator.detach_child(principal, child_id).await
    }

    pub async fn delete_group(
        &self,
        principal: &Principal,
        group_id: GroupId,
        policy: DeletePolicy,
    ) -> Result<DeletedGroups> {
        self.coordinator
            .delete_group(principal, group_id, policy)
            .await
    }

    pub async fn get_group(&self, principal: &Principal, group_id: GroupId) -> Result<Group> {
        permissions::authorize(principal, HierarchyAction::Read)?;
        self.query.get_group(group_id).await
    }

    pub async fn parent(
        &self,
        principal: &Principal,
        group_id: GroupId,
    ) -> Result<Option<HierarchyEdge>> {
        permissions::authorize(principal, HierarchyAction::Read)?;
        self.query.parent(group_id).await
    }

    pub async fn children(&self, principal: &Principal, group_id: GroupId) -> Result<Vec<Group>> {
        permissions::authorize(principal, HierarchyAction::Read)?;
        self.query.children(group_id).await
    }

    pub async fn ancestors(&self, principal: &Principal, group_id: GroupId) -> Result<Vec<Group>> {
        permissions::authorize(principal, HierarchyAction::Read)?;
        self.query.ancestors(group_id).await
    }

    pub async fn descendants(
        &self,
        principal: &Principal,
        group_id: GroupId,
    ) -> Result<Vec<Group>> {
        permissions::authorize(principal, HierarchyAction::Read)?;
        self.query.descendants(group_id).await
    }

    pub async fn subtree(&self, principal: &Principal, group_id: GroupId) -> Result<SubtreeNode> {
        permissions::authorize(principal, HierarchyAction::Read)?;
        self.query.subtree(group_id).await
    }

    pub async fn audit(&self, principal: &Principal) -> Result<Vec<HierarchyViolation>> {
        permissions::authorize(principal, HierarchyAction::Read)?;
        self.query.audit().await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ErrorKind;
    use crate::memory::MemoryBackend;
    use crate::models::GroupType;
    use crate::permissions::{HIERARCHY_ROLE_ADMIN, HIERARCHY_ROLE_READ};

    fn service() -> HierarchyService<MemoryBackend> {
        HierarchyService::new(MemoryBackend::new(), CoordinatorConfig::default())
    }

    fn admin() -> Principal {
        Principal::new("admin", [HIERARCHY_ROLE_ADMIN])
    }

    fn operation(value: serde_json::Value) -> HierarchyOperation {
        serde_json::from_value(value).expect("operation should deserialize")
    }

    async fn create(service: &HierarchyService<MemoryBackend>, name: &str, kind: &str) -> Group {
        let result = service
            .execute(
                &admin(),
                operation(json!({
                    "operation": "create_group",
                    "payload": {"name": name, "type": kind}
                })),
            )
            .await
            .expect("create");
        match result {
            HierarchyOperationResult::Group { group } => group,
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn tagged_operations_drive_the_hierarchy() {
        let service = service();
        let root = create(&service, "Company", "root").await;
        let unit = create(&service, "Engineering", "organizational_unit").await;
        assert_eq!(root.group_type, GroupType::Root);

        let attached = service
            .execute(
                &admin(),
                operation(json!({
                    "operation": "attach_child",
                    "child_id": unit.id,
                    "parent_id": root.id
                })),
            )
            .await
            .expect("attach");
        assert!(matches!(
            attached,
            HierarchyOperationResult::Edge { ref edge } if edge.child_label == "Engineering"
        ));

        let tree = service
            .execute(
                &admin(),
                operation(json!({"operation": "get_subtree", "group_id": root.id})),
            )
            .await
            .expect("subtree");
        let HierarchyOperationResult::Subtree { tree } = tree else {
            panic!("expected a subtree");
        };
        assert_eq!(tree.ids(), vec![root.id, unit.id]);

        let audit = service
            .execute(&admin(), operation(json!({"operation": "audit"})))
            .await
            .expect("audit");
        assert!(matches!(
            audit,
            HierarchyOperationResult::Audit { ref violations } if violations.is_empty()
        ));
    }

    #[tokio::test]
    async fn delete_operation_defaults_to_reject() {
        let service = service();
        let parent = create(&service, "Parent", "organizational_unit").await;
        let child = create(&service, "Child", "organizational_unit").await;
        service
            .attach_child(&admin(), child.id, parent.id)
            .await
            .expect("attach");

        let err = service
            .execute(
                &admin(),
                operation(json!({"operation": "delete_group", "group_id": parent.id})),
            )
            .await
            .expect_err("parent has a child");
        assert_eq!(err.code, "hierarchy_group_has_children");

        let result = service
            .execute(
                &admin(),
                operation(json!({
                    "operation": "delete_group",
                    "group_id": parent.id,
                    "policy": "cascade"
                })),
            )
            .await
            .expect("cascade");
        let HierarchyOperationResult::Deleted { deleted } = result else {
            panic!("expected deletion");
        };
        assert_eq!(deleted.deleted_ids, vec![child.id, parent.id]);
    }

    #[tokio::test]
    async fn reads_need_a_hierarchy_role() {
        let service = service();
        let group = create(&service, "Ops", "organizational_unit").await;

        let stranger = Principal::new("stranger", ["billing"]);
        let err = service
            .get_group(&stranger, group.id)
            .await
            .expect_err("no hierarchy role");
        assert_eq!(err.kind, ErrorKind::Unauthorized);

        let reader = Principal::new("reader", [HIERARCHY_ROLE_READ]);
        let fetched = service.get_group(&reader, group.id).await.expect("read");
        assert_eq!(fetched, group);
        assert!(service.parent(&reader, group.id).await.expect("parent").is_none());
    }

    #[test]
    fn results_serialize_with_result_tag() {
        let value = serde_json::to_value(HierarchyOperationResult::Parent { edge: None })
            .expect("serializes");
        assert_eq!(value, json!({"result": "parent", "edge": null}));
    }
}
