use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;

use crate::config::CoordinatorConfig;
use crate::error::{LibError, Result};
use crate::events::{self, ChangeSink, NoopSink};
use crate::invariants::{self, AttachCheck};
use crate::models::{
    ChangeOperation, CreateGroupPayload, DeletePolicy, DeletedGroups, Group, GroupId, GroupType,
    HierarchyEdge,
};
use crate::permissions::{self, HierarchyAction, Principal};
use crate::store::{HierarchyBackend, HierarchyRead, HierarchyTx};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPhase {
    Started,
    Validating,
    Committed,
    Aborted,
}

struct Mutation<T> {
    tx: T,
    operation: &'static str,
    phase: MutationPhase,
}

impl<T: HierarchyTx> Mutation<T> {
    async fn begin<B>(backend: &B, operation: &'static str, lock_timeout: Duration) -> Result<Self>
    where
        B: HierarchyBackend<Tx = T>,
    {
        let tx = backend.begin(lock_timeout).await?;
        tracing::debug!(operation, phase = ?MutationPhase::Started, "hierarchy mutation");
        Ok(Self {
            tx,
            operation,
            phase: MutationPhase::Started,
        })
    }

    fn validating(&mut self) {
        self.phase = MutationPhase::Validating;
        tracing::debug!(operation = self.operation, phase = ?self.phase, "hierarchy mutation");
    }

    fn tx(&mut self) -> &mut T {
        &mut self.tx
    }

    async fn commit(self) -> Result<()> {
        let Mutation { tx, operation, .. } = self;
        tx.commit().await?;
        tracing::debug!(operation, phase = ?MutationPhase::Committed, "hierarchy mutation");
        Ok(())
    }

    async fn abort<R>(self, err: LibError) -> Result<R> {
        let Mutation { tx, operation, .. } = self;
        if let Err(rollback_err) = tx.rollback().await {
            tracing::error!(operation, error = %rollback_err.source, "rollback failed");
        }
        tracing::warn!(
            operation,
            phase = ?MutationPhase::Aborted,
            code = err.code,
            "hierarchy mutation rejected"
        );
        Err(err)
    }
}

#[derive(Clone)]
pub struct HierarchyCoordinator<B> {
    backend: B,
    sink: Arc<dyn ChangeSink>,
    config: CoordinatorConfig,
}

impl<B: HierarchyBackend> HierarchyCoordinator<B> {
    pub fn new(backend: B, config: CoordinatorConfig) -> Self {
        Self {
            backend,
            sink: Arc::new(NoopSink),
            config,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ChangeSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub async fn create_group(
        &self,
        principal: &Principal,
        payload: CreateGroupPayload,
    ) -> Result<Group> {
        let action = if payload.group_type.is_root() {
            HierarchyAction::CreateRoot
        } else {
            HierarchyAction::CreateGroup
        };
        permissions::authorize(principal, action)?;
        let group = &payload.normalize()?;

        let created = self
            .with_retry("create_group", move || self.try_create_group(group))
            .await?;

        tracing::info!(
            group_id = %created.id,
            group_type = created.group_type.as_db_value(),
            subject = principal.subject(),
            "group created"
        );
        self.publish(ChangeOperation::GroupCreated, vec![created.id]);
        Ok(created)
    }

    pub async fn attach_child(
        &self,
        principal: &Principal,
        child_id: GroupId,
        parent_id: GroupId,
    ) -> Result<HierarchyEdge> {
        permissions::authorize(principal, HierarchyAction::AttachChild)?;

        let edge = self
            .with_retry("attach_child", move || self.try_attach_child(child_id, parent_id))
            .await?;

        tracing::info!(
            child_id = %edge.child_id,
            parent_id = %edge.parent_id,
            subject = principal.subject(),
            "child attached"
        );
        self.publish(ChangeOperation::ChildAttached, vec![child_id, parent_id]);
        Ok(edge)
    }

    pub async fn detach_child(
        &self,
        principal: &Principal,
        child_id: GroupId,
    ) -> Result<HierarchyEdge> {
        permissions::authorize(principal, HierarchyAction::DetachChild)?;

        let edge = self
            .with_retry("detach_child", move || self.try_detach_child(child_id))
            .await?;

        tracing::info!(
            child_id = %edge.child_id,
            parent_id = %edge.parent_id,
            subject = principal.subject(),
            "child detached"
        );
        self.publish(ChangeOperation::ChildDetached, vec![edge.child_id, edge.parent_id]);
        Ok(edge)
    }

    pub async fn delete_group(
        &self,
        principal: &Principal,
        group_id: GroupId,
        policy: DeletePolicy,
    ) -> Result<DeletedGroups> {
        permissions::authorize(principal, HierarchyAction::DeleteGroup)?;

        let outcome = self
            .with_retry("delete_group", move || self.try_delete_group(group_id, policy))
            .await?;

        tracing::info!(
            group_id = %group_id,
            deleted = outcome.deleted_ids.len(),
            subject = principal.subject(),
            "group deleted"
        );
        let mut affected = outcome.deleted_ids.clone();
        affected.extend(outcome.former_parent_id);
        self.publish(ChangeOperation::GroupDeleted, affected);
        Ok(outcome)
    }

    async fn try_create_group(&self, group: &Group) -> Result<Group> {
        let mut mutation =
            Mutation::begin(&self.backend, "create_group", self.config.lock_timeout()).await?;

        let existing_root_count = if group.group_type.is_root() {
            mutation.tx().lock_root_guard().await?;
            mutation.validating();
            mutation.tx().count_by_type(GroupType::Root).await?
        } else {
            mutation.validating();
            0
        };
        if let Err(err) = invariants::ensure_create(group.group_type, existing_root_count) {
            return mutation.abort(err).await;
        }

        mutation.tx().insert_group(group).await?;
        mutation.commit().await?;
        Ok(group.clone())
    }

    async fn try_attach_child(&self, child_id: GroupId, parent_id: GroupId) -> Result<HierarchyEdge> {
        let mut mutation =
            Mutation::begin(&self.backend, "attach_child", self.config.lock_timeout()).await?;

        let parent_path = lock_ancestor_path(mutation.tx(), child_id, parent_id).await?;
        mutation.validating();

        let Some(child) = mutation.tx().group(child_id).await? else {
            let err = LibError::not_found(
                "Child group not found",
                anyhow!("group {} does not exist", child_id),
            );
            return mutation.abort(err).await;
        };
        if mutation.tx().group(parent_id).await?.is_none() {
            let err = LibError::not_found(
                "Parent group not found",
                anyhow!("group {} does not exist", parent_id),
            );
            return mutation.abort(err).await;
        }
        let current_parent = mutation
            .tx()
            .parent(child_id)
            .await?
            .map(|edge| edge.parent_id);

        let check = AttachCheck {
            child: &child,
            parent_id,
            current_parent,
            parent_path: &parent_path,
        };
        if let Err(err) = invariants::ensure_attach(&check) {
            return mutation.abort(err).await;
        }

        let edge = HierarchyEdge {
            child_id,
            parent_id,
            child_label: child.name.clone(),
            created_at: Utc::now().naive_utc(),
        };
        mutation.tx().insert_edge(&edge).await?;
        mutation.commit().await?;
        Ok(edge)
    }

    async fn try_detach_child(&self, child_id: GroupId) -> Result<HierarchyEdge> {
        let mut mutation =
            Mutation::begin(&self.backend, "detach_child", self.config.lock_timeout()).await?;

        mutation.tx().lock_groups(&[child_id]).await?;
        mutation.validating();

        if mutation.tx().group(child_id).await?.is_none() {
            let err = LibError::not_found(
                "Group not found",
                anyhow!("group {} does not exist", child_id),
            );
            return mutation.abort(err).await;
        }
        let Some(edge) = mutation.tx().remove_edge(child_id).await? else {
            let err = LibError::not_found(
                "Group has no parent",
                anyhow!("group {} is not attached", child_id),
            );
            return mutation.abort(err).await;
        };

        mutation.commit().await?;
        Ok(edge)
    }

    async fn try_delete_group(&self, group_id: GroupId, policy: DeletePolicy) -> Result<DeletedGroups> {
        let mut mutation =
            Mutation::begin(&self.backend, "delete_group", self.config.lock_timeout()).await?;

        let descendants = match policy {
            DeletePolicy::Reject => {
                mutation.tx().lock_groups(&[group_id]).await?;
                Vec::new()
            }
            DeletePolicy::Cascade => lock_subtree(mutation.tx(), group_id).await?,
        };
        mutation.validating();

        if mutation.tx().group(group_id).await?.is_none() {
            let err = LibError::not_found(
                "Group not found",
                anyhow!("group {} does not exist", group_id),
            );
            return mutation.abort(err).await;
        }
        let child_count = mutation.tx().children(group_id).await?.len();
        if let Err(err) = invariants::ensure_delete(group_id, child_count, policy) {
            return mutation.abort(err).await;
        }

        let former_parent_id = mutation
            .tx()
            .remove_edge(group_id)
            .await?
            .map(|edge| edge.parent_id);

        let mut deleted_ids = Vec::with_capacity(descendants.len() + 1);
        for edge in descendants.into_iter().rev() {
            mutation.tx().remove_edge(edge.child_id).await?;
            mutation.tx().delete_group(edge.child_id).await?;
            deleted_ids.push(edge.child_id);
        }
        mutation.tx().delete_group(group_id).await?;
        deleted_ids.push(group_id);

        mutation.commit().await?;
        Ok(DeletedGroups {
            deleted_ids,
            former_parent_id,
        })
    }

    async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt_no = 1u32;
        loop {
            match attempt().await {
                Err(err) if err.is_retryable() && attempt_no < max_attempts => {
                    tracing::warn!(
                        operation,
                        attempt = attempt_no,
                        error = %err.source,
                        "retrying conflicting hierarchy mutation"
                    );
                    tokio::time::sleep(Duration::from_millis(5 * u64::from(attempt_no))).await;
                    attempt_no += 1;
                }
                Err(err) if err.is_retryable() => {
                    tracing::warn!(operation, attempts = attempt_no, "giving up on hierarchy mutation");
                    return Err(LibError::timeout(
                        "Hierarchy mutation could not be serialized, try again",
                        err.source,
                    ));
                }
                other => return other,
            }
        }
    }

    fn publish(&self, operation: ChangeOperation, affected_ids: Vec<GroupId>) {
        self.sink.publish(events::change(operation, affected_ids));
    }
}

/// Locks `anchor` and every group on the path from `start` to the top of its tree, then returns
/// that path as read under the locks.
async fn lock_ancestor_path<T: HierarchyTx>(
    tx: &mut T,
    anchor: GroupId,
    start: GroupId,
) -> Result<Vec<GroupId>> {
    let mut locked = BTreeSet::new();
    loop {
        let path = tx.path_to_root(start).await?;
        let wanted: BTreeSet<GroupId> = path.iter().copied().chain([anchor]).collect();
        if wanted.is_subset(&locked) {
            return Ok(path);
        }
        locked.extend(wanted);
        let ids = locked.iter().copied().collect::<Vec<_>>();
        tx.lock_groups(&ids).await?;
    }
}

/// Locks `root` and all of its descendants, returning the descendant edges as read under the
/// locks.
async fn lock_subtree<T: HierarchyTx>(tx: &mut T, root: GroupId) -> Result<Vec<HierarchyEdge>> {
    let mut locked = BTreeSet::new();
    loop {
        let edges = tx.descendant_edges(root).await?;
        let wanted: BTreeSet<GroupId> = edges
            .iter()
            .map(|edge| edge.child_id)
            .chain([root])
            .collect();
        if wanted.is_subset(&locked) {
            return Ok(edges);
        }
        locked.extend(wanted);
        let ids = locked.iter().copied().collect::<Vec<_>>();
        tx.lock_groups(&ids).await?;
    }
}
