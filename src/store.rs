use std::future::Future;
use std::time::Duration;

use crate::error::Result;
use crate::models::{Group, GroupId, GroupType, HierarchyEdge};

pub trait HierarchyRead: Send {
    fn group(&mut self, id: GroupId) -> impl Future<Output = Result<Option<Group>>> + Send;

    /// Groups for `ids` in the given order; unknown ids are skipped.
    fn groups(&mut self, ids: &[GroupId]) -> impl Future<Output = Result<Vec<Group>>> + Send;

    fn count_by_type(&mut self, group_type: GroupType)
    -> impl Future<Output = Result<i64>> + Send;

    fn parent(&mut self, child_id: GroupId)
    -> impl Future<Output = Result<Option<HierarchyEdge>>> + Send;

    /// Direct children in edge insertion order.
    fn children(&mut self, parent_id: GroupId) -> impl Future<Output = Result<Vec<Group>>> + Send;

    /// `id` followed by its ancestors, nearest first. Always terminates, even on corrupt data.
    fn path_to_root(&mut self, id: GroupId) -> impl Future<Output = Result<Vec<GroupId>>> + Send;

    /// Every edge below `id`, ordered by depth and then by insertion order.
    fn descendant_edges(
        &mut self,
        id: GroupId,
    ) -> impl Future<Output = Result<Vec<HierarchyEdge>>> + Send;

    fn all_groups(&mut self) -> impl Future<Output = Result<Vec<Group>>> + Send;

    fn all_edges(&mut self) -> impl Future<Output = Result<Vec<HierarchyEdge>>> + Send;
}

pub trait HierarchyTx: HierarchyRead + Sized {
    /// Global guard serializing root creation. Held until commit or rollback.
    fn lock_root_guard(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Ensures every id in `ids` is locked by this transaction. Held until commit or rollback.
    fn lock_groups(&mut self, ids: &[GroupId]) -> impl Future<Output = Result<()>> + Send;

    fn insert_group(&mut self, group: &Group) -> impl Future<Output = Result<()>> + Send;

    fn insert_edge(&mut self, edge: &HierarchyEdge) -> impl Future<Output = Result<()>> + Send;

    fn remove_edge(
        &mut self,
        child_id: GroupId,
    ) -> impl Future<Output = Result<Option<HierarchyEdge>>> + Send;

    /// Removes a group that has no remaining edges.
    fn delete_group(&mut self, id: GroupId) -> impl Future<Output = Result<()>> + Send;

    fn commit(self) -> impl Future<Output = Result<()>> + Send;

    fn rollback(self) -> impl Future<Output = Result<()>> + Send;
}

pub trait HierarchyBackend: Clone + Send + Sync + 'static {
    type Tx: HierarchyTx;
    type Reader<'a>: HierarchyRead
    where
        Self: 'a;

    /// Opens a write transaction whose lock waits give up after `lock_timeout`.
    fn begin(&self, lock_timeout: Duration) -> impl Future<Output = Result<Self::Tx>> + Send;

    fn reader(&self) -> Self::Reader<'_>;
}
