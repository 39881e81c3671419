use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::algorithms;
use crate::error::{LibError, Result};
use crate::models::{Group, GroupId, GroupType, HierarchyEdge, HierarchyViolation};
use crate::store::{HierarchyBackend, HierarchyRead, HierarchyTx};

#[derive(Debug, Clone)]
struct StoredEdge {
    edge: HierarchyEdge,
    seq: u64,
}

#[derive(Debug, Clone)]
enum WriteOp {
    InsertGroup(Group),
    InsertEdge(HierarchyEdge),
    RemoveEdge(GroupId),
    DeleteGroup(GroupId),
}

/// Both stores as plain maps. Writes go through `apply`, which enforces the same constraints
/// the database schema does.
#[derive(Debug, Clone, Default)]
pub struct HierarchyState {
    groups: HashMap<GroupId, Group>,
    group_order: Vec<GroupId>,
    edges: HashMap<GroupId, StoredEdge>,
    children: HashMap<GroupId, Vec<GroupId>>,
    next_seq: u64,
}

impl HierarchyState {
    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(&id)
    }

    pub fn groups(&self, ids: &[GroupId]) -> Vec<Group> {
        ids.iter()
            .filter_map(|id| self.groups.get(id).cloned())
            .collect()
    }

    pub fn count_by_type(&self, group_type: GroupType) -> i64 {
        self.groups
            .values()
            .filter(|group| group.group_type == group_type)
            .count() as i64
    }

    pub fn parent(&self, child_id: GroupId) -> Option<&HierarchyEdge> {
        self.edges.get(&child_id).map(|stored| &stored.edge)
    }

    pub fn children(&self, parent_id: GroupId) -> Vec<Group> {
        self.children
            .get(&parent_id)
            .map(|ids| self.groups(ids))
            .unwrap_or_default()
    }

    pub fn path_to_root(&self, id: GroupId) -> Vec<GroupId> {
        algorithms::path_to_root(id, |child| {
            self.edges.get(&child).map(|stored| stored.edge.parent_id)
        })
    }

    pub fn descendant_edges(&self, id: GroupId) -> Vec<HierarchyEdge> {
        let mut found: Vec<(usize, u64, &HierarchyEdge)> = Vec::new();
        let mut visited = HashSet::from([id]);
        let mut queue = VecDeque::from([(id, 0usize)]);
        while let Some((current, depth)) = queue.pop_front() {
            let Some(child_ids) = self.children.get(&current) else {
                continue;
            };
            for child_id in child_ids {
                if !visited.insert(*child_id) {
                    continue;
                }
                if let Some(stored) = self.edges.get(child_id) {
                    found.push((depth + 1, stored.seq, &stored.edge));
                    queue.push_back((*child_id, depth + 1));
                }
            }
        }
        found.sort_by_key(|(depth, seq, _)| (*depth, *seq));
        found.into_iter().map(|(_, _, edge)| edge.clone()).collect()
    }

    pub fn all_groups(&self) -> Vec<Group> {
        self.groups(&self.group_order)
    }

    pub fn all_edges(&self) -> Vec<HierarchyEdge> {
        let mut stored = self.edges.values().collect::<Vec<_>>();
        stored.sort_by_key(|stored| stored.seq);
        stored.into_iter().map(|stored| stored.edge.clone()).collect()
    }

    /// Checks every constraint before touching any map, so a rejected op leaves no trace.
    fn apply(&mut self, op: &WriteOp) -> Result<()> {
        match op {
            WriteOp::InsertGroup(group) => {
                if self.groups.contains_key(&group.id) {
                    return Err(LibError::database(
                        "Group identifier already exists",
                        anyhow!("duplicate group id {}", group.id),
                    ));
                }
                if group.group_type.is_root() {
                    let existing_root_count = self.count_by_type(GroupType::Root);
                    if existing_root_count > 0 {
                        return Err(LibError::violation(
                            HierarchyViolation::RootAlreadyExists {
                                existing_root_count,
                            },
                        ));
                    }
                }
                self.groups.insert(group.id, group.clone());
                self.group_order.push(group.id);
            }
            WriteOp::InsertEdge(edge) => {
                let Some(child) = self.groups.get(&edge.child_id) else {
                    return Err(missing_group(edge.child_id));
                };
                if !self.groups.contains_key(&edge.parent_id) {
                    return Err(missing_group(edge.parent_id));
                }
                if child.group_type.is_root() {
                    return Err(LibError::violation(HierarchyViolation::RootCannotBeChild {
                        child_id: edge.child_id,
                    }));
                }
                if let Some(existing) = self.edges.get(&edge.child_id) {
                    return Err(LibError::violation(
                        HierarchyViolation::ChildAlreadyHasParent {
                            child_id: edge.child_id,
                            parent_id: existing.edge.parent_id,
                        },
                    ));
                }
                if edge.child_id == edge.parent_id {
                    return Err(LibError::violation(HierarchyViolation::CycleDetected {
                        child_id: edge.child_id,
                        parent_id: edge.parent_id,
                    }));
                }

                let seq = self.next_seq;
                self.next_seq += 1;
                self.edges.insert(
                    edge.child_id,
                    StoredEdge {
                        edge: edge.clone(),
                        seq,
                    },
                );
                self.children
                    .entry(edge.parent_id)
                    .or_default()
                    .push(edge.child_id);
            }
            WriteOp::RemoveEdge(child_id) => {
                if let Some(stored) = self.edges.remove(child_id) {
                    if let Some(siblings) = self.children.get_mut(&stored.edge.parent_id) {
                        siblings.retain(|id| id != child_id);
                        if siblings.is_empty() {
                            self.children.remove(&stored.edge.parent_id);
                        }
                    }
                }
            }
            WriteOp::DeleteGroup(id) => {
                if !self.groups.contains_key(id) {
                    return Err(missing_group(*id));
                }
                if let Some(children) = self.children.get(id) {
                    return Err(LibError::violation(HierarchyViolation::GroupHasChildren {
                        group_id: *id,
                        child_count: children.len(),
                    }));
                }
                if self.edges.contains_key(id) {
                    return Err(LibError::database(
                        "Group is still attached to a parent",
                        anyhow!("group {} still has a parent edge", id),
                    ));
                }
                self.groups.remove(id);
                self.group_order.retain(|existing| existing != id);
            }
        }
        Ok(())
    }
}

fn missing_group(id: GroupId) -> LibError {
    LibError::not_found("Group not found", anyhow!("group {} does not exist", id))
}

#[derive(Default)]
struct Shared {
    committed: RwLock<Arc<HierarchyState>>,
    root_guard: Arc<AsyncMutex<()>>,
    group_locks: Mutex<HashMap<GroupId, Arc<AsyncMutex<()>>>>,
}

impl Shared {
    fn group_lock(&self, id: GroupId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.group_locks.lock();
        Arc::clone(locks.entry(id).or_default())
    }

    /// Drops the guards and forgets every lock that no transaction holds or waits on.
    fn release_group_locks<I>(&self, guards: I)
    where
        I: IntoIterator<Item = (GroupId, OwnedMutexGuard<()>)>,
    {
        let mut locks = self.group_locks.lock();
        for (id, guard) in guards {
            drop(guard);
            prune_lock(&mut locks, id);
        }
    }

    fn forget_unused_lock(&self, id: GroupId) {
        prune_lock(&mut self.group_locks.lock(), id);
    }
}

/// The table's own handle is the last one once nobody holds or waits on the lock. Handles are
/// only cloned under the table mutex, so the count cannot grow while it is checked.
fn prune_lock(locks: &mut HashMap<GroupId, Arc<AsyncMutex<()>>>, id: GroupId) {
    if locks
        .get(&id)
        .is_some_and(|lock| Arc::strong_count(lock) == 1)
    {
        locks.remove(&id);
    }
}

#[derive(Clone, Default)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last committed state.
    pub fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot {
            state: Arc::clone(&self.shared.committed.read()),
        }
    }
}

impl HierarchyBackend for MemoryBackend {
    type Tx = MemoryTx;
    type Reader<'a>
        = MemorySnapshot
    where
        Self: 'a;

    async fn begin(&self, lock_timeout: Duration) -> Result<MemoryTx> {
        Ok(MemoryTx {
            shared: Arc::clone(&self.shared),
            lock_timeout,
            working: None,
            staged: Vec::new(),
            root_guard: None,
            group_guards: BTreeMap::new(),
        })
    }

    fn reader(&self) -> MemorySnapshot {
        self.snapshot()
    }
}

#[derive(Debug, Clone)]
pub struct MemorySnapshot {
    state: Arc<HierarchyState>,
}

impl MemorySnapshot {
    pub fn state(&self) -> &HierarchyState {
        &self.state
    }
}

impl HierarchyRead for MemorySnapshot {
    async fn group(&mut self, id: GroupId) -> Result<Option<Group>> {
        Ok(self.state.group(id).cloned())
    }

    async fn groups(&mut self, ids: &[GroupId]) -> Result<Vec<Group>> {
        Ok(self.state.groups(ids))
    }

    async fn count_by_type(&mut self, group_type: GroupType) -> Result<i64> {
        Ok(self.state.count_by_type(group_type))
    }

    async fn parent(&mut self, child_id: GroupId) -> Result<Option<HierarchyEdge>> {
        Ok(self.state.parent(child_id).cloned())
    }

    async fn children(&mut self, parent_id: GroupId) -> Result<Vec<Group>> {
        Ok(self.state.children(parent_id))
    }

    async fn path_to_root(&mut self, id: GroupId) -> Result<Vec<GroupId>> {
        Ok(self.state.path_to_root(id))
    }

    async fn descendant_edges(&mut self, id: GroupId) -> Result<Vec<HierarchyEdge>> {
        Ok(self.state.descendant_edges(id))
    }

    async fn all_groups(&mut self) -> Result<Vec<Group>> {
        Ok(self.state.all_groups())
    }

    async fn all_edges(&mut self) -> Result<Vec<HierarchyEdge>> {
        Ok(self.state.all_edges())
    }
}

pub struct MemoryTx {
    shared: Arc<Shared>,
    lock_timeout: Duration,
    working: Option<HierarchyState>,
    staged: Vec<WriteOp>,
    root_guard: Option<OwnedMutexGuard<()>>,
    group_guards: BTreeMap<GroupId, OwnedMutexGuard<()>>,
}

impl MemoryTx {
    /// Reads see this transaction's own writes once it has staged any; before that they see the
    /// latest committed state.
    fn with_state<R>(&self, f: impl FnOnce(&HierarchyState) -> R) -> R {
        match &self.working {
            Some(state) => f(state),
            None => f(&self.shared.committed.read()),
        }
    }

    fn stage(&mut self, op: WriteOp) -> Result<()> {
        let shared = &self.shared;
        let working = self
            .working
            .get_or_insert_with(|| HierarchyState::clone(&shared.committed.read()));
        working.apply(&op)?;
        self.staged.push(op);
        Ok(())
    }

    async fn acquire(&mut self, id: GroupId) -> Result<()> {
        let lock = self.shared.group_lock(id);
        let acquired = tokio::time::timeout(self.lock_timeout, lock.lock_owned()).await;
        let Ok(guard) = acquired else {
            self.shared.forget_unused_lock(id);
            return Err(LibError::timeout(
                "Timed out waiting for a hierarchy lock",
                anyhow!("lock on group {} not acquired within {:?}", id, self.lock_timeout),
            ));
        };
        self.group_guards.insert(id, guard);
        Ok(())
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        let held = std::mem::take(&mut self.group_guards);
        self.shared.release_group_locks(held);
    }
}

impl HierarchyRead for MemoryTx {
    async fn group(&mut self, id: GroupId) -> Result<Option<Group>> {
        Ok(self.with_state(|state| state.group(id).cloned()))
    }

    async fn groups(&mut self, ids: &[GroupId]) -> Result<Vec<Group>> {
        Ok(self.with_state(|state| state.groups(ids)))
    }

    async fn count_by_type(&mut self, group_type: GroupType) -> Result<i64> {
        Ok(self.with_state(|state| state.count_by_type(group_type)))
    }

    async fn parent(&mut self, child_id: GroupId) -> Result<Option<HierarchyEdge>> {
        Ok(self.with_state(|state| state.parent(child_id).cloned()))
    }

    async fn children(&mut self, parent_id: GroupId) -> Result<Vec<Group>> {
        Ok(self.with_state(|state| state.children(parent_id)))
    }

    async fn path_to_root(&mut self, id: GroupId) -> Result<Vec<GroupId>> {
        Ok(self.with_state(|state| state.path_to_root(id)))
    }

    async fn descendant_edges(&mut self, id: GroupId) -> Result<Vec<HierarchyEdge>> {
        Ok(self.with_state(|state| state.descendant_edges(id)))
    }

    async fn all_groups(&mut self) -> Result<Vec<Group>> {
        Ok(self.with_state(HierarchyState::all_groups))
    }

    async fn all_edges(&mut self) -> Result<Vec<HierarchyEdge>> {
        Ok(self.with_state(HierarchyState::all_edges))
    }
}

impl HierarchyTx for MemoryTx {
    async fn lock_root_guard(&mut self) -> Result<()> {
        if self.root_guard.is_some() {
            return Ok(());
        }
        let guard = tokio::time::timeout(
            self.lock_timeout,
            Arc::clone(&self.shared.root_guard).lock_owned(),
        )
        .await
        .map_err(|_| {
            LibError::timeout(
                "Timed out waiting for the root creation guard",
                anyhow!("root guard not acquired within {:?}", self.lock_timeout),
            )
        })?;
        self.root_guard = Some(guard);
        Ok(())
    }

    async fn lock_groups(&mut self, ids: &[GroupId]) -> Result<()> {
        let wanted: BTreeSet<GroupId> = ids
            .iter()
            .copied()
            .chain(self.group_guards.keys().copied())
            .collect();
        if wanted.iter().all(|id| self.group_guards.contains_key(id)) {
            return Ok(());
        }

        // Nothing written yet, so it is safe to let go and take the whole set again in
        // ascending order. Two transactions then never wait on each other in a circle.
        if self.staged.is_empty() {
            let released = std::mem::take(&mut self.group_guards);
            self.shared.release_group_locks(released);
        }
        for id in wanted {
            if !self.group_guards.contains_key(&id) {
                self.acquire(id).await?;
            }
        }
        Ok(())
    }

    async fn insert_group(&mut self, group: &Group) -> Result<()> {
        self.stage(WriteOp::InsertGroup(group.clone()))
    }

    async fn insert_edge(&mut self, edge: &HierarchyEdge) -> Result<()> {
        self.stage(WriteOp::InsertEdge(edge.clone()))
    }

    async fn remove_edge(&mut self, child_id: GroupId) -> Result<Option<HierarchyEdge>> {
        let removed = self.with_state(|state| state.parent(child_id).cloned());
        if removed.is_some() {
            self.stage(WriteOp::RemoveEdge(child_id))?;
        }
        Ok(removed)
    }

    async fn delete_group(&mut self, id: GroupId) -> Result<()> {
        self.stage(WriteOp::DeleteGroup(id))
    }

    async fn commit(self) -> Result<()> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let mut committed = self.shared.committed.write();
        let mut next = HierarchyState::clone(&committed);
        for op in &self.staged {
            next.apply(op)?;
        }
        *committed = Arc::new(next);
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        Ok(())
    }
}
