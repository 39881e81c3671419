use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use anyhow::anyhow;
use once_cell::sync::Lazy;
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::{FromRow, PgConnection, PgExecutor, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::{LibError, Result};
use crate::models::{Group, GroupId, GroupType, HierarchyEdge, HierarchyViolation};
use crate::store::{HierarchyBackend, HierarchyRead, HierarchyTx};

pub static MIGRATOR: Lazy<Migrator> = Lazy::new(|| {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator
});

pub async fn create_hierarchy_tables(pool: &PgPool) -> std::result::Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

/// Advisory lock key of the root creation guard.
const ROOT_GUARD_KEY: i64 = 0x6869_6572_6172_6368;

const LOCK_NOT_AVAILABLE: &str = "55P03";
const DEADLOCK_DETECTED: &str = "40P01";
const SERIALIZATION_FAILURE: &str = "40001";

const SINGLE_ROOT_INDEX: &str = "groups_single_root_idx";
const EDGE_PRIMARY_KEY: &str = "group_hierarchies_pkey";
const NO_SELF_PARENT: &str = "group_hierarchies_no_self_parent";
const ROOT_CHILD_TRIGGER: &str = "group_hierarchies_root_child";
const CHILD_FOREIGN_KEY: &str = "group_hierarchies_child_fkey";
const PARENT_FOREIGN_KEY: &str = "group_hierarchies_parent_fkey";

#[derive(Debug, Clone, FromRow)]
struct GroupRow {
    id: Uuid,
    name: String,
    #[sqlx(rename = "type")]
    group_type: String,
    created_at: chrono::NaiveDateTime,
}

#[derive(Debug, Clone, FromRow)]
struct EdgeRow {
    child_group_id: Uuid,
    parent_group_id: Uuid,
    child_name: String,
    created_at: chrono::NaiveDateTime,
}

impl TryFrom<GroupRow> for Group {
    type Error = LibError;

    fn try_from(value: GroupRow) -> Result<Self> {
        let group_type = GroupType::from_db_value(&value.group_type).ok_or_else(|| {
            LibError::database(
                "Stored group has an unknown type",
                anyhow!("group {} has type '{}'", value.id, value.group_type),
            )
        })?;
        Ok(Self {
            id: GroupId(value.id),
            name: value.name,
            group_type,
            created_at: value.created_at,
        })
    }
}

impl From<EdgeRow> for HierarchyEdge {
    fn from(value: EdgeRow) -> Self {
        Self {
            child_id: GroupId(value.child_group_id),
            parent_id: GroupId(value.parent_group_id),
            child_label: value.child_name,
            created_at: value.created_at,
        }
    }
}

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.code().map(|code| code.into_owned()),
        _ => None,
    }
}

fn constraint(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.constraint().map(str::to_string),
        _ => None,
    }
}

fn db_err(public: &'static str, err: sqlx::Error) -> LibError {
    match sqlstate(&err).as_deref() {
        Some(LOCK_NOT_AVAILABLE) => {
            LibError::timeout("Timed out waiting for a hierarchy lock", anyhow!(err))
        }
        Some(DEADLOCK_DETECTED) | Some(SERIALIZATION_FAILURE) => {
            LibError::conflict("Transaction conflict", anyhow!(err))
        }
        _ => LibError::database(public, anyhow!(err)),
    }
}

fn insert_group_err(err: sqlx::Error) -> LibError {
    match constraint(&err).as_deref() {
        Some(SINGLE_ROOT_INDEX) => LibError::violation(HierarchyViolation::RootAlreadyExists {
            existing_root_count: 1,
        }),
        _ => db_err("Failed to create group", err),
    }
}

fn insert_edge_err(edge: &HierarchyEdge, err: sqlx::Error) -> LibError {
    match constraint(&err).as_deref() {
        Some(EDGE_PRIMARY_KEY) => LibError::violation(HierarchyViolation::ChildAlreadyHasParent {
            child_id: edge.child_id,
            parent_id: edge.parent_id,
        }),
        Some(NO_SELF_PARENT) => LibError::violation(HierarchyViolation::CycleDetected {
            child_id: edge.child_id,
            parent_id: edge.parent_id,
        }),
        Some(ROOT_CHILD_TRIGGER) => LibError::violation(HierarchyViolation::RootCannotBeChild {
            child_id: edge.child_id,
        }),
        Some(CHILD_FOREIGN_KEY) | Some(PARENT_FOREIGN_KEY) => LibError::not_found(
            "Group not found",
            anyhow!("edge {} -> {} references a missing group: {}", edge.child_id, edge.parent_id, err),
        ),
        _ => db_err("Failed to attach group", err),
    }
}

/// Folds a group id into an advisory lock key.
fn lock_key(id: GroupId) -> i64 {
    let (high, low) = id.0.as_u64_pair();
    (high ^ low) as i64
}

async fn advisory_lock<'e, E>(executor: E, key: i64) -> Result<()>
where
    E: PgExecutor<'e>,
{
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(key)
        .execute(executor)
        .await
        .map_err(|err| db_err("Failed to acquire hierarchy lock", err))?;
    Ok(())
}

async fn fetch_group<'e, E>(executor: E, id: GroupId) -> Result<Option<Group>>
where
    E: PgExecutor<'e>,
{
    let row = sqlx::query_as::<_, GroupRow>(
        r#"
        SELECT id, name, type, created_at
        FROM hierarchy.groups
        WHERE id = $1
        "#,
    )
    .bind(id.0)
    .fetch_optional(executor)
    .await
    .map_err(|err| db_err("Failed to query group", err))?;

    row.map(Group::try_from).transpose()
}

async fn fetch_groups<'e, E>(executor: E, ids: &[GroupId]) -> Result<Vec<Group>>
where
    E: PgExecutor<'e>,
{
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let raw_ids = ids.iter().map(|id| id.0).collect::<Vec<_>>();
    let rows = sqlx::query_as::<_, GroupRow>(
        r#"
        SELECT id, name, type, created_at
        FROM hierarchy.groups
        WHERE id = ANY($1)
        "#,
    )
    .bind(raw_ids)
    .fetch_all(executor)
    .await
    .map_err(|err| db_err("Failed to query groups", err))?;

    let mut by_id = rows
        .into_iter()
        .map(|row| Group::try_from(row).map(|group| (group.id, group)))
        .collect::<Result<HashMap<_, _>>>()?;
    Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
}

async fn fetch_count_by_type<'e, E>(executor: E, group_type: GroupType) -> Result<i64>
where
    E: PgExecutor<'e>,
{
    let count: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*)::bigint
        FROM hierarchy.groups
        WHERE type = $1
        "#,
    )
    .bind(group_type.as_db_value())
    .fetch_one(executor)
    .await
    .map_err(|err| db_err("Failed to count groups", err))?;

    Ok(count.0)
}

async fn fetch_parent<'e, E>(executor: E, child_id: GroupId) -> Result<Option<HierarchyEdge>>
where
    E: PgExecutor<'e>,
{
    let row = sqlx::query_as::<_, EdgeRow>(
        r#"
        SELECT child_group_id, parent_group_id, child_name, created_at
        FROM hierarchy.group_hierarchies
        WHERE child_group_id = $1
        "#,
    )
    .bind(child_id.0)
    .fetch_optional(executor)
    .await
    .map_err(|err| db_err("Failed to query parent group", err))?;

    Ok(row.map(HierarchyEdge::from))
}

async fn fetch_children<'e, E>(executor: E, parent_id: GroupId) -> Result<Vec<Group>>
where
    E: PgExecutor<'e>,
{
    let rows = sqlx::query_as::<_, GroupRow>(
        r#"
        SELECT g.id, g.name, g.type, g.created_at
        FROM hierarchy.group_hierarchies h
        JOIN hierarchy.groups g
        ON g.id = h.child_group_id
        WHERE h.parent_group_id = $1
        ORDER BY h.seq ASC
        "#,
    )
    .bind(parent_id.0)
    .fetch_all(executor)
    .await
    .map_err(|err| db_err("Failed to query child groups", err))?;

    rows.into_iter().map(Group::try_from).collect()
}

async fn fetch_path_to_root<'e, E>(executor: E, id: GroupId) -> Result<Vec<GroupId>>
where
    E: PgExecutor<'e>,
{
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        r#"
        WITH RECURSIVE ancestors (id, depth, visited) AS (
            SELECT $1::uuid, 0, ARRAY[$1::uuid]
            UNION ALL
            SELECT h.parent_group_id, a.depth + 1, a.visited || h.parent_group_id
            FROM ancestors a
            JOIN hierarchy.group_hierarchies h
            ON h.child_group_id = a.id
            WHERE NOT h.parent_group_id = ANY(a.visited)
        )
        SELECT id
        FROM ancestors
        ORDER BY depth ASC
        "#,
    )
    .bind(id.0)
    .fetch_all(executor)
    .await
    .map_err(|err| db_err("Failed to query ancestor path", err))?;

    Ok(rows.into_iter().map(|(id,)| GroupId(id)).collect())
}

async fn fetch_descendant_edges<'e, E>(executor: E, id: GroupId) -> Result<Vec<HierarchyEdge>>
where
    E: PgExecutor<'e>,
{
    let rows = sqlx::query_as::<_, EdgeRow>(
        r#"
        WITH RECURSIVE descendants (
            child_group_id,
            parent_group_id,
            child_name,
            created_at,
            seq,
            depth,
            visited
        ) AS (
            SELECT
                h.child_group_id,
                h.parent_group_id,
                h.child_name,
                h.created_at,
                h.seq,
                1,
                ARRAY[$1::uuid, h.child_group_id]
            FROM hierarchy.group_hierarchies h
            WHERE h.parent_group_id = $1
              AND h.child_group_id <> $1
            UNION ALL
            SELECT
                h.child_group_id,
                h.parent_group_id,
                h.child_name,
                h.created_at,
                h.seq,
                d.depth + 1,
                d.visited || h.child_group_id
            FROM descendants d
            JOIN hierarchy.group_hierarchies h
            ON h.parent_group_id = d.child_group_id
            WHERE NOT h.child_group_id = ANY(d.visited)
        )
        SELECT child_group_id, parent_group_id, child_name, created_at
        FROM descendants
        ORDER BY depth ASC, seq ASC
        "#,
    )
    .bind(id.0)
    .fetch_all(executor)
    .await
    .map_err(|err| db_err("Failed to query descendant groups", err))?;

    Ok(rows.into_iter().map(HierarchyEdge::from).collect())
}

async fn fetch_all_groups<'e, E>(executor: E) -> Result<Vec<Group>>
where
    E: PgExecutor<'e>,
{
    let rows = sqlx::query_as::<_, GroupRow>(
        r#"
        SELECT id, name, type, created_at
        FROM hierarchy.groups
        ORDER BY created_at ASC, id ASC
        "#,
    )
    .fetch_all(executor)
    .await
    .map_err(|err| db_err("Failed to list groups", err))?;

    rows.into_iter().map(Group::try_from).collect()
}

async fn fetch_all_edges<'e, E>(executor: E) -> Result<Vec<HierarchyEdge>>
where
    E: PgExecutor<'e>,
{
    let rows = sqlx::query_as::<_, EdgeRow>(
        r#"
        SELECT child_group_id, parent_group_id, child_name, created_at
        FROM hierarchy.group_hierarchies
        ORDER BY seq ASC
        "#,
    )
    .fetch_all(executor)
    .await
    .map_err(|err| db_err("Failed to list hierarchy edges", err))?;

    Ok(rows.into_iter().map(HierarchyEdge::from).collect())
}

#[derive(Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl HierarchyBackend for PgBackend {
    type Tx = PgHierarchyTx;
    type Reader<'a>
        = PgReader<'a>
    where
        Self: 'a;

    async fn begin(&self, lock_timeout: Duration) -> Result<PgHierarchyTx> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| db_err("Failed to start transaction", err))?;

        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", lock_timeout.as_millis().max(1)))
            .execute(&mut *tx)
            .await
            .map_err(|err| db_err("Failed to configure transaction", err))?;

        Ok(PgHierarchyTx {
            tx,
            locked: BTreeSet::new(),
            root_guard: false,
        })
    }

    fn reader(&self) -> PgReader<'_> {
        PgReader {
            pool: &self.pool,
            tx: None,
        }
    }
}

/// Reads share one `REPEATABLE READ READ ONLY` transaction, opened by the first read and rolled
/// back on drop, so a multi-step query sees a single committed state.
pub struct PgReader<'a> {
    pool: &'a PgPool,
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgReader<'_> {
    async fn conn(&mut self) -> Result<&mut PgConnection> {
        let tx = match self.tx.take() {
            Some(tx) => tx,
            None => begin_read_only(self.pool).await?,
        };
        Ok(&mut **self.tx.insert(tx))
    }
}

async fn begin_read_only(pool: &PgPool) -> Result<Transaction<'static, Postgres>> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|err| db_err("Failed to start transaction", err))?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
        .execute(&mut *tx)
        .await
        .map_err(|err| db_err("Failed to configure transaction", err))?;
    Ok(tx)
}

impl HierarchyRead for PgReader<'_> {
    async fn group(&mut self, id: GroupId) -> Result<Option<Group>> {
        fetch_group(self.conn().await?, id).await
    }

    async fn groups(&mut self, ids: &[GroupId]) -> Result<Vec<Group>> {
        fetch_groups(self.conn().await?, ids).await
    }

    async fn count_by_type(&mut self, group_type: GroupType) -> Result<i64> {
        fetch_count_by_type(self.conn().await?, group_type).await
    }

    async fn parent(&mut self, child_id: GroupId) -> Result<Option<HierarchyEdge>> {
        fetch_parent(self.conn().await?, child_id).await
    }

    async fn children(&mut self, parent_id: GroupId) -> Result<Vec<Group>> {
        fetch_children(self.conn().await?, parent_id).await
    }

    async fn path_to_root(&mut self, id: GroupId) -> Result<Vec<GroupId>> {
        fetch_path_to_root(self.conn().await?, id).await
    }

    async fn descendant_edges(&mut self, id: GroupId) -> Result<Vec<HierarchyEdge>> {
        fetch_descendant_edges(self.conn().await?, id).await
    }

    async fn all_groups(&mut self) -> Result<Vec<Group>> {
        fetch_all_groups(self.conn().await?).await
    }

    async fn all_edges(&mut self) -> Result<Vec<HierarchyEdge>> {
        fetch_all_edges(self.conn().await?).await
    }
}

pub struct PgHierarchyTx {
    tx: Transaction<'static, Postgres>,
    locked: BTreeSet<GroupId>,
    root_guard: bool,
}

impl HierarchyRead for PgHierarchyTx {
    async fn group(&mut self, id: GroupId) -> Result<Option<Group>> {
        fetch_group(&mut *self.tx, id).await
    }

    async fn groups(&mut self, ids: &[GroupId]) -> Result<Vec<Group>> {
        fetch_groups(&mut *self.tx, ids).await
    }

    async fn count_by_type(&mut self, group_type: GroupType) -> Result<i64> {
        fetch_count_by_type(&mut *self.tx, group_type).await
    }

    async fn parent(&mut self, child_id: GroupId) -> Result<Option<HierarchyEdge>> {
        fetch_parent(&mut *self.tx, child_id).await
    }

    async fn children(&mut self, parent_id: GroupId) -> Result<Vec<Group>> {
        fetch_children(&mut *self.tx, parent_id).await
    }

    async fn path_to_root(&mut self, id: GroupId) -> Result<Vec<GroupId>> {
        fetch_path_to_root(&mut *self.tx, id).await
    }

    async fn descendant_edges(&mut self, id: GroupId) -> Result<Vec<HierarchyEdge>> {
        fetch_descendant_edges(&mut *self.tx, id).await
    }

    async fn all_groups(&mut self) -> Result<Vec<Group>> {
        fetch_all_groups(&mut *self.tx).await
    }

    async fn all_edges(&mut self) -> Result<Vec<HierarchyEdge>> {
        fetch_all_edges(&mut *self.tx).await
    }
}

impl HierarchyTx for PgHierarchyTx {
    async fn lock_root_guard(&mut self) -> Result<()> {
        if self.root_guard {
            return Ok(());
        }
        advisory_lock(&mut *self.tx, ROOT_GUARD_KEY).await?;
        self.root_guard = true;
        Ok(())
    }

    /// Transaction-scoped advisory locks cannot be released early, so a lock taken out of order
    /// can deadlock. Postgres breaks the deadlock and the coordinator retries.
    async fn lock_groups(&mut self, ids: &[GroupId]) -> Result<()> {
        let missing = ids
            .iter()
            .copied()
            .filter(|id| !self.locked.contains(id))
            .collect::<BTreeSet<_>>();
        for id in missing {
            advisory_lock(&mut *self.tx, lock_key(id)).await?;
            self.locked.insert(id);
        }
        Ok(())
    }

    async fn insert_group(&mut self, group: &Group) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO hierarchy.groups (id, name, type, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(group.id.0)
        .bind(&group.name)
        .bind(group.group_type.as_db_value())
        .bind(group.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(insert_group_err)?;

        Ok(())
    }

    async fn insert_edge(&mut self, edge: &HierarchyEdge) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO hierarchy.group_hierarchies (
                child_group_id,
                parent_group_id,
                child_name,
                created_at
            )
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(edge.child_id.0)
        .bind(edge.parent_id.0)
        .bind(&edge.child_label)
        .bind(edge.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|err| insert_edge_err(edge, err))?;

        Ok(())
    }

    async fn remove_edge(&mut self, child_id: GroupId) -> Result<Option<HierarchyEdge>> {
        let row = sqlx::query_as::<_, EdgeRow>(
            r#"
            DELETE FROM hierarchy.group_hierarchies
            WHERE child_group_id = $1
            RETURNING child_group_id, parent_group_id, child_name, created_at
            "#,
        )
        .bind(child_id.0)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|err| db_err("Failed to detach group", err))?;

        Ok(row.map(HierarchyEdge::from))
    }

    async fn delete_group(&mut self, id: GroupId) -> Result<()> {
        let result = sqlx::query(
            r#"
            DELETE FROM hierarchy.groups
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .execute(&mut *self.tx)
        .await
        .map_err(|err| db_err("Failed to delete group", err))?;

        if result.rows_affected() == 0 {
            return Err(LibError::not_found(
                "Group not found",
                anyhow!("group {} does not exist", id),
            ));
        }
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx
            .commit()
            .await
            .map_err(|err| db_err("Failed to commit transaction", err))
    }

    async fn rollback(self) -> Result<()> {
        self.tx
            .rollback()
            .await
            .map_err(|err| db_err("Failed to roll back transaction", err))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::coordinator::HierarchyCoordinator;
    use crate::error::ErrorKind;
    use crate::models::CreateGroupPayload;
    use crate::permissions::{HIERARCHY_ROLE_ADMIN, Principal};
    use crate::query::HierarchyQuery;

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn admin() -> Principal {
        Principal::new("admin", [HIERARCHY_ROLE_ADMIN])
    }

    fn coordinator(pool: PgPool) -> HierarchyCoordinator<PgBackend> {
        HierarchyCoordinator::new(PgBackend::new(pool), CoordinatorConfig::default())
    }

    fn group(name: &str, group_type: GroupType) -> Group {
        Group {
            id: GroupId::new_v4(),
            name: name.to_string(),
            group_type,
            created_at: Utc::now().naive_utc(),
        }
    }

    fn edge(child: &Group, parent_id: GroupId) -> HierarchyEdge {
        HierarchyEdge {
            child_id: child.id,
            parent_id,
            child_label: child.name.clone(),
            created_at: Utc::now().naive_utc(),
        }
    }

    async fn seed(backend: &PgBackend, groups: &[&Group], edges: &[HierarchyEdge]) {
        let mut tx = backend.begin(TIMEOUT).await.expect("begin");
        for group in groups {
            tx.insert_group(group).await.expect("insert group");
        }
        for edge in edges {
            tx.insert_edge(edge).await.expect("insert edge");
        }
        tx.commit().await.expect("commit");
    }

    /// Inserts `edge` straight through the store, skipping the validator.
    async fn raw_edge_error(backend: &PgBackend, edge: &HierarchyEdge) -> LibError {
        let mut tx = backend.begin(TIMEOUT).await.expect("begin");
        let err = tx.insert_edge(edge).await.expect_err("schema should reject the edge");
        tx.rollback().await.expect("rollback");
        err
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn root_cannot_be_attached_as_child(pool: PgPool) {
        let coordinator = coordinator(pool);
        let a = coordinator
            .create_group(&admin(), CreateGroupPayload::new("A", GroupType::OrganizationalUnit))
            .await
            .expect("create A");
        let root = coordinator
            .create_group(&admin(), CreateGroupPayload::new("root1", GroupType::Root))
            .await
            .expect("create root");

        let err = coordinator
            .attach_child(&admin(), root.id, a.id)
            .await
            .expect_err("root as child");
        assert_eq!(
            err.violation_kind(),
            Some(&HierarchyViolation::RootCannotBeChild { child_id: root.id })
        );
        let mut reader = coordinator.backend().reader();
        assert!(reader.parent(root.id).await.expect("parent").is_none());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn second_root_is_rejected(pool: PgPool) {
        let coordinator = coordinator(pool);
        coordinator
            .create_group(&admin(), CreateGroupPayload::new("root1", GroupType::Root))
            .await
            .expect("first root");

        let err = coordinator
            .create_group(&admin(), CreateGroupPayload::new("root2", GroupType::Root))
            .await
            .expect_err("second root");
        assert!(matches!(
            err.violation_kind(),
            Some(HierarchyViolation::RootAlreadyExists { .. })
        ));
        let mut reader = coordinator.backend().reader();
        assert_eq!(reader.count_by_type(GroupType::Root).await.expect("count"), 1);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn concurrent_root_creation_admits_one(pool: PgPool) {
        let coordinator = coordinator(pool);
        let principal = admin();
        let (first, second) = tokio::join!(
            coordinator.create_group(&principal, CreateGroupPayload::new("root1", GroupType::Root)),
            coordinator.create_group(&principal, CreateGroupPayload::new("root2", GroupType::Root)),
        );

        let outcomes = [first, second];
        assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 1);
        let rejected = outcomes
            .iter()
            .find_map(|outcome| outcome.as_ref().err())
            .expect("one rejection");
        assert!(matches!(
            rejected.violation_kind(),
            Some(HierarchyViolation::RootAlreadyExists { .. })
        ));
        let mut reader = coordinator.backend().reader();
        assert_eq!(reader.count_by_type(GroupType::Root).await.expect("count"), 1);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn schema_constraints_map_to_violations(pool: PgPool) {
        let backend = PgBackend::new(pool);
        let root = group("root", GroupType::Root);
        let a = group("A", GroupType::OrganizationalUnit);
        let b = group("B", GroupType::OrganizationalUnit);
        seed(&backend, &[&root, &a, &b], &[edge(&b, a.id)]).await;

        let mut tx = backend.begin(TIMEOUT).await.expect("begin");
        let err = tx
            .insert_group(&group("root2", GroupType::Root))
            .await
            .expect_err("single root index");
        tx.rollback().await.expect("rollback");
        assert!(matches!(
            err.violation_kind(),
            Some(HierarchyViolation::RootAlreadyExists { .. })
        ));

        let err = raw_edge_error(&backend, &edge(&root, a.id)).await;
        assert_eq!(
            err.violation_kind(),
            Some(&HierarchyViolation::RootCannotBeChild { child_id: root.id })
        );

        let err = raw_edge_error(&backend, &edge(&b, root.id)).await;
        assert_eq!(
            err.violation_kind(),
            Some(&HierarchyViolation::ChildAlreadyHasParent {
                child_id: b.id,
                parent_id: root.id,
            })
        );

        let err = raw_edge_error(&backend, &edge(&a, a.id)).await;
        assert!(matches!(
            err.violation_kind(),
            Some(HierarchyViolation::CycleDetected { .. })
        ));

        let err = raw_edge_error(&backend, &edge(&a, GroupId::new_v4())).await;
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn held_group_lock_times_out_other_writers(pool: PgPool) {
        let backend = PgBackend::new(pool);
        let id = GroupId::new_v4();

        let mut holder = backend.begin(TIMEOUT).await.expect("begin");
        holder.lock_groups(&[id]).await.expect("first lock");

        let mut waiter = backend
            .begin(Duration::from_millis(50))
            .await
            .expect("begin");
        let err = waiter.lock_groups(&[id]).await.expect_err("should time out");
        assert_eq!(err.kind, ErrorKind::Timeout);
        waiter.rollback().await.expect("rollback");

        holder.commit().await.expect("commit");
        let mut next = backend.begin(TIMEOUT).await.expect("begin");
        next.lock_groups(&[id]).await.expect("lock after release");
        next.rollback().await.expect("rollback");
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn subtree_reads_through_one_transaction(pool: PgPool) {
        let backend = PgBackend::new(pool);
        let root = group("root", GroupType::Root);
        let a = group("A", GroupType::OrganizationalUnit);
        let b = group("B", GroupType::OrganizationalUnit);
        seed(&backend, &[&root, &a, &b], &[edge(&a, root.id), edge(&b, a.id)]).await;

        let query = HierarchyQuery::new(backend);
        let tree = query.subtree(root.id).await.expect("subtree");
        assert_eq!(tree.ids(), vec![root.id, a.id, b.id]);
        let ancestors = query.ancestors(b.id).await.expect("ancestors");
        assert_eq!(
            ancestors.iter().map(|g| g.id).collect::<Vec<_>>(),
            vec![a.id, root.id]
        );
    }

    #[test]
    fn lock_keys_are_stable_per_group() {
        let id = GroupId::new_v4();
        assert_eq!(lock_key(id), lock_key(id));
        assert_ne!(lock_key(id), lock_key(GroupId::new_v4()));
    }

    #[test]
    fn non_database_errors_stay_database_errors() {
        let err = db_err("Failed to query group", sqlx::Error::RowNotFound);
        assert_eq!(err.code, "database_error");
        assert_eq!(err.public, "Failed to query group");
    }
}
