pub mod algorithms;
#[cfg(feature = "api")]
pub mod api;
pub mod config;
pub mod coordinator;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;
pub mod events;
pub mod invariants;
pub mod memory;
pub mod models;
pub mod operations;
pub mod permissions;
pub mod query;
pub mod store;

pub mod prelude {
    pub use crate::algorithms::{build_subtree, has_cycle, path_to_root};
    #[cfg(feature = "api")]
    pub use crate::api::{AppError, HierarchyApp};
    pub use crate::config::CoordinatorConfig;
    pub use crate::coordinator::{HierarchyCoordinator, MutationPhase};
    #[cfg(feature = "sqlx")]
    pub use crate::db::{PgBackend, create_hierarchy_tables};
    pub use crate::error::{ErrorKind, LibError, Result};
    pub use crate::events::{BroadcastSink, ChangeSink, NoopSink};
    pub use crate::invariants::{
        AttachCheck, ensure_attach, ensure_create, ensure_delete, ensure_forest_invariants,
    };
    pub use crate::memory::MemoryBackend;
    pub use crate::models::{
        AttachChildPayload, ChangeOperation, CreateGroupPayload, DeleteGroupQuery, DeletePolicy,
        DeletedGroups, Group, GroupId, GroupType, HierarchyChange, HierarchyEdge,
        HierarchyViolation, SubtreeNode,
    };
    pub use crate::operations::{HierarchyOperation, HierarchyOperationResult, HierarchyService};
    pub use crate::permissions::{HierarchyAction, Principal};
    pub use crate::query::HierarchyQuery;
    pub use crate::store::{HierarchyBackend, HierarchyRead, HierarchyTx};
}
