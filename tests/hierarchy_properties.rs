//! Random mutation sequences against the in-process backend. Whatever mix of accepted and
//! rejected operations a sequence produces, the committed state must stay a single-rooted forest.

use proptest::prelude::*;

use subseq_hierarchy::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Create { root: bool },
    Attach { child: usize, parent: usize },
    Detach { child: usize },
    Delete { group: usize, cascade: bool },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        2 => any::<bool>().prop_map(|root| Op::Create { root }),
        4 => (0usize..32, 0usize..32).prop_map(|(child, parent)| Op::Attach { child, parent }),
        1 => (0usize..32).prop_map(|child| Op::Detach { child }),
        1 => (0usize..32, any::<bool>()).prop_map(|(group, cascade)| Op::Delete { group, cascade }),
    ]
}

fn admin() -> Principal {
    Principal::new("prop", [subseq_hierarchy::permissions::HIERARCHY_ROLE_ADMIN])
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("runtime")
}

fn pick(ids: &[GroupId], idx: usize) -> Option<GroupId> {
    if ids.is_empty() {
        None
    } else {
        Some(ids[idx % ids.len()])
    }
}

/// Applies `op`, returning the error kind of a rejected operation.
async fn apply(
    service: &HierarchyService<MemoryBackend>,
    ids: &mut Vec<GroupId>,
    op: &Op,
) -> Option<ErrorKind> {
    let principal = admin();
    let result = match op {
        Op::Create { root } => {
            let group_type = if *root {
                GroupType::Root
            } else {
                GroupType::OrganizationalUnit
            };
            let name = format!("g{}", ids.len());
            service
                .create_group(&principal, CreateGroupPayload::new(name, group_type))
                .await
                .map(|group| ids.push(group.id))
        }
        Op::Attach { child, parent } => {
            let (Some(child), Some(parent)) = (pick(ids, *child), pick(ids, *parent)) else {
                return None;
            };
            service
                .attach_child(&principal, child, parent)
                .await
                .map(|_| ())
        }
        Op::Detach { child } => {
            let Some(child) = pick(ids, *child) else {
                return None;
            };
            service.detach_child(&principal, child).await.map(|_| ())
        }
        Op::Delete { group, cascade } => {
            let Some(group) = pick(ids, *group) else {
                return None;
            };
            let policy = if *cascade {
                DeletePolicy::Cascade
            } else {
                DeletePolicy::Reject
            };
            service
                .delete_group(&principal, group, policy)
                .await
                .map(|deleted| ids.retain(|id| !deleted.deleted_ids.contains(id)))
        }
    };
    result.err().map(|err| err.kind)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn committed_state_stays_a_single_rooted_forest(ops in prop::collection::vec(arb_op(), 1..60)) {
        let runtime = runtime();
        runtime.block_on(async {
            let backend = MemoryBackend::new();
            let service = HierarchyService::new(backend.clone(), CoordinatorConfig::default());
            let mut ids = Vec::new();

            for op in &ops {
                if let Some(kind) = apply(&service, &mut ids, op).await {
                    prop_assert!(
                        matches!(kind, ErrorKind::Violation | ErrorKind::NotFound),
                        "unexpected rejection {:?} for {:?}",
                        kind,
                        op
                    );
                }

                let snapshot = backend.snapshot();
                let state = snapshot.state();
                let groups = state.all_groups();
                let edges = state.all_edges();

                prop_assert!(state.count_by_type(GroupType::Root) <= 1);
                prop_assert!(forest_violations(&groups, &edges).is_empty());
                for group in &groups {
                    prop_assert!(state.path_to_root(group.id).len() <= groups.len());
                }
            }
            Ok(())
        })?;
    }

    #[test]
    fn subtree_reads_repeat_without_mutation(ops in prop::collection::vec(arb_op(), 1..40)) {
        let runtime = runtime();
        runtime.block_on(async {
            let service = HierarchyService::new(MemoryBackend::new(), CoordinatorConfig::default());
            let mut ids = Vec::new();
            for op in &ops {
                apply(&service, &mut ids, op).await;
            }

            for id in &ids {
                let first = service.subtree(&admin(), *id).await.expect("subtree");
                let second = service.subtree(&admin(), *id).await.expect("subtree");
                prop_assert_eq!(&first, &second);
                prop_assert_eq!(first.ids()[0], *id);
            }
            Ok(())
        })?;
    }
}

fn forest_violations(groups: &[Group], edges: &[HierarchyEdge]) -> Vec<HierarchyViolation> {
    subseq_hierarchy::invariants::forest_invariant_violations(groups, edges)
}
