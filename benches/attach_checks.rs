use std::collections::HashMap;
use std::hint::black_box;

use chrono::NaiveDate;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use uuid::Uuid;

use subseq_hierarchy::algorithms::path_to_root;
use subseq_hierarchy::invariants::{AttachCheck, attach_violations, forest_invariant_violations};
use subseq_hierarchy::models::{Group, GroupId, GroupType, HierarchyEdge};

fn lcg_next(state: &mut u64) -> u64 {
    *state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
    *state
}

fn group(id: GroupId, group_type: GroupType) -> Group {
    Group {
        id,
        name: "G".to_string(),
        group_type,
        created_at: NaiveDate::from_ymd_opt(2026, 1, 1)
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .unwrap_or_default(),
    }
}

/// One root with every other group hanging below a random earlier group.
fn synthetic_tree(group_count: usize) -> (Vec<Group>, Vec<HierarchyEdge>) {
    let groups = (0..group_count)
        .map(|idx| {
            let id = GroupId(Uuid::from_u128((idx as u128) + 1));
            let group_type = if idx == 0 {
                GroupType::Root
            } else {
                GroupType::OrganizationalUnit
            };
            group(id, group_type)
        })
        .collect::<Vec<_>>();

    let mut state = 0x1234_5678_9abc_def0u64;
    let edges = (1..group_count)
        .map(|idx| {
            let parent = (lcg_next(&mut state) as usize) % idx;
            HierarchyEdge {
                child_id: groups[idx].id,
                parent_id: groups[parent].id,
                child_label: groups[idx].name.clone(),
                created_at: groups[idx].created_at,
            }
        })
        .collect::<Vec<_>>();

    (groups, edges)
}

fn bench_attach_checks(c: &mut Criterion) {
    let mut bench_group = c.benchmark_group("attach_checks");
    for size in [1_000usize, 10_000usize] {
        let (groups, edges) = synthetic_tree(size);
        let parents = edges
            .iter()
            .map(|edge| (edge.child_id, edge.parent_id))
            .collect::<HashMap<_, _>>();

        bench_group.throughput(Throughput::Elements(1));
        bench_group.bench_with_input(
            BenchmarkId::new("path_and_attach_rules", format!("{size}g")),
            &(groups, parents),
            |b, (groups, parents)| {
                let mut seed = 42u64;
                b.iter(|| {
                    let child = &groups[(lcg_next(&mut seed) as usize) % groups.len()];
                    let parent_id = groups[(lcg_next(&mut seed) as usize) % groups.len()].id;
                    let parent_path = path_to_root(parent_id, |id| parents.get(&id).copied());
                    let check = AttachCheck {
                        child,
                        parent_id,
                        current_parent: parents.get(&child.id).copied(),
                        parent_path: &parent_path,
                    };
                    black_box(attach_violations(&check));
                });
            },
        );
    }
    bench_group.finish();
}

fn bench_forest_audit(c: &mut Criterion) {
    let mut bench_group = c.benchmark_group("forest_audit");
    for size in [1_000usize, 10_000usize] {
        let (groups, edges) = synthetic_tree(size);

        bench_group.throughput(Throughput::Elements(size as u64));
        bench_group.bench_with_input(
            BenchmarkId::new("full_snapshot", format!("{size}g")),
            &(groups, edges),
            |b, (groups, edges)| {
                b.iter(|| black_box(forest_invariant_violations(groups, edges)));
            },
        );
    }
    bench_group.finish();
}

criterion_group!(attach_checks, bench_attach_checks, bench_forest_audit);
criterion_main!(attach_checks);
