use std::collections::{HashMap, HashSet, VecDeque};

use crate::models::{Group, GroupId, HierarchyEdge, SubtreeNode};

/// Parent id to child ids, keeping the order in which the edges are given.
pub fn children_map(edges: &[HierarchyEdge]) -> HashMap<GroupId, Vec<GroupId>> {
    let mut children: HashMap<GroupId, Vec<GroupId>> = HashMap::new();
    for edge in edges {
        children
            .entry(edge.parent_id)
            .or_default()
            .push(edge.child_id);
    }
    children
}

/// Walks parent links from `start` upwards. The result starts with `start` itself and stops at
/// the first node without a parent, or at the first id seen twice.
pub fn path_to_root<F>(start: GroupId, mut parent_of: F) -> Vec<GroupId>
where
    F: FnMut(GroupId) -> Option<GroupId>,
{
    let mut path = vec![start];
    let mut seen = HashSet::from([start]);
    let mut current = start;
    while let Some(parent) = parent_of(current) {
        if !seen.insert(parent) {
            break;
        }
        path.push(parent);
        current = parent;
    }
    path
}

/// Nodes that Kahn's algorithm cannot order, i.e. nodes on or behind a cycle.
pub fn cyclic_nodes(groups: &[Group], edges: &[HierarchyEdge]) -> Vec<GroupId> {
    let mut indegree: HashMap<GroupId, usize> = HashMap::with_capacity(groups.len());
    for group in groups {
        indegree.insert(group.id, 0);
    }
    let mut adjacency: HashMap<GroupId, Vec<GroupId>> = HashMap::with_capacity(groups.len());
    for edge in edges {
        // Dangling references are reported separately by the forest audit.
        if !indegree.contains_key(&edge.parent_id) || !indegree.contains_key(&edge.child_id) {
            continue;
        }
        if let Some(degree) = indegree.get_mut(&edge.child_id) {
            *degree += 1;
        }
        adjacency
            .entry(edge.parent_id)
            .or_default()
            .push(edge.child_id);
    }

    let mut queue: VecDeque<GroupId> = indegree
        .iter()
        .filter_map(|(id, degree)| if *degree == 0 { Some(*id) } else { None })
        .collect();
    while let Some(id) = queue.pop_front() {
        if let Some(children) = adjacency.get(&id) {
            for child in children {
                if let Some(degree) = indegree.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(*child);
                    }
                }
            }
        }
    }

    let mut remaining = indegree
        .into_iter()
        .filter_map(|(id, degree)| if degree > 0 { Some(id) } else { None })
        .collect::<Vec<_>>();
    remaining.sort();
    remaining
}

pub fn has_cycle(groups: &[Group], edges: &[HierarchyEdge]) -> bool {
    !cyclic_nodes(groups, edges).is_empty()
}

/// Builds the tree below `root` from edges that all lie inside that subtree.
/// Edges whose child is missing from `groups` are skipped.
pub fn build_subtree(
    root: Group,
    groups: &HashMap<GroupId, Group>,
    edges: &[HierarchyEdge],
) -> SubtreeNode {
    let children = children_map(edges);
    let mut visited = HashSet::from([root.id]);

    // Breadth-first listing; entry `i` is node `i + 1` and records its parent's node index.
    let mut order = vec![root.id];
    let mut entries: Vec<(Group, usize)> = Vec::new();
    let mut next = 0;
    while next < order.len() {
        if let Some(child_ids) = children.get(&order[next]) {
            for child_id in child_ids {
                if !visited.insert(*child_id) {
                    continue;
                }
                if let Some(child) = groups.get(child_id) {
                    order.push(*child_id);
                    entries.push((child.clone(), next));
                }
            }
        }
        next += 1;
    }

    // Later siblings come out first, so each child list is reversed once complete.
    let mut built: Vec<Vec<SubtreeNode>> = (0..order.len()).map(|_| Vec::new()).collect();
    for (offset, (group, parent)) in entries.into_iter().enumerate().rev() {
        let mut node_children = std::mem::take(&mut built[offset + 1]);
        node_children.reverse();
        built[parent].push(SubtreeNode {
            group,
            children: node_children,
        });
    }
    let mut root_children = std::mem::take(&mut built[0]);
    root_children.reverse();
    SubtreeNode {
        group: root,
        children: root_children,
    }
}

/// Number of edge levels below `root`. Zero for a leaf.
pub fn subtree_depth(root: GroupId, edges: &[HierarchyEdge]) -> usize {
    let children = children_map(edges);
    let mut visited = HashSet::from([root]);
    let mut frontier = vec![root];
    let mut depth = 0;
    loop {
        let mut below = Vec::new();
        for id in &frontier {
            if let Some(child_ids) = children.get(id) {
                below.extend(child_ids.iter().copied().filter(|child| visited.insert(*child)));
            }
        }
        if below.is_empty() {
            return depth;
        }
        depth += 1;
        frontier = below;
    }
}
