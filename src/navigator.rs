//! Read-only traversal over a task tree
//!
//! Every function here works on borrowed [`TaskNode`]s and never mutates. Lookup by id is
//! depth-first with parents visited before their children.

use crate::models::{TaskId, TaskNode};

/// Finds a node by id, searching `node` itself first and then each child subtree in order.
pub fn find(node: &TaskNode, id: TaskId) -> Option<&TaskNode> {
    if node.id() == id {
        return Some(node);
    }
    node.children().iter().find_map(|child| find(child, id))
}

pub fn find_mut(node: &mut TaskNode, id: TaskId) -> Option<&mut TaskNode> {
    if node.id() == id {
        return Some(node);
    }
    node.children_mut()
        .iter_mut()
        .find_map(|child| find_mut(child, id))
}

/// Returns the next task that should be worked on inside `node`.
///
/// Direct children are scanned first for an incomplete leaf. Only when none qualifies does
/// the search descend into incomplete children, in order. Completed branches are skipped
/// entirely, and the tree root is never returned.
pub fn next_incomplete(node: &TaskNode) -> Option<&TaskNode> {
    if let Some(leaf) = node
        .children()
        .iter()
        .find(|child| !child.is_completed() && child.is_leaf())
    {
        return Some(leaf);
    }

    for child in node.children().iter().filter(|child| !child.is_completed()) {
        if let Some(found) = next_incomplete(child) {
            return Some(found);
        }
    }

    if !node.is_root() && !node.is_completed() && node.is_leaf() {
        return Some(node);
    }

    None
}

/// Collects every incomplete node below `node` in depth-first order, regardless of leaf
/// status. The tree root is skipped.
pub fn flatten_incomplete(node: &TaskNode) -> Vec<&TaskNode> {
    let mut out = Vec::new();
    collect_incomplete(node, &mut out);
    out
}

fn collect_incomplete<'a>(node: &'a TaskNode, out: &mut Vec<&'a TaskNode>) {
    if !node.is_root() && !node.is_completed() {
        out.push(node);
    }
    for child in node.children() {
        collect_incomplete(child, out);
    }
}

/// Returns the chain from the node with `id` up to and including the tree root.
///
/// The first element is the node itself. Returns `None` when `id` is not in the tree or a
/// parent link cannot be resolved.
pub fn ancestor_chain(root: &TaskNode, id: TaskId) -> Option<Vec<&TaskNode>> {
    let mut chain = Vec::new();
    let mut current = find(root, id)?;
    chain.push(current);
    while let Some(parent_id) = current.parent_id() {
        current = find(root, parent_id)?;
        chain.push(current);
        if chain.len() > count_nodes(root) {
            // Cyclic parent links
            return None;
        }
    }
    Some(chain)
}

/// Counts `node` and all of its descendants.
pub fn count_nodes(node: &TaskNode) -> usize {
    1 + node.children().iter().map(count_nodes).sum::<usize>()
}

/// Largest id present in the subtree.
pub fn max_id(node: &TaskNode) -> TaskId {
    node.children()
        .iter()
        .map(max_id)
        .fold(node.id(), TaskId::max)
}
