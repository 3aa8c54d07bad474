//! The node arena and its dependency graph.
//!
//! Nodes live in a slot vector and refer to each other by [`NodeId`]. Every edge is stored on
//! both ends: `dependencies` on the reading node, `dependents` on the node that was read. All
//! mutations go through [`NodeTable`] methods so the two sides never drift apart.

use std::collections::VecDeque;

use rustc_hash::{FxHashMap, FxHashSet};

use super::node::{InFlight, Node, NodeId, NodeState};
use super::ComputedKey;

#[derive(Debug, Default)]
pub(crate) struct NodeTable {
    slots: Vec<Option<Node>>,
    free: Vec<u32>,
    index: FxHashMap<ComputedKey, NodeId>,
}

impl NodeTable {
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn lookup(&self, key: &ComputedKey) -> Option<NodeId> {
        self.index.get(key).copied()
    }

    pub fn get(&self, id: NodeId) -> &Node {
        self.slots[id.0 as usize]
            .as_ref()
            .expect("node ids always point at occupied slots")
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut Node {
        self.slots[id.0 as usize]
            .as_mut()
            .expect("node ids always point at occupied slots")
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.index.values().copied().collect()
    }

    pub fn insert(&mut self, node: Node) -> NodeId {
        let key = node.key.clone();
        let id = match self.free.pop() {
            Some(slot) => {
                self.slots[slot as usize] = Some(node);
                NodeId(slot)
            }
            None => {
                self.slots.push(Some(node));
                NodeId(self.slots.len() as u32 - 1)
            }
        };
        self.index.insert(key, id);
        id
    }

    /// Removes a node and prunes every edge touching it.
    pub fn remove(&mut self, id: NodeId) -> Node {
        let dependencies = std::mem::take(&mut self.get_mut(id).dependencies);
        for dependency in dependencies {
            self.get_mut(dependency).dependents.remove(&id);
        }
        let dependents = std::mem::take(&mut self.get_mut(id).dependents);
        for dependent in dependents {
            self.get_mut(dependent).dependencies.retain(|d| *d != id);
        }

        let mut node = self.slots[id.0 as usize]
            .take()
            .expect("node ids always point at occupied slots");
        self.index.remove(&node.key);
        self.free.push(id.0);
        node.state = NodeState::Disposed;
        node
    }

    /// Replaces the dependency set of `id`, mirroring every change in the dependents index.
    pub fn set_dependencies(&mut self, id: NodeId, mut dependencies: Vec<NodeId>) {
        dependencies.sort_unstable();
        dependencies.dedup();

        let previous = std::mem::take(&mut self.get_mut(id).dependencies);
        for dependency in previous {
            self.get_mut(dependency).dependents.remove(&id);
        }
        for &dependency in &dependencies {
            self.get_mut(dependency).dependents.insert(id);
        }
        self.get_mut(id).dependencies = dependencies;
    }

    /// Whether any dependent of `id` still relies on its current value.
    pub fn has_live_dependents(&self, id: NodeId) -> bool {
        self.get(id)
            .dependents
            .iter()
            .any(|dependent| self.get(*dependent).state != NodeState::Invalidated)
    }

    /// Invalidates `root` and, breadth-first, everything that transitively depends on it.
    ///
    /// Each node is visited at most once. Nodes that are computing are flagged so their
    /// pending result lands as invalidated. Returns the keys that went from `Consistent` to
    /// `Invalidated` in this pass.
    pub fn invalidate(&mut self, root: NodeId) -> Vec<ComputedKey> {
        let mut invalidated = Vec::new();
        let mut visited = FxHashSet::default();
        let mut queue = VecDeque::from([root]);
        visited.insert(root);

        while let Some(id) = queue.pop_front() {
            let node = self.get_mut(id);
            match node.state {
                NodeState::Consistent => {
                    node.state = NodeState::Invalidated;
                    node.auto_invalidate_at = None;
                    invalidated.push(node.key.clone());
                }
                NodeState::Computing => {
                    if let Some(computation) = node.computation.as_mut() {
                        computation.invalidated = true;
                    }
                }
                NodeState::Invalidated | NodeState::Disposed => {}
            }

            for dependent in &node.dependents {
                if visited.insert(*dependent) {
                    queue.push_back(*dependent);
                }
            }
        }

        invalidated
    }

    /// The running computation of `key`, if it is still computation `id`.
    pub fn computation_mut(&mut self, key: &ComputedKey, id: u64) -> Option<&mut InFlight> {
        let node_id = self.lookup(key)?;
        self.get_mut(node_id)
            .computation
            .as_mut()
            .filter(|computation| computation.id == id)
    }

    /// Follows the keys that running computations are waiting for, starting at `key`.
    ///
    /// Returns the chain from `key` to the first key found on `stack`. A caller with that stack
    /// waiting for `key` would close a cycle that never resolves.
    pub fn find_wait_cycle(
        &self,
        key: &ComputedKey,
        stack: &[ComputedKey],
    ) -> Option<Vec<ComputedKey>> {
        let mut parents: FxHashMap<&ComputedKey, &ComputedKey> = FxHashMap::default();
        let mut pending = vec![key];

        while let Some(current) = pending.pop() {
            let Some(computation) = self
                .lookup(current)
                .and_then(|id| self.get(id).computation.as_ref())
            else {
                continue;
            };
            // A cancelled computation is replaced instead of joined.
            if computation.cancel.is_cancelled() {
                continue;
            }
            for next in &computation.awaiting {
                if next == key || parents.contains_key(next) {
                    continue;
                }
                parents.insert(next, current);
                if stack.contains(next) {
                    let mut chain = vec![next.clone()];
                    let mut at = next;
                    while let Some(parent) = parents.get(at) {
                        chain.push((*parent).clone());
                        at = *parent;
                    }
                    chain.reverse();
                    return Some(chain);
                }
                pending.push(next);
            }
        }

        None
    }

    /// Checks that the dependents index is the exact transpose of all dependency sets.
    #[cfg(test)]
    pub fn assert_transposed(&self) {
        let mut forward = FxHashSet::default();
        let mut backward = FxHashSet::default();
        for id in self.ids() {
            let node = self.get(id);
            forward.extend(node.dependencies.iter().map(|d| (id, *d)));
            backward.extend(node.dependents.iter().map(|d| (*d, id)));
        }
        assert_eq!(forward, backward);
    }
}
