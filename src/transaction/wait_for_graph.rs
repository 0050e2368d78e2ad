use std::collections::{HashMap, HashSet};

use crate::wal::TxnId;

/// Incrementally maintained wait-for graph. An edge a -> b means
/// transaction a is waiting for a lock held by b.
pub(crate) struct WaitForGraph {
    graph: HashMap<TxnId, HashSet<TxnId>>,
}

impl WaitForGraph {
    pub(crate) fn new() -> Self {
        Self {
            graph: HashMap::new(),
        }
    }

    pub(crate) fn add_edge(&mut self, from: TxnId, to: TxnId) {
        if from == to {
            return;
        }
        self.graph
            .entry(from)
            .or_insert_with(HashSet::new)
            .insert(to);
    }

    pub(crate) fn remove_waiter(&mut self, tid: TxnId) {
        self.graph.remove(&tid);
    }

    /// Drop the transaction both as a waiter and as a wait target.
    pub(crate) fn remove_transaction(&mut self, tid: TxnId) {
        self.graph.remove(&tid);
        for targets in self.graph.values_mut() {
            targets.remove(&tid);
        }
    }

    /// Find one cycle and return its members, or None.
    pub(crate) fn find_cycle(&self) -> Option<Vec<TxnId>> {
        let mut visited = HashSet::new();

        for &tid in self.graph.keys() {
            if visited.contains(&tid) {
                continue;
            }
            let mut stack = Vec::new();
            let mut on_stack = HashSet::new();
            if let Some(cycle) = self.walk(tid, &mut visited, &mut stack, &mut on_stack) {
                return Some(cycle);
            }
        }

        None
    }

    fn walk(
        &self,
        tid: TxnId,
        visited: &mut HashSet<TxnId>,
        stack: &mut Vec<TxnId>,
        on_stack: &mut HashSet<TxnId>,
    ) -> Option<Vec<TxnId>> {
        visited.insert(tid);
        stack.push(tid);
        on_stack.insert(tid);

        if let Some(targets) = self.graph.get(&tid) {
            for &next in targets {
                if on_stack.contains(&next) {
                    // unwind the stack back to where the cycle starts
                    let start = stack.iter().position(|&t| t == next).unwrap();
                    return Some(stack[start..].to_vec());
                }
                if !visited.contains(&next) {
                    if let Some(cycle) = self.walk(next, visited, stack, on_stack) {
                        return Some(cycle);
                    }
                }
            }
        }

        stack.pop();
        on_stack.remove(&tid);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_cycle() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(1, 2);
        graph.add_edge(2, 3);
        assert!(graph.find_cycle().is_none());
    }

    #[test]
    fn test_simple_cycle() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(1, 2);
        graph.add_edge(2, 1);
        let mut cycle = graph.find_cycle().unwrap();
        cycle.sort();
        assert_eq!(cycle, vec![1, 2]);
    }

    #[test]
    fn test_cycle_broken_by_removal() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(1, 2);
        graph.add_edge(2, 3);
        graph.add_edge(3, 1);
        assert!(graph.find_cycle().is_some());

        graph.remove_transaction(3);
        assert!(graph.find_cycle().is_none());
    }

    #[test]
    fn test_self_edge_ignored() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(1, 1);
        assert!(graph.find_cycle().is_none());
    }
}
