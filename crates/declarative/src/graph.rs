//! Dependency graph over declared resources
//!
//! Nodes are kept in declaration order. An edge `a -> b` means `b` consumes
//! something `a` produces, so `a` must materialize first. The graph is
//! acyclic at all times: every insertion that would close a loop is
//! rejected with the offending path.

use crate::error::DeclarationError;
use std::collections::{BTreeSet, HashMap};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Grey,
    Black,
}

#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    names: Vec<String>,
    index: HashMap<String, usize>,
    /// dependency -> dependents
    dependents: Vec<BTreeSet<usize>>,
    /// dependent -> dependencies
    dependencies: Vec<BTreeSet<usize>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn name(&self, idx: usize) -> &str {
        &self.names[idx]
    }

    /// Names in declaration order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn add_node(&mut self, name: &str) -> Result<usize, DeclarationError> {
        if self.contains(name) {
            return Err(DeclarationError::DuplicateName(name.to_string()));
        }
        let idx = self.names.len();
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), idx);
        self.dependents.push(BTreeSet::new());
        self.dependencies.push(BTreeSet::new());
        Ok(idx)
    }

    /// Record that `dependent` needs `dependency` first.
    pub fn add_edge(&mut self, dependency: &str, dependent: &str) -> Result<(), DeclarationError> {
        let to = self
            .index_of(dependent)
            .ok_or_else(|| DeclarationError::DanglingReference {
                dependent: dependency.to_string(),
                missing: dependent.to_string(),
            })?;
        let from = self
            .index_of(dependency)
            .ok_or_else(|| DeclarationError::DanglingReference {
                dependent: dependent.to_string(),
                missing: dependency.to_string(),
            })?;

        if self.dependents[from].contains(&to) {
            return Ok(());
        }

        // The new edge closes a loop iff `dependent` already reaches `dependency`
        if let Some(path) = self.find_path(to, from) {
            let mut cycle = vec![dependency.to_string()];
            cycle.extend(path.into_iter().map(|idx| self.names[idx].clone()));
            return Err(DeclarationError::CyclicDependency { path: cycle });
        }

        self.dependents[from].insert(to);
        self.dependencies[to].insert(from);
        Ok(())
    }

    /// Iterative three-colour DFS along dependent edges from `start`,
    /// returning the path to `target` if one exists.
    fn find_path(&self, start: usize, target: usize) -> Option<Vec<usize>> {
        if start == target {
            return Some(vec![start]);
        }

        let mut color = vec![Color::White; self.names.len()];
        color[start] = Color::Grey;
        let mut stack = vec![(start, self.dependents[start].iter())];

        loop {
            let (node, children) = stack.last_mut()?;
            let node = *node;
            match children.next().copied() {
                Some(next) if next == target => {
                    let mut path: Vec<usize> = stack.iter().map(|(n, _)| *n).collect();
                    path.push(target);
                    return Some(path);
                }
                Some(next) => {
                    if color[next] == Color::White {
                        color[next] = Color::Grey;
                        stack.push((next, self.dependents[next].iter()));
                    }
                }
                None => {
                    color[node] = Color::Black;
                    stack.pop();
                }
            }
        }
    }

    pub fn dependencies(&self, idx: usize) -> &BTreeSet<usize> {
        &self.dependencies[idx]
    }

    pub fn dependents(&self, idx: usize) -> &BTreeSet<usize> {
        &self.dependents[idx]
    }

    /// Names this node depends on directly, in declaration order.
    pub fn dependency_names(&self, idx: usize) -> Vec<String> {
        self.dependencies[idx]
            .iter()
            .map(|&d| self.names[d].clone())
            .collect()
    }

    /// Every node reachable through dependent edges.
    pub fn descendants(&self, idx: usize) -> BTreeSet<usize> {
        let mut seen = BTreeSet::new();
        let mut frontier: Vec<usize> = self.dependents[idx].iter().copied().collect();
        while let Some(next) = frontier.pop() {
            if seen.insert(next) {
                frontier.extend(self.dependents[next].iter().copied());
            }
        }
        seen
    }

    /// Kahn's algorithm; ties go to the earlier declaration.
    pub fn topological_order(&self) -> Vec<usize> {
        let mut remaining: Vec<usize> = self.dependencies.iter().map(BTreeSet::len).collect();
        let mut ready: BTreeSet<usize> = (0..self.len()).filter(|&i| remaining[i] == 0).collect();
        let mut order = Vec::with_capacity(self.len());

        while let Some(idx) = ready.pop_first() {
            order.push(idx);
            for &dependent in &self.dependents[idx] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }
        order
    }

    pub fn topological_names(&self) -> Vec<String> {
        self.topological_order()
            .into_iter()
            .map(|idx| self.names[idx].clone())
            .collect()
    }
}
