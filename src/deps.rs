//! Restart closures and priority weights over the cascade graph.
//!
//! Every server restarts together with the servers it cascades into, transitively.
//! The resulting restart order sorts by a weight that grows with the number of
//! cascade paths leading into a server, so servers that many others cascade into
//! are restarted after the servers that pull them in. The weight is a heuristic and
//! not a topological sort: cycles are cut at the first revisit and logged.
use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

/// Cascade edges: server name to the names it cascades into.
pub type CascadeGraph = BTreeMap<String, BTreeSet<String>>;

/// Result of walking the cascade graph from one server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Closure {
    /// Reachable servers in depth-first discovery order, starting with the root.
    pub members: Vec<String>,
    /// Cycles met during the walk, each written as `[a, b, a]`.
    pub cycles: Vec<Vec<String>>,
}

/// Closures and weights for a whole graph.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    closures: BTreeMap<String, Closure>,
    priorities: BTreeMap<String, u32>,
    cycles: Vec<Vec<String>>,
}

impl Resolution {
    /// Weight of a server; unknown names weigh zero.
    pub fn priority(&self, name: &str) -> u32 {
        self.priorities.get(name).copied().unwrap_or_default()
    }

    /// The restart closure of `name` sorted by ascending weight, ties broken by name.
    pub fn ordered_closure(&self, name: &str) -> Vec<String> {
        let members = self
            .closures
            .get(name)
            .map(|closure| closure.members.clone())
            .unwrap_or_else(|| vec![name.to_string()]);
        self.sort_by_priority(members)
    }

    /// Every server sorted by ascending weight.
    pub fn start_order(&self) -> Vec<String> {
        self.sort_by_priority(self.priorities.keys().cloned().collect())
    }

    /// Distinct cycles found across every closure walk.
    pub fn cycles(&self) -> &[Vec<String>] {
        &self.cycles
    }

    fn sort_by_priority(&self, mut names: Vec<String>) -> Vec<String> {
        names.sort_by(|a, b| {
            self.priority(a)
                .cmp(&self.priority(b))
                .then_with(|| a.cmp(b))
        });
        names
    }
}

/// Computes closures and weights for every server of the graph.
pub fn resolve(graph: &CascadeGraph) -> Resolution {
    let mut closures = BTreeMap::new();
    let mut cycles: Vec<Vec<String>> = Vec::new();

    for name in graph.keys() {
        let closure = restart_closure(graph, name);
        for cycle in &closure.cycles {
            if !cycles.iter().any(|known| same_cycle(known, cycle)) {
                cycles.push(cycle.clone());
            }
        }
        closures.insert(name.clone(), closure);
    }

    Resolution {
        closures,
        priorities: priorities(graph),
        cycles,
    }
}

/// Walks `cascade_dependents` edges depth-first from `root`.
///
/// A server already on the traversal stack closes a cycle: the cycle is logged and
/// recorded and the branch is not descended. A server reached again through another
/// branch is skipped quietly.
pub fn restart_closure(graph: &CascadeGraph, root: &str) -> Closure {
    let mut closure = Closure::default();
    let mut seen = BTreeSet::new();
    let mut stack = Vec::new();
    visit(graph, root, &mut stack, &mut seen, &mut closure);
    closure
}

fn visit(
    graph: &CascadeGraph,
    name: &str,
    stack: &mut Vec<String>,
    seen: &mut BTreeSet<String>,
    closure: &mut Closure,
) {
    stack.push(name.to_string());
    seen.insert(name.to_string());
    closure.members.push(name.to_string());

    if let Some(targets) = graph.get(name) {
        for target in targets {
            if let Some(position) = stack.iter().position(|entry| entry == target) {
                let mut cycle = stack[position..].to_vec();
                cycle.push(target.clone());
                warn!("Cascade configuration contains a cycle: {}", cycle.join(" -> "));
                closure.cycles.push(cycle);
                continue;
            }

            if seen.contains(target) {
                debug!("'{target}' already in the restart closure, skipping");
                continue;
            }

            visit(graph, target, stack, seen, closure);
        }
    }

    stack.pop();
}

/// Computes the weight of every server.
///
/// Each server adds one to its own weight and, recursively, to the weight of every
/// server reachable from it, so a server gains one point per cascade path ending in
/// it. Paths are cut where they would revisit a server already on the stack.
pub fn priorities(graph: &CascadeGraph) -> BTreeMap<String, u32> {
    let mut weights = BTreeMap::new();
    let mut stack = Vec::new();
    for name in graph.keys() {
        bump(graph, name, &mut weights, &mut stack);
    }
    weights
}

fn bump(
    graph: &CascadeGraph,
    name: &str,
    weights: &mut BTreeMap<String, u32>,
    stack: &mut Vec<String>,
) {
    *weights.entry(name.to_string()).or_insert(0) += 1;
    stack.push(name.to_string());

    if let Some(targets) = graph.get(name) {
        for target in targets {
            if stack.iter().any(|entry| entry == target) {
                debug!("Priority propagation stops at cycle through '{target}'");
                continue;
            }
            bump(graph, target, weights, stack);
        }
    }

    stack.pop();
}

/// Two recorded cycles are the same when they are rotations of each other.
fn same_cycle(a: &[String], b: &[String]) -> bool {
    // Cycles are stored closed (`[x, y, x]`); compare the open forms.
    let a = &a[..a.len().saturating_sub(1)];
    let b = &b[..b.len().saturating_sub(1)];
    if a.len() != b.len() {
        return false;
    }
    if a.is_empty() {
        return true;
    }
    (0..a.len()).any(|shift| a.iter().cycle().skip(shift).take(a.len()).eq(b.iter()))
}
