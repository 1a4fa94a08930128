//! Declarative phase dependency graph.
//!
//! Phase ordering is data, not control flow: the graph is validated once at
//! construction (acyclic, every phase reachable from a foundation phase,
//! unit keys unique) so execution never has to discover a bad ordering at
//! runtime.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::EngineError;

/// One analyzer unit declared by a phase.
#[derive(Debug, Clone, Copy)]
pub struct UnitSpec {
    pub key: &'static str,
    /// A failed critical unit fails the phase. Non-critical failures degrade
    /// to a warning plus a synthesized fallback value.
    pub critical: bool,
    /// Unit consumes extracted diagrams when present; their absence lowers
    /// confidence but never blocks.
    pub wants_diagrams: bool,
}

impl UnitSpec {
    pub const fn critical(key: &'static str) -> Self {
        Self {
            key,
            critical: true,
            wants_diagrams: false,
        }
    }

    pub const fn optional(key: &'static str) -> Self {
        Self {
            key,
            critical: false,
            wants_diagrams: false,
        }
    }

    pub const fn with_diagrams(key: &'static str) -> Self {
        Self {
            key,
            critical: false,
            wants_diagrams: true,
        }
    }
}

/// One phase: a set of concurrently-executable units gated by predecessors.
#[derive(Debug, Clone, Copy)]
pub struct PhaseSpec {
    pub id: &'static str,
    pub predecessors: &'static [&'static str],
    pub units: &'static [UnitSpec],
}

/// Validated phase graph.
#[derive(Debug, Clone)]
pub struct PhaseGraph {
    phases: Vec<PhaseSpec>,
    topo_order: Vec<&'static str>,
}

impl PhaseGraph {
    /// Build and validate a graph.
    pub fn new(phases: &[PhaseSpec]) -> Result<Self, EngineError> {
        let mut seen = HashSet::new();
        for phase in phases {
            if !seen.insert(phase.id) {
                return Err(EngineError::FatalConfig(format!(
                    "duplicate phase id: {}",
                    phase.id
                )));
            }
            let mut unit_keys = HashSet::new();
            for unit in phase.units {
                if !unit_keys.insert(unit.key) {
                    return Err(EngineError::FatalConfig(format!(
                        "duplicate unit key {} in phase {}",
                        unit.key, phase.id
                    )));
                }
            }
            if phase.units.is_empty() {
                return Err(EngineError::FatalConfig(format!(
                    "phase {} declares no units",
                    phase.id
                )));
            }
        }
        for phase in phases {
            for pred in phase.predecessors {
                if !seen.contains(pred) {
                    return Err(EngineError::FatalConfig(format!(
                        "phase {} depends on unknown phase {}",
                        phase.id, pred
                    )));
                }
                if pred == &phase.id {
                    return Err(EngineError::FatalConfig(format!(
                        "phase {} depends on itself",
                        phase.id
                    )));
                }
            }
        }

        let topo_order = topo_sort(phases)?;
        if !phases.iter().any(|p| p.predecessors.is_empty()) {
            // Unreachable in practice: an acyclic graph always has a source.
            return Err(EngineError::FatalConfig(
                "graph has no foundation phase".into(),
            ));
        }

        Ok(Self {
            phases: phases.to_vec(),
            topo_order,
        })
    }

    pub fn phases(&self) -> &[PhaseSpec] {
        &self.phases
    }

    pub fn get(&self, id: &str) -> Option<&PhaseSpec> {
        self.phases.iter().find(|p| p.id == id)
    }

    /// Phase ids in dependency order.
    pub fn topo_order(&self) -> &[&'static str] {
        &self.topo_order
    }

    /// Phases with no predecessors.
    pub fn foundation(&self) -> impl Iterator<Item = &PhaseSpec> {
        self.phases.iter().filter(|p| p.predecessors.is_empty())
    }

    /// Phases no other phase depends on.
    pub fn terminal(&self) -> impl Iterator<Item = &PhaseSpec> {
        self.phases.iter().filter(|p| {
            !self
                .phases
                .iter()
                .any(|other| other.predecessors.contains(&p.id))
        })
    }

    /// Phases that directly declare `id` as a predecessor.
    pub fn direct_dependents(&self, id: &str) -> Vec<&'static str> {
        self.phases
            .iter()
            .filter(|p| p.predecessors.contains(&id))
            .map(|p| p.id)
            .collect()
    }

    /// Whether every predecessor of `id` is in `done`.
    pub fn predecessors_done(&self, id: &str, done: &HashSet<String>) -> bool {
        self.get(id)
            .map(|p| p.predecessors.iter().all(|pred| done.contains(*pred)))
            .unwrap_or(false)
    }
}

/// Kahn's algorithm. Phases left over after the queue drains sit on a cycle
/// (or depend on one), which also means they are unreachable from any
/// foundation phase.
fn topo_sort(phases: &[PhaseSpec]) -> Result<Vec<&'static str>, EngineError> {
    let mut in_degree: HashMap<&str, usize> = phases
        .iter()
        .map(|p| (p.id, p.predecessors.len()))
        .collect();
    let mut queue: VecDeque<&'static str> = phases
        .iter()
        .filter(|p| p.predecessors.is_empty())
        .map(|p| p.id)
        .collect();
    let mut order = Vec::with_capacity(phases.len());

    while let Some(id) = queue.pop_front() {
        order.push(id);
        for phase in phases {
            if phase.predecessors.contains(&id) {
                let degree = in_degree.get_mut(phase.id).expect("phase id known");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(phase.id);
                }
            }
        }
    }

    if order.len() != phases.len() {
        let stuck: Vec<&str> = phases
            .iter()
            .map(|p| p.id)
            .filter(|id| !order.contains(id))
            .collect();
        return Err(EngineError::FatalConfig(format!(
            "phase graph has a cycle or unreachable phases: {}",
            stuck.join(", ")
        )));
    }
    Ok(order)
}
