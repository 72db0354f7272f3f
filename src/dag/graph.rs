use std::collections::{HashMap, VecDeque};
use std::fmt;

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graphmap::DiGraphMap;

use crate::config::model::{PipelineConfig, StageName};
use crate::errors::{ConfigError, ConfigErrors};

/// Dense index of a stage instance, in declaration order.
///
/// The scheduler works exclusively on ids; names are only looked up at the
/// edges of the system (logging, status store, CLI).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(pub usize);

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Immutable dependency graph over stage instances.
///
/// Edge direction is prerequisite -> dependent: for `Decode` referencing
/// `Preprocess` through `preprocess_task` the graph holds
/// `Preprocess -> Decode`.
#[derive(Debug, Clone)]
pub struct DagGraph {
    names: Vec<StageName>,
    index: HashMap<StageName, StageId>,
    /// Direct prerequisites, deduplicated, in declaration order.
    deps: Vec<Vec<StageId>>,
    /// Direct dependents, deduplicated, in declaration order.
    dependents: Vec<Vec<StageId>>,
    topo_order: Vec<StageId>,
}

impl DagGraph {
    /// Build the graph from a resolved config, failing with one
    /// [`ConfigError::CyclicDependency`] per cycle found.
    pub fn build(cfg: &PipelineConfig) -> Result<Self, ConfigErrors> {
        let names: Vec<StageName> = cfg.stages().iter().map(|s| s.name.clone()).collect();
        let index: HashMap<StageName, StageId> = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), StageId(i)))
            .collect();

        let mut graph: DiGraphMap<usize, ()> = DiGraphMap::new();
        for i in 0..names.len() {
            graph.add_node(i);
        }

        let mut deps = vec![Vec::new(); names.len()];
        let mut dependents = vec![Vec::new(); names.len()];

        for edge in cfg.edges() {
            // Edges only ever name declared instances after resolution.
            let (Some(&from), Some(&to)) = (index.get(&edge.from), index.get(&edge.to)) else {
                continue;
            };
            graph.add_edge(from.0, to.0, ());
            if !deps[to.0].contains(&from) {
                deps[to.0].push(from);
            }
            if !dependents[from.0].contains(&to) {
                dependents[from.0].push(to);
            }
        }

        for list in deps.iter_mut().chain(dependents.iter_mut()) {
            list.sort();
        }

        let cycles = find_cycles(&graph, &names);
        if !cycles.is_empty() {
            return Err(ConfigErrors(cycles));
        }

        let topo_order = toposort(&graph, None)
            .map_err(|cycle| {
                ConfigErrors(vec![ConfigError::CyclicDependency {
                    stages: vec![names[cycle.node_id()].clone()],
                }])
            })?
            .into_iter()
            .map(StageId)
            .collect();

        Ok(Self {
            names,
            index,
            deps,
            dependents,
            topo_order,
        })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// All stage ids in declaration order.
    pub fn ids(&self) -> impl Iterator<Item = StageId> + '_ {
        (0..self.names.len()).map(StageId)
    }

    pub fn id_of(&self, name: &str) -> Option<StageId> {
        self.index.get(name).copied()
    }

    pub fn name_of(&self, id: StageId) -> &str {
        &self.names[id.0]
    }

    /// Direct prerequisites of a stage.
    pub fn dependencies_of(&self, id: StageId) -> &[StageId] {
        self.deps.get(id.0).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Direct dependents of a stage.
    pub fn dependents_of(&self, id: StageId) -> &[StageId] {
        self.dependents.get(id.0).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every stage reachable downstream of `id`, excluding `id` itself.
    pub fn transitive_dependents(&self, id: StageId) -> Vec<StageId> {
        let mut seen = vec![false; self.names.len()];
        let mut queue: VecDeque<StageId> = self.dependents_of(id).iter().copied().collect();
        let mut out = Vec::new();

        while let Some(next) = queue.pop_front() {
            if std::mem::replace(&mut seen[next.0], true) {
                continue;
            }
            out.push(next);
            queue.extend(self.dependents_of(next).iter().copied());
        }

        out.sort();
        out
    }

    /// A topological order. Only a scheduling hint: actual start times
    /// follow live readiness.
    pub fn topological_order(&self) -> &[StageId] {
        &self.topo_order
    }

    /// Name-based convenience over [`Self::dependencies_of`].
    pub fn dependency_names(&self, name: &str) -> Vec<&str> {
        self.id_of(name)
            .map(|id| {
                self.dependencies_of(id)
                    .iter()
                    .map(|d| self.name_of(*d))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Name-based convenience over [`Self::dependents_of`].
    pub fn dependent_names(&self, name: &str) -> Vec<&str> {
        self.id_of(name)
            .map(|id| {
                self.dependents_of(id)
                    .iter()
                    .map(|d| self.name_of(*d))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// One error per strongly connected component that forms a cycle
/// (including single-stage self references).
fn find_cycles(graph: &DiGraphMap<usize, ()>, names: &[StageName]) -> Vec<ConfigError> {
    let mut errors: Vec<ConfigError> = tarjan_scc(graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .map(|mut scc| {
            scc.sort_unstable();
            ConfigError::CyclicDependency {
                stages: scc.into_iter().map(|i| names[i].clone()).collect(),
            }
        })
        .collect();
    errors.sort_by(|a, b| format!("{a}").cmp(&format!("{b}")));
    errors
}
