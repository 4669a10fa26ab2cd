//! Dependency graph construction and topological sorting

use crate::config::{ComposeFile, DependencyCondition, EnvFileError};
use crate::runtime::spec::ServiceSpec;
use indexmap::{IndexMap, IndexSet};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;

/// Dependency graph for services, kept in launch (topological) order
#[derive(Debug, Clone)]
pub struct ServiceGraph {
    /// Services in topological order
    services: Vec<Arc<ServiceSpec>>,
    /// Map from service name to index
    index_map: HashMap<String, usize>,
    /// Adjacency list: dependency name -> names of its direct dependents
    dependents: HashMap<String, Vec<String>>,
}

impl ServiceGraph {
    /// Build a dependency graph from a compose file
    ///
    /// An empty `selected` list means every service. Otherwise the selected
    /// services are started together with everything they transitively
    /// depend on.
    pub fn build(
        compose: &ComposeFile,
        project_dir: &Path,
        selected: &[String],
    ) -> Result<Self, GraphError> {
        let included = Self::select(compose, selected)?;

        let mut specs = Vec::with_capacity(included.len());
        for (name, config) in &compose.services {
            if included.contains(name) {
                specs.push(ServiceSpec::resolve(name, config, project_dir)?);
            }
        }

        Self::from_specs(specs)
    }

    /// Compute the selected services plus their transitive dependencies
    fn select(compose: &ComposeFile, selected: &[String]) -> Result<HashSet<String>, GraphError> {
        if selected.is_empty() {
            return Ok(compose.services.keys().cloned().collect());
        }

        let mut included = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        for name in selected {
            if !compose.services.contains_key(name) {
                return Err(GraphError::UnknownService(name.clone()));
            }
            queue.push_back(name.clone());
        }

        while let Some(name) = queue.pop_front() {
            if !included.insert(name.clone()) {
                continue;
            }
            if let Some(config) = compose.services.get(&name) {
                for (dep_name, _) in config.depends_on.entries() {
                    queue.push_back(dep_name);
                }
            }
        }

        Ok(included)
    }

    /// Build a dependency graph from already resolved services
    pub fn from_specs(specs: Vec<ServiceSpec>) -> Result<Self, GraphError> {
        let mut nodes: IndexMap<String, Arc<ServiceSpec>> = IndexMap::new();
        for spec in specs {
            if nodes.contains_key(&spec.name) {
                return Err(GraphError::DuplicateService(spec.name));
            }
            nodes.insert(spec.name.clone(), Arc::new(spec));
        }

        // Validate edges before sorting
        for (name, spec) in &nodes {
            for edge in &spec.dependencies {
                if edge.dependency == *name {
                    return Err(GraphError::SelfDependency(name.clone()));
                }
                let Some(dependency) = nodes.get(&edge.dependency) else {
                    return Err(GraphError::UnknownDependency {
                        service: name.clone(),
                        dependency: edge.dependency.clone(),
                    });
                };
                if edge.condition == DependencyCondition::ServiceHealthy
                    && dependency.probe.is_none()
                {
                    return Err(GraphError::HealthcheckRequired {
                        service: name.clone(),
                        dependency: edge.dependency.clone(),
                    });
                }
            }
        }

        let services = Self::topological_sort(&nodes)?;

        let index_map = services
            .iter()
            .enumerate()
            .map(|(i, spec)| (spec.name.clone(), i))
            .collect();

        let mut dependents: HashMap<String, Vec<String>> =
            nodes.keys().map(|name| (name.clone(), Vec::new())).collect();
        for (name, spec) in &nodes {
            let deps: IndexSet<&str> = spec
                .dependencies
                .iter()
                .map(|e| e.dependency.as_str())
                .collect();
            for dep in deps {
                if let Some(list) = dependents.get_mut(dep) {
                    list.push(name.clone());
                }
            }
        }

        Ok(Self {
            services,
            index_map,
            dependents,
        })
    }

    /// Topological sort using Kahn's algorithm
    ///
    /// Ties are broken by declaration order so the plan is deterministic.
    fn topological_sort(
        nodes: &IndexMap<String, Arc<ServiceSpec>>,
    ) -> Result<Vec<Arc<ServiceSpec>>, GraphError> {
        let mut in_degree: IndexMap<&str, usize> = IndexMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for (name, spec) in nodes {
            in_degree.entry(name.as_str()).or_insert(0);
            let deps: IndexSet<&str> = spec
                .dependencies
                .iter()
                .map(|e| e.dependency.as_str())
                .collect();
            for dep in deps {
                *in_degree.entry(name.as_str()).or_insert(0) += 1;
                dependents.entry(dep).or_default().push(name.as_str());
            }
        }

        // Start with services that have no dependencies
        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(name, _)| *name)
            .collect();

        let mut sorted: Vec<Arc<ServiceSpec>> = Vec::with_capacity(nodes.len());

        while let Some(name) = queue.pop_front() {
            if let Some(spec) = nodes.get(name) {
                sorted.push(Arc::clone(spec));
            }

            // Reduce in-degree for dependents
            for &dependent in dependents.get(name).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        // Check for cycles
        if sorted.len() != nodes.len() {
            let sorted_names: HashSet<&str> = sorted.iter().map(|s| s.name.as_str()).collect();
            let cycle: Vec<String> = nodes
                .keys()
                .filter(|name| !sorted_names.contains(name.as_str()))
                .cloned()
                .collect();

            return Err(GraphError::CyclicDependency(cycle));
        }

        Ok(sorted)
    }

    /// Number of services
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether the graph has no services
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Look up a service by name
    pub fn get(&self, name: &str) -> Option<&Arc<ServiceSpec>> {
        self.index_map.get(name).map(|&i| &self.services[i])
    }

    /// Position of a service in launch order
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index_map.get(name).copied()
    }

    /// Get services that directly depend on a given service
    pub fn dependents(&self, name: &str) -> Vec<&Arc<ServiceSpec>> {
        self.dependents
            .get(name)
            .into_iter()
            .flatten()
            .filter_map(|dependent| self.get(dependent))
            .collect()
    }

    /// All services that transitively depend on a given service
    pub fn transitive_dependents(&self, name: &str) -> Vec<String> {
        let mut seen: IndexSet<String> = IndexSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([name]);
        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents.get(current).into_iter().flatten() {
                if seen.insert(dependent.clone()) {
                    queue.push_back(dependent);
                }
            }
        }
        seen.into_iter().collect()
    }

    /// Get the launch order (reverse of shutdown order)
    pub fn launch_order(&self) -> impl Iterator<Item = &Arc<ServiceSpec>> {
        self.services.iter()
    }

    /// Get the shutdown order (reverse of launch order)
    pub fn shutdown_order(&self) -> impl Iterator<Item = &Arc<ServiceSpec>> {
        self.services.iter().rev()
    }

    /// Group services into stages; every service in a stage only depends on
    /// services of earlier stages, so a stage can launch concurrently
    pub fn stages(&self) -> Vec<Vec<&str>> {
        let mut level: HashMap<&str, usize> = HashMap::new();
        let mut stages: Vec<Vec<&str>> = Vec::new();

        for spec in &self.services {
            let stage = spec
                .dependencies
                .iter()
                .filter_map(|e| level.get(e.dependency.as_str()))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            level.insert(spec.name.as_str(), stage);
            if stages.len() <= stage {
                stages.resize_with(stage + 1, Vec::new);
            }
            stages[stage].push(spec.name.as_str());
        }

        stages
    }
}

/// Configuration faults found while building the graph; nothing is started
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("No such service: '{0}'")]
    UnknownService(String),

    #[error("Service '{0}' is defined more than once")]
    DuplicateService(String),

    #[error("Service '{service}' depends on unknown service '{dependency}'")]
    UnknownDependency { service: String, dependency: String },

    #[error("Service '{0}' depends on itself")]
    SelfDependency(String),

    #[error("Cyclic dependency detected involving services: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),

    #[error(
        "Service '{service}' waits for '{dependency}' to be healthy, but '{dependency}' has no healthcheck"
    )]
    HealthcheckRequired { service: String, dependency: String },

    #[error("Service '{service}': {source}")]
    EnvFile {
        service: String,
        #[source]
        source: EnvFileError,
    },
}
