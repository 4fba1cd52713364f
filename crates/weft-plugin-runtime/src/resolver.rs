//! Dependency graph and priority-aware load ordering

use crate::error::DependencyError;
use semver::Version;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use weft_plugin_api::{DependencyDescriptor, PluginMetadata};

/// A registered plugin as seen by the resolver
#[derive(Debug, Clone)]
pub struct DependencyNode {
    /// Plugin name
    pub name: String,

    /// Registered version
    pub version: Version,

    /// Load priority; higher goes first among ready plugins
    pub priority: i32,

    /// Declared dependencies
    pub dependencies: Vec<DependencyDescriptor>,

    // Insertion sequence, the final tie-breaker
    seq: u64,
}

impl DependencyNode {
    fn from_metadata(metadata: &PluginMetadata, seq: u64) -> Self {
        Self {
            name: metadata.name.clone(),
            version: metadata.version.clone(),
            priority: metadata.load_priority,
            dependencies: metadata.dependencies.clone(),
            seq,
        }
    }

    fn required(&self) -> impl Iterator<Item = &str> {
        self.dependencies
            .iter()
            .filter(|d| d.required)
            .map(|d| d.plugin_name.as_str())
    }

    fn declares(&self, plugin: &str) -> bool {
        self.dependencies.iter().any(|d| d.plugin_name == plugin)
    }
}

// Max-heap key: higher priority first, then earlier insertion.
type ReadyKey = (i32, Reverse<u64>);

/// Dependency graph over registered plugins
///
/// Edges run from a dependency to its dependents. Only required
/// dependencies constrain the load order and can fail resolution;
/// optional ones still count for [`get_dependents`].
///
/// [`get_dependents`]: DependencyResolver::get_dependents
#[derive(Debug, Clone, Default)]
pub struct DependencyResolver {
    nodes: HashMap<String, DependencyNode>,
    next_seq: u64,
}

impl DependencyResolver {
    /// Create an empty resolver
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a plugin's node
    ///
    /// Replacing keeps the node's original insertion position. No
    /// dependency validation happens here.
    pub fn add_plugin(&mut self, metadata: &PluginMetadata) {
        let seq = match self.nodes.get(&metadata.name) {
            Some(existing) => existing.seq,
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                seq
            }
        };
        self.nodes
            .insert(metadata.name.clone(), DependencyNode::from_metadata(metadata, seq));
    }

    /// Remove a plugin's node, returning whether it was present
    ///
    /// Dependents keep their declarations and will fail the next
    /// [`resolve`](Self::resolve) if the dependency was required.
    pub fn remove_plugin(&mut self, name: &str) -> bool {
        self.nodes.remove(name).is_some()
    }

    /// Drop every node
    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    /// Whether `name` is registered
    pub fn has_plugin(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Node registered under `name`
    pub fn get_node(&self, name: &str) -> Option<&DependencyNode> {
        self.nodes.get(name)
    }

    /// Number of registered plugins
    pub fn plugin_count(&self) -> usize {
        self.nodes.len()
    }

    /// Registered names in insertion order
    pub fn plugin_names(&self) -> Vec<String> {
        self.ordered_nodes()
            .into_iter()
            .map(|node| node.name.clone())
            .collect()
    }

    fn ordered_nodes(&self) -> Vec<&DependencyNode> {
        let mut nodes: Vec<&DependencyNode> = self.nodes.values().collect();
        nodes.sort_by_key(|node| node.seq);
        nodes
    }

    /// Compute a load order where every plugin follows its required dependencies
    ///
    /// Among plugins whose dependencies are all placed, the highest
    /// `load_priority` goes next; ties go to the earliest registered.
    pub fn resolve(&self) -> Result<Vec<String>, DependencyError> {
        let nodes = self.ordered_nodes();

        for node in &nodes {
            if let Some(missing) = node.required().find(|dep| !self.nodes.contains_key(*dep)) {
                return Err(DependencyError::missing(&node.name, missing));
            }
        }

        let mut in_degree: HashMap<&str, usize> = HashMap::with_capacity(nodes.len());
        let mut dependents: HashMap<&str, Vec<&DependencyNode>> = HashMap::new();

        for &node in &nodes {
            let required: HashSet<&str> = node.required().collect();
            in_degree.insert(node.name.as_str(), required.len());
            for dep in required {
                dependents.entry(dep).or_default().push(node);
            }
        }

        let mut ready: BinaryHeap<(ReadyKey, &str)> = nodes
            .iter()
            .filter(|node| in_degree[node.name.as_str()] == 0)
            .map(|node| (ready_key(node), node.name.as_str()))
            .collect();

        let mut order = Vec::with_capacity(nodes.len());
        while let Some((_, name)) = ready.pop() {
            order.push(name.to_string());

            for dependent in dependents.get(name).into_iter().flatten().copied() {
                if let Some(degree) = in_degree.get_mut(dependent.name.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push((ready_key(dependent), dependent.name.as_str()));
                    }
                }
            }
        }

        if order.len() < nodes.len() {
            let placed: HashSet<&str> = order.iter().map(String::as_str).collect();
            let stuck = nodes
                .iter()
                .filter(|node| !placed.contains(node.name.as_str()))
                .map(|node| node.name.clone())
                .collect();
            return Err(DependencyError::Cycle(stuck));
        }

        Ok(order)
    }

    /// Check a plugin's required dependencies against the registered set
    ///
    /// Fails on self-dependency, on a required dependency that is not
    /// registered, and on one whose version falls outside
    /// `[min_version, max_version)`. Optional dependencies are not checked.
    pub fn validate_metadata(&self, metadata: &PluginMetadata) -> Result<(), DependencyError> {
        if metadata.depends_on(&metadata.name) {
            return Err(DependencyError::SelfDependency(metadata.name.clone()));
        }

        for dep in metadata.required_dependencies() {
            let node = self
                .nodes
                .get(&dep.plugin_name)
                .ok_or_else(|| DependencyError::missing(&metadata.name, &dep.plugin_name))?;

            if !dep.accepts(&node.version) {
                return Err(DependencyError::VersionConstraint {
                    plugin: metadata.name.clone(),
                    dependency: dep.plugin_name.clone(),
                    required: dep.range(),
                    found: node.version.clone(),
                });
            }
        }

        Ok(())
    }

    /// Direct dependencies declared by `name`, required and optional
    pub fn get_dependencies(&self, name: &str) -> Vec<String> {
        self.nodes
            .get(name)
            .map(|node| {
                node.dependencies
                    .iter()
                    .map(|d| d.plugin_name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Registered plugins that declare `name` as a dependency
    ///
    /// Direct dependents only, in insertion order.
    pub fn get_dependents(&self, name: &str) -> Vec<String> {
        self.ordered_nodes()
            .into_iter()
            .filter(|node| node.name != name && node.declares(name))
            .map(|node| node.name.clone())
            .collect()
    }

    /// `name` plus every plugin that transitively depends on it
    pub fn dependents_closure(&self, name: &str) -> Vec<String> {
        let mut seen: HashSet<String> = HashSet::from([name.to_string()]);
        let mut closure = vec![name.to_string()];
        let mut queue = VecDeque::from([name.to_string()]);

        while let Some(current) = queue.pop_front() {
            for dependent in self.get_dependents(&current) {
                if seen.insert(dependent.clone()) {
                    closure.push(dependent.clone());
                    queue.push_back(dependent);
                }
            }
        }

        closure
    }

    /// Order a subset of plugins so dependencies precede dependents
    ///
    /// Every declared edge between members counts here, optional ones
    /// included, and ties use the same priority rule as
    /// [`resolve`](Self::resolve). Members caught in a cycle are appended
    /// in insertion order. Names that are not registered are dropped.
    pub fn order_subset(&self, names: &[String]) -> Vec<String> {
        let mut members: Vec<&DependencyNode> =
            names.iter().filter_map(|name| self.nodes.get(name)).collect();
        members.sort_by_key(|node| node.seq);
        members.dedup_by_key(|node| node.seq);

        let in_subset: HashSet<&str> = members.iter().map(|n| n.name.as_str()).collect();
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        for node in &members {
            let deps: HashSet<&str> = node
                .dependencies
                .iter()
                .map(|d| d.plugin_name.as_str())
                .filter(|dep| *dep != node.name && in_subset.contains(dep))
                .collect();
            in_degree.insert(node.name.as_str(), deps.len());
        }

        let mut ready: BinaryHeap<(ReadyKey, &str)> = members
            .iter()
            .filter(|node| in_degree[node.name.as_str()] == 0)
            .map(|node| (ready_key(node), node.name.as_str()))
            .collect();

        let mut order: Vec<String> = Vec::with_capacity(members.len());
        while let Some((_, name)) = ready.pop() {
            order.push(name.to_string());
            for node in &members {
                if node.name != name && node.declares(name) {
                    if let Some(degree) = in_degree.get_mut(node.name.as_str()) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            ready.push((ready_key(node), node.name.as_str()));
                        }
                    }
                }
            }
        }

        for node in &members {
            if !order.contains(&node.name) {
                order.push(node.name.clone());
            }
        }

        order
    }
}

fn ready_key(node: &DependencyNode) -> ReadyKey {
    (node.priority, Reverse(node.seq))
}

/// Resolve a load order for a batch of plugins in one call
///
/// Every plugin is validated before ordering, so version violations are
/// reported even when the graph itself is sound.
pub fn resolve_dependencies(plugins: &[PluginMetadata]) -> Result<Vec<String>, DependencyError> {
    let mut resolver = DependencyResolver::new();
    for metadata in plugins {
        resolver.add_plugin(metadata);
    }
    for metadata in plugins {
        resolver.validate_metadata(metadata)?;
    }
    resolver.resolve()
}
