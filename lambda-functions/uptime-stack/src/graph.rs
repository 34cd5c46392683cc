use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::StackError;

/// Resources of the stack. Declaration order breaks ties in
/// [`ResourceGraph::topological_order`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceNode {
    Identity,
    PolicyDocument,
    LogSink,
    PolicyAttachment,
    DeployedUnit,
}

impl fmt::Display for ResourceNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identity => write!(f, "identity"),
            Self::PolicyDocument => write!(f, "policy_document"),
            Self::LogSink => write!(f, "log_sink"),
            Self::PolicyAttachment => write!(f, "policy_attachment"),
            Self::DeployedUnit => write!(f, "deployed_unit"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceGraph {
    // node -> nodes it depends on
    dependencies: BTreeMap<ResourceNode, BTreeSet<ResourceNode>>,
}

impl ResourceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// The uptime stack: the unit may only be created once its identity is
    /// authorized and its log sink exists.
    pub fn stack() -> Self {
        let mut graph = Self::new();
        graph.add_dependency(ResourceNode::PolicyAttachment, ResourceNode::Identity);
        graph.add_dependency(ResourceNode::PolicyAttachment, ResourceNode::PolicyDocument);
        graph.add_dependency(ResourceNode::DeployedUnit, ResourceNode::Identity);
        graph.add_dependency(ResourceNode::DeployedUnit, ResourceNode::PolicyAttachment);
        graph.add_dependency(ResourceNode::DeployedUnit, ResourceNode::LogSink);
        graph
    }

    pub fn add_node(&mut self, node: ResourceNode) {
        self.dependencies.entry(node).or_default();
    }

    pub fn add_dependency(&mut self, node: ResourceNode, depends_on: ResourceNode) {
        self.add_node(depends_on);
        self.dependencies.entry(node).or_default().insert(depends_on);
    }

    pub fn dependencies_of(&self, node: ResourceNode) -> BTreeSet<ResourceNode> {
        self.dependencies.get(&node).cloned().unwrap_or_default()
    }

    pub fn nodes(&self) -> impl Iterator<Item = ResourceNode> + '_ {
        self.dependencies.keys().copied()
    }

    /// Kahn's algorithm over an ordered ready set, so the same graph always
    /// yields the same order.
    pub fn topological_order(&self) -> Result<Vec<ResourceNode>, StackError> {
        let mut remaining: BTreeMap<ResourceNode, usize> = self
            .dependencies
            .iter()
            .map(|(node, deps)| (*node, deps.len()))
            .collect();

        let mut ready: BTreeSet<ResourceNode> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(node, _)| *node)
            .collect();

        let mut order = Vec::with_capacity(remaining.len());
        while let Some(node) = ready.pop_first() {
            remaining.remove(&node);
            order.push(node);

            for (dependent, deps) in &self.dependencies {
                if !deps.contains(&node) {
                    continue;
                }
                if let Some(count) = remaining.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(*dependent);
                    }
                }
            }
        }

        if !remaining.is_empty() {
            return Err(StackError::Cycle(remaining.into_keys().collect()));
        }
        Ok(order)
    }
}
