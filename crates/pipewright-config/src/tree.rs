//! Immutable, traversable pipeline tree.
//!
//! Nodes live in a pre-order arena: the root sits at index 0 and every
//! subtree occupies a contiguous range, so "next node" is `index + 1` and
//! skipping a subtree jumps to the end of its range. Parallel branches are
//! flattened one after another in declaration order.

use std::collections::{BTreeSet, HashMap};

use crate::node::{Node, NodeDef, NodeKind};
use crate::{ConfigError, ConfigResult, NodePath, yml};

#[derive(Debug, Clone)]
pub struct NodeTree {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
}

impl NodeTree {
    /// Build a tree from a parsed root definition.
    pub fn create(root: NodeDef) -> ConfigResult<Self> {
        if root.kind != NodeKind::Flow {
            return Err(ConfigError::InvalidValue {
                field: root.name,
                message: "the root node must be a flow".to_string(),
            });
        }
        if root.children.is_empty() {
            return Err(ConfigError::MissingField("steps".to_string()));
        }

        let mut tree = Self {
            nodes: Vec::new(),
            index: HashMap::new(),
        };
        let path = NodePath::root(&root.name)?;
        tree.insert(root, path, None, false)?;
        Ok(tree)
    }

    /// Parse `yaml` and build its tree rooted at `flow_name`.
    pub fn from_yaml(flow_name: &str, yaml: &str) -> ConfigResult<Self> {
        Self::create(yml::parse(flow_name, yaml)?)
    }

    fn insert(
        &mut self,
        def: NodeDef,
        path: NodePath,
        parent: Option<usize>,
        inherited_final: bool,
    ) -> ConfigResult<usize> {
        let key = path.to_string();
        if self.index.contains_key(&key) {
            return Err(ConfigError::Duplicate(format!("node path '{key}'")));
        }
        if def.attrs.plugin.is_some() && !def.children.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: key,
                message: "a node with children cannot use a plugin".to_string(),
            });
        }

        let idx = self.nodes.len();
        let mut attrs = def.attrs;
        attrs.is_final |= inherited_final;
        let is_final = attrs.is_final;

        self.nodes.push(Node {
            name: def.name,
            path: path.clone(),
            kind: def.kind,
            attrs,
            index: idx,
            parent,
            children: Vec::new(),
            end: idx + 1,
        });
        self.index.insert(key, idx);

        for child in def.children {
            let child_path = path.child(&child.name)?;
            let child_idx = self.insert(child, child_path, Some(idx), is_final)?;
            self.nodes[idx].children.push(child_idx);
        }
        self.nodes[idx].end = self.nodes.len();

        Ok(idx)
    }

    pub fn root(&self) -> &Node {
        &self.nodes[0]
    }

    /// Every node except the root, in traversal order.
    pub fn steps(&self) -> &[Node] {
        &self.nodes[1..]
    }

    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Exact lookup; fails with [`ConfigError::NotFound`].
    pub fn get(&self, path: &str) -> ConfigResult<&Node> {
        self.index
            .get(path)
            .map(|&i| &self.nodes[i])
            .ok_or_else(|| ConfigError::NotFound(path.to_string()))
    }

    /// The node after `path` in traversal order. For the root this is the
    /// first step, for a group its first child.
    pub fn next(&self, path: &str) -> ConfigResult<Option<&Node>> {
        let node = self.get(path)?;
        Ok(self.nodes.get(node.index + 1))
    }

    /// The first node after `path`'s whole subtree.
    pub fn next_root_step(&self, path: &str) -> ConfigResult<Option<&Node>> {
        let node = self.get(path)?;
        Ok(self.nodes.get(node.end))
    }

    /// The first node after `path` marked final (directly or through an
    /// ancestor).
    pub fn next_final(&self, path: &str) -> ConfigResult<Option<&Node>> {
        let node = self.get(path)?;
        Ok(self.nodes[node.index + 1..].iter().find(|n| n.is_final()))
    }

    /// Whether `path` is the first leaf step, the one whose start time
    /// becomes the job's start time.
    pub fn is_first(&self, path: &str) -> bool {
        self.steps()
            .iter()
            .find(|n| !n.has_children())
            .is_some_and(|n| n.path_str() == path)
    }

    pub fn parent(&self, node: &Node) -> Option<&Node> {
        node.parent.map(|i| &self.nodes[i])
    }

    pub fn children<'a>(&'a self, node: &'a Node) -> impl Iterator<Item = &'a Node> + 'a {
        node.children.iter().map(move |&i| &self.nodes[i])
    }

    /// All nodes below `node`, in traversal order.
    pub fn descendants(&self, node: &Node) -> &[Node] {
        &self.nodes[node.index + 1..node.end]
    }

    /// `node` and its ancestors, root first.
    pub fn lineage<'a>(&'a self, node: &'a Node) -> Vec<&'a Node> {
        let mut lineage = vec![node];
        let mut cursor = node.parent;
        while let Some(i) = cursor {
            lineage.push(&self.nodes[i]);
            cursor = self.nodes[i].parent;
        }
        lineage.reverse();
        lineage
    }

    pub fn prev_sibling(&self, node: &Node) -> Option<&Node> {
        let siblings = &self.parent(node)?.children;
        let pos = siblings.iter().position(|&i| i == node.index)?;
        pos.checked_sub(1).map(|p| &self.nodes[siblings[p]])
    }

    pub fn next_sibling(&self, node: &Node) -> Option<&Node> {
        let siblings = &self.parent(node)?.children;
        let pos = siblings.iter().position(|&i| i == node.index)?;
        siblings.get(pos + 1).map(|&i| &self.nodes[i])
    }

    /// Names of all plugins referenced by the pipeline.
    pub fn plugins(&self) -> BTreeSet<&str> {
        self.nodes
            .iter()
            .filter_map(|n| n.attrs.plugin.as_deref())
            .collect()
    }
}
