//! Pipeline nodes.

use pipewright_core::Vars;
use pipewright_core::agent::DockerOption;

use crate::NodePath;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// The root of a pipeline.
    Flow,
    /// A step, optionally grouping nested steps.
    Step,
    /// A `parallel` section; its children are branches.
    Parallel,
    /// One named branch of a parallel section.
    Branch,
}

/// Attributes a pipeline author sets on a node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeAttrs {
    pub condition: Option<String>,
    pub envs: Vars,
    pub bash: Option<String>,
    pub plugin: Option<String>,
    /// Unset means "inherit from the plugin, else false".
    pub allow_failure: Option<bool>,
    pub exports: Vec<String>,
    pub dockers: Vec<DockerOption>,
    pub is_final: bool,
    pub timeout: Option<u32>,
}

/// Node definition as parsed, before it is placed into a [`crate::NodeTree`].
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDef {
    pub name: String,
    pub kind: NodeKind,
    pub attrs: NodeAttrs,
    pub children: Vec<NodeDef>,
}

impl NodeDef {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            attrs: NodeAttrs::default(),
            children: Vec::new(),
        }
    }
}

/// A node placed in a tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub name: String,
    pub path: NodePath,
    pub kind: NodeKind,
    pub attrs: NodeAttrs,
    pub(crate) index: usize,
    pub(crate) parent: Option<usize>,
    pub(crate) children: Vec<usize>,
    /// One past the last descendant in pre-order.
    pub(crate) end: usize,
}

impl Node {
    pub fn path_str(&self) -> String {
        self.path.to_string()
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    pub fn is_final(&self) -> bool {
        self.attrs.is_final
    }
}
