//! Configuration for pipewright.
//!
//! Pipelines are YAML documents parsed into an immutable [`NodeTree`].
//! The engine itself is configured with KDL.

pub mod cache;
pub mod error;
pub mod node;
pub mod path;
pub mod system;
pub mod tree;
pub mod variables;
pub mod yml;

pub use cache::TreeCache;
pub use error::{ConfigError, ConfigResult};
pub use node::{Node, NodeKind};
pub use path::NodePath;
pub use system::EngineConfig;
pub use tree::NodeTree;
