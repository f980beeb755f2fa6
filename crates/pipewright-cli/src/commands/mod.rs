//! CLI command implementations.

pub mod run;

use anyhow::{Context, Result};
use pipewright_config::NodeTree;
use pipewright_scheduler::condition;
use std::path::Path;

/// Flow name given on the command line, else the file name without its
/// leading dot and extension.
pub fn flow_name(path: &Path, name: Option<&str>) -> String {
    if let Some(name) = name {
        return name.to_string();
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().trim_start_matches('.').replace('.', "-"))
        .unwrap_or_default();
    if stem.is_empty() { "flow".to_string() } else { stem }
}

pub fn load_tree(path: &Path, name: Option<&str>) -> Result<(NodeTree, String)> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("unable to read {}", path.display()))?;
    let tree = NodeTree::from_yaml(&flow_name(path, name), &content)?;
    Ok((tree, content))
}

pub fn validate(path: &Path, name: Option<&str>) -> Result<()> {
    let tree = match load_tree(path, name) {
        Ok((tree, _)) => tree,
        Err(e) => {
            println!("Configuration error: {e:#}");
            std::process::exit(1);
        }
    };

    let mut invalid = 0;
    for node in std::iter::once(tree.root()).chain(tree.steps()) {
        let mut notes = Vec::new();
        if let Some(plugin) = &node.attrs.plugin {
            notes.push(format!("plugin={plugin}"));
        }
        if node.is_final() {
            notes.push("final".to_string());
        }
        if node.attrs.allow_failure == Some(true) {
            notes.push("allow_failure".to_string());
        }
        if let Some(cond) = &node.attrs.condition {
            match condition::verify(cond) {
                Ok(()) => notes.push(format!("if {cond}")),
                Err(e) => {
                    invalid += 1;
                    notes.push(format!("INVALID CONDITION: {e}"));
                }
            }
        }

        let indent = "  ".repeat(node.path.depth().saturating_sub(1));
        if notes.is_empty() {
            println!("{indent}{}", node.name);
        } else {
            println!("{indent}{} ({})", node.name, notes.join(", "));
        }
    }

    if invalid > 0 {
        println!("Configuration error: {invalid} invalid condition(s)");
        std::process::exit(1);
    }
    println!("Configuration is valid");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_name() {
        assert_eq!(flow_name(Path::new("ci/.pipewright.yml"), None), "pipewright");
        assert_eq!(flow_name(Path::new("release.v2.yaml"), None), "release-v2");
        assert_eq!(flow_name(Path::new(".yml"), Some("demo")), "demo");
        assert_eq!(flow_name(Path::new("/"), None), "flow");
    }
}
