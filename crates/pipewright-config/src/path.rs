//! Slash-separated node paths, e.g. `flow/build/unit-test`.

use std::fmt;

use crate::{ConfigError, ConfigResult};

pub const SEPARATOR: char = '/';
pub const MAX_DEPTH: usize = 10;
pub const MAX_NAME_LEN: usize = 100;

const RESERVED_CHARS: [char; 4] = ['*', ';', '.', '/'];

/// Check a single node name.
pub fn validate_name(name: &str) -> ConfigResult<()> {
    let invalid = |reason: &str| ConfigError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.trim().is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(invalid("name is longer than 100 characters"));
    }
    if let Some(c) = name.chars().find(|c| RESERVED_CHARS.contains(c)) {
        return Err(invalid(&format!("'{c}' is reserved")));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodePath {
    segments: Vec<String>,
}

impl NodePath {
    pub fn root(name: &str) -> ConfigResult<Self> {
        validate_name(name)?;
        Ok(Self {
            segments: vec![name.to_string()],
        })
    }

    pub fn parse(path: &str) -> ConfigResult<Self> {
        let mut segments = Vec::new();
        for segment in path.split(SEPARATOR).filter(|s| !s.is_empty()) {
            validate_name(segment)?;
            segments.push(segment.to_string());
        }
        if segments.is_empty() {
            return Err(ConfigError::InvalidName {
                name: path.to_string(),
                reason: "path is empty".to_string(),
            });
        }
        if segments.len() > MAX_DEPTH {
            return Err(ConfigError::DepthExceeded(path.to_string()));
        }
        Ok(Self { segments })
    }

    pub fn child(&self, name: &str) -> ConfigResult<Self> {
        validate_name(name)?;
        if self.segments.len() >= MAX_DEPTH {
            return Err(ConfigError::DepthExceeded(format!("{self}/{name}")));
        }
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Ok(Self { segments })
    }

    pub fn parent(&self) -> Option<Self> {
        if self.segments.len() <= 1 {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn name(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or_default()
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    pub fn is_root(&self) -> bool {
        self.segments.len() == 1
    }

    /// Whether `self` is `other` or lies underneath it.
    pub fn starts_with(&self, other: &NodePath) -> bool {
        self.segments.starts_with(&other.segments)
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

impl std::str::FromStr for NodePath {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let path = NodePath::parse("flow/build/test").unwrap();
        assert_eq!(path.to_string(), "flow/build/test");
        assert_eq!(path.name(), "test");
        assert_eq!(path.parent().unwrap().to_string(), "flow/build");
        assert_eq!(path.depth(), 3);
    }

    #[test]
    fn test_reserved_characters_rejected() {
        for name in ["a*b", "a;b", "a.b", ""] {
            assert!(validate_name(name).is_err(), "{name} should be rejected");
        }
        assert!(validate_name(&"x".repeat(101)).is_err());
        assert!(validate_name(&"x".repeat(100)).is_ok());
    }

    #[test]
    fn test_depth_limit() {
        let mut path = NodePath::root("flow").unwrap();
        for i in 1..MAX_DEPTH {
            path = path.child(&format!("n{i}")).unwrap();
        }
        assert!(matches!(path.child("deep"), Err(ConfigError::DepthExceeded(_))));
    }

    #[test]
    fn test_starts_with() {
        let group = NodePath::parse("flow/group").unwrap();
        assert!(NodePath::parse("flow/group/a").unwrap().starts_with(&group));
        assert!(!NodePath::parse("flow/groupie").unwrap().starts_with(&group));
    }
}
