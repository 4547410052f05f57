//! Key layout of the namespace the routing layer reads.
//!
//! Two layouts are supported and must not be mixed within one namespace:
//!
//! ```text
//! Json:   /subproxies/<name>        = {"container":"<name>","domain_names":"<declaration>"}
//! Hosts:  /subproxies/<name>/hosts  = <declaration>
//! ```

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

/// Namespace validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NamespaceError {
    #[error("namespace must start with '/': {0:?}")]
    NotAbsolute(String),

    #[error("namespace must not be the store root")]
    Root,
}

/// Key prefix under which every entry of this system lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace(String);

impl Namespace {
    /// Validate and normalize a namespace (trailing separators are dropped).
    pub fn new(raw: &str) -> Result<Self, NamespaceError> {
        if !raw.starts_with('/') {
            return Err(NamespaceError::NotAbsolute(raw.to_string()));
        }

        let trimmed = raw.trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(NamespaceError::Root);
        }

        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key of the immediate child for `name`.
    pub fn child_key(&self, name: &str) -> String {
        format!("{}/{}", self.0, name)
    }

    /// Name of an immediate child key, or `None` if `key` is not one.
    pub fn child_name<'a>(&self, key: &'a str) -> Option<&'a str> {
        let rest = key.strip_prefix(self.0.as_str())?.strip_prefix('/')?;
        if rest.is_empty() || rest.contains('/') {
            return None;
        }
        Some(rest)
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self(crate::DEFAULT_NAMESPACE.to_string())
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a desired entry is encoded in the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EntryLayout {
    /// One JSON object per unit at `<namespace>/<name>`.
    #[default]
    Json,

    /// One scalar per field under the `<namespace>/<name>/` directory.
    Hosts,
}

impl EntryLayout {
    /// Field name used by the `Hosts` layout.
    pub const HOSTS_FIELD: &'static str = "hosts";

    /// Whether a unit's entry is a directory in the store.
    pub fn is_nested(&self) -> bool {
        matches!(self, Self::Hosts)
    }

    /// Key a unit's value is written to.
    pub fn key_for(&self, namespace: &Namespace, name: &str) -> String {
        match self {
            Self::Json => namespace.child_key(name),
            Self::Hosts => format!("{}/{}", namespace.child_key(name), Self::HOSTS_FIELD),
        }
    }

    /// Encode a unit's routing declaration.
    pub fn value_for(&self, name: &str, declaration: &str) -> String {
        match self {
            Self::Json => serde_json::json!({
                "container": name,
                "domain_names": declaration,
            })
            .to_string(),
            Self::Hosts => declaration.to_string(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Hosts => "hosts",
        }
    }
}

impl FromStr for EntryLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "hosts" => Ok(Self::Hosts),
            other => Err(format!("unknown layout {other:?} (expected json or hosts)")),
        }
    }
}

impl fmt::Display for EntryLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node returned by a recursive listing of the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct StoreNode {
    pub key: String,

    #[serde(default)]
    pub value: Option<String>,

    #[serde(default)]
    pub dir: bool,

    #[serde(default)]
    pub nodes: Vec<StoreNode>,
}

impl StoreNode {
    /// A leaf node holding a value.
    pub fn leaf(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            dir: false,
            nodes: Vec::new(),
        }
    }

    /// A directory node with children.
    pub fn directory(key: impl Into<String>, nodes: Vec<StoreNode>) -> Self {
        Self {
            key: key.into(),
            value: None,
            dir: true,
            nodes,
        }
    }
}

/// One child of the namespace as currently stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    /// Name derived from the child key.
    pub name: String,

    /// Key of the namespace child (not of the nested field).
    pub key: String,

    /// Value as read for the active layout; `None` if absent or unreadable.
    pub value: Option<String>,

    /// Whether the child is a directory.
    pub is_dir: bool,
}

impl StoredEntry {
    /// Decode the namespace's immediate children for the given layout.
    ///
    /// Children written by another layout, or by an earlier crashed run, are
    /// kept with `value: None` so they are either rewritten or cleaned up.
    pub fn decode(namespace: &Namespace, layout: EntryLayout, children: &[StoreNode]) -> Vec<Self> {
        children
            .iter()
            .filter_map(|child| {
                let name = namespace.child_name(&child.key)?;
                let value = match (layout, child.dir) {
                    (EntryLayout::Json, false) => child.value.clone(),
                    (EntryLayout::Hosts, true) => {
                        let field_key = layout.key_for(namespace, name);
                        child
                            .nodes
                            .iter()
                            .find(|node| !node.dir && node.key == field_key)
                            .and_then(|node| node.value.clone())
                    }
                    _ => None,
                };

                Some(Self {
                    name: name.to_string(),
                    key: child.key.clone(),
                    value,
                    is_dir: child.dir,
                })
            })
            .collect()
    }
}
