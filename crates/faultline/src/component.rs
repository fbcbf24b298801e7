//! Component Registry
//!
//! Hierarchical dotted-path namespace of error producers ("ui.editor.toolbar").
//! Registration is explicit but optional: unregistered paths resolve to an
//! anonymous leaf so submission never fails on a missing registration.
//! Many readers, rare writers: the map sits behind a RwLock.

use crate::error::ComponentError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

/// Path separator for component hierarchies
pub const SEPARATOR: char = '.';

/// A registered producer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentNode {
    /// Full dotted path
    pub name: String,
    /// Full dotted path of the parent, None for top-level components
    pub parent_name: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// False for anonymous leaves synthesized on resolve
    #[serde(default)]
    pub registered: bool,
}

impl ComponentNode {
    fn anonymous(path: &str) -> Self {
        Self {
            name: path.to_string(),
            parent_name: parent_of(path).map(str::to_string),
            metadata: BTreeMap::new(),
            registered: false,
        }
    }
}

/// Validate a dotted component path
pub fn validate_path(path: &str) -> Result<(), ComponentError> {
    if path.is_empty() {
        return Err(ComponentError::Empty);
    }
    if let Some(position) = path.split(SEPARATOR).position(str::is_empty) {
        return Err(ComponentError::EmptySegment {
            path: path.to_string(),
            position,
        });
    }
    Ok(())
}

/// Parent path of `path`, None for a top-level segment
pub fn parent_of(path: &str) -> Option<&str> {
    path.rfind(SEPARATOR).map(|idx| &path[..idx])
}

/// True if `candidate` equals `ancestor` or sits below it.
///
/// Segment-wise: "ui.editor" is an ancestor of "ui.editor.toolbar" but not of
/// "ui.editorial". The empty ancestor is the root and matches everything.
pub fn is_descendant_or_equal(candidate: &str, ancestor: &str) -> bool {
    if ancestor.is_empty() {
        return true;
    }
    match candidate.strip_prefix(ancestor) {
        Some("") => true,
        Some(rest) => rest.starts_with(SEPARATOR),
        None => false,
    }
}

/// Process-wide registry of components, keyed by full path
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    nodes: RwLock<HashMap<String, ComponentNode>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component. Missing ancestors are created without metadata;
    /// re-registering replaces the metadata of an existing node.
    pub fn register(
        &self,
        path: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<(), ComponentError> {
        validate_path(path)?;

        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());

        let mut ancestor = parent_of(path);
        while let Some(p) = ancestor {
            nodes.entry(p.to_string()).or_insert_with(|| ComponentNode {
                registered: true,
                ..ComponentNode::anonymous(p)
            });
            ancestor = parent_of(p);
        }

        nodes.insert(
            path.to_string(),
            ComponentNode {
                name: path.to_string(),
                parent_name: parent_of(path).map(str::to_string),
                metadata,
                registered: true,
            },
        );
        Ok(())
    }

    /// Look up a registered component
    pub fn resolve(&self, path: &str) -> Option<ComponentNode> {
        self.nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned()
    }

    /// Resolve for the submission path: registered node, anonymous leaf for a
    /// well-formed unknown path, or Err for a malformed one.
    pub fn resolve_or_anonymous(&self, path: &str) -> Result<ComponentNode, ComponentError> {
        if path.is_empty() {
            return Ok(ComponentNode::anonymous(""));
        }
        if let Some(node) = self.resolve(path) {
            return Ok(node);
        }
        validate_path(path)?;
        Ok(ComponentNode::anonymous(path))
    }

    /// Direct children of `path` (registered nodes only), sorted by name
    pub fn children(&self, path: &str) -> Vec<ComponentNode> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        let mut children: Vec<ComponentNode> = nodes
            .values()
            .filter(|n| match &n.parent_name {
                Some(parent) => parent == path,
                None => path.is_empty(),
            })
            .cloned()
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        children
    }

    /// All registered paths, sorted
    pub fn paths(&self) -> Vec<String> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        let mut paths: Vec<String> = nodes.keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn len(&self) -> usize {
        self.nodes.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_path() {
        assert!(validate_path("ui.editor").is_ok());
        assert_eq!(validate_path(""), Err(ComponentError::Empty));
        assert!(matches!(
            validate_path("ui..editor"),
            Err(ComponentError::EmptySegment { position: 1, .. })
        ));
        assert!(matches!(
            validate_path(".ui"),
            Err(ComponentError::EmptySegment { position: 0, .. })
        ));
        // Only empty segments are malformed
        assert!(validate_path("ui.text editor").is_ok());
    }

    #[test]
    fn test_descendant_or_equal() {
        assert!(is_descendant_or_equal("ui.editor", "ui.editor"));
        assert!(is_descendant_or_equal("ui.editor.toolbar", "ui.editor"));
        assert!(!is_descendant_or_equal("ui.binder", "ui.editor"));
        assert!(!is_descendant_or_equal("ui.editorial", "ui.editor"));
        assert!(!is_descendant_or_equal("ui", "ui.editor"));
        assert!(is_descendant_or_equal("anything", ""));
    }

    #[test]
    fn test_register_creates_ancestors() {
        let registry = ComponentRegistry::new();
        let mut meta = BTreeMap::new();
        meta.insert("owner".to_string(), "editor-team".to_string());
        registry.register("ui.editor.toolbar", meta).unwrap();

        assert_eq!(registry.len(), 3);
        let toolbar = registry.resolve("ui.editor.toolbar").unwrap();
        assert_eq!(toolbar.parent_name.as_deref(), Some("ui.editor"));
        assert_eq!(toolbar.metadata.get("owner").map(String::as_str), Some("editor-team"));

        let ui = registry.resolve("ui").unwrap();
        assert_eq!(ui.parent_name, None);
    }

    #[test]
    fn test_register_rejects_malformed() {
        let registry = ComponentRegistry::new();
        assert!(registry.register("ui..x", BTreeMap::new()).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unregistered_resolves_anonymous() {
        let registry = ComponentRegistry::new();
        let node = registry.resolve_or_anonymous("ai.client").unwrap();
        assert!(!node.registered);
        assert_eq!(node.parent_name.as_deref(), Some("ai"));

        let root = registry.resolve_or_anonymous("").unwrap();
        assert_eq!(root.name, "");

        assert!(registry.resolve_or_anonymous("ai..client").is_err());
    }

    #[test]
    fn test_children() {
        let registry = ComponentRegistry::new();
        registry.register("ui.editor", BTreeMap::new()).unwrap();
        registry.register("ui.binder", BTreeMap::new()).unwrap();
        registry.register("ai", BTreeMap::new()).unwrap();

        let names: Vec<String> = registry.children("ui").into_iter().map(|n| n.name).collect();
        assert_eq!(names, vec!["ui.binder", "ui.editor"]);

        let roots: Vec<String> = registry.children("").into_iter().map(|n| n.name).collect();
        assert_eq!(roots, vec!["ai", "ui"]);
    }

    #[test]
    fn test_concurrent_register_and_resolve() {
        let registry = std::sync::Arc::new(ComponentRegistry::new());
        std::thread::scope(|s| {
            for t in 0..4 {
                let registry = registry.clone();
                s.spawn(move || {
                    for i in 0..50 {
                        let path = format!("worker{}.job{}", t, i);
                        registry.register(&path, BTreeMap::new()).unwrap();
                        assert!(registry.resolve(&path).is_some());
                    }
                });
            }
        });
        // 4 parents + 200 leaves
        assert_eq!(registry.len(), 204);
    }
}
