//! The loaded-module tree produced by resolution.
//!
//! One node per resolved package, carrying the modules bound for that
//! package and the child nodes for its dependencies. Nodes are immutable
//! once returned; a package referenced from several parents materializes
//! as an independent node per reference.

use crate::host::LoadedModule;
use semver::Version;
use serde::Serialize;
use std::collections::HashSet;

#[derive(Debug, Clone, Serialize)]
pub struct ModuleTree {
    pub id: String,
    pub version: Version,
    /// False for nodes wrapping modules the host already had bound before
    /// this resolution (the resolver does not own those).
    pub managed: bool,
    pub modules: Vec<LoadedModule>,
    pub children: Vec<ModuleTree>,
}

impl ModuleTree {
    /// A leaf wrapping a module that was already bound in the host.
    pub fn unmanaged_leaf(module: LoadedModule) -> Self {
        ModuleTree {
            id: module.name.clone(),
            version: module.version.clone(),
            managed: false,
            modules: vec![module],
            children: Vec::new(),
        }
    }

    /// All modules reachable from this node, deduplicated by exact
    /// (name, version) identity. Order is depth-first, own modules before
    /// children, matching resolution order.
    pub fn flatten(&self) -> Vec<&LoadedModule> {
        fn inner<'t>(
            node: &'t ModuleTree,
            seen: &mut HashSet<(&'t str, &'t Version)>,
            out: &mut Vec<&'t LoadedModule>,
        ) {
            for module in &node.modules {
                if seen.insert((module.name.as_str(), &module.version)) {
                    out.push(module);
                }
            }
            for child in &node.children {
                inner(child, seen, out);
            }
        }

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        inner(self, &mut seen, &mut out);
        out
    }

    /// Depth-first traversal; the callback receives each node and its depth.
    pub fn walk(&self, visit: &mut impl FnMut(&ModuleTree, usize)) {
        fn inner(node: &ModuleTree, depth: usize, visit: &mut impl FnMut(&ModuleTree, usize)) {
            visit(node, depth);
            for child in &node.children {
                inner(child, depth + 1, visit);
            }
        }
        inner(self, 0, visit);
    }

    /// Number of nodes in the tree, this one included.
    pub fn node_count(&self) -> usize {
        let mut count = 0;
        self.walk(&mut |_, _| count += 1);
        count
    }

    /// Find a reachable module by exact name, and optionally exact version.
    pub fn find_module(&self, name: &str, version: Option<&Version>) -> Option<&LoadedModule> {
        self.flatten()
            .into_iter()
            .find(|m| m.name == name && version.is_none_or(|v| &m.version == v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(name: &str, version: &str) -> LoadedModule {
        LoadedModule {
            name: name.to_string(),
            version: version.parse().unwrap(),
        }
    }

    fn node(id: &str, version: &str, modules: Vec<LoadedModule>, children: Vec<ModuleTree>) -> ModuleTree {
        ModuleTree {
            id: id.to_string(),
            version: version.parse().unwrap(),
            managed: true,
            modules,
            children,
        }
    }

    #[test]
    fn test_flatten_dedups_by_exact_identity() {
        // The same package materialized under two parents: one module handle
        // per appearance, equal identity.
        let shared = node("base", "1.0.0", vec![module("base", "1.0.0")], vec![]);
        let tree = node(
            "app",
            "2.0.0",
            vec![module("app", "2.0.0")],
            vec![
                node("left", "1.0.0", vec![module("left", "1.0.0")], vec![shared.clone()]),
                node("right", "1.0.0", vec![module("right", "1.0.0")], vec![shared]),
            ],
        );

        let flat = tree.flatten();
        let names: Vec<_> = flat.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["app", "left", "base", "right"]);
    }

    #[test]
    fn test_flatten_keeps_distinct_versions() {
        // Dedup is exact identity, not range compatibility: two versions of
        // the same name both survive.
        let tree = node(
            "app",
            "1.0.0",
            vec![],
            vec![
                node("base", "1.0.0", vec![module("base", "1.0.0")], vec![]),
                node("base", "2.0.0", vec![module("base", "2.0.0")], vec![]),
            ],
        );
        assert_eq!(tree.flatten().len(), 2);
    }

    #[test]
    fn test_walk_depth() {
        let tree = node(
            "a",
            "1.0.0",
            vec![],
            vec![node("b", "1.0.0", vec![], vec![node("c", "1.0.0", vec![], vec![])])],
        );
        let mut depths = Vec::new();
        tree.walk(&mut |n, d| depths.push((n.id.clone(), d)));
        assert_eq!(
            depths,
            vec![
                ("a".to_string(), 0),
                ("b".to_string(), 1),
                ("c".to_string(), 2)
            ]
        );
    }

    #[test]
    fn test_find_module() {
        let tree = node(
            "app",
            "1.0.0",
            vec![module("app", "1.0.0")],
            vec![node("base", "1.5.0", vec![module("base", "1.5.0")], vec![])],
        );
        assert!(tree.find_module("base", None).is_some());
        assert!(tree.find_module("base", Some(&"1.5.0".parse().unwrap())).is_some());
        assert!(tree.find_module("base", Some(&"1.0.0".parse().unwrap())).is_none());
        assert!(tree.find_module("missing", None).is_none());
    }

    #[test]
    fn test_unmanaged_leaf() {
        let leaf = ModuleTree::unmanaged_leaf(module("ext", "1.7.0"));
        assert!(!leaf.managed);
        assert_eq!(leaf.id, "ext");
        assert_eq!(leaf.node_count(), 1);
    }
}
