use crate::tree::{join_keys, JobTree, FILE_KEY};
use indexmap::IndexMap;
use serde_yaml::{Mapping, Value};

/// Position of a single job in the tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub path: String,
    pub keys: Vec<String>,
    pub generation: usize,
}

/// Flattened view of every job in a tree, in traversal order
///
/// Derived from a snapshot and never persisted, rebuild it whenever the tree is reloaded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobRegistry {
    jobs: IndexMap<String, RegistryEntry>,
}

impl JobRegistry {
    /// depth first traversal following the key order of the tree
    pub fn enumerate(tree: &JobTree) -> Self {
        let mut registry = Self::default();
        let mut keys = Vec::new();

        for (key, value) in tree.root() {
            if let (Some(key), Value::Mapping(node)) = (key.as_str(), value) {
                keys.push(key.to_owned());
                registry.visit(node, &mut keys);
                keys.pop();
            }
        }

        registry
    }

    fn visit(&mut self, node: &Mapping, keys: &mut Vec<String>) {
        for (key, value) in node {
            match (key.as_str(), value) {
                (Some(FILE_KEY), _) => {
                    let path = join_keys(keys);
                    self.jobs.insert(
                        path.clone(),
                        RegistryEntry {
                            path,
                            keys: keys.clone(),
                            generation: keys.len() - 1,
                        },
                    );
                }
                (Some(key), Value::Mapping(child)) => {
                    keys.push(key.to_owned());
                    self.visit(child, keys);
                    keys.pop();
                }
                _ => {}
            }
        }
    }

    pub fn get(&self, path: &str) -> Option<&RegistryEntry> {
        self.jobs.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.jobs.contains_key(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.jobs.values()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Registry of all jobs in `tree`, keyed by job path
pub fn enumerate_jobs(tree: &JobTree) -> JobRegistry {
    JobRegistry::enumerate(tree)
}

#[cfg(test)]
mod test {
    use super::*;

    const TREE: &str = r#"
python_environment: /venv
base:
  file: base.py
  a_1.0_b_1:
    file: more.py
    deep:
      file: deepest.py
  a_2.0_b_1:
    file: more.py
side:
  file: side.py
"#;

    #[test]
    fn enumerates_in_key_order() {
        let registry = enumerate_jobs(&JobTree::from_yaml(TREE).unwrap());

        let paths = registry
            .iter()
            .map(|entry| entry.path.as_str())
            .collect::<Vec<_>>();
        assert_eq!(
            paths,
            [
                "base",
                "base/a_1.0_b_1",
                "base/a_1.0_b_1/deep",
                "base/a_2.0_b_1",
                "side"
            ]
        );
    }

    #[test]
    fn generation_is_depth() {
        let registry = enumerate_jobs(&JobTree::from_yaml(TREE).unwrap());

        let deep = registry.get("base/a_1.0_b_1/deep").unwrap();
        assert_eq!(deep.generation, 2);
        assert_eq!(deep.keys, ["base", "a_1.0_b_1", "deep"]);
        assert_eq!(registry.get("side").unwrap().generation, 0);
        assert!(!registry.contains("python_environment"));
    }

    #[test]
    fn identical_trees_give_identical_registries() {
        let tree = JobTree::from_yaml(TREE).unwrap();

        assert_eq!(enumerate_jobs(&tree), enumerate_jobs(&tree.clone()));
        assert!(enumerate_jobs(&JobTree::default()).is_empty());
    }
}
