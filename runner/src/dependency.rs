use crate::{
    registry::{JobRegistry, RegistryEntry},
    tree::{join_keys, JobStatus, JobTree, FILE_KEY},
};
use serde_yaml::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::debug;

/// Unfinished jobs `job` has to wait for
///
/// Generations form a coarse DAG: every collection holding jobs that lies strictly above the
/// collection of `job` contributes all of its direct job children that are not completed. Jobs
/// sharing the collection of `job` are its own generation and never block it.
pub fn unfinished_dependencies(
    job: &RegistryEntry,
    tree: &JobTree,
    registry: &JobRegistry,
) -> BTreeSet<String> {
    unfinished_with(job, tree, &job_collections(registry))
}

/// key paths of every collection that directly contains a job
fn job_collections(registry: &JobRegistry) -> HashSet<&[String]> {
    registry
        .iter()
        .map(|entry| &entry.keys[..entry.keys.len() - 1])
        .collect()
}

fn unfinished_with(
    job: &RegistryEntry,
    tree: &JobTree,
    collections: &HashSet<&[String]>,
) -> BTreeSet<String> {
    let mut blocking = BTreeSet::new();

    for length in 0..job.keys.len().saturating_sub(1) {
        let ancestor = &job.keys[..length];
        if !collections.contains(ancestor) {
            continue;
        }

        let Some(collection) = tree.get(ancestor) else {
            continue;
        };

        for (name, node) in collection {
            let (Some(name), Value::Mapping(node)) = (name.as_str(), node) else {
                continue;
            };
            if !node.contains_key(FILE_KEY) {
                continue;
            }

            let mut keys = ancestor.to_vec();
            keys.push(name.to_owned());

            let status = tree.job(keys.as_slice()).map(|sibling| sibling.status);
            if status != Some(JobStatus::Completed) {
                blocking.insert(join_keys(keys.as_slice()));
            }
        }
    }

    blocking
}

/// Blocking set of every job of a tree snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    dependencies: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn build(tree: &JobTree, registry: &JobRegistry) -> Self {
        let collections = job_collections(registry);

        let dependencies = registry
            .iter()
            .map(|job| (job.path.clone(), unfinished_with(job, tree, &collections)))
            .collect::<BTreeMap<_, _>>();

        for (job, blocking) in dependencies.iter().filter(|(_, set)| !set.is_empty()) {
            debug!(job = %job, blocking = ?blocking, "Job is blocked");
        }

        Self { dependencies }
    }

    pub fn unfinished(&self, path: &str) -> Option<&BTreeSet<String>> {
        self.dependencies.get(path)
    }

    /// unknown jobs are never eligible
    pub fn is_eligible(&self, path: &str) -> bool {
        self.dependencies
            .get(path)
            .map_or(false, BTreeSet::is_empty)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::registry::enumerate_jobs;

    fn blocking(tree: &str, job: &str) -> Vec<String> {
        let tree = JobTree::from_yaml(tree).unwrap();
        let registry = enumerate_jobs(&tree);

        unfinished_dependencies(registry.get(job).unwrap(), &tree, &registry)
            .into_iter()
            .collect()
    }

    #[test]
    fn completed_parent_unblocks_child() {
        let tree = r#"
gen0:
  a:
    file: a.py
    status: completed
    gen1:
      b:
        file: b.py
        status: to_submit
"#;

        assert!(blocking(tree, "gen0/a/gen1/b").is_empty());
    }

    #[test]
    fn unfinished_parent_blocks_child() {
        let tree = r#"
gen0:
  a:
    file: a.py
    status: to_submit
    gen1:
      b:
        file: b.py
"#;

        assert_eq!(blocking(tree, "gen0/a/gen1/b"), ["gen0/a"]);
        assert!(blocking(tree, "gen0/a").is_empty());
    }

    #[test]
    fn siblings_of_the_same_generation_do_not_block() {
        let tree = r#"
base:
  file: base.py
  status: completed
  x:
    file: x.py
  y:
    file: y.py
    z:
      file: z.py
      status: completed
"#;

        assert!(blocking(tree, "base/x").is_empty());
        assert_eq!(blocking(tree, "base/y/z"), ["base/x", "base/y"]);
    }

    #[test]
    fn every_shallower_generation_counts() {
        let tree = r#"
root:
  file: root.py
  status: submitted
  mid:
    file: mid.py
    status: completed
    leaf:
      file: leaf.py
"#;

        let tree = JobTree::from_yaml(tree).unwrap();
        let registry = enumerate_jobs(&tree);
        let graph = DependencyGraph::build(&tree, &registry);

        assert!(graph.is_eligible("root"));
        assert_eq!(
            graph.unfinished("root/mid").unwrap().iter().collect::<Vec<_>>(),
            ["root"]
        );
        assert_eq!(
            graph.unfinished("root/mid/leaf").unwrap().iter().collect::<Vec<_>>(),
            ["root"]
        );
        assert!(!graph.is_eligible("root/mid/leaf"));
        assert!(!graph.is_eligible("missing"));
    }
}
