use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Scheduler id -> job path for jobs handed to a batch scheduler
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct IdentifierMap(BTreeMap<u64, String>);

impl IdentifierMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: u64) -> Option<&str> {
        self.0.get(&id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &str)> {
        self.0.iter().map(|(id, path)| (*id, path.as_str()))
    }

    /// add freshly submitted jobs, new entries win on collision
    pub fn merge<I: IntoIterator<Item = (u64, String)>>(&mut self, entries: I) {
        self.0.extend(entries);
    }

    /// Drop every entry tracked in `scope` whose job is no longer live
    ///
    /// Entries outside of `scope` belong to backends that were not queried and are kept. Returns
    /// the removed ids.
    pub fn prune(&mut self, scope: &BTreeSet<String>, live: &BTreeSet<String>) -> Vec<u64> {
        let stale = self
            .0
            .iter()
            .filter(|(_, path)| scope.contains(*path) && !live.contains(*path))
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();

        for id in stale.iter() {
            if let Some(path) = self.0.remove(id) {
                debug!(id = id, path = %path, "Job left the scheduler");
            }
        }

        stale
    }
}

impl FromIterator<(u64, String)> for IdentifierMap {
    fn from_iter<I: IntoIterator<Item = (u64, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn set(paths: &[&str]) -> BTreeSet<String> {
        paths.iter().map(|path| path.to_string()).collect()
    }

    #[test]
    fn merge_prefers_new_entries() {
        let mut map: IdentifierMap = [(1, "a".to_owned()), (2, "b".to_owned())]
            .into_iter()
            .collect();

        map.merge([(2, "c".to_owned()), (3, "d".to_owned())]);

        assert_eq!(map.get(2), Some("c"));
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn prune_only_touches_scoped_jobs() {
        let mut map: IdentifierMap = [
            (1, "gen0/a".to_owned()),
            (2, "gen0/b".to_owned()),
            (3, "other/c".to_owned()),
        ]
        .into_iter()
        .collect();

        let removed = map.prune(&set(&["gen0/a", "gen0/b"]), &set(&["gen0/b"]));

        assert_eq!(removed, [1]);
        assert_eq!(map.get(1), None);
        assert_eq!(map.get(2), Some("gen0/b"));
        assert_eq!(map.get(3), Some("other/c"));
    }

    #[test]
    fn yaml_layout_is_a_plain_mapping() {
        let map: IdentifierMap = [(4821, "base/child".to_owned())].into_iter().collect();
        let yaml = serde_yaml::to_string(&map).unwrap();

        assert_eq!(yaml, "4821: base/child\n");
        assert_eq!(serde_yaml::from_str::<IdentifierMap>(&yaml).unwrap(), map);
    }
}
