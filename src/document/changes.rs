use std::collections::BTreeSet;

/// Set of dirty paths (`.`-joined attribute names and list indexes).
///
/// Marking a path whose ancestor is already present is a no-op, and marking
/// a path drops the descendants recorded so far: the ancestor covers them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    paths: BTreeSet<String>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&mut self, path: &str) {
        if path.is_empty() || self.covers(path) {
            return;
        }
        let level = format!("{path}.");
        self.paths.retain(|p| !p.starts_with(&level));
        self.paths.insert(path.to_string());
    }

    /// Whether `path` or one of its ancestors is marked.
    pub fn covers(&self, path: &str) -> bool {
        if self.paths.contains(path) {
            return true;
        }
        path.match_indices('.')
            .any(|(i, _)| self.paths.contains(&path[..i]))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.paths.contains(path)
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.paths.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ancestor_covers_descendant() {
        let mut changes = ChangeSet::new();
        changes.mark("a");
        changes.mark("a.b");
        assert_eq!(changes.iter().collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn test_marking_ancestor_drops_descendants() {
        let mut changes = ChangeSet::new();
        changes.mark("a.b");
        changes.mark("a.c.0");
        changes.mark("ab");
        changes.mark("a");
        assert_eq!(changes.iter().collect::<Vec<_>>(), vec!["a", "ab"]);
    }

    #[test]
    fn test_sibling_prefix_is_not_an_ancestor() {
        let mut changes = ChangeSet::new();
        changes.mark("tag");
        changes.mark("tags.1");
        assert!(changes.contains("tags.1"));
        assert!(!changes.covers("tagsx"));
    }

    #[test]
    fn test_clear() {
        let mut changes = ChangeSet::new();
        changes.mark("x");
        changes.clear();
        assert!(changes.is_empty());
    }
}
