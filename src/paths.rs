//! Resolving logical file references against named storage roots.
//!
//! Resolution is pure path arithmetic: we never check whether the resolved
//! path exists. Existence is verified downstream by the OCR invocation,
//! which fails with `FileNotFound` if the mount is missing the file.

use std::collections::BTreeMap;

use crate::{config::Config, prelude::*};

/// Maps logical paths onto physical storage roots.
#[derive(Debug, Clone)]
pub struct PathResolver {
    /// Namespace name to storage root.
    roots: BTreeMap<String, PathBuf>,

    /// Root for paths with no recognized namespace prefix.
    default_root: PathBuf,
}

impl PathResolver {
    /// Create a resolver from explicit mappings.
    pub fn new(default_root: PathBuf, roots: BTreeMap<String, PathBuf>) -> Self {
        Self {
            roots,
            default_root,
        }
    }

    /// Create a resolver from process configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.default_root.clone(), config.roots.clone())
    }

    /// Resolve a logical path to a physical path.
    ///
    /// If the path starts with a known namespace, the namespace is stripped
    /// and the remainder is joined onto that namespace's root. Overlapping
    /// namespace names are disambiguated by longest-prefix match on whole
    /// path components, so a `news` root never captures `newsletters/x`.
    /// Unmatched paths are joined whole onto the default root.
    pub fn resolve(&self, logical_path: &str) -> PathBuf {
        let logical_path = logical_path.trim_start_matches('/');

        let mut best: Option<(&str, &PathBuf)> = None;
        for (name, root) in &self.roots {
            let matches = logical_path == name
                || logical_path
                    .strip_prefix(name.as_str())
                    .is_some_and(|rest| rest.starts_with('/'));
            if matches && best.is_none_or(|(prev, _)| name.len() > prev.len()) {
                best = Some((name, root));
            }
        }

        match best {
            Some((name, root)) => {
                let rest = logical_path[name.len()..].trim_start_matches('/');
                if rest.is_empty() {
                    root.clone()
                } else {
                    root.join(rest)
                }
            }
            None => self.default_root.join(logical_path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> PathResolver {
        let mut roots = BTreeMap::new();
        roots.insert("newsletters".to_owned(), PathBuf::from("/data/newsletters"));
        roots.insert("news".to_owned(), PathBuf::from("/mnt/news"));
        roots.insert("books".to_owned(), PathBuf::from("/data/books"));
        PathResolver::new(PathBuf::from("/srv/default"), roots)
    }

    #[test]
    fn resolves_namespaced_path() {
        assert_eq!(
            resolver().resolve("newsletters/RSNLVHZZ002/page1.jpg"),
            PathBuf::from("/data/newsletters/RSNLVHZZ002/page1.jpg")
        );
    }

    #[test]
    fn falls_back_to_default_root() {
        assert_eq!(
            resolver().resolve("data/t1/file.pdf"),
            PathBuf::from("/srv/default/data/t1/file.pdf")
        );
    }

    #[test]
    fn namespace_root_is_independent_of_default_root() {
        let mut roots = BTreeMap::new();
        roots.insert("newsletters".to_owned(), PathBuf::from("/data/newsletters"));
        let a = PathResolver::new(PathBuf::from("/srv/a"), roots.clone());
        let b = PathResolver::new(PathBuf::from("/srv/b"), roots);
        assert_eq!(
            a.resolve("newsletters/x.jpg"),
            b.resolve("newsletters/x.jpg")
        );
    }

    #[test]
    fn longest_prefix_wins() {
        // `news` must not capture `newsletters/...`.
        assert_eq!(
            resolver().resolve("newsletters/x.jpg"),
            PathBuf::from("/data/newsletters/x.jpg")
        );
        assert_eq!(
            resolver().resolve("news/today.pdf"),
            PathBuf::from("/mnt/news/today.pdf")
        );
    }

    #[test]
    fn prefix_must_match_a_whole_component() {
        // `booksmith/...` shares a string prefix with `books` but is not in
        // that namespace.
        assert_eq!(
            resolver().resolve("booksmith/a.pdf"),
            PathBuf::from("/srv/default/booksmith/a.pdf")
        );
    }

    #[test]
    fn leading_slash_is_ignored() {
        assert_eq!(
            resolver().resolve("/newsletters/x.jpg"),
            PathBuf::from("/data/newsletters/x.jpg")
        );
    }

    #[test]
    fn bare_namespace_resolves_to_its_root() {
        assert_eq!(
            resolver().resolve("newsletters"),
            PathBuf::from("/data/newsletters")
        );
    }
}
