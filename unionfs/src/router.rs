use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::source::Source;

/// Maps logical paths (as seen at the mount point) to concrete paths under
/// exactly one source, per §4.1.
///
/// The router holds no state of its own beyond the (immutable, shared)
/// source list: placement decisions are recomputed from the current state of
/// the sources on every call, which is what makes rules 2 and 3
/// referentially transparent for anything already rooted.
#[derive(Debug, Clone)]
pub struct PathRouter {
    sources: Arc<[Source]>,
}

impl PathRouter {
    pub fn new(sources: Arc<[Source]>) -> Self {
        Self { sources }
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    /// Resolves `logical_path` (must start with `/`) to a concrete path.
    ///
    /// This never fails: existence checks are best-effort, and a host error
    /// while probing is treated as "does not exist" and resolution continues
    /// to the next rule, per the router's contract in §4.1.
    #[instrument(skip(self), fields(logical_path = %logical_path.display()))]
    pub fn resolve(&self, logical_path: &Path) -> PathBuf {
        let rel = strip_leading_slash(logical_path);

        // Rule 1: the root itself always resolves to the first source. Every
        // source's root directory trivially "exists", so rule 2 below would
        // reach the same conclusion for `/`; this early return just avoids
        // walking an empty relative path through the general machinery.
        if rel.as_os_str().is_empty() {
            return self.sources[0].concrete_path("");
        }

        // Rule 2: existing-entry rule.
        for source in self.sources.iter() {
            let candidate = source.concrete_path(&rel);
            if exists(&candidate) {
                debug!(source = %source.path().display(), "existing-entry rule matched");
                return candidate;
            }
        }

        // Rule 3: existing-top-level rule.
        if let Some(top_level) = top_level_component(&rel) {
            for source in self.sources.iter() {
                let top_level_candidate = source.concrete_path(top_level);
                if exists(&top_level_candidate) {
                    debug!(source = %source.path().display(), "existing-top-level rule matched");
                    return source.concrete_path(&rel);
                }
            }
        }

        // Rule 4: free-space rule. Ties broken by declaration order, i.e. the
        // first source reaching the maximum wins.
        let mut best_idx = 0;
        let mut best_free_blocks = self.sources[0].free_blocks().unwrap_or(0);
        for (idx, source) in self.sources.iter().enumerate().skip(1) {
            let free_blocks = source.free_blocks().unwrap_or(0);
            if free_blocks > best_free_blocks {
                best_idx = idx;
                best_free_blocks = free_blocks;
            }
        }
        debug!(source = %self.sources[best_idx].path().display(), "free-space rule matched");
        self.sources[best_idx].concrete_path(&rel)
    }
}

fn strip_leading_slash(path: &Path) -> PathBuf {
    match path.strip_prefix("/") {
        Ok(rel) => rel.to_path_buf(),
        Err(_) => path.to_path_buf(),
    }
}

fn top_level_component(rel: &Path) -> Option<&std::ffi::OsStr> {
    let mut components = rel.components();
    let first = components.next()?;
    // Only a top-level name if there's at least one more component beneath
    // it — a bare top-level path is handled by rule 2 already.
    components.next()?;
    Some(first.as_os_str())
}

/// `lstat`s `path`, not following a symlink in the final component, treating
/// any error (including permission denied on an intermediate component) as
/// "does not exist" per the router's total-failure contract.
fn exists(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn router_over(dirs: &[&TempDir]) -> PathRouter {
        let sources: Vec<Source> = dirs.iter().map(|d| Source::new(d.path())).collect();
        PathRouter::new(sources.into())
    }

    #[test]
    fn existing_entry_wins_regardless_of_free_space() {
        let d0 = TempDir::new().unwrap();
        let d1 = TempDir::new().unwrap();
        fs::write(d1.path().join("f"), b"hi").unwrap();

        let router = router_over(&[&d0, &d1]);
        let resolved = router.resolve(Path::new("/f"));
        assert_eq!(resolved, d1.path().join("f"));
    }

    #[test]
    fn top_level_cohesion_follows_existing_directory() {
        let d0 = TempDir::new().unwrap();
        let d1 = TempDir::new().unwrap();
        fs::create_dir(d0.path().join("dir")).unwrap();

        let router = router_over(&[&d0, &d1]);
        let resolved = router.resolve(Path::new("/dir/new"));
        assert_eq!(resolved, d0.path().join("dir").join("new"));
    }

    #[test]
    fn root_resolves_to_first_source() {
        let d0 = TempDir::new().unwrap();
        let d1 = TempDir::new().unwrap();

        let router = router_over(&[&d0, &d1]);
        let resolved = router.resolve(Path::new("/"));
        assert_eq!(resolved, d0.path().join(""));
    }

    #[test]
    fn brand_new_top_level_uses_most_free_space() {
        // Both empty; we can't force real statvfs free space in a unit test
        // without root, but we can at least assert determinism: resolving
        // twice agrees, and the winner is one of the declared sources.
        let d0 = TempDir::new().unwrap();
        let d1 = TempDir::new().unwrap();

        let router = router_over(&[&d0, &d1]);
        let first = router.resolve(Path::new("/new"));
        let second = router.resolve(Path::new("/new"));
        assert_eq!(first, second);
        assert!(first == d0.path().join("new") || first == d1.path().join("new"));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn valid_name() -> impl Strategy<Value = String> {
            "[a-z]{1,8}".prop_filter("non-empty", |s| !s.is_empty())
        }

        proptest! {
            #[test]
            fn routing_an_existing_path_is_idempotent(name in valid_name()) {
                let d0 = TempDir::new().unwrap();
                let d1 = TempDir::new().unwrap();
                fs::write(d1.path().join(&name), b"x").unwrap();

                let router = router_over(&[&d0, &d1]);
                let logical = Path::new("/").join(&name);
                let resolved = router.resolve(&logical);

                // The concrete path, re-interpreted as a logical path rooted at
                // the same name, must resolve to the same place again.
                let resolved_again = router.resolve(&logical);
                prop_assert_eq!(resolved, resolved_again);
            }

            #[test]
            fn existing_entry_always_dominates_free_space(name in valid_name()) {
                let d0 = TempDir::new().unwrap();
                let d1 = TempDir::new().unwrap();
                // d0 is declared first and would win an empty-sources free-space
                // tie, but the entry only exists under d1.
                fs::write(d1.path().join(&name), b"x").unwrap();

                let router = router_over(&[&d0, &d1]);
                let resolved = router.resolve(&Path::new("/").join(&name));
                prop_assert_eq!(resolved, d1.path().join(&name));
            }
        }
    }
}
