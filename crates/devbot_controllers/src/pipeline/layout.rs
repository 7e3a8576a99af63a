//! Lookup of the kustomization to bake inside a clone.

use std::path::{Path, PathBuf};

use devbot_api::naming::slugify;

pub const KUSTOMIZATION_FILE: &str = "kustomization.yaml";
pub const OUTPUT_FILE: &str = ".devbot.output.resources.yaml";

const DEVBOT_DIR: &str = ".devbot";

/// Directory of the most specific kustomization for `application` and
/// `branch`, searched in this order:
///
/// 1. `.devbot/<app>/<branch-slug>/`
/// 2. `.devbot/<app>/`
/// 3. `.devbot/<branch-slug>/`
/// 4. `.devbot/`
///
/// `base` is the clone root, joined with the repository's `path` if the
/// application sets one.
pub fn find_kustomization(base: &Path, application: &str, branch: &str) -> Option<PathBuf> {
    let root = base.join(DEVBOT_DIR);
    let slug = slugify(branch);
    [
        root.join(application).join(&slug),
        root.join(application),
        root.join(&slug),
        root,
    ]
    .into_iter()
    .find(|dir| dir.join(KUSTOMIZATION_FILE).is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(base: &Path, dir: &str) {
        let dir = base.join(dir);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(KUSTOMIZATION_FILE), "resources: []\n").unwrap();
    }

    #[test]
    fn test_most_specific_directory_wins() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path();
        touch(base, ".devbot");
        touch(base, ".devbot/feature-login");
        touch(base, ".devbot/shop");

        assert_eq!(
            find_kustomization(base, "shop", "feature/login"),
            Some(base.join(".devbot/shop"))
        );
        assert_eq!(
            find_kustomization(base, "blog", "feature/login"),
            Some(base.join(".devbot/feature-login"))
        );
        assert_eq!(find_kustomization(base, "blog", "main"), Some(base.join(".devbot")));

        touch(base, ".devbot/shop/feature-login");
        assert_eq!(
            find_kustomization(base, "shop", "feature/login"),
            Some(base.join(".devbot/shop/feature-login"))
        );
    }

    #[test]
    fn test_directory_named_like_the_file_is_ignored() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join(".devbot").join(KUSTOMIZATION_FILE)).unwrap();

        assert_eq!(find_kustomization(tmp.path(), "shop", "main"), None);
    }
}
