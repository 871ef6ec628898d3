use anyhow::{Context, Result};
use std::path::PathBuf;

/// On-disk copy of transferred attachment bytes, laid out as
/// `<root>/<issue-key>/<filename>`. A hit saves a download on the next pass.
#[derive(Debug, Clone)]
pub struct AttachmentCache {
    root: PathBuf,
}

impl AttachmentCache {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path(&self, issue_key: &str, filename: &str) -> PathBuf {
        self.root.join(sanitize(issue_key)).join(sanitize(filename))
    }

    pub fn get(&self, issue_key: &str, filename: &str) -> Option<Vec<u8>> {
        std::fs::read(self.path(issue_key, filename)).ok()
    }

    pub fn put(&self, issue_key: &str, filename: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path(issue_key, filename);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(&path, bytes).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

/// Keep a name inside its directory: separators and traversal become `_`.
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AttachmentCache::new(dir.path().to_path_buf());
        assert_eq!(cache.get("TGT-1", "[SRC] a.png"), None);

        cache.put("TGT-1", "[SRC] a.png", b"png").unwrap();
        assert_eq!(cache.get("TGT-1", "[SRC] a.png"), Some(b"png".to_vec()));
        assert!(dir.path().join("TGT-1").join("[SRC] a.png").exists());
    }

    #[test]
    fn names_cannot_escape_the_root() {
        assert_eq!(sanitize("../etc/passwd"), ".._etc_passwd");
        assert_eq!(sanitize(".."), "_");
        assert_eq!(sanitize("a\\b"), "a_b");
    }
}
