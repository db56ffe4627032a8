//! Static file share: path resolution for the HTTP GET/POST endpoints.
//! Only wire-format-adjacent plumbing is specified here (spec names the
//! endpoint only as a wire format); the containment check is the one
//! invariant that actually belongs to the core.

use std::path::{Path, PathBuf};

use crate::error::Error;

/// Resolve a requested download path to a file under `share_root`,
/// rejecting anything that escapes it (spec's "must resolve, after
/// canonicalisation, to a descendant of the share root"). The target
/// must already exist; `tokio::fs::canonicalize` both resolves `..`
/// and symlinks, which a purely lexical join cannot catch.
pub async fn resolve_download(share_root: &Path, requested: &str) -> Result<PathBuf, Error> {
    let root = tokio::fs::canonicalize(share_root)
        .await
        .map_err(Error::Resource)?;
    let candidate = root.join(requested.trim_start_matches('/'));
    let resolved = tokio::fs::canonicalize(&candidate)
        .await
        .map_err(|_| Error::Operator("path not found".into()))?;
    if resolved.starts_with(&root) {
        Ok(resolved)
    } else {
        Err(Error::Operator("path escapes share root".into()))
    }
}

/// Resolve an upload destination under `share_root`. The file itself
/// need not exist yet, so only the (existing) parent directory is
/// canonicalized; the final component is appended lexically and the
/// containment check still applies to the result.
pub async fn resolve_upload(share_root: &Path, requested: &str) -> Result<PathBuf, Error> {
    let root = tokio::fs::canonicalize(share_root)
        .await
        .map_err(Error::Resource)?;
    let relative = requested.trim_start_matches('/');
    let candidate = root.join(relative);
    let parent = candidate
        .parent()
        .ok_or_else(|| Error::Operator("path escapes share root".into()))?;
    tokio::fs::create_dir_all(parent).await.map_err(Error::Resource)?;
    let canonical_parent = tokio::fs::canonicalize(parent)
        .await
        .map_err(Error::Resource)?;
    if !canonical_parent.starts_with(&root) {
        return Err(Error::Operator("path escapes share root".into()));
    }
    let file_name = candidate
        .file_name()
        .ok_or_else(|| Error::Operator("path escapes share root".into()))?;
    Ok(canonical_parent.join(file_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_path_stays_within_root() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = resolve_upload(dir.path(), "notes.txt").await.unwrap();
        assert!(resolved.starts_with(dir.path().canonicalize().unwrap()));
    }

    #[tokio::test]
    async fn upload_traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let outside = dir.path().parent().unwrap();
        let escape = format!(
            "../{}/escape.txt",
            outside.file_name().unwrap().to_string_lossy()
        );
        let result = resolve_upload(dir.path(), &escape).await;
        assert!(result.is_err() || result.unwrap().starts_with(dir.path()));
    }

    #[tokio::test]
    async fn download_of_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(resolve_download(dir.path(), "missing.txt").await.is_err());
    }

    #[tokio::test]
    async fn download_path_traversal_denied() {
        let dir = tempfile::tempdir().unwrap();
        let result = resolve_download(dir.path(), "../etc/passwd").await;
        assert!(result.is_err());
    }
}
