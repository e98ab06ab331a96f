use crate::error::{LifecycleError, Result};
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn unix_now_ms() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    u64::try_from(now.as_millis()).unwrap_or(u64::MAX)
}

/// `root/relative`, refusing anything that could land outside `root`
pub fn resolve_in_root(root: &Path, relative: &str) -> Result<PathBuf> {
    let path = Path::new(relative);
    if relative.is_empty() || path.is_absolute() {
        return Err(LifecycleError::InvalidPath(relative.to_string()));
    }
    for component in path.components() {
        if !matches!(component, Component::Normal(_) | Component::CurDir) {
            return Err(LifecycleError::InvalidPath(relative.to_string()));
        }
    }
    Ok(root.join(path))
}

/// Replace `path` in one step: the new content goes to a sibling temp file first
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file_name = path
        .file_name()
        .ok_or_else(|| LifecycleError::InvalidPath(path.display().to_string()))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".reaper.tmp");
    let tmp = path.with_file_name(tmp_name);

    tokio::fs::write(&tmp, contents).await?;
    if let Err(err) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_rejects_escapes() {
        let root = Path::new("/project");
        assert_eq!(
            resolve_in_root(root, "js/app.js").expect("resolve"),
            PathBuf::from("/project/js/app.js")
        );
        assert!(resolve_in_root(root, "../etc/passwd").is_err());
        assert!(resolve_in_root(root, "js/../../x.js").is_err());
        assert!(resolve_in_root(root, "/etc/passwd").is_err());
        assert!(resolve_in_root(root, "").is_err());
    }

    #[tokio::test]
    async fn test_write_atomic_replaces_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/app.js");
        write_atomic(&path, b"first").await.expect("write");
        write_atomic(&path, b"second").await.expect("write");
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "second");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("nested"))
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
