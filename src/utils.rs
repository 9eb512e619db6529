use crate::Result;
use anyhow::Context;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// Write a file.
pub(crate) async fn write(path: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> Result<()> {
    let path = path.as_ref();
    tokio::fs::write(path, contents)
        .await
        .context(format!("Unable to write to {}", path.to_string_lossy()))
}

/// Write a file that holds secrets: the data lands in a sibling temp file which is created
/// restricted to the owner and then renamed over `path`, so readers see either the old or the
/// new contents. The temp file is removed if anything fails.
pub(crate) async fn write_private(path: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> Result<()> {
    let path = path.as_ref();
    let tmp = temp_sibling(path);
    let result = write_private_then_rename(&tmp, path, contents.as_ref()).await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

async fn write_private_then_rename(tmp: &Path, path: &Path, contents: &[u8]) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options
        .open(tmp)
        .await
        .with_context(|| format!("Unable to create {}", tmp.display()))?;
    file.write_all(contents)
        .await
        .with_context(|| format!("Unable to write to {}", tmp.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("Unable to flush {}", tmp.display()))?;
    drop(file);
    tokio::fs::rename(tmp, path).await.with_context(|| {
        format!(
            "Unable to move '{}' into place at '{}'",
            tmp.display(),
            path.display()
        )
    })
}

/// Blocking version of `write_private` for callers that are not async, such as secret store
/// backends.
pub(crate) fn write_private_sync(path: &Path, contents: impl AsRef<[u8]>) -> Result<()> {
    let tmp = temp_sibling(path);
    let result = write_private_then_rename_sync(&tmp, path, contents.as_ref());
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

fn write_private_then_rename_sync(tmp: &Path, path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(tmp)
        .with_context(|| format!("Unable to create {}", tmp.display()))?;
    file.write_all(contents)
        .with_context(|| format!("Unable to write to {}", tmp.display()))?;
    file.sync_all()
        .with_context(|| format!("Unable to flush {}", tmp.display()))?;
    drop(file);
    std::fs::rename(tmp, path).with_context(|| {
        format!(
            "Unable to move '{}' into place at '{}'",
            tmp.display(),
            path.display()
        )
    })
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple()))
}

/// Create a directory, and its parents, that only the owner may enter (0700 on Unix).
pub(crate) async fn make_private_dir(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    tokio::fs::create_dir_all(path)
        .await
        .with_context(|| format!("Unable to create directory at {}", path.to_string_lossy()))?;
    #[cfg(unix)]
    {
        use std::fs::Permissions;
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, Permissions::from_mode(0o700))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }
    Ok(())
}

/// Read a file to a `String`.
pub async fn read(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read file at {}", path.display()))
}

/// Read a file to bytes, or read all of stdin when `path` is `-`.
pub async fn read_input(path: &Path) -> Result<Vec<u8>> {
    if path == Path::new("-") {
        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        tokio::io::stdin()
            .read_to_end(&mut buf)
            .await
            .context("Failed to read from stdin")?;
        return Ok(buf);
    }
    let path = expand_home(path);
    tokio::fs::read(&path)
        .await
        .with_context(|| format!("Failed to read file at {}", path.display()))
}

/// Deserialize a JSON file into type `T`.
pub async fn deserialize<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let content = read(path).await?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse JSON file at {}", path.display()))
}

/// Expands a leading `~` to the user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

/// Lower-cases and trims an email so that it can be used as a lookup key.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_private_replaces_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("secret.json");
        write_private(&path, "one").await.unwrap();
        write_private(&path, "two").await.unwrap();
        assert_eq!("two", read(&path).await.unwrap());

        // No temp files are left behind.
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(1, entries.len());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(0o600, mode & 0o777);
        }
    }

    #[tokio::test]
    async fn test_write_private_cleans_up_on_failure() {
        let dir = TempDir::new().unwrap();
        // Renaming a file over a non-empty directory fails.
        let target = dir.path().join("target");
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("inner"), "x").unwrap();

        assert!(write_private(&target, "secret").await.is_err());
        assert!(write_private_sync(&target, "secret").is_err());

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(vec!["target".to_string()], names);
    }

    #[test]
    fn test_write_private_sync_mode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("secret");
        write_private_sync(&path, "one").unwrap();
        write_private_sync(&path, "two").unwrap();
        assert_eq!("two", std::fs::read_to_string(&path).unwrap());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(0o600, mode & 0o777);
        }
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!("work@example.com", normalize_email("  Work@Example.COM "));
    }

    #[test]
    fn test_expand_home_leaves_absolute_paths() {
        let p = Path::new("/tmp/key.json");
        assert_eq!(p, expand_home(p));
    }
}
