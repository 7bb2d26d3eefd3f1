//! temp file logic
use std::{
    collections::HashSet,
    env,
    path::{Path, PathBuf},
    sync::{LazyLock, Mutex},
};

static TEMPS: LazyLock<Mutex<HashSet<PathBuf>>> = LazyLock::new(<_>::default);

static PROCESS_DIR: LazyLock<PathBuf> = LazyLock::new(|| {
    let mut dir = env::temp_dir();
    dir.push(format!(".vqcheck-{}", fastrand::u32(..)));
    dir
});

/// Per-process temp directory, registered for cleanup on first use.
pub async fn process_dir() -> anyhow::Result<PathBuf> {
    let dir = PROCESS_DIR.clone();
    tokio::fs::create_dir_all(&dir).await?;
    add(&dir);
    Ok(dir)
}

/// Add a file or directory as temporary so it can be deleted later.
pub fn add(path: impl Into<PathBuf>) {
    if let Ok(mut temps) = TEMPS.lock() {
        temps.insert(path.into());
    }
}

/// Remove a previously added file so that it won't be deleted later,
/// if it hasn't already.
pub fn unadd(path: &Path) -> bool {
    TEMPS.lock().is_ok_and(|mut temps| temps.remove(path))
}

/// Delete all added temporary files & directories.
pub async fn clean() {
    let temps = match TEMPS.lock() {
        Ok(mut temps) => std::mem::take(&mut *temps),
        Err(_) => return,
    };
    for path in temps {
        match tokio::fs::metadata(&path).await {
            Ok(m) if m.is_dir() => {
                let _ = tokio::fs::remove_dir_all(&path).await;
            }
            Ok(_) => {
                let _ = tokio::fs::remove_file(&path).await;
            }
            Err(_) => {}
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn clean_removes_dirs_and_files() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("frames");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("0001.png"), b"x").unwrap();
        let file = root.path().join("vmaf.json");
        std::fs::write(&file, b"{}").unwrap();
        let kept = root.path().join("kept.json");
        std::fs::write(&kept, b"{}").unwrap();

        add(&dir);
        add(&file);
        add(&kept);
        assert!(unadd(&kept));
        clean().await;

        assert!(!dir.exists());
        assert!(!file.exists());
        assert!(kept.exists());
    }
}
