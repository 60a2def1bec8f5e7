//! Manager configuration read from a local file, with change notifications.
use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use eyre::{Context, Result, eyre};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::{
    config::{loader::load_config, models::ManagerConfig},
    ports::config_provider::ConfigProvider,
};

/// Loads [`ManagerConfig`] from `path` and signals when the file changes.
///
/// The parent directory is watched rather than the file itself: editors and
/// deploy tools commonly replace the file, which would orphan a file watch.
/// Bursts of events collapse into one pending signal.
pub struct FileConfigProvider {
    path: PathBuf,
    _watcher: RecommendedWatcher,
    changes: Mutex<Option<mpsc::Receiver<()>>>,
}

impl FileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file_name = path
            .file_name()
            .ok_or_else(|| eyre!("config path has no file name: {}", path.display()))?
            .to_owned();
        let (tx, rx) = mpsc::channel(1);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if touches_config(&event, &file_name) => {
                debug!(kind = ?event.kind, "config file changed");
                // A full channel already holds a pending reload.
                let _ = tx.try_send(());
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "config file watch error"),
        })
        .wrap_err("failed to create config file watcher")?;

        watcher
            .watch(watch_dir(&path), RecursiveMode::NonRecursive)
            .wrap_err_with(|| format!("failed to watch config directory of {}", path.display()))?;

        Ok(Self {
            path,
            _watcher: watcher,
            changes: Mutex::new(Some(rx)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn watch_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Whether `event` writes, creates or removes the file named `file_name`.
fn touches_config(event: &Event, file_name: &OsString) -> bool {
    matches!(
        event.kind,
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
    ) && event
        .paths
        .iter()
        .any(|p| p.file_name() == Some(file_name.as_os_str()))
}

#[async_trait]
impl ConfigProvider for FileConfigProvider {
    async fn load_config(&self) -> Result<ManagerConfig> {
        let path = self
            .path
            .to_str()
            .ok_or_else(|| eyre!("config path is not valid UTF-8: {}", self.path.display()))?;
        load_config(path)
            .await
            .wrap_err_with(|| format!("failed to load {path}"))
    }

    fn watch(&self) -> Option<mpsc::Receiver<()>> {
        self.changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
