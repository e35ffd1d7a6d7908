//! File-mtime polling watcher that keeps the system prompt cache fed from a
//! prompt file.
//!
//! The file is reloaded only when its mtime changes. An entry that expires
//! without a change stays expired, and requests fall back to the built-in
//! default until the file or the admin endpoint supplies a new prompt.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::ExpiringValue;
use crate::error::{GatewayError, Result};

/// Polling-based system prompt watcher.
pub struct SystemPromptWatcher {
    path: PathBuf,
    poll_interval: Duration,
    last_mtime: Option<SystemTime>,
}

impl SystemPromptWatcher {
    pub fn new(path: PathBuf, poll_interval: Duration) -> Self {
        Self {
            path,
            poll_interval,
            last_mtime: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the prompt file and store it in `cache` with the cache's TTL.
    pub fn load_into(&self, cache: &ExpiringValue<String>) -> Result<()> {
        let prompt = read_prompt(&self.path)?;
        cache.set_default_ttl(prompt);
        Ok(())
    }

    /// Poll until `shutdown_rx` flips to `true`.
    pub async fn watch(
        mut self,
        cache: Arc<ExpiringValue<String>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        self.last_mtime = read_mtime(&self.path);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("System prompt watcher shutting down");
                        return;
                    }
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            if *shutdown_rx.borrow() {
                return;
            }

            let current = read_mtime(&self.path);
            let changed = match (self.last_mtime, current) {
                (Some(prev), Some(next)) => next != prev,
                (None, Some(_)) => true,
                _ => false,
            };
            if !changed {
                continue;
            }

            self.last_mtime = current;
            match self.load_into(&cache) {
                Ok(()) => {
                    debug!(path = %self.path.display(), "System prompt reloaded");
                }
                Err(err) => {
                    warn!(
                        path = %self.path.display(),
                        error = %err,
                        "System prompt reload rejected; keeping current prompt"
                    );
                }
            }
        }
    }
}

fn read_prompt(path: &Path) -> Result<String> {
    let text = std::fs::read_to_string(path)?;
    let prompt = text.trim();
    if prompt.is_empty() {
        return Err(GatewayError::Config(format!(
            "system prompt file {} is empty",
            path.display()
        )));
    }
    Ok(prompt.to_string())
}

fn read_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok().and_then(|m| m.modified().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;
    use tempfile::TempDir;

    async fn wait_for(cache: &ExpiringValue<String>, expected: &str) -> bool {
        for _ in 0..200 {
            if cache.get().as_deref() == Some(expected) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[test]
    fn test_load_into_sets_trimmed_prompt() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("prompt.md");
        std::fs::write(&path, "\n  You are terse.  \n").unwrap();

        let cache = ExpiringValue::new(Duration::from_secs(60));
        SystemPromptWatcher::new(path, Duration::from_secs(1))
            .load_into(&cache)
            .unwrap();
        assert_eq!(cache.get().as_deref(), Some("You are terse."));
    }

    #[test]
    fn test_load_into_rejects_empty_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("prompt.md");
        std::fs::write(&path, "   \n").unwrap();

        let cache = ExpiringValue::new(Duration::from_secs(60));
        let err = SystemPromptWatcher::new(path, Duration::from_secs(1))
            .load_into(&cache)
            .unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
        assert!(cache.get().is_none());
    }

    #[test]
    fn test_load_into_missing_file_is_io_error() {
        let cache = ExpiringValue::new(Duration::from_secs(60));
        let err = SystemPromptWatcher::new(
            PathBuf::from("/nonexistent/chatgate/prompt.md"),
            Duration::from_secs(1),
        )
        .load_into(&cache)
        .unwrap_err();
        assert!(matches!(err, GatewayError::Io(_)));
    }

    #[tokio::test]
    async fn test_watcher_reloads_on_change() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("prompt.md");
        std::fs::write(&path, "first").unwrap();

        let cache = Arc::new(ExpiringValue::new(Duration::from_secs(60)));
        cache.set_default_ttl("first".to_string());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let watcher = SystemPromptWatcher::new(path.clone(), Duration::from_millis(25));
        let handle = tokio::spawn(watcher.watch(Arc::clone(&cache), shutdown_rx));

        // Let the watcher record the initial mtime, then make sure the
        // rewrite lands on a different one.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        std::fs::write(&path, "second").unwrap();

        assert!(wait_for(&cache, "second").await);

        let _ = shutdown_tx.send(true);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_expired_prompt_is_not_reloaded_without_change() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("prompt.md");
        std::fs::write(&path, "from file").unwrap();

        let clock = ManualClock::new();
        let cache = Arc::new(ExpiringValue::with_clock(
            Duration::from_secs(300),
            Arc::new(clock.clone()),
        ));
        let watcher = SystemPromptWatcher::new(path, Duration::from_millis(25));
        watcher.load_into(&cache).unwrap();
        assert_eq!(cache.get().as_deref(), Some("from file"));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(watcher.watch(Arc::clone(&cache), shutdown_rx));

        clock.advance(Duration::from_secs(301));
        assert!(cache.get().is_none());

        // Several polls with an unchanged file.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(cache.get().is_none());

        let _ = shutdown_tx.send(true);
        let _ = handle.await;
    }
}
