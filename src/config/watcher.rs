//! Desired-state document watcher.
//!
//! The document is a JSON object mapping stage keys (`<gateway>/<stage>`)
//! to configurations. Each successful reload is sent on a channel; a document
//! that fails to load is logged and the previous one stays in effect.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::apisix::ApisixConfiguration;
use crate::config::loader::ConfigError;

/// Stage key → desired configuration.
pub type DesiredState = HashMap<String, ApisixConfiguration>;

/// Load a desired-state document.
pub fn load_desired_state(path: &Path) -> Result<DesiredState, ConfigError> {
    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(DesiredState::new());
    }
    Ok(serde_json::from_str(&content)?)
}

/// Monitors the desired-state document for changes.
pub struct DesiredStateWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<DesiredState>,
}

impl DesiredStateWatcher {
    /// Returns the watcher and a receiver for reloaded documents.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<DesiredState>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        (
            Self {
                path: path.to_path_buf(),
                update_tx,
            },
            update_rx,
        )
    }

    /// Send the current document once, if it loads.
    pub fn send_current(&self) {
        match load_desired_state(&self.path) {
            Ok(state) => {
                let _ = self.update_tx.send(state);
            }
            Err(e) => {
                tracing::error!(path = %self.path.display(), error = %e, "Failed to load desired state")
            }
        }
    }

    /// Start watching the document; dropping the returned watcher stops it.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.update_tx.clone();
        let path = self.path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        tracing::info!(path = %path.display(), "Desired state change detected, reloading");
                        match load_desired_state(&path) {
                            Ok(state) => {
                                let _ = tx.send(state);
                            }
                            Err(e) => tracing::error!(
                                path = %path.display(),
                                error = %e,
                                "Failed to reload desired state, keeping current"
                            ),
                        }
                    }
                }
                Err(e) => tracing::error!(error = %e, "Watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = %self.path.display(), "Desired state watcher started");
        Ok(watcher)
    }
}
