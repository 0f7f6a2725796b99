//! Hot reload of the configuration file
//!
//! [`ConfigWatcher`] turns notify events into a debounced "file changed"
//! signal. [`ReloadManager`] re-parses the file on that signal and hands a
//! [`ConfigUpdate`] to its callback, naming the listeners that differ from
//! the last configuration it accepted.

use crate::config::{Config, ListenerConfig};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Quiet period before a burst of file events counts as one change
pub const DEBOUNCE: Duration = Duration::from_millis(500);

const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct ConfigWatcher {
    config_path: PathBuf,
    _watcher: RecommendedWatcher,
    events: Receiver<notify::Result<Event>>,
    /// Time of the last relevant event not yet reported
    pending_since: Option<Instant>,
}

impl ConfigWatcher {
    pub fn new<P: AsRef<Path>>(config_path: P) -> notify::Result<Self> {
        let config_path = config_path.as_ref().to_path_buf();
        let (tx, events) = channel();

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            notify::Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        // Editors replace files, so watch the directory. A bare file name
        // has an empty parent, which notify refuses.
        let dir = config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        watcher.watch(dir, RecursiveMode::NonRecursive)?;

        info!(path = ?config_path, "Watching configuration file");
        Ok(Self {
            config_path,
            _watcher: watcher,
            events,
            pending_since: None,
        })
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// True once the file changed and then stayed quiet for [`DEBOUNCE`]
    pub fn poll(&mut self) -> bool {
        self.poll_at(Instant::now())
    }

    fn poll_at(&mut self, now: Instant) -> bool {
        while let Ok(result) = self.events.try_recv() {
            match result {
                Ok(event) if self.is_relevant(&event) => {
                    debug!(kind = ?event.kind, "Configuration file event");
                    self.pending_since = Some(now);
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "File watcher error"),
            }
        }

        match self.pending_since {
            Some(since) if now.saturating_duration_since(since) >= DEBOUNCE => {
                self.pending_since = None;
                true
            }
            _ => false,
        }
    }

    fn is_relevant(&self, event: &Event) -> bool {
        matches!(
            event.kind,
            EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
        ) && event
            .paths
            .iter()
            .any(|p| p == &self.config_path || p.file_name() == self.config_path.file_name())
    }
}

/// A newly accepted configuration and how its listeners differ
#[derive(Debug, Clone)]
pub struct ConfigUpdate {
    pub config: Config,
    /// Present before and after, with different settings
    pub changed_listeners: Vec<String>,
    pub added_listeners: Vec<String>,
    pub removed_listeners: Vec<String>,
    /// Upstream clusters differ, so routing filters need a rebuild
    pub clusters_changed: bool,
}

impl ConfigUpdate {
    pub fn between(previous: &Config, config: Config) -> Self {
        let mut changed_listeners = Vec::new();
        let mut added_listeners = Vec::new();
        for listener in &config.listeners {
            match previous.listeners.iter().find(|l| l.name == listener.name) {
                Some(old) if !same_listener(old, listener) => {
                    changed_listeners.push(listener.name.clone())
                }
                Some(_) => {}
                None => added_listeners.push(listener.name.clone()),
            }
        }
        let removed_listeners = previous
            .listeners
            .iter()
            .filter(|old| !config.listeners.iter().any(|l| l.name == old.name))
            .map(|old| old.name.clone())
            .collect();
        let clusters_changed = !same_value(&previous.clusters, &config.clusters);

        Self {
            config,
            changed_listeners,
            added_listeners,
            removed_listeners,
            clusters_changed,
        }
    }

    pub fn is_changed(&self, listener: &str) -> bool {
        self.changed_listeners.iter().any(|name| name == listener)
    }
}

fn same_listener(a: &ListenerConfig, b: &ListenerConfig) -> bool {
    same_value(a, b)
}

/// Filter settings hold hash maps, so compare through ordered TOML values
fn same_value<T: serde::Serialize + ?Sized>(a: &T, b: &T) -> bool {
    match (toml::Value::try_from(a), toml::Value::try_from(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

pub struct ReloadManager {
    watcher: ConfigWatcher,
    current: Config,
}

impl ReloadManager {
    /// `current` is the configuration already running
    pub fn new<P: AsRef<Path>>(config_path: P, current: Config) -> notify::Result<Self> {
        Ok(Self {
            watcher: ConfigWatcher::new(config_path)?,
            current,
        })
    }

    /// Poll the watcher from a background task until the runtime stops
    ///
    /// The callback only sees configurations that parsed and validated; a
    /// broken file keeps the running configuration.
    pub fn start<F>(mut self, callback: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(ConfigUpdate) + Send + 'static,
    {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(POLL_INTERVAL);
            loop {
                interval.tick().await;
                if !self.watcher.poll() {
                    continue;
                }
                if let Some(update) = self.reload() {
                    callback(update);
                }
            }
        })
    }

    /// Load the watched file and diff it against the running configuration
    pub fn reload(&mut self) -> Option<ConfigUpdate> {
        let path = self.watcher.config_path();
        let config = match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, path = ?path, "Rejected configuration reload");
                return None;
            }
        };

        let update = ConfigUpdate::between(&self.current, config);
        info!(
            changed = ?update.changed_listeners,
            added = ?update.added_listeners,
            removed = ?update.removed_listeners,
            clusters_changed = update.clusters_changed,
            "Configuration reloaded"
        );
        self.current = update.config.clone();
        Some(update)
    }
}
