//! Hot-reload for the watched sketch file

use anyhow::{Context, Result};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(150);

/// Collapses a burst of change events into one reload once the file is quiet
#[derive(Debug, Clone)]
pub struct Debouncer {
    quiet: Duration,
    pending_since: Option<Instant>,
}

impl Debouncer {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            pending_since: None,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.pending_since = Some(now);
    }

    /// True once per burst, after `quiet` has passed since its last event
    pub fn ready(&mut self, now: Instant) -> bool {
        match self.pending_since {
            Some(since) if now.duration_since(since) >= self.quiet => {
                self.pending_since = None;
                true
            }
            _ => false,
        }
    }
}

pub struct HotReloader {
    _watcher: RecommendedWatcher,
    receiver: Receiver<()>,
    debouncer: Debouncer,
}

impl HotReloader {
    pub fn new(file: &Path, debounce: Duration) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let target = file.to_path_buf();
        let file_name = file.file_name().map(|name| name.to_os_string());

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    let touches_target = event
                        .paths
                        .iter()
                        .any(|path| path.file_name().map(|n| n.to_os_string()) == file_name);
                    if touches_target {
                        let _ = tx.send(());
                    }
                }
                Err(e) => log::error!("file watcher error on {}: {:?}", target.display(), e),
            }
        })?;

        // Editors often replace the file on save, so watch the directory
        let directory = watch_directory(file);
        watcher
            .watch(&directory, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", directory.display()))?;
        log::info!("watching {} for changes", file.display());

        Ok(Self {
            _watcher: watcher,
            receiver: rx,
            debouncer: Debouncer::new(debounce),
        })
    }

    /// Drain pending events; true when a settled change is ready to load
    pub fn check_for_changes(&mut self) -> bool {
        let now = Instant::now();
        while self.receiver.try_recv().is_ok() {
            self.debouncer.touch(now);
        }
        self.debouncer.ready(now)
    }
}

fn watch_directory(file: &Path) -> PathBuf {
    match file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Reads the sketch, skipping content identical to what was last submitted
pub struct SourceLoader {
    path: PathBuf,
    current: Option<String>,
}

impl SourceLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            current: None,
        }
    }

    pub fn load_if_changed(&mut self) -> Result<Option<String>> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        if self.current.as_ref() == Some(&content) {
            return Ok(None);
        }
        self.current = Some(content.clone());
        Ok(Some(content))
    }
}
