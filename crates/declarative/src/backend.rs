//! State backends and the serialized state writer

use crate::error::StateError;
use crate::state::RecordedState;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Durable storage for [`RecordedState`].
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Load recorded state; an absent store yields empty state.
    async fn load(&self) -> Result<RecordedState, StateError>;

    /// Persist the full state.
    async fn save(&self, state: &RecordedState) -> Result<(), StateError>;

    /// Where the state lives, for display.
    fn location(&self) -> String;
}

// ============================================================================
// File Backend
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Toml,
}

/// State stored in a single file, JSON or TOML by extension.
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn format(&self) -> Format {
        match self.path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Format::Toml,
            _ => Format::Json,
        }
    }

    fn parse(&self, content: &str) -> Result<RecordedState, StateError> {
        let parsed = match self.format() {
            Format::Json => serde_json::from_str(content).map_err(|e| e.to_string()),
            Format::Toml => toml::from_str(content).map_err(|e| e.to_string()),
        };
        parsed.map_err(|message| StateError::Parse {
            path: self.path.clone(),
            message,
        })
    }

    fn render(&self, state: &RecordedState) -> Result<String, StateError> {
        match self.format() {
            Format::Json => serde_json::to_string_pretty(state).map_err(|e| e.to_string()),
            Format::Toml => toml::to_string_pretty(state).map_err(|e| e.to_string()),
        }
        .map_err(StateError::Serialize)
    }
}

#[async_trait]
impl StateBackend for FileBackend {
    async fn load(&self) -> Result<RecordedState, StateError> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            log::debug!("State file {} does not exist, using empty state", self.path.display());
            return Ok(RecordedState::default());
        }

        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| StateError::Read {
                path: self.path.clone(),
                source,
            })?;
        let state = self.parse(&content)?;

        log::debug!(
            "Loaded {} resource(s) from {}",
            state.len(),
            self.path.display()
        );
        Ok(state)
    }

    async fn save(&self, state: &RecordedState) -> Result<(), StateError> {
        let content = self.render(state)?;
        let write_err = |source| StateError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(dir).await.map_err(write_err)?;
        }

        // Write beside the target then rename, so a crash never leaves a torn file
        let staging = self.path.with_extension("tmp");
        tokio::fs::write(&staging, content)
            .await
            .map_err(write_err)?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .map_err(write_err)?;

        log::debug!("Saved state to {}", self.path.display());
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

// ============================================================================
// Memory Backend
// ============================================================================

/// In-process state, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: parking_lot::Mutex<RecordedState>,
    saves: std::sync::atomic::AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: RecordedState) -> Self {
        Self {
            state: parking_lot::Mutex::new(state),
            saves: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn snapshot(&self) -> RecordedState {
        self.state.lock().clone()
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl StateBackend for MemoryBackend {
    async fn load(&self) -> Result<RecordedState, StateError> {
        Ok(self.snapshot())
    }

    async fn save(&self, state: &RecordedState) -> Result<(), StateError> {
        *self.state.lock() = state.clone();
        self.saves.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

// ============================================================================
// Serialized Writer
// ============================================================================

/// Funnels every state change through one lock so concurrent node
/// completions never interleave their writes.
pub(crate) struct StateWriter {
    backend: Arc<dyn StateBackend>,
    state: tokio::sync::Mutex<RecordedState>,
}

impl StateWriter {
    pub fn new(backend: Arc<dyn StateBackend>, state: RecordedState) -> Self {
        Self {
            backend,
            state: tokio::sync::Mutex::new(state),
        }
    }

    /// Apply `change` and persist the whole state before returning.
    pub async fn commit<F>(&self, change: F) -> Result<(), StateError>
    where
        F: FnOnce(&mut RecordedState) + Send,
    {
        let mut state = self.state.lock().await;
        change(&mut state);
        state.touch();
        self.backend.save(&state).await
    }

    pub async fn snapshot(&self) -> RecordedState {
        self.state.lock().await.clone()
    }
}
