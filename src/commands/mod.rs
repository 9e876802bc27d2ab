//! Command implementations
//!
//! Every command opens a [`Session`]: configuration, the state backend, the
//! sandbox provider and an [`Engine`] wired together.

pub mod deploy;
pub mod state;

use anyhow::{Context as AnyhowContext, Result};
use declarative::{Engine, FileBackend, Stack};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use crate::Context;
use crate::config::GantryConfig;
use crate::program;
use crate::progress::RunProgress;
use crate::sandbox::{SandboxProvider, SandboxSecrets};
use crate::ui;

pub struct Session {
    pub config: GantryConfig,
    pub config_path: Option<PathBuf>,
    pub engine: Engine,
}

impl Session {
    /// Open a session; `jobs` and `timeout` override the configured values.
    pub fn open(ctx: &Context, jobs: Option<usize>, timeout: Option<u64>) -> Result<Self> {
        let (config, config_path) = GantryConfig::load(ctx.config.as_deref())?;
        match &config_path {
            Some(path) => log::info!("Using config {}", path.display()),
            None => log::info!("No config file found, using defaults"),
        }

        let state_path = ctx
            .state
            .clone()
            .unwrap_or_else(|| config.state.path.clone());
        let backend = Arc::new(FileBackend::new(state_path));
        let provider = Arc::new(SandboxProvider::new(&config.sandbox, &config.stack.region));
        let engine = Engine::new(provider, backend)
            .with_options(config.engine_options(jobs, timeout))
            .with_progress(Arc::new(RunProgress::new(ctx.quiet)));

        Ok(Self {
            config,
            config_path,
            engine,
        })
    }

    /// Print where configuration and state come from.
    pub fn describe(&self) {
        let config = self
            .config_path
            .as_ref()
            .map_or_else(|| "(defaults)".to_string(), |p| p.display().to_string());
        ui::kv("Config", &config);
        ui::kv("State", &self.engine.state_location());
    }

    /// Declare the configured stack.
    pub fn stack(&self) -> Result<Stack> {
        program::web_service(&self.config.stack, Arc::new(SandboxSecrets))
            .context("Failed to declare stack")
    }
}

pub fn runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")
}

/// Token cancelled on Ctrl-C. In-flight operations finish, nothing new starts.
pub fn interrupt_token(runtime: &Runtime) -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, waiting for in-flight operations");
            cancel.cancel();
        }
    });
    token
}
