/// Sandbox lifecycle state machine
///
/// A sandbox moves CREATED → INITIALIZED → READY and never backwards. A
/// sandbox that must serve a different piece set is torn down and replaced.

use crate::error::{Result, WorkerError};
use crate::flow::types::StepAction;
use crate::sandbox::installer::{InstalledPieces, PieceInstaller, PieceSet};
use crate::config::{IsolationMode, SandboxConfig};
use crate::sandbox::lua::{self, ExecutionLimits, Isolation, RunningExecutions};
use crate::sandbox::pool::PoolTicket;
use crate::sandbox::result::CodeExecutionResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle state of a sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SandboxState {
    /// Allocated, nothing provisioned
    Created,
    /// Working directory established, no pieces installed
    Initialized,
    /// Pieces installed; accepts executions
    Ready,
}

impl SandboxState {
    /// The only state reachable from this one
    fn successor(self) -> Option<SandboxState> {
        match self {
            SandboxState::Created => Some(SandboxState::Initialized),
            SandboxState::Initialized => Some(SandboxState::Ready),
            SandboxState::Ready => None,
        }
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SandboxState::Created => "CREATED",
            SandboxState::Initialized => "INITIALIZED",
            SandboxState::Ready => "READY",
        };
        f.write_str(name)
    }
}

/// Limits every execution in a sandbox runs under (the timeout comes per call)
#[derive(Debug, Clone)]
pub struct SandboxLimits {
    pub grace: Duration,
    pub output_limit_bytes: usize,
    pub memory_limit_bytes: usize,
    pub isolation: Isolation,
}

impl SandboxLimits {
    /// Resolve limits from config; process isolation defaults to this executable
    pub fn from_config(config: &SandboxConfig) -> std::io::Result<Self> {
        let isolation = match config.isolation {
            IsolationMode::Thread => Isolation::Thread,
            IsolationMode::Process => {
                let program = match &config.runner_program {
                    Some(program) => PathBuf::from(program),
                    None => std::env::current_exe()?,
                };
                Isolation::Process { program }
            }
        };

        Ok(Self {
            grace: config.timeout_grace(),
            output_limit_bytes: config.output_limit_bytes,
            memory_limit_bytes: config.memory_limit_bytes,
            isolation,
        })
    }
}

/// Isolated execution environment bound to one piece set
#[derive(Debug)]
pub struct Sandbox {
    id: Uuid,
    state: SandboxState,
    piece_set: Option<PieceSet>,
    installed: InstalledPieces,
    workdir: PathBuf,
    limits: SandboxLimits,
    running: RunningExecutions,
    created_at: DateTime<Utc>,
    last_used_at: DateTime<Utc>,
    /// Present while checked out of a pool
    ticket: Option<PoolTicket>,
}

impl Sandbox {
    /// Allocate a sandbox in CREATED state; its working dir will live under `root`
    pub fn new(root: &Path, limits: SandboxLimits) -> Self {
        let id = Uuid::new_v4();
        let now = Utc::now();
        Self {
            id,
            state: SandboxState::Created,
            piece_set: None,
            installed: InstalledPieces::default(),
            workdir: root.join(id.to_string()),
            limits,
            running: RunningExecutions::default(),
            created_at: now,
            last_used_at: now,
            ticket: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    pub fn piece_set(&self) -> Option<&PieceSet> {
        self.piece_set.as_ref()
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_used_at(&self) -> DateTime<Utc> {
        self.last_used_at
    }

    /// Executions of this sandbox whose VM thread is still alive
    pub fn running_executions(&self) -> usize {
        self.running.count()
    }

    /// READY and installed with exactly this piece set
    pub fn serves(&self, piece_set: &PieceSet) -> bool {
        self.state == SandboxState::Ready && self.piece_set.as_ref() == Some(piece_set)
    }

    pub(crate) fn touch(&mut self) {
        self.last_used_at = Utc::now();
    }

    pub(crate) fn attach_ticket(&mut self, ticket: PoolTicket) {
        self.ticket = Some(ticket);
    }

    pub(crate) fn take_ticket(&mut self) -> Option<PoolTicket> {
        self.ticket.take()
    }

    fn advance(&mut self, to: SandboxState) -> Result<()> {
        if self.state.successor() != Some(to) {
            return Err(WorkerError::InvalidTransition { from: self.state, to });
        }
        tracing::debug!("🔁 Sandbox {} {} -> {}", self.id, self.state, to);
        self.state = to;
        Ok(())
    }

    /// CREATED → INITIALIZED: establish the private working directory
    pub async fn init(&mut self) -> Result<()> {
        if self.state != SandboxState::Created {
            return Err(WorkerError::InvalidTransition {
                from: self.state,
                to: SandboxState::Initialized,
            });
        }
        tokio::fs::create_dir_all(&self.workdir).await?;
        self.advance(SandboxState::Initialized)
    }

    /// INITIALIZED → READY: install the piece set through the external installer
    ///
    /// A failed install leaves the sandbox INITIALIZED.
    pub async fn install(&mut self, installer: &dyn PieceInstaller, piece_set: &PieceSet) -> Result<()> {
        if self.state != SandboxState::Initialized {
            return Err(WorkerError::InvalidTransition {
                from: self.state,
                to: SandboxState::Ready,
            });
        }

        let installed = installer.install(self.id, &self.workdir, piece_set).await?;
        self.installed = installed;
        self.piece_set = Some(piece_set.clone());
        self.advance(SandboxState::Ready)
    }

    /// Run one action with a caller-specified timeout
    ///
    /// Fails fast with `SandboxNotReady` unless the sandbox is READY. Script
    /// failures and timeouts come back as verdicts, not errors.
    pub async fn execute(&mut self, action: &StepAction, input: &Value, timeout: Duration) -> Result<CodeExecutionResult> {
        if self.state != SandboxState::Ready {
            return Err(WorkerError::SandboxNotReady {
                sandbox_id: self.id,
                state: self.state,
            });
        }

        let (chunk_name, source) = match action {
            StepAction::Piece { piece, action } => {
                let source = self
                    .installed
                    .source(piece, action)
                    .ok_or_else(|| WorkerError::UnknownAction(format!("{}:{}", piece, action)))?;
                (format!("{}:{}", piece, action), source.to_string())
            }
            StepAction::Code { source } => ("inline".to_string(), source.clone()),
        };

        let limits = ExecutionLimits {
            timeout,
            grace: self.limits.grace,
            output_limit_bytes: self.limits.output_limit_bytes,
            memory_limit_bytes: self.limits.memory_limit_bytes,
            isolation: self.limits.isolation.clone(),
        };

        tracing::debug!("🏃 Sandbox {} executing '{}' (timeout {:?})", self.id, chunk_name, timeout);
        let result = lua::run_chunk(&chunk_name, &source, input, &limits, &self.running).await;
        self.touch();
        Ok(result)
    }

    /// Release the sandbox's resources; the sandbox is gone afterwards
    pub async fn teardown(self) -> Result<()> {
        if self.running.count() > 0 {
            tracing::warn!(
                "⚠️ Tearing down sandbox {} with {} execution(s) still running",
                self.id,
                self.running.count()
            );
        }
        match tokio::fs::remove_dir_all(&self.workdir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::debug!("🧹 Sandbox {} torn down", self.id);
        Ok(())
    }
}
