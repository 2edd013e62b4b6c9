/// Piece dependency installation
///
/// The installer is the external capability that turns "this piece set" into
/// executable action sources inside one sandbox. Two implementations:
/// - `FsPieceInstaller`: reads `<pieces_dir>/<piece>/<version>/<action>.lua`
/// - `CatalogInstaller`: in-memory catalogue for development and tests

use crate::error::{Result, WorkerError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

/// Set of pieces (name → version) a flow version depends on
///
/// Ordered map so two equal sets always produce the same fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PieceSet {
    pieces: BTreeMap<String, String>,
}

impl PieceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, piece: impl Into<String>, version: impl Into<String>) -> Self {
        self.pieces.insert(piece.into(), version.into());
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pieces.iter().map(|(name, version)| (name.as_str(), version.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    pub fn contains(&self, piece: &str) -> bool {
        self.pieces.contains_key(piece)
    }

    /// Stable identity of the set, e.g. "gmail@1.2.0,slack@0.9.1"
    pub fn fingerprint(&self) -> String {
        self.iter()
            .map(|(name, version)| format!("{}@{}", name, version))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for PieceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("<no pieces>")
        } else {
            f.write_str(&self.fingerprint())
        }
    }
}

/// Action sources installed into one sandbox, keyed "piece:action"
#[derive(Debug, Clone, Default)]
pub struct InstalledPieces {
    actions: HashMap<String, String>,
}

impl InstalledPieces {
    pub fn insert(&mut self, piece: &str, action: &str, source: String) {
        self.actions.insert(action_key(piece, action), source);
    }

    pub fn source(&self, piece: &str, action: &str) -> Option<&str> {
        self.actions.get(&action_key(piece, action)).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

pub fn action_key(piece: &str, action: &str) -> String {
    format!("{}:{}", piece, action)
}

/// Installs a piece set into a sandbox working directory
#[async_trait]
pub trait PieceInstaller: Send + Sync {
    async fn install(&self, sandbox_id: Uuid, workdir: &Path, piece_set: &PieceSet) -> Result<InstalledPieces>;
}

/// Filesystem piece catalogue
///
/// Copies each action file into `<workdir>/<piece>/` so the sandbox owns its
/// own copy, and returns the sources.
#[derive(Debug, Clone)]
pub struct FsPieceInstaller {
    pieces_dir: PathBuf,
}

impl FsPieceInstaller {
    pub fn new(pieces_dir: impl Into<PathBuf>) -> Self {
        Self {
            pieces_dir: pieces_dir.into(),
        }
    }
}

#[async_trait]
impl PieceInstaller for FsPieceInstaller {
    async fn install(&self, sandbox_id: Uuid, workdir: &Path, piece_set: &PieceSet) -> Result<InstalledPieces> {
        let mut installed = InstalledPieces::default();

        for (piece, version) in piece_set.iter() {
            let source_dir = self.pieces_dir.join(piece).join(version);
            let mut entries = tokio::fs::read_dir(&source_dir).await.map_err(|e| WorkerError::InstallFailed {
                sandbox_id,
                reason: format!("piece {}@{} not found at {}: {}", piece, version, source_dir.display(), e),
            })?;

            let target_dir = workdir.join(piece);
            tokio::fs::create_dir_all(&target_dir).await?;

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some("lua") {
                    continue;
                }
                let Some(action) = path.file_stem().and_then(|stem| stem.to_str()) else {
                    continue;
                };

                let source = tokio::fs::read_to_string(&path).await?;
                tokio::fs::write(target_dir.join(format!("{}.lua", action)), &source).await?;
                tracing::debug!("📦 Installed {}:{} ({}) into sandbox {}", piece, action, version, sandbox_id);
                installed.insert(piece, action, source);
            }
        }

        tracing::info!("📦 Installed {} actions for [{}] into sandbox {}", installed.len(), piece_set, sandbox_id);
        Ok(installed)
    }
}

/// In-memory piece catalogue: (piece, version) → action → source
#[derive(Debug, Default)]
pub struct CatalogInstaller {
    catalog: HashMap<(String, String), HashMap<String, String>>,
    installs: AtomicUsize,
}

impl CatalogInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one action source for a piece version
    pub fn with_action(
        mut self,
        piece: impl Into<String>,
        version: impl Into<String>,
        action: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        self.catalog
            .entry((piece.into(), version.into()))
            .or_default()
            .insert(action.into(), source.into());
        self
    }

    /// Number of install() calls served so far
    pub fn install_count(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PieceInstaller for CatalogInstaller {
    async fn install(&self, sandbox_id: Uuid, _workdir: &Path, piece_set: &PieceSet) -> Result<InstalledPieces> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        let mut installed = InstalledPieces::default();

        for (piece, version) in piece_set.iter() {
            let actions = self
                .catalog
                .get(&(piece.to_string(), version.to_string()))
                .ok_or_else(|| WorkerError::InstallFailed {
                    sandbox_id,
                    reason: format!("piece {}@{} is not in the catalogue", piece, version),
                })?;
            for (action, source) in actions {
                installed.insert(piece, action, source.clone());
            }
        }

        Ok(installed)
    }
}
