/// Process-local sandbox pool
///
/// Sandboxes are reused across jobs that share a piece set so the install
/// cost is paid once. A checked-out sandbox is owned by its borrower until it
/// is checked in, so one sandbox never serves two executions at once. When the
/// pool would exceed its capacity the least-recently-used idle sandbox is torn
/// down. A checked-out sandbox carries a `PoolTicket`; if its borrower is
/// aborted and the sandbox dropped, the ticket returns the reservation and
/// removes the working directory.

use crate::error::Result;
use crate::sandbox::installer::{PieceInstaller, PieceSet};
use crate::sandbox::instance::{Sandbox, SandboxLimits, SandboxState};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Snapshot of pool occupancy for monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub idle: usize,
    pub checked_out: usize,
    pub capacity: usize,
}

/// Checkout reservation travelling with a borrowed sandbox
#[derive(Debug)]
pub(crate) struct PoolTicket {
    checked_out: Arc<AtomicUsize>,
    workdir: PathBuf,
    returned: bool,
}

impl PoolTicket {
    /// Mark the sandbox as handed back through checkin/discard
    fn settle(mut self) {
        self.returned = true;
    }
}

impl Drop for PoolTicket {
    fn drop(&mut self) {
        self.checked_out.fetch_sub(1, Ordering::SeqCst);
        if self.returned {
            return;
        }
        tracing::warn!("⚠️ Sandbox at {} dropped while checked out, removing it", self.workdir.display());
        match std::fs::remove_dir_all(&self.workdir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("⚠️ Failed to remove {}: {}", self.workdir.display(), e),
        }
    }
}

#[derive(Debug, Default)]
struct PoolInner {
    idle: Vec<Sandbox>,
}

impl PoolInner {
    /// Pull LRU idle sandboxes until `incoming` more fit under `capacity`
    fn make_room(&mut self, capacity: usize, checked_out: usize, incoming: usize) -> Vec<Sandbox> {
        let mut evicted = Vec::new();
        while self.idle.len() + checked_out + incoming > capacity && !self.idle.is_empty() {
            let lru = self
                .idle
                .iter()
                .enumerate()
                .min_by_key(|(_, sandbox)| sandbox.last_used_at())
                .map(|(index, _)| index);
            match lru {
                Some(index) => evicted.push(self.idle.swap_remove(index)),
                None => break,
            }
        }
        evicted
    }
}

/// Pool of READY sandboxes keyed implicitly by piece set
pub struct SandboxPool {
    installer: Arc<dyn PieceInstaller>,
    root: PathBuf,
    limits: SandboxLimits,
    capacity: usize,
    inner: Mutex<PoolInner>,
    checked_out: Arc<AtomicUsize>,
}

impl SandboxPool {
    pub fn new(installer: Arc<dyn PieceInstaller>, root: impl Into<PathBuf>, limits: SandboxLimits, capacity: usize) -> Self {
        Self {
            installer,
            root: root.into(),
            limits,
            capacity: capacity.max(1),
            inner: Mutex::new(PoolInner::default()),
            checked_out: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Count one more checkout; the returned ticket gives it back when dropped
    fn reserve(&self, workdir: PathBuf) -> PoolTicket {
        self.checked_out.fetch_add(1, Ordering::SeqCst);
        PoolTicket {
            checked_out: Arc::clone(&self.checked_out),
            workdir,
            returned: false,
        }
    }

    fn checked_out(&self) -> usize {
        self.checked_out.load(Ordering::SeqCst)
    }

    /// Borrow a READY sandbox for `piece_set`
    ///
    /// Reuses the most recently used idle sandbox with the same piece set,
    /// otherwise provisions a new one (evicting LRU idle sandboxes of other
    /// sets to stay within capacity).
    pub async fn checkout(&self, piece_set: &PieceSet) -> Result<Sandbox> {
        let evicted = {
            let mut inner = self.inner.lock().await;

            let reusable = inner
                .idle
                .iter()
                .enumerate()
                .filter(|(_, sandbox)| sandbox.serves(piece_set))
                .max_by_key(|(_, sandbox)| sandbox.last_used_at())
                .map(|(index, _)| index);

            if let Some(index) = reusable {
                let mut sandbox = inner.idle.swap_remove(index);
                sandbox.attach_ticket(self.reserve(sandbox.workdir().to_path_buf()));
                tracing::debug!("♻️ Reusing sandbox {} for [{}]", sandbox.id(), piece_set);
                return Ok(sandbox);
            }

            let checked_out = self.checked_out();
            let evicted = inner.make_room(self.capacity, checked_out, 1);
            if inner.idle.len() + checked_out >= self.capacity {
                tracing::warn!(
                    "⚠️ Sandbox pool over capacity ({} checked out, capacity {})",
                    checked_out + 1,
                    self.capacity
                );
            }
            evicted
        };

        teardown_all(evicted).await;

        // Provisioning failures tear the sandbox down themselves
        let mut sandbox = self.provision(piece_set).await?;
        sandbox.attach_ticket(self.reserve(sandbox.workdir().to_path_buf()));
        Ok(sandbox)
    }

    /// Return a sandbox after use
    pub async fn checkin(&self, mut sandbox: Sandbox) {
        if sandbox.state() != SandboxState::Ready {
            self.discard(sandbox).await;
            return;
        }

        sandbox.touch();
        let evicted = {
            let mut inner = self.inner.lock().await;
            if let Some(ticket) = sandbox.take_ticket() {
                ticket.settle();
            }
            inner.idle.push(sandbox);
            inner.make_room(self.capacity, self.checked_out(), 0)
        };
        teardown_all(evicted).await;
    }

    /// Drop a checked-out sandbox instead of returning it
    pub async fn discard(&self, mut sandbox: Sandbox) {
        if let Some(ticket) = sandbox.take_ticket() {
            ticket.settle();
        }
        teardown_all(vec![sandbox]).await;
    }

    /// Pre-create idle sandboxes for the given piece sets
    pub async fn warm(&self, piece_sets: &[PieceSet]) -> Result<()> {
        for piece_set in piece_sets {
            let sandbox = self.provision(piece_set).await?;
            tracing::info!("🔥 Warmed sandbox {} for [{}]", sandbox.id(), piece_set);
            let evicted = {
                let mut inner = self.inner.lock().await;
                inner.idle.push(sandbox);
                inner.make_room(self.capacity, self.checked_out(), 0)
            };
            teardown_all(evicted).await;
        }
        Ok(())
    }

    /// Tear down every idle sandbox
    pub async fn shutdown(&self) {
        let idle = {
            let mut inner = self.inner.lock().await;
            std::mem::take(&mut inner.idle)
        };
        tracing::info!("🧹 Shutting down sandbox pool ({} idle)", idle.len());
        teardown_all(idle).await;
    }

    pub async fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().await;
        PoolStats {
            idle: inner.idle.len(),
            checked_out: self.checked_out(),
            capacity: self.capacity,
        }
    }

    /// CREATED → INITIALIZED → READY for a fresh sandbox
    async fn provision(&self, piece_set: &PieceSet) -> Result<Sandbox> {
        let mut sandbox = Sandbox::new(&self.root, self.limits.clone());
        tracing::info!("🏗️ Provisioning sandbox {} for [{}]", sandbox.id(), piece_set);

        let prepared = match sandbox.init().await {
            Ok(()) => sandbox.install(self.installer.as_ref(), piece_set).await,
            Err(e) => Err(e),
        };

        match prepared {
            Ok(()) => Ok(sandbox),
            Err(e) => {
                tracing::warn!("❌ Provisioning sandbox {} failed: {}", sandbox.id(), e);
                teardown_all(vec![sandbox]).await;
                Err(e)
            }
        }
    }
}

async fn teardown_all(sandboxes: Vec<Sandbox>) {
    for sandbox in sandboxes {
        let id = sandbox.id();
        if let Err(e) = sandbox.teardown().await {
            tracing::warn!("⚠️ Failed to tear down sandbox {}: {}", id, e);
        }
    }
}
