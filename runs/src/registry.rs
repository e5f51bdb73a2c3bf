//! Tracking of scripted fire-and-forget runs.
//!
//! A binding starts a long-running loop (an HTTP accept loop, a watcher)
//! from one scripted call; the host must be able to cancel it by id and must
//! join every run before exiting. Script code keeps only the integer id.
//!
//! The registry is an explicitly constructed value with a single owner: the
//! host builds one at startup, hands it (usually `Arc`-wrapped) to each
//! binding installer, and calls [`RunRegistry::shutdown`] once at exit.

use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, warn};

use moor_registry::{HandleId, Registry, RegistryError};

use crate::{CancelToken, RunSettings, SpawnError, ThreadHandle};

/// Id of a tracked background run. Runs live in a [`Registry`], so their ids
/// are ordinary registry handles.
pub type RunId = HandleId;

#[derive(Debug, Error)]
pub enum RunError {
    /// Shutdown has begun; the registry no longer accepts new runs.
    #[error("run registry is shut down; no new runs may start")]
    RegistryClosed,
    /// The configured cap on tracked runs was hit.
    #[error("too many live runs (limit {limit})")]
    TooManyRuns { limit: usize },
    /// The run slot could not be stored.
    #[error("failed to track run")]
    Slot(#[from] RegistryError),
    /// The OS thread could not be created.
    #[error("failed to start run thread")]
    Spawn(#[from] SpawnError),
}

/// `Open` accepts runs; `Draining` and `Closed` reject them. Shutdown flips
/// `Open -> Draining` before joining and `Draining -> Closed` after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunPhase {
    Open,
    Draining,
    Closed,
}

struct RunSlot {
    /// `None` only inside `run` between slot reservation and spawn.
    handle: Option<ThreadHandle<()>>,
}

/// Tracks every background run so the host can cancel by id and join all of
/// them at shutdown.
pub struct RunRegistry {
    phase: Mutex<RunPhase>,
    slots: Registry<RunSlot>,
    settings: RunSettings,
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RunRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::with_settings(RunSettings::default())
    }

    #[must_use]
    pub fn with_settings(settings: RunSettings) -> Self {
        Self {
            phase: Mutex::new(RunPhase::Open),
            slots: Registry::new(),
            settings,
        }
    }

    fn lock_phase(&self) -> MutexGuard<'_, RunPhase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a background run.
    ///
    /// The entry function receives the run's [`CancelToken`] and should poll
    /// it at its safe points. Whatever argument the run needs travels in the
    /// closure's captures.
    ///
    /// The phase gate is held across slot insertion, so a concurrent
    /// [`shutdown`](Self::shutdown) either rejects this call or is
    /// guaranteed to see (and join) the new run.
    pub fn run<F>(&self, f: F) -> Result<RunId, RunError>
    where
        F: FnOnce(CancelToken) + Send + 'static,
    {
        let phase = self.lock_phase();
        if *phase != RunPhase::Open {
            return Err(RunError::RegistryClosed);
        }

        if let Some(limit) = self.settings.max_live_runs() {
            if self.slots.len() >= limit.get() {
                return Err(RunError::TooManyRuns { limit: limit.get() });
            }
        }

        // Reserve the slot first so a storage failure cannot orphan a
        // spawned thread.
        let id = self.slots.insert(RunSlot { handle: None })?;
        let name = self.settings.thread_name(id);
        match ThreadHandle::spawn(Some(&name), f) {
            Ok(handle) => {
                self.slots.with_mut(id, |slot| slot.handle = Some(handle));
                drop(phase);
                debug!(run = %id, thread = %name, "run started");
                Ok(id)
            }
            Err(err) => {
                self.slots.remove(id);
                Err(RunError::Spawn(err))
            }
        }
    }

    /// Request cooperative cancellation of a run. The slot stays tracked
    /// until [`shutdown`](Self::shutdown) reaps it, exactly like a run that
    /// finishes on its own. Returns whether the id was live.
    pub fn cancel(&self, id: RunId) -> bool {
        let found = self
            .slots
            .with(id, |slot| {
                if let Some(handle) = &slot.handle {
                    handle.cancel();
                }
            })
            .is_some();
        if found {
            debug!(run = %id, "run cancellation requested");
        } else {
            debug!(run = %id, "cancel requested for unknown run id");
        }
        found
    }

    /// Synchronous shutdown barrier: join every tracked run, then close the
    /// registry.
    ///
    /// Runs are joined sequentially in unspecified order; every id present
    /// when the drain starts is joined and removed before this returns. A
    /// cancel racing a natural completion is indistinguishable here, and
    /// harmless: the join succeeds either way. Calling `shutdown` again is a
    /// no-op; calling [`run`](Self::run) afterwards fails with
    /// [`RunError::RegistryClosed`].
    pub fn shutdown(&self) {
        {
            let mut phase = self.lock_phase();
            if *phase != RunPhase::Open {
                let phase = *phase;
                debug!(?phase, "shutdown requested again; ignoring");
                return;
            }
            *phase = RunPhase::Draining;
        }

        let live = self.slots.len();
        if live > 0 {
            debug!(live, "draining background runs");
        }

        while let Some(id) = self.slots.any_id() {
            let Some(slot) = self.slots.remove(id) else {
                continue;
            };
            let Some(handle) = slot.handle else {
                continue;
            };
            match handle.join() {
                Ok(()) => debug!(run = %id, "run joined"),
                Err(err) => warn!(run = %id, error = %err, "run terminated abnormally"),
            }
        }

        *self.lock_phase() = RunPhase::Closed;
        debug!("run registry closed");
    }

    /// Number of tracked runs, including runs that already finished but
    /// have not been reaped by shutdown.
    #[must_use]
    pub fn live(&self) -> usize {
        self.slots.len()
    }

    /// Whether shutdown has begun. New runs are rejected from that point on.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        *self.lock_phase() != RunPhase::Open
    }
}
