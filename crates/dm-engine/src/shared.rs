//! Lock-guarded engine handle shared by the heartbeat and audio threads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::command::{Command, CommandOutput};
use crate::engine::Engine;
use crate::error::EngineError;
use crate::host::SoundProvider;

/// One mutex around the whole engine, plus a flag that drops a heartbeat
/// fired while the previous one is still running.
pub struct SharedEngine<P: SoundProvider> {
    engine: Arc<Mutex<Engine<P>>>,
    in_heartbeat: Arc<AtomicBool>,
}

impl<P: SoundProvider> Clone for SharedEngine<P> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            in_heartbeat: Arc::clone(&self.in_heartbeat),
        }
    }
}

impl<P: SoundProvider> SharedEngine<P> {
    pub fn new(engine: Engine<P>) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
            in_heartbeat: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Exclusive access. A panic on another thread does not lock the
    /// engine out; its state is used as left.
    pub fn lock(&self) -> MutexGuard<'_, Engine<P>> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one engine tick. Returns false when the tick was dropped
    /// because another heartbeat is in progress.
    pub fn heartbeat(&self) -> bool {
        if self.in_heartbeat.swap(true, Ordering::Acquire) {
            trace!("heartbeat re-entered, tick dropped");
            return false;
        }
        self.lock().tick();
        self.in_heartbeat.store(false, Ordering::Release);
        true
    }

    pub fn render(&self, out: &mut [u8]) -> usize {
        self.lock().render(out)
    }

    pub fn execute(&self, command: Command) -> Result<CommandOutput, EngineError> {
        self.lock().execute(command)
    }
}
