use crossbeam::channel::Receiver;
use log::{debug, warn};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use super::error::Result;
use super::tempo::HalfBeat;
use super::tick::TickEvent;

pub type HalfBeatCallback = Box<dyn FnMut(HalfBeat) + Send>;

/// Shared slot for the outbound callback; replaceable while running.
pub type CallbackSlot = Arc<Mutex<Option<HalfBeatCallback>>>;

#[derive(Debug, Default)]
struct SyncState {
    playing: bool,
    generation: u64,
    last_index: Option<u64>,
    visible: Option<HalfBeat>,
}

/// What the display should show, filtered to the current tick run.
#[derive(Debug, Default)]
pub struct VisualSync {
    state: Mutex<SyncState>,
}

impl VisualSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept events from `generation` onwards; older ones are dropped.
    pub fn begin(&self, generation: u64) {
        let mut state = self.lock();
        state.playing = true;
        state.generation = generation;
        state.last_index = None;
        state.visible = None;
    }

    pub fn end(&self) {
        let mut state = self.lock();
        state.playing = false;
        state.last_index = None;
        state.visible = None;
    }

    /// Show half-beat 0 again without touching the tick run.
    pub fn reset(&self) {
        self.lock().visible = None;
    }

    /// Half-beat 0 whenever nothing is playing.
    pub fn current(&self) -> HalfBeat {
        let state = self.lock();
        match state.visible {
            Some(half_beat) if state.playing => half_beat,
            _ => HalfBeat {
                index: 0,
                display: 0,
            },
        }
    }

    pub fn is_playing(&self) -> bool {
        self.lock().playing
    }

    /// Returns the half-beat to publish, if `event` is a new transition in
    /// the current run.
    pub fn observe(&self, event: &TickEvent) -> Option<HalfBeat> {
        let mut state = self.lock();
        if !state.playing || event.generation != state.generation {
            return None;
        }
        if state
            .last_index
            .is_some_and(|last| last >= event.half_beat.index)
        {
            return None;
        }
        state.last_index = Some(event.half_beat.index);
        state.visible = Some(event.half_beat);
        Some(event.half_beat)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drains tick events on a thread and calls the registered callback. Exits
/// when the tick source's sender goes away.
pub struct VisualSyncBridge {
    thread: Option<JoinHandle<()>>,
}

impl VisualSyncBridge {
    pub fn spawn(
        events: Receiver<TickEvent>,
        sync: Arc<VisualSync>,
        callback: CallbackSlot,
    ) -> Result<Self> {
        let thread = thread::Builder::new()
            .name("metronome-visual".to_string())
            .spawn(move || {
                for event in events.iter() {
                    let Some(half_beat) = sync.observe(&event) else {
                        continue;
                    };
                    let mut slot = callback.lock().unwrap_or_else(PoisonError::into_inner);
                    if let Some(callback) = slot.as_mut() {
                        callback(half_beat);
                    }
                }
                debug!("Visual sync bridge exiting");
            })?;

        Ok(Self {
            thread: Some(thread),
        })
    }
}

impl Drop for VisualSyncBridge {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("Visual sync thread panicked");
        }
    }
}
