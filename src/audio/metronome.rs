use crossbeam::channel::{self, Receiver};
use log::{debug, error, info};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use super::error::Result;
use super::factory::ClickTrackFactory;
use super::io::ClickSource;
use super::output::AudioOutput;
use super::scheduler::{SchedulerEvent, SchedulerHandle, SessionChange, SessionHook};
use super::tempo::{HalfBeat, TempoConfig};
use super::tick::{Clock, TickSource};
use super::visual::{CallbackSlot, VisualSync, VisualSyncBridge};
use crate::settings::EngineSettings;

/// Keeps the tick run lined up with what the scheduler made audible.
#[derive(Clone)]
struct TickAnchor {
    ticks: Arc<Mutex<TickSource>>,
    sync: Arc<VisualSync>,
}

impl TickAnchor {
    fn apply(&self, change: SessionChange) {
        match change {
            SessionChange::Started { config, started_at } => self.restart(started_at, config),
            SessionChange::Silent { config, at } => self.restart(at, config),
            SessionChange::Stopped => self.halt(),
        }
    }

    fn restart(&self, started_at: Instant, config: TempoConfig) {
        let mut ticks = self.lock_ticks();
        self.sync.begin(ticks.next_generation());
        if let Err(e) = ticks.start(started_at, config) {
            error!("Could not start tick source: {}", e);
            self.sync.end();
        }
    }

    fn halt(&self) {
        self.lock_ticks().stop();
        self.sync.end();
    }

    fn lock_ticks(&self) -> MutexGuard<'_, TickSource> {
        self.ticks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The metronome engine as seen by a host: one call to say what should be
/// playing, one callback to hear about half-beats.
///
/// Audio and visuals run off the same `{beats, bpm}`. The scheduler debounces
/// and rebuilds the looped click track; the tick source counts half-beats
/// from the instant that loop reached the output, or from the failed attempt
/// when no loop could be started.
pub struct Metronome {
    // Drop order: scheduler (joins its thread and the hook's anchor), then
    // the anchor's tick source, then the bridge once its channel closes.
    scheduler: SchedulerHandle,
    anchor: TickAnchor,
    _bridge: VisualSyncBridge,
    callback: CallbackSlot,
    events: Receiver<SchedulerEvent>,
    settings: EngineSettings,
    playing: Option<TempoConfig>,
    muted: bool,
}

impl Metronome {
    /// `open_output` runs on the scheduler thread.
    pub fn new<F>(
        settings: EngineSettings,
        open_output: F,
        source: Arc<dyn ClickSource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self>
    where
        F: FnOnce() -> Box<dyn AudioOutput> + Send + 'static,
    {
        let (ticks, tick_events) = TickSource::new(Arc::clone(&clock), settings.poll_interval());
        let sync = Arc::new(VisualSync::new());
        let callback: CallbackSlot = Arc::new(Mutex::new(None));
        let bridge =
            VisualSyncBridge::spawn(tick_events, Arc::clone(&sync), Arc::clone(&callback))?;
        let anchor = TickAnchor {
            ticks: Arc::new(Mutex::new(ticks)),
            sync,
        };

        let hook_anchor = anchor.clone();
        let session_hook: SessionHook =
            Box::new(move |change: SessionChange| hook_anchor.apply(change));

        let (events_tx, events) = channel::bounded(256);
        let builder = Arc::new(ClickTrackFactory::new(source));
        let scheduler = SchedulerHandle::spawn(
            open_output,
            builder,
            clock,
            settings.debounce(),
            events_tx,
            session_hook,
        )?;
        scheduler.set_volume(settings.volume);

        Ok(Self {
            scheduler,
            anchor,
            _bridge: bridge,
            callback,
            events,
            settings,
            playing: None,
            muted: false,
        })
    }

    /// Say what should be playing. Redundant calls are no-ops; `play = false`
    /// stops even when the numbers are invalid.
    ///
    /// The half-beat count restarts once the new loop is audible, not when
    /// this returns.
    pub fn set_playback(
        &mut self,
        play: bool,
        beats_per_measure: u32,
        beats_per_minute: f64,
    ) -> Result<()> {
        if !play {
            self.stop();
            return Ok(());
        }

        let config = TempoConfig::new(beats_per_measure, beats_per_minute)?;
        if self.playing == Some(config) {
            return Ok(());
        }

        self.playing = Some(config);
        self.scheduler.set_desired(true, config);
        info!(
            "Metronome: {} beats @ {} bpm",
            beats_per_measure, beats_per_minute
        );
        Ok(())
    }

    pub fn stop(&mut self) {
        self.scheduler.stop();
        if self.playing.take().is_some() {
            self.anchor.halt();
            info!("Metronome stopped");
        }
    }

    /// Register the half-beat listener, replacing any previous one. Called on
    /// the bridge thread.
    pub fn on_half_beat<F>(&self, callback: F)
    where
        F: FnMut(HalfBeat) + Send + 'static,
    {
        let mut slot = self.callback.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(Box::new(callback));
    }

    pub fn set_muted(&mut self, muted: bool) {
        if self.muted == muted {
            return;
        }
        self.muted = muted;
        debug!("Muted: {}", muted);
        self.scheduler.set_volume(self.effective_volume());
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.settings.volume = volume.clamp(0.0, 1.0);
        self.scheduler.set_volume(self.effective_volume());
    }

    pub fn volume(&self) -> f32 {
        self.settings.volume
    }

    /// Navigation: show the first half-beat again. Timing is unaffected.
    pub fn skip(&self) {
        self.anchor.sync.reset();
    }

    pub fn current_half_beat(&self) -> HalfBeat {
        self.anchor.sync.current()
    }

    pub fn is_playing(&self) -> bool {
        self.playing.is_some()
    }

    /// The tempo currently requested, while playing.
    pub fn config(&self) -> Option<TempoConfig> {
        self.playing
    }

    /// What the audio side actually did: loops started, stopped, discarded,
    /// and build failures.
    pub fn events(&self) -> &Receiver<SchedulerEvent> {
        &self.events
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    fn effective_volume(&self) -> f32 {
        if self.muted { 0.0 } else { self.settings.volume }
    }
}

impl Drop for Metronome {
    fn drop(&mut self) {
        self.scheduler.stop();
        self.anchor.halt();
    }
}
