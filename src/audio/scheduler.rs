use crossbeam::channel::{self, Receiver, Sender, select};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::click_track::ClickTrackBuffer;
use super::error::{MetronomeError, Result};
use super::factory::{CancellationToken, TrackBuilder};
use super::output::{AudioOutput, SourceId};
use super::tempo::TempoConfig;
use super::tick::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    /// Nothing audible yet; waiting for the first track.
    Building,
    Playing,
    /// A loop is playing while its successor is debounced or being built.
    Replacing,
}

/// Notifications about what actually reached (or didn't reach) the speakers.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    Started(TempoConfig),
    Stopped,
    Discarded(TempoConfig),
    Error(String),
}

/// A build the driver should run off-thread.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub id: u64,
    pub config: TempoConfig,
    pub sample_rate: u32,
    pub token: CancellationToken,
}

#[derive(Debug)]
struct PendingBuild {
    id: u64,
    config: TempoConfig,
    token: CancellationToken,
    /// Debounce deadline; `None` once the build has been handed out.
    not_before: Option<Instant>,
}

/// When the click actually changed, in the scheduler clock's time base.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionChange {
    /// A loop went out to the output at `started_at`.
    Started {
        config: TempoConfig,
        started_at: Instant,
    },
    /// Nothing could be made audible for `config`. Timing should go ahead
    /// from `at` anyway.
    Silent { config: TempoConfig, at: Instant },
    Stopped,
}

/// Called on the scheduler thread for every [`SessionChange`].
pub type SessionHook = Box<dyn FnMut(SessionChange) + Send>;

#[derive(Debug, Clone, Copy)]
pub struct PlaybackSession {
    pub config: TempoConfig,
    pub source: SourceId,
    pub started_at: Instant,
}

/// Playback state machine. Owns the output and at most one session.
///
/// Pure with respect to threads: builds are returned as [`BuildRequest`]s and
/// their results fed back through [`complete_build`](Self::complete_build),
/// so the same logic runs under the threaded driver and in tests.
pub struct PlaybackScheduler {
    output: Box<dyn AudioOutput>,
    clock: Arc<dyn Clock>,
    session_hook: Option<SessionHook>,
    state: SchedulerState,
    session: Option<PlaybackSession>,
    pending: Option<PendingBuild>,
    debounce: Duration,
    next_build_id: u64,
    builds_started: u64,
    events: Sender<SchedulerEvent>,
}

impl PlaybackScheduler {
    pub fn new(
        output: Box<dyn AudioOutput>,
        clock: Arc<dyn Clock>,
        debounce: Duration,
        events: Sender<SchedulerEvent>,
    ) -> Self {
        Self {
            output,
            clock,
            session_hook: None,
            state: SchedulerState::Idle,
            session: None,
            pending: None,
            debounce,
            next_build_id: 0,
            builds_started: 0,
            events,
        }
    }

    pub fn set_session_hook(&mut self, hook: SessionHook) {
        self.session_hook = Some(hook);
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn session(&self) -> Option<&PlaybackSession> {
        self.session.as_ref()
    }

    /// Builds actually handed out to run; debounced ones that were
    /// superseded never count.
    pub fn builds_started(&self) -> u64 {
        self.builds_started
    }

    pub fn output_name(&self) -> &str {
        self.output.name()
    }

    /// The single entry point for play/tempo changes. Returns a build to run
    /// when one must start right away.
    pub fn set_desired(
        &mut self,
        play: bool,
        config: TempoConfig,
        now: Instant,
    ) -> Option<BuildRequest> {
        if !play {
            self.stop();
            return None;
        }

        match self.state {
            SchedulerState::Idle => Some(self.begin_build(config, None)),
            SchedulerState::Building => {
                if self.pending.as_ref().is_some_and(|p| p.config == config) {
                    return None;
                }
                // Nothing audible to protect: rebuild right away.
                self.cancel_pending();
                Some(self.begin_build(config, None))
            }
            SchedulerState::Playing => {
                if self.session.as_ref().is_some_and(|s| s.config == config) {
                    return None;
                }
                self.schedule_replacement(config, now);
                None
            }
            SchedulerState::Replacing => {
                if self.session.as_ref().is_some_and(|s| s.config == config) {
                    self.cancel_pending();
                    self.state = SchedulerState::Playing;
                    return None;
                }
                if self.pending.as_ref().is_some_and(|p| p.config == config) {
                    return None;
                }
                self.cancel_pending();
                self.schedule_replacement(config, now);
                None
            }
        }
    }

    /// Silence immediately and drop any in-flight or debounced build.
    pub fn stop(&mut self) {
        self.cancel_pending();
        if let Some(session) = self.session.take() {
            self.output.stop(session.source);
            info!(
                "Stopped click track ({} beats @ {} bpm)",
                session.config.beats_per_measure(),
                session.config.beats_per_minute()
            );
            self.emit(SchedulerEvent::Stopped);
        }
        self.state = SchedulerState::Idle;
        self.notify(SessionChange::Stopped);
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.output.set_volume(volume);
    }

    /// When the debounced replacement becomes due.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.as_ref().and_then(|p| p.not_before)
    }

    /// Hand out the debounced build once its quiet period has passed.
    pub fn poll_debounce(&mut self, now: Instant) -> Option<BuildRequest> {
        let pending = self.pending.as_mut()?;
        match pending.not_before {
            Some(deadline) if deadline <= now => {
                pending.not_before = None;
                self.builds_started += 1;
                Some(BuildRequest {
                    id: pending.id,
                    config: pending.config,
                    sample_rate: self.output.sample_rate(),
                    token: pending.token.clone(),
                })
            }
            _ => None,
        }
    }

    /// Feed back a finished build. Only the current, uncanceled build is ever
    /// connected; anything else is discarded.
    pub fn complete_build(&mut self, id: u64, result: Result<Arc<ClickTrackBuffer>>) {
        let is_current = self
            .pending
            .as_ref()
            .is_some_and(|p| p.id == id && p.not_before.is_none() && !p.token.is_canceled());

        if !is_current {
            match &result {
                Ok(track) => {
                    debug!("Discarding superseded build #{}", id);
                    self.emit(SchedulerEvent::Discarded(track.config));
                }
                Err(e) => debug!("Superseded build #{} ended with: {}", id, e),
            }
            return;
        }

        let Some(pending) = self.pending.take() else {
            return;
        };

        match result {
            Ok(track) => self.connect(pending.config, track),
            Err(MetronomeError::BuildCanceled) => {
                debug!("Build #{} canceled", id);
                self.settle();
            }
            Err(e) => {
                error!("Click track build failed: {}", e);
                self.emit(SchedulerEvent::Error(e.to_string()));
                self.settle();
                if self.session.is_none() {
                    self.go_silent(pending.config);
                }
            }
        }
    }

    fn connect(&mut self, config: TempoConfig, track: Arc<ClickTrackBuffer>) {
        // Old loop out before the new one goes in; the device applies both in
        // one callback so there is no audible gap.
        if let Some(previous) = self.session.take() {
            self.output.stop(previous.source);
        }

        match self.output.start_loop(track) {
            Ok(source) => {
                let session = PlaybackSession {
                    config,
                    source,
                    started_at: self.clock.now(),
                };
                self.session = Some(session);
                self.state = SchedulerState::Playing;
                self.notify(SessionChange::Started {
                    config: session.config,
                    started_at: session.started_at,
                });
                info!(
                    "Playing click track ({} beats @ {} bpm) on {}",
                    config.beats_per_measure(),
                    config.beats_per_minute(),
                    self.output.name()
                );
                self.emit(SchedulerEvent::Started(config));
            }
            Err(e) => {
                warn!("Could not start click track: {}", e);
                self.emit(SchedulerEvent::Error(e.to_string()));
                self.state = SchedulerState::Idle;
                self.go_silent(config);
            }
        }
    }

    fn go_silent(&mut self, config: TempoConfig) {
        debug!(
            "No audio for {} beats @ {} bpm; timing runs silently",
            config.beats_per_measure(),
            config.beats_per_minute()
        );
        let at = self.clock.now();
        self.notify(SessionChange::Silent { config, at });
    }

    fn notify(&mut self, change: SessionChange) {
        if let Some(hook) = self.session_hook.as_mut() {
            hook(change);
        }
    }

    fn begin_build(&mut self, config: TempoConfig, not_before: Option<Instant>) -> BuildRequest {
        self.next_build_id += 1;
        let token = CancellationToken::new();
        self.pending = Some(PendingBuild {
            id: self.next_build_id,
            config,
            token: token.clone(),
            not_before,
        });
        if self.session.is_none() {
            self.state = SchedulerState::Building;
        }
        if not_before.is_none() {
            self.builds_started += 1;
        }

        BuildRequest {
            id: self.next_build_id,
            config,
            sample_rate: self.output.sample_rate(),
            token,
        }
    }

    fn schedule_replacement(&mut self, config: TempoConfig, now: Instant) {
        self.begin_build(config, Some(now + self.debounce));
        self.state = SchedulerState::Replacing;
    }

    fn cancel_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.token.cancel();
            debug!("Canceled build #{}", pending.id);
        }
    }

    /// State after a build ended without producing a new session.
    fn settle(&mut self) {
        self.state = if self.session.is_some() {
            SchedulerState::Playing
        } else {
            SchedulerState::Idle
        };
    }

    fn emit(&self, event: SchedulerEvent) {
        let _ = self.events.try_send(event);
    }
}

#[derive(Debug)]
pub enum SchedulerCommand {
    SetDesired { play: bool, config: TempoConfig },
    Stop,
    SetVolume(f32),
    Shutdown,
}

struct BuildDone {
    id: u64,
    result: Result<Arc<ClickTrackBuffer>>,
}

/// Runs a [`PlaybackScheduler`] on its own thread. Dropping the handle stops
/// playback and joins the thread.
pub struct SchedulerHandle {
    commands: Sender<SchedulerCommand>,
    thread: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// `open_output` runs on the scheduler thread, since device streams may
    /// not be movable between threads. So does `session_hook`.
    pub fn spawn<F>(
        open_output: F,
        builder: Arc<dyn TrackBuilder>,
        clock: Arc<dyn Clock>,
        debounce: Duration,
        events: Sender<SchedulerEvent>,
        session_hook: SessionHook,
    ) -> Result<Self>
    where
        F: FnOnce() -> Box<dyn AudioOutput> + Send + 'static,
    {
        let (commands, command_rx) = channel::unbounded();
        let thread = thread::Builder::new()
            .name("metronome-scheduler".to_string())
            .spawn(move || {
                let mut scheduler = PlaybackScheduler::new(open_output(), clock, debounce, events);
                scheduler.set_session_hook(session_hook);
                run_scheduler(scheduler, command_rx, builder);
            })?;

        Ok(Self {
            commands,
            thread: Some(thread),
        })
    }

    pub fn set_desired(&self, play: bool, config: TempoConfig) {
        self.send(SchedulerCommand::SetDesired { play, config });
    }

    pub fn stop(&self) {
        self.send(SchedulerCommand::Stop);
    }

    pub fn set_volume(&self, volume: f32) {
        self.send(SchedulerCommand::SetVolume(volume));
    }

    fn send(&self, command: SchedulerCommand) {
        if self.commands.send(command).is_err() {
            warn!("Scheduler thread is gone; command dropped");
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        let _ = self.commands.send(SchedulerCommand::Shutdown);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            error!("Scheduler thread panicked");
        }
    }
}

fn run_scheduler(
    mut scheduler: PlaybackScheduler,
    commands: Receiver<SchedulerCommand>,
    builder: Arc<dyn TrackBuilder>,
) {
    let (done_tx, done_rx) = channel::unbounded::<BuildDone>();

    loop {
        let debounce = scheduler
            .next_deadline()
            .map(channel::at)
            .unwrap_or_else(channel::never);

        select! {
            recv(commands) -> command => match command {
                Ok(SchedulerCommand::SetDesired { play, config }) => {
                    if let Some(request) = scheduler.set_desired(play, config, Instant::now()) {
                        spawn_build(&mut scheduler, &builder, request, &done_tx);
                    }
                }
                Ok(SchedulerCommand::Stop) => scheduler.stop(),
                Ok(SchedulerCommand::SetVolume(volume)) => scheduler.set_volume(volume),
                Ok(SchedulerCommand::Shutdown) | Err(_) => break,
            },
            recv(done_rx) -> done => {
                if let Ok(done) = done {
                    scheduler.complete_build(done.id, done.result);
                }
            }
            recv(debounce) -> _ => {
                if let Some(request) = scheduler.poll_debounce(Instant::now()) {
                    spawn_build(&mut scheduler, &builder, request, &done_tx);
                }
            }
        }
    }

    scheduler.stop();
    debug!("Scheduler thread exiting");
}

fn spawn_build(
    scheduler: &mut PlaybackScheduler,
    builder: &Arc<dyn TrackBuilder>,
    request: BuildRequest,
    done: &Sender<BuildDone>,
) {
    let builder = Arc::clone(builder);
    let done = done.clone();
    let id = request.id;

    let spawned = thread::Builder::new()
        .name("click-build".to_string())
        .spawn(move || {
            let result = builder.build(request.config, request.sample_rate, &request.token);
            let _ = done.send(BuildDone { id, result });
        });

    if let Err(e) = spawned {
        scheduler.complete_build(id, Err(MetronomeError::Io(e)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::tick::{ManualClock, SystemClock};
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct OutputLog {
        started: Vec<(SourceId, TempoConfig)>,
        stopped: Vec<SourceId>,
        active: Vec<SourceId>,
        max_active: usize,
    }

    struct RecordingOutput {
        log: Arc<Mutex<OutputLog>>,
        next_id: u64,
    }

    impl RecordingOutput {
        fn new() -> (Self, Arc<Mutex<OutputLog>>) {
            let log = Arc::new(Mutex::new(OutputLog::default()));
            (
                Self {
                    log: Arc::clone(&log),
                    next_id: 0,
                },
                log,
            )
        }
    }

    impl AudioOutput for RecordingOutput {
        fn sample_rate(&self) -> u32 {
            8000
        }

        fn start_loop(&mut self, track: Arc<ClickTrackBuffer>) -> Result<SourceId> {
            self.next_id += 1;
            let id = SourceId(self.next_id);
            let mut log = self.log.lock().unwrap();
            log.started.push((id, track.config));
            log.active.push(id);
            log.max_active = log.max_active.max(log.active.len());
            Ok(id)
        }

        fn stop(&mut self, source: SourceId) {
            let mut log = self.log.lock().unwrap();
            log.stopped.push(source);
            log.active.retain(|id| *id != source);
        }

        fn set_volume(&mut self, _volume: f32) {}

        fn name(&self) -> &str {
            "recording"
        }
    }

    fn track(config: TempoConfig) -> Result<Arc<ClickTrackBuffer>> {
        Ok(Arc::new(ClickTrackBuffer {
            config,
            sample_rate: 8000,
            channels: vec![vec![0.0; 16]],
        }))
    }

    fn tempo(beats: u32, bpm: f64) -> TempoConfig {
        TempoConfig::new(beats, bpm).unwrap()
    }

    fn scheduler() -> (PlaybackScheduler, Arc<Mutex<OutputLog>>, Receiver<SchedulerEvent>) {
        let (output, log) = RecordingOutput::new();
        let (events_tx, events_rx) = channel::unbounded();
        let scheduler = PlaybackScheduler::new(
            Box::new(output),
            Arc::new(SystemClock),
            Duration::from_millis(300),
            events_tx,
        );
        (scheduler, log, events_rx)
    }

    fn record_sessions(scheduler: &mut PlaybackScheduler) -> Arc<Mutex<Vec<SessionChange>>> {
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changes);
        scheduler.set_session_hook(Box::new(move |change: SessionChange| {
            sink.lock().unwrap().push(change);
        }));
        changes
    }

    fn start_playing(scheduler: &mut PlaybackScheduler, config: TempoConfig, now: Instant) {
        let request = scheduler.set_desired(true, config, now).unwrap();
        scheduler.complete_build(request.id, track(request.config));
        assert_eq!(scheduler.state(), SchedulerState::Playing);
    }

    #[test]
    fn test_idle_play_builds_immediately() {
        let (mut scheduler, log, events) = scheduler();
        let now = Instant::now();

        let request = scheduler.set_desired(true, tempo(4, 120.0), now).unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Building);
        assert_eq!(request.sample_rate, 8000);
        assert!(log.lock().unwrap().started.is_empty());

        scheduler.complete_build(request.id, track(request.config));
        assert_eq!(scheduler.state(), SchedulerState::Playing);
        assert_eq!(log.lock().unwrap().active.len(), 1);
        assert_eq!(events.try_recv(), Ok(SchedulerEvent::Started(tempo(4, 120.0))));
    }

    #[test]
    fn test_identical_request_is_noop() {
        let (mut scheduler, _log, _events) = scheduler();
        let now = Instant::now();

        let request = scheduler.set_desired(true, tempo(4, 120.0), now).unwrap();
        assert!(scheduler.set_desired(true, tempo(4, 120.0), now).is_none());
        scheduler.complete_build(request.id, track(request.config));

        assert!(scheduler.set_desired(true, tempo(4, 120.0), now).is_none());
        assert_eq!(scheduler.state(), SchedulerState::Playing);
        assert_eq!(scheduler.builds_started(), 1);
    }

    #[test]
    fn test_rapid_changes_while_playing_are_debounced() {
        let (mut scheduler, log, _events) = scheduler();
        let now = Instant::now();
        start_playing(&mut scheduler, tempo(4, 120.0), now);

        let t1 = now + Duration::from_millis(10);
        let t2 = now + Duration::from_millis(20);
        assert!(scheduler.set_desired(true, tempo(4, 180.0), t1).is_none());
        assert!(scheduler.set_desired(true, tempo(4, 240.0), t2).is_none());
        assert_eq!(scheduler.state(), SchedulerState::Replacing);

        // Quiet period counts from the last change.
        assert_eq!(scheduler.next_deadline(), Some(t2 + Duration::from_millis(300)));
        assert!(scheduler.poll_debounce(t1 + Duration::from_millis(300)).is_none());

        let request = scheduler
            .poll_debounce(t2 + Duration::from_millis(300))
            .unwrap();
        assert_eq!(request.config, tempo(4, 240.0));
        scheduler.complete_build(request.id, track(request.config));

        let log = log.lock().unwrap();
        assert_eq!(log.active.len(), 1);
        assert_eq!(log.max_active, 1);
        let active = log.active[0];
        let (_, config) = log.started.iter().find(|(id, _)| *id == active).unwrap();
        assert_eq!(*config, tempo(4, 240.0));
        assert_eq!(log.started.len(), 2);
        // One build for the start, one for the settled change.
        assert_eq!(scheduler.builds_started(), 2);
    }

    #[test]
    fn test_rapid_changes_before_first_build_keep_last() {
        let (mut scheduler, log, events) = scheduler();
        let now = Instant::now();

        let r120 = scheduler.set_desired(true, tempo(4, 120.0), now).unwrap();
        let r180 = scheduler.set_desired(true, tempo(4, 180.0), now).unwrap();
        let r240 = scheduler.set_desired(true, tempo(4, 240.0), now).unwrap();
        assert!(r120.token.is_canceled());
        assert!(r180.token.is_canceled());
        assert!(!r240.token.is_canceled());

        // Results arrive out of order; stale ones must never be connected.
        scheduler.complete_build(r240.id, track(r240.config));
        scheduler.complete_build(r120.id, track(r120.config));
        scheduler.complete_build(r180.id, track(r180.config));

        let log = log.lock().unwrap();
        assert_eq!(log.started.len(), 1);
        assert_eq!(log.started[0].1, tempo(4, 240.0));
        assert_eq!(log.max_active, 1);

        let discarded = events
            .try_iter()
            .filter(|e| matches!(e, SchedulerEvent::Discarded(_)))
            .count();
        assert_eq!(discarded, 2);
    }

    #[test]
    fn test_stop_before_build_completes_is_silent() {
        let (mut scheduler, log, _events) = scheduler();
        let now = Instant::now();

        let request = scheduler.set_desired(true, tempo(3, 90.0), now).unwrap();
        scheduler.set_desired(false, tempo(3, 90.0), now);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert!(request.token.is_canceled());

        scheduler.complete_build(request.id, track(request.config));
        assert!(log.lock().unwrap().started.is_empty());
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[test]
    fn test_stop_silences_immediately_during_replacement() {
        let (mut scheduler, log, events) = scheduler();
        let now = Instant::now();
        start_playing(&mut scheduler, tempo(4, 120.0), now);

        scheduler.set_desired(true, tempo(4, 200.0), now);
        let request = scheduler
            .poll_debounce(now + Duration::from_millis(300))
            .unwrap();
        scheduler.stop();

        assert!(log.lock().unwrap().active.is_empty());
        assert_eq!(scheduler.next_deadline(), None);

        scheduler.complete_build(request.id, track(request.config));
        assert!(log.lock().unwrap().active.is_empty());
        assert!(events.try_iter().any(|e| e == SchedulerEvent::Stopped));
    }

    #[test]
    fn test_returning_to_playing_config_cancels_replacement() {
        let (mut scheduler, _log, _events) = scheduler();
        let now = Instant::now();
        start_playing(&mut scheduler, tempo(4, 120.0), now);

        scheduler.set_desired(true, tempo(4, 130.0), now);
        assert_eq!(scheduler.state(), SchedulerState::Replacing);
        scheduler.set_desired(true, tempo(4, 120.0), now);
        assert_eq!(scheduler.state(), SchedulerState::Playing);
        assert_eq!(scheduler.next_deadline(), None);
    }

    #[test]
    fn test_failed_replacement_keeps_old_loop() {
        let (mut scheduler, log, events) = scheduler();
        let now = Instant::now();
        start_playing(&mut scheduler, tempo(4, 120.0), now);

        scheduler.set_desired(true, tempo(5, 120.0), now);
        let request = scheduler
            .poll_debounce(now + Duration::from_millis(300))
            .unwrap();
        scheduler.complete_build(
            request.id,
            Err(MetronomeError::IncompatibleAudioFormat("test".to_string())),
        );

        assert_eq!(scheduler.state(), SchedulerState::Playing);
        assert_eq!(scheduler.session().unwrap().config, tempo(4, 120.0));
        assert_eq!(log.lock().unwrap().active.len(), 1);
        assert!(events.try_iter().any(|e| matches!(e, SchedulerEvent::Error(_))));
    }

    #[test]
    fn test_session_start_reported_when_audible() {
        let (output, _log) = RecordingOutput::new();
        let (events_tx, _events) = channel::unbounded();
        let clock = Arc::new(ManualClock::new());
        let mut scheduler = PlaybackScheduler::new(
            Box::new(output),
            clock.clone(),
            Duration::from_millis(300),
            events_tx,
        );
        let changes = record_sessions(&mut scheduler);
        let now = Instant::now();

        let request = scheduler.set_desired(true, tempo(4, 120.0), now).unwrap();
        clock.advance(Duration::from_millis(40));
        assert!(changes.lock().unwrap().is_empty());
        scheduler.complete_build(request.id, track(request.config));

        let started_at = scheduler.session().unwrap().started_at;
        assert_eq!(started_at, clock.now());
        assert_eq!(
            changes.lock().unwrap().as_slice(),
            &[SessionChange::Started {
                config: tempo(4, 120.0),
                started_at
            }]
        );

        // The old loop keeps its start until the replacement is connected.
        scheduler.set_desired(true, tempo(4, 180.0), now);
        clock.advance(Duration::from_millis(300));
        let request = scheduler
            .poll_debounce(now + Duration::from_millis(300))
            .unwrap();
        assert_eq!(changes.lock().unwrap().len(), 1);

        clock.advance(Duration::from_millis(15));
        scheduler.complete_build(request.id, track(request.config));
        assert_eq!(
            changes.lock().unwrap().last(),
            Some(&SessionChange::Started {
                config: tempo(4, 180.0),
                started_at: clock.now()
            })
        );
    }

    #[test]
    fn test_failed_first_build_runs_silently() {
        let (mut scheduler, log, _events) = scheduler();
        let changes = record_sessions(&mut scheduler);

        let request = scheduler
            .set_desired(true, tempo(7, 100.0), Instant::now())
            .unwrap();
        scheduler.complete_build(
            request.id,
            Err(MetronomeError::IncompatibleAudioFormat("test".to_string())),
        );

        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert!(log.lock().unwrap().started.is_empty());
        let changes = changes.lock().unwrap();
        assert_eq!(changes.len(), 1);
        assert!(matches!(
            changes[0],
            SessionChange::Silent { config, .. } if config == tempo(7, 100.0)
        ));
    }

    #[test]
    fn test_failed_replacement_keeps_session_timing() {
        let (mut scheduler, _log, _events) = scheduler();
        let now = Instant::now();
        start_playing(&mut scheduler, tempo(4, 120.0), now);
        let changes = record_sessions(&mut scheduler);

        scheduler.set_desired(true, tempo(6, 120.0), now);
        let request = scheduler
            .poll_debounce(now + Duration::from_millis(300))
            .unwrap();
        scheduler.complete_build(
            request.id,
            Err(MetronomeError::IncompatibleAudioFormat("test".to_string())),
        );

        assert!(changes.lock().unwrap().is_empty());
        scheduler.stop();
        assert_eq!(changes.lock().unwrap().as_slice(), &[SessionChange::Stopped]);
    }

    struct InstantBuilder;

    impl TrackBuilder for InstantBuilder {
        fn build(
            &self,
            config: TempoConfig,
            _sample_rate: u32,
            token: &CancellationToken,
        ) -> Result<Arc<ClickTrackBuffer>> {
            thread::sleep(Duration::from_millis(5));
            token.check()?;
            track(config)
        }
    }

    #[test]
    fn test_threaded_driver_settles_on_last_change() {
        let (output, log) = RecordingOutput::new();
        let (events_tx, events_rx) = channel::unbounded();
        let handle = SchedulerHandle::spawn(
            move || Box::new(output) as Box<dyn AudioOutput>,
            Arc::new(InstantBuilder),
            Arc::new(SystemClock),
            Duration::from_millis(50),
            events_tx,
            Box::new(|_: SessionChange| {}),
        )
        .unwrap();

        handle.set_desired(true, tempo(4, 120.0));
        assert_eq!(
            events_rx.recv_timeout(Duration::from_secs(2)),
            Ok(SchedulerEvent::Started(tempo(4, 120.0)))
        );

        handle.set_desired(true, tempo(4, 180.0));
        handle.set_desired(true, tempo(4, 240.0));
        let settled = loop {
            match events_rx.recv_timeout(Duration::from_secs(2)) {
                Ok(SchedulerEvent::Started(config)) if config == tempo(4, 240.0) => break true,
                Ok(_) => continue,
                Err(_) => break false,
            }
        };
        assert!(settled);

        drop(handle);
        let log = log.lock().unwrap();
        assert_eq!(log.started.last().map(|(_, c)| *c), Some(tempo(4, 240.0)));
        assert_eq!(log.max_active, 1);
        assert!(log.active.is_empty());
    }
}
