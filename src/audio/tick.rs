use crossbeam::channel::{self, Receiver, Sender, select};
use log::{debug, warn};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::error::Result;
use super::tempo::{HalfBeat, TempoConfig, half_beat_index};

/// Time base for the tick source.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut offset) = self.offset.lock() {
            *offset += by;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = self.offset.lock().map(|o| *o).unwrap_or_default();
        self.base + offset
    }
}

/// One emission of the tick source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickEvent {
    /// Which `start` call produced this event.
    pub generation: u64,
    pub half_beat: HalfBeat,
}

/// Poll state for one run: recomputes the absolute half-beat from the start
/// instant on every poll, so missed or late polls never accumulate error.
#[derive(Debug, Clone)]
pub struct TickTracker {
    started_at: Instant,
    config: TempoConfig,
    last_emitted: Option<u64>,
}

impl TickTracker {
    pub fn new(started_at: Instant, config: TempoConfig) -> Self {
        Self {
            started_at,
            config,
            last_emitted: None,
        }
    }

    /// The current half-beat if it differs from the last one returned.
    pub fn poll(&mut self, now: Instant) -> Option<HalfBeat> {
        let elapsed_ms = now.saturating_duration_since(self.started_at).as_secs_f64() * 1000.0;
        let index = half_beat_index(elapsed_ms, self.config.beats_per_minute()).ok()?;

        if self.last_emitted.is_some_and(|last| last >= index) {
            return None;
        }
        self.last_emitted = Some(index);
        Some(HalfBeat::at(index, &self.config))
    }
}

struct RunningTimer {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

/// Free-running half-beat timer on its own thread.
pub struct TickSource {
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    events: Sender<TickEvent>,
    generation: u64,
    running: Option<RunningTimer>,
}

impl TickSource {
    pub fn new(clock: Arc<dyn Clock>, poll_interval: Duration) -> (Self, Receiver<TickEvent>) {
        let (events, receiver) = channel::unbounded();
        let source = Self {
            clock,
            poll_interval: poll_interval.max(Duration::from_micros(100)),
            events,
            generation: 0,
            running: None,
        };
        (source, receiver)
    }

    /// Generation the next `start` will stamp its events with.
    pub fn next_generation(&self) -> u64 {
        self.generation + 1
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Begin emitting half-beats counted from `started_at`. Replaces any
    /// running timer; the count restarts at 0.
    pub fn start(&mut self, started_at: Instant, config: TempoConfig) -> Result<u64> {
        self.stop();
        self.generation += 1;
        let generation = self.generation;

        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let clock = Arc::clone(&self.clock);
        let events = self.events.clone();
        let ticker = channel::tick(self.poll_interval);
        let mut tracker = TickTracker::new(started_at, config);

        let thread = thread::Builder::new()
            .name("metronome-tick".to_string())
            .spawn(move || {
                let emit = |tracker: &mut TickTracker| -> bool {
                    match tracker.poll(clock.now()) {
                        Some(half_beat) => events
                            .send(TickEvent {
                                generation,
                                half_beat,
                            })
                            .is_ok(),
                        None => true,
                    }
                };

                if !emit(&mut tracker) {
                    return;
                }
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            if !emit(&mut tracker) {
                                break;
                            }
                        }
                    }
                }
            })?;

        debug!(
            "Tick source generation {} started ({} beats @ {} bpm)",
            generation,
            config.beats_per_measure(),
            config.beats_per_minute()
        );

        self.running = Some(RunningTimer {
            stop: stop_tx,
            thread,
        });
        Ok(generation)
    }

    /// Halt emission and wait for the timer thread to exit.
    pub fn stop(&mut self) {
        if let Some(timer) = self.running.take() {
            let _ = timer.stop.try_send(());
            if timer.thread.join().is_err() {
                warn!("Tick thread panicked");
            }
        }
    }
}

impl Drop for TickSource {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_second_at_120_bpm() {
        let clock = ManualClock::new();
        let config = TempoConfig::new(4, 120.0).unwrap();
        let mut tracker = TickTracker::new(clock.now(), config);

        let mut seen = Vec::new();
        for _ in 0..1000 {
            if let Some(half_beat) = tracker.poll(clock.now()) {
                seen.push(half_beat.index);
            }
            clock.advance(Duration::from_millis(1));
        }

        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_late_poll_skips_to_latest() {
        let clock = ManualClock::new();
        let config = TempoConfig::new(4, 120.0).unwrap();
        let mut tracker = TickTracker::new(clock.now(), config);

        assert_eq!(tracker.poll(clock.now()).map(|h| h.index), Some(0));
        clock.advance(Duration::from_millis(1100));
        let half_beat = tracker.poll(clock.now()).unwrap();
        assert_eq!(half_beat.index, 4);
        assert_eq!(half_beat.display, 4);
        assert_eq!(tracker.poll(clock.now()), None);
    }

    #[test]
    fn test_no_drift_over_long_session() {
        let clock = ManualClock::new();
        let config = TempoConfig::new(3, 90.0).unwrap();
        let mut tracker = TickTracker::new(clock.now(), config);

        // Irregular poll spacing for ten minutes of play
        let mut last = 0;
        for step in 0..60_000u64 {
            clock.advance(Duration::from_micros(7_000 + (step % 9) * 1_000));
            if let Some(half_beat) = tracker.poll(clock.now()) {
                assert!(half_beat.index > last || half_beat.index == 0);
                last = half_beat.index;
            }
        }

        let elapsed = clock.now().duration_since(clock.base).as_secs_f64() * 1000.0;
        assert_eq!(last, half_beat_index(elapsed, 90.0).unwrap());
    }

    #[test]
    fn test_display_wraps_per_measure() {
        let clock = ManualClock::new();
        let config = TempoConfig::new(2, 60.0).unwrap();
        let mut tracker = TickTracker::new(clock.now(), config);

        let mut displays = Vec::new();
        for _ in 0..6 {
            if let Some(half_beat) = tracker.poll(clock.now()) {
                displays.push(half_beat.display);
            }
            clock.advance(Duration::from_millis(500));
        }
        assert_eq!(displays, vec![0, 1, 2, 3, 0, 1]);
    }

    #[test]
    fn test_thread_emits_increasing_indices() {
        let (mut source, events) = TickSource::new(Arc::new(SystemClock), Duration::from_millis(1));
        let config = TempoConfig::new(4, 600.0).unwrap(); // 50ms half-beats
        let generation = source.start(source.now(), config).unwrap();

        let mut indices = Vec::new();
        while indices.len() < 4 {
            let event = events.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_eq!(event.generation, generation);
            indices.push(event.half_beat.index);
        }
        source.stop();

        assert_eq!(indices[0], 0);
        assert!(indices.windows(2).all(|w| w[0] < w[1]));
        assert!(!source.is_running());
    }

    #[test]
    fn test_restart_bumps_generation() {
        let (mut source, events) = TickSource::new(Arc::new(SystemClock), Duration::from_millis(1));
        let config = TempoConfig::new(4, 120.0).unwrap();

        assert_eq!(source.next_generation(), 1);
        let first = source.start(source.now(), config).unwrap();
        let second = source.start(source.now(), config).unwrap();
        assert_eq!(second, first + 1);

        // The restarted run begins again at half-beat 0.
        let event = loop {
            let event = events.recv_timeout(Duration::from_secs(2)).unwrap();
            if event.generation == second {
                break event;
            }
        };
        assert_eq!(event.half_beat.index, 0);
    }
}
