use std::sync::Arc;

use super::click_track::ClickTrackBuffer;
use super::error::Result;

/// Handle for one started loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(pub u64);

/// Where click tracks are played.
///
/// Implementations hold at most one looping source; `start_loop` on a busy
/// output replaces the previous loop.
pub trait AudioOutput {
    fn sample_rate(&self) -> u32;

    /// Connect `track` and start looping it from frame 0 immediately.
    fn start_loop(&mut self, track: Arc<ClickTrackBuffer>) -> Result<SourceId>;

    /// Stop and disconnect `source`. Ignored if it is not the active one.
    fn stop(&mut self, source: SourceId);

    fn set_volume(&mut self, volume: f32);

    fn name(&self) -> &str;
}

/// Messages from the control side to the real-time player.
#[derive(Debug)]
pub enum PlayerMessage {
    Play(SourceId, Arc<ClickTrackBuffer>),
    Stop(SourceId),
    Volume(f32),
}

/// The single loop slot rendered by the device callback.
#[derive(Debug)]
pub struct LoopPlayer {
    current: Option<(SourceId, Arc<ClickTrackBuffer>)>,
    position: usize,
    volume: f32,
}

impl LoopPlayer {
    pub fn new() -> Self {
        Self {
            current: None,
            position: 0,
            volume: 1.0,
        }
    }

    pub fn apply(&mut self, message: PlayerMessage) {
        match message {
            PlayerMessage::Play(id, track) => {
                self.current = Some((id, track));
                self.position = 0;
            }
            PlayerMessage::Stop(id) => {
                if self.active() == Some(id) {
                    self.current = None;
                    self.position = 0;
                }
            }
            PlayerMessage::Volume(volume) => {
                self.volume = volume.clamp(0.0, 1.0);
            }
        }
    }

    pub fn active(&self) -> Option<SourceId> {
        self.current.as_ref().map(|(id, _)| *id)
    }

    /// Render interleaved frames into `output`, looping the track. Output
    /// channel `c` takes track channel `c % track_channels`.
    pub fn fill(&mut self, output: &mut [f32], output_channels: usize) {
        let Some((_, track)) = self.current.as_ref() else {
            output.fill(0.0);
            return;
        };

        let frames = track.frames();
        let track_channels = track.channel_count();
        if frames == 0 || track_channels == 0 || output_channels == 0 {
            output.fill(0.0);
            return;
        }

        for frame in output.chunks_mut(output_channels) {
            if self.position >= frames {
                self.position = 0;
            }
            for (c, sample) in frame.iter_mut().enumerate() {
                *sample = track.channels[c % track_channels][self.position] * self.volume;
            }
            self.position += 1;
        }
    }
}

impl Default for LoopPlayer {
    fn default() -> Self {
        Self::new()
    }
}

/// Output that accepts loops and makes no sound. Used when no audio device
/// can be acquired so timing keeps running.
#[derive(Debug)]
pub struct NullOutput {
    sample_rate: u32,
    active: Option<SourceId>,
    next_id: u64,
}

impl NullOutput {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            active: None,
            next_id: 0,
        }
    }

    pub fn active(&self) -> Option<SourceId> {
        self.active
    }
}

impl AudioOutput for NullOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start_loop(&mut self, _track: Arc<ClickTrackBuffer>) -> Result<SourceId> {
        self.next_id += 1;
        let id = SourceId(self.next_id);
        self.active = Some(id);
        Ok(id)
    }

    fn stop(&mut self, source: SourceId) {
        if self.active == Some(source) {
            self.active = None;
        }
    }

    fn set_volume(&mut self, _volume: f32) {}

    fn name(&self) -> &str {
        "silent"
    }
}
