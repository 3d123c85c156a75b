use std::hash::{Hash, Hasher};

use super::error::{MetronomeError, Result};

/// Tempo and meter of one click track.
///
/// Always valid once constructed: `beats_per_measure >= 1` and
/// `beats_per_minute` finite and positive. Never mutated; a new value is
/// built whenever the user changes either number.
#[derive(Debug, Clone, Copy)]
pub struct TempoConfig {
    beats_per_measure: u32,
    beats_per_minute: f64,
}

impl TempoConfig {
    pub fn new(beats_per_measure: u32, beats_per_minute: f64) -> Result<Self> {
        if beats_per_measure == 0 {
            return Err(MetronomeError::InvalidConfiguration(
                "beats per measure must be at least 1".to_string(),
            ));
        }
        validate_bpm(beats_per_minute)?;

        Ok(Self {
            beats_per_measure,
            beats_per_minute,
        })
    }

    pub fn beats_per_measure(&self) -> u32 {
        self.beats_per_measure
    }

    pub fn beats_per_minute(&self) -> f64 {
        self.beats_per_minute
    }

    /// Number of half-beats in one measure (the display modulus).
    pub fn half_beats_per_measure(&self) -> u64 {
        self.beats_per_measure as u64 * 2
    }

    /// Length of one measure in seconds.
    pub fn measure_seconds(&self) -> f64 {
        self.beats_per_measure as f64 * 60.0 / self.beats_per_minute
    }

    /// Length of one measure in whole frames at `sample_rate`.
    pub fn measure_frames(&self, sample_rate: u32) -> usize {
        (self.beats_per_measure as f64 * samples_per_beat(sample_rate, self.beats_per_minute))
            .round() as usize
    }
}

// Cache keys compare the exact bpm bit pattern; NaN can't get in through `new`.
impl PartialEq for TempoConfig {
    fn eq(&self, other: &Self) -> bool {
        self.beats_per_measure == other.beats_per_measure
            && self.beats_per_minute.to_bits() == other.beats_per_minute.to_bits()
    }
}

impl Eq for TempoConfig {}

impl Hash for TempoConfig {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.beats_per_measure.hash(state);
        self.beats_per_minute.to_bits().hash(state);
    }
}

fn validate_bpm(bpm: f64) -> Result<()> {
    if bpm.is_finite() && bpm > 0.0 {
        Ok(())
    } else {
        Err(MetronomeError::InvalidConfiguration(format!(
            "beats per minute must be positive, got {}",
            bpm
        )))
    }
}

/// Milliseconds between two half-beats: `(60000 / bpm) / 2`.
pub fn ms_per_half_beat(bpm: f64) -> Result<f64> {
    validate_bpm(bpm)?;
    Ok((60_000.0 / bpm) / 2.0)
}

/// Number of half-beat boundaries crossed after `elapsed_ms`.
pub fn half_beat_index(elapsed_ms: f64, bpm: f64) -> Result<u64> {
    let interval = ms_per_half_beat(bpm)?;
    if elapsed_ms <= 0.0 {
        return Ok(0);
    }
    Ok((elapsed_ms / interval).floor() as u64)
}

/// Inverse of [`half_beat_index`]: the instant (in ms after start) at which
/// half-beat `index` begins.
pub fn half_beat_start_ms(index: u64, bpm: f64) -> Result<f64> {
    Ok(index as f64 * ms_per_half_beat(bpm)?)
}

/// Position of a half-beat inside its measure. 0 is the accented downbeat,
/// even values are on the beat.
pub fn display_beat(half_beat_index: u64, beats_per_measure: u32) -> Result<u32> {
    if beats_per_measure == 0 {
        return Err(MetronomeError::InvalidConfiguration(
            "beats per measure must be at least 1".to_string(),
        ));
    }
    Ok((half_beat_index % (beats_per_measure as u64 * 2)) as u32)
}

/// 1-based beat number for a display half-beat.
pub fn beat_number(display: u32) -> u32 {
    display / 2 + 1
}

pub fn samples_per_beat(sample_rate: u32, bpm: f64) -> f64 {
    sample_rate as f64 * 60.0 / bpm
}

/// One observed half-beat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HalfBeat {
    /// Monotonic count since the play-start instant.
    pub index: u64,
    /// `index` modulo the half-beats in a measure.
    pub display: u32,
}

impl HalfBeat {
    pub fn at(index: u64, config: &TempoConfig) -> Self {
        Self {
            index,
            display: (index % config.half_beats_per_measure()) as u32,
        }
    }

    pub fn is_on_beat(&self) -> bool {
        self.index % 2 == 0
    }

    pub fn is_measure_start(&self) -> bool {
        self.display == 0
    }

    pub fn beat_number(&self) -> u32 {
        beat_number(self.display)
    }
}
