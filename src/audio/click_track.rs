use log::debug;

use super::error::{MetronomeError, Result};
use super::io::resample_channels;
use super::mixer::{clamp_unit, mix_wrapped};
use super::tempo::{TempoConfig, samples_per_beat};

/// Which of the two source clips a sample is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClickKind {
    /// High click on beat 1.
    Accent,
    /// Low click on every other beat.
    Regular,
}

impl ClickKind {
    pub fn file_name(&self) -> &'static str {
        match self {
            ClickKind::Accent => "click_hi.wav",
            ClickKind::Regular => "click_lo.wav",
        }
    }
}

/// A decoded click clip, planar: one `Vec` per channel, all the same length.
#[derive(Debug, Clone, PartialEq)]
pub struct ClickSample {
    pub sample_rate: u32,
    pub channels: Vec<Vec<f32>>,
}

impl ClickSample {
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// The same clip at another sample rate. Clips are converted before they
    /// are laid into a measure, so the loop is assembled at the output rate
    /// and its seam stays exact.
    pub fn resampled(&self, sample_rate: u32) -> Result<Self> {
        if sample_rate == self.sample_rate {
            return Ok(self.clone());
        }

        let channels = resample_channels(&self.channels, self.sample_rate, sample_rate)?;
        debug!(
            "Resampled click clip {}Hz -> {}Hz ({} frames)",
            self.sample_rate,
            sample_rate,
            channels.first().map_or(0, Vec::len)
        );

        Ok(Self {
            sample_rate,
            channels,
        })
    }
}

/// One seamless measure of clicks, ready to be looped.
#[derive(Debug, Clone, PartialEq)]
pub struct ClickTrackBuffer {
    pub config: TempoConfig,
    pub sample_rate: u32,
    pub channels: Vec<Vec<f32>>,
}

impl ClickTrackBuffer {
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Frame offset of every beat in the measure.
    pub fn beat_offsets(&self) -> Vec<usize> {
        beat_offsets(&self.config, self.sample_rate)
    }

}

fn beat_offsets(config: &TempoConfig, sample_rate: u32) -> Vec<usize> {
    let per_beat = samples_per_beat(sample_rate, config.beats_per_minute());
    (0..config.beats_per_measure())
        .map(|beat| (beat as f64 * per_beat).round() as usize)
        .collect()
}

pub fn check_formats(accent: &ClickSample, regular: &ClickSample) -> Result<()> {
    if accent.sample_rate != regular.sample_rate {
        return Err(MetronomeError::IncompatibleAudioFormat(format!(
            "sample rates differ: accent {}Hz, regular {}Hz",
            accent.sample_rate, regular.sample_rate
        )));
    }
    if accent.channel_count() != regular.channel_count() {
        return Err(MetronomeError::IncompatibleAudioFormat(format!(
            "channel counts differ: accent {}, regular {}",
            accent.channel_count(),
            regular.channel_count()
        )));
    }
    if accent.channel_count() == 0 || accent.sample_rate == 0 {
        return Err(MetronomeError::IncompatibleAudioFormat(
            "click clips have no audio channels".to_string(),
        ));
    }
    Ok(())
}

/// Build one measure of clicks: the accent clip on beat 1, the regular clip on
/// every following beat, summed into silence at the clips' own sample rate.
/// Overlapping clicks are hard-limited to ±1.
pub fn synthesize(
    accent: &ClickSample,
    regular: &ClickSample,
    config: TempoConfig,
) -> Result<ClickTrackBuffer> {
    check_formats(accent, regular)?;

    let sample_rate = accent.sample_rate;
    let frames = config.measure_frames(sample_rate);
    if frames == 0 {
        return Err(MetronomeError::InvalidConfiguration(format!(
            "{} bpm is too fast for {}Hz audio",
            config.beats_per_minute(),
            sample_rate
        )));
    }

    let mut channels = vec![vec![0.0f32; frames]; accent.channel_count()];
    for (beat, offset) in beat_offsets(&config, sample_rate).into_iter().enumerate() {
        let clip = if beat == 0 { accent } else { regular };
        for (channel, source) in channels.iter_mut().zip(clip.channels.iter()) {
            mix_wrapped(channel, source, offset);
        }
    }
    for channel in &mut channels {
        clamp_unit(channel);
    }

    Ok(ClickTrackBuffer {
        config,
        sample_rate,
        channels,
    })
}
