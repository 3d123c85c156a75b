use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use log::{debug, info};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::f64::consts::PI;
use std::path::{Path, PathBuf};

use super::click_track::{ClickKind, ClickSample, ClickTrackBuffer};
use super::error::{MetronomeError, Result};

/// Somewhere the two click clips can be loaded from.
pub trait ClickSource: Send + Sync {
    fn load(&self, kind: ClickKind) -> Result<ClickSample>;
}

/// Reads `click_hi.wav` / `click_lo.wav` from a directory.
#[derive(Debug, Clone)]
pub struct WavClickSource {
    dir: PathBuf,
}

impl WavClickSource {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, kind: ClickKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }

    /// True when both clips are present.
    pub fn is_complete(&self) -> bool {
        [ClickKind::Accent, ClickKind::Regular]
            .iter()
            .all(|kind| self.path_for(*kind).is_file())
    }
}

impl ClickSource for WavClickSource {
    fn load(&self, kind: ClickKind) -> Result<ClickSample> {
        let path = self.path_for(kind);
        let sample = import_wav(&path)?;
        info!(
            "Loaded {} ({}Hz, {}ch, {} frames)",
            path.display(),
            sample.sample_rate,
            sample.channel_count(),
            sample.frames()
        );
        Ok(sample)
    }
}

/// Built-in clicks for hosts that ship no audio assets: short decaying sine
/// bursts, higher and louder on the accent.
#[derive(Debug, Clone, Copy)]
pub struct SynthClickSource {
    sample_rate: u32,
}

impl SynthClickSource {
    const CLICK_SECONDS: f64 = 0.03;

    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

impl Default for SynthClickSource {
    fn default() -> Self {
        Self::new(44100)
    }
}

impl ClickSource for SynthClickSource {
    fn load(&self, kind: ClickKind) -> Result<ClickSample> {
        let (freq, gain) = match kind {
            ClickKind::Accent => (1760.0, 0.9),
            ClickKind::Regular => (880.0, 0.6),
        };

        let sample_rate = self.sample_rate as f64;
        let frames = (sample_rate * Self::CLICK_SECONDS) as usize;
        let data = (0..frames)
            .map(|i| {
                let t = i as f64 / sample_rate;
                // 1ms attack, exponential decay
                let attack = (t / 0.001).min(1.0);
                let env = attack * (-t * 150.0).exp();
                ((2.0 * PI * freq * t).sin() * env * gain) as f32
            })
            .collect();

        Ok(ClickSample {
            sample_rate: self.sample_rate,
            channels: vec![data],
        })
    }
}

/// Decode a WAV file into planar f32 channels, keeping its native rate and
/// channel count.
pub fn import_wav<P: AsRef<Path>>(path: P) -> Result<ClickSample> {
    let mut reader = WavReader::open(&path)?;
    let spec = reader.spec();

    // Read samples as f32 in interleaved order
    let raw_samples: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()?,
        SampleFormat::Int => {
            let max_value = 2_i64.pow((spec.bits_per_sample - 1) as u32) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_value))
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
    };

    let channel_count = spec.channels as usize;
    if channel_count == 0 {
        return Err(MetronomeError::IncompatibleAudioFormat(format!(
            "{} has no channels",
            path.as_ref().display()
        )));
    }

    let mut channels = vec![Vec::with_capacity(raw_samples.len() / channel_count); channel_count];
    for frame in raw_samples.chunks_exact(channel_count) {
        for (channel, sample) in channels.iter_mut().zip(frame) {
            channel.push(*sample);
        }
    }

    Ok(ClickSample {
        sample_rate: spec.sample_rate,
        channels,
    })
}

/// Write a click track as 32-bit float WAV (interleaved).
pub fn export_click_track<P: AsRef<Path>>(path: P, track: &ClickTrackBuffer) -> Result<()> {
    let spec = WavSpec {
        channels: track.channel_count() as u16,
        sample_rate: track.sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };

    let mut writer = WavWriter::create(&path, spec)?;
    for frame in 0..track.frames() {
        for channel in &track.channels {
            writer.write_sample(channel[frame])?;
        }
    }
    writer.finalize()?;

    debug!(
        "Exported {} frames to {}",
        track.frames(),
        path.as_ref().display()
    );
    Ok(())
}

/// Resample planar channels from `input_rate` to `output_rate`, compensating
/// for the filter delay. Output length is `round(frames * ratio)`.
pub fn resample_channels(
    channels: &[Vec<f32>],
    input_rate: u32,
    output_rate: u32,
) -> Result<Vec<Vec<f32>>> {
    let frames = channels.first().map_or(0, Vec::len);
    if input_rate == output_rate || frames == 0 {
        return Ok(channels.to_vec());
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let ratio = output_rate as f64 / input_rate as f64;
    let expected = (frames as f64 * ratio).round() as usize;

    let mut resampler = SincFixedIn::<f32>::new(
        ratio,
        2.0, // Max ratio
        params,
        frames,
        channels.len(),
    )
    .map_err(|e| MetronomeError::Resample(e.to_string()))?;

    let delay = resampler.output_delay();
    let mut output = resampler
        .process(channels, None)
        .map_err(|e| MetronomeError::Resample(e.to_string()))?;
    let tail = resampler
        .process_partial::<Vec<f32>>(None, None)
        .map_err(|e| MetronomeError::Resample(e.to_string()))?;

    // The flush pushes a chunk of silence through to drain the filter.
    for (channel, rest) in output.iter_mut().zip(tail) {
        channel.extend(rest);
        channel.drain(..delay.min(channel.len()));
        channel.resize(expected, 0.0);
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::click_track::synthesize;
    use crate::audio::tempo::TempoConfig;
    use std::fs;

    #[test]
    fn test_export_import_roundtrip() {
        let source = SynthClickSource::new(8000);
        let hi = source.load(ClickKind::Accent).unwrap();
        let lo = source.load(ClickKind::Regular).unwrap();
        let track = synthesize(&hi, &lo, TempoConfig::new(2, 240.0).unwrap()).unwrap();

        let temp_path = "test_click_track_roundtrip.wav";
        export_click_track(temp_path, &track).unwrap();
        let imported = import_wav(temp_path).unwrap();
        let _ = fs::remove_file(temp_path);

        assert_eq!(imported.sample_rate, 8000);
        assert_eq!(imported.channel_count(), track.channel_count());
        assert_eq!(imported.frames(), track.frames());
        for (orig, imp) in track.channels[0].iter().zip(imported.channels[0].iter()) {
            assert!((orig - imp).abs() < 0.001);
        }
    }

    #[test]
    fn test_import_int_stereo_deinterleaves() {
        let temp_path = "test_click_int_stereo.wav";
        let spec = WavSpec {
            channels: 2,
            sample_rate: 22050,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(temp_path, spec).unwrap();
        for (left, right) in [(16384i16, -16384i16), (0, 8192)] {
            writer.write_sample(left).unwrap();
            writer.write_sample(right).unwrap();
        }
        writer.finalize().unwrap();

        let imported = import_wav(temp_path).unwrap();
        let _ = fs::remove_file(temp_path);

        assert_eq!(imported.channel_count(), 2);
        assert_eq!(imported.channels[0], vec![0.5, 0.0]);
        assert_eq!(imported.channels[1], vec![-0.5, 0.25]);
    }

    #[test]
    fn test_wav_source_reads_named_files() {
        let dir = std::env::temp_dir().join("clicktrack_wav_source_test");
        fs::create_dir_all(&dir).unwrap();

        let source = WavClickSource::new(&dir);
        assert!(source.load(ClickKind::Accent).is_err());

        let synth = SynthClickSource::new(8000);
        for kind in [ClickKind::Accent, ClickKind::Regular] {
            let clip = synth.load(kind).unwrap();
            let track = ClickTrackBuffer {
                config: TempoConfig::new(1, 60.0).unwrap(),
                sample_rate: clip.sample_rate,
                channels: clip.channels,
            };
            export_click_track(source.path_for(kind), &track).unwrap();
        }

        assert!(source.is_complete());
        let accent = source.load(ClickKind::Accent).unwrap();
        assert_eq!(accent.sample_rate, 8000);
        assert_eq!(accent.frames(), 240);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_synth_clicks_share_format() {
        let source = SynthClickSource::default();
        let hi = source.load(ClickKind::Accent).unwrap();
        let lo = source.load(ClickKind::Regular).unwrap();
        assert_eq!(hi.sample_rate, lo.sample_rate);
        assert_eq!(hi.channel_count(), lo.channel_count());
        assert_eq!(hi.frames(), 1323);

        let peak = |clip: &ClickSample| clip.channels[0].iter().fold(0.0f32, |a, s| a.max(s.abs()));
        assert!(peak(&hi) > peak(&lo));
        assert!(peak(&hi) <= 1.0);
    }

    #[test]
    fn test_resample_length() {
        let channels = vec![vec![0.0f32; 4410], vec![0.0f32; 4410]];
        let output = resample_channels(&channels, 44100, 48000).unwrap();
        assert_eq!(output.len(), 2);
        assert_eq!(output[0].len(), 4800);
        assert_eq!(output[1].len(), 4800);
    }
}
