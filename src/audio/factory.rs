use log::debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::cache::{ClipCache, ConvertedClipCache, TrackCache, TrackKey};
use super::click_track::{ClickKind, ClickSample, ClickTrackBuffer, check_formats, synthesize};
use super::error::{MetronomeError, Result};
use super::io::ClickSource;
use super::tempo::TempoConfig;

/// Per-build cancellation flag. Cloned into the build; flipped by whoever
/// supersedes it.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// `Err(BuildCanceled)` once canceled.
    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            Err(MetronomeError::BuildCanceled)
        } else {
            Ok(())
        }
    }
}

/// Produces the looping click track for a tempo at an output sample rate.
pub trait TrackBuilder: Send + Sync {
    fn build(
        &self,
        config: TempoConfig,
        sample_rate: u32,
        token: &CancellationToken,
    ) -> Result<Arc<ClickTrackBuffer>>;
}

/// Loads the two clips once, converts them once per output rate, and
/// synthesizes each tempo once at that rate.
pub struct ClickTrackFactory {
    source: Arc<dyn ClickSource>,
    clips: ClipCache,
    converted: ConvertedClipCache,
    tracks: TrackCache,
}

impl ClickTrackFactory {
    pub fn new(source: Arc<dyn ClickSource>) -> Self {
        Self {
            source,
            clips: ClipCache::new(),
            converted: ConvertedClipCache::new(),
            tracks: TrackCache::new(),
        }
    }

    pub fn cached_tracks(&self) -> usize {
        self.tracks.len()
    }

    fn clip(&self, kind: ClickKind) -> Result<Arc<ClickSample>> {
        self.clips.get_or_try_insert_with(&kind, || self.source.load(kind))
    }

    fn clip_at(
        &self,
        native: Arc<ClickSample>,
        kind: ClickKind,
        sample_rate: u32,
    ) -> Result<Arc<ClickSample>> {
        if native.sample_rate == sample_rate {
            return Ok(native);
        }
        self.converted
            .get_or_try_insert_with(&(kind, sample_rate), || native.resampled(sample_rate))
    }
}

impl TrackBuilder for ClickTrackFactory {
    fn build(
        &self,
        config: TempoConfig,
        sample_rate: u32,
        token: &CancellationToken,
    ) -> Result<Arc<ClickTrackBuffer>> {
        token.check()?;

        let accent = self.clip(ClickKind::Accent)?;
        let regular = self.clip(ClickKind::Regular)?;
        check_formats(&accent, &regular)?;

        token.check()?;

        let accent = self.clip_at(accent, ClickKind::Accent, sample_rate)?;
        let regular = self.clip_at(regular, ClickKind::Regular, sample_rate)?;

        let key = TrackKey {
            config,
            sample_rate,
        };
        self.tracks.get_or_try_insert_with(&key, || {
            debug!(
                "Synthesizing click track: {} beats @ {} bpm, {}Hz",
                config.beats_per_measure(),
                config.beats_per_minute(),
                sample_rate
            );
            synthesize(&accent, &regular, config)
        })
    }
}
