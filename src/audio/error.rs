use thiserror::Error;

/// Everything that can go wrong inside the metronome core.
///
/// Only `InvalidConfiguration` is ever returned across the `set_playback`
/// boundary. The rest are raised by builds and devices and handled inside the
/// scheduler, which logs them and keeps the host running.
#[derive(Error, Debug)]
pub enum MetronomeError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("incompatible audio format: {0}")]
    IncompatibleAudioFormat(String),
    #[error("build canceled")]
    BuildCanceled,
    #[error("audio output unavailable: {0}")]
    AudioUnavailable(String),
    #[error("resampling failed: {0}")]
    Resample(String),
    #[error("settings error: {0}")]
    Settings(String),
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MetronomeError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, MetronomeError::BuildCanceled)
    }
}

pub type Result<T> = std::result::Result<T, MetronomeError>;
