pub mod cache;
pub mod click_track;
pub mod error;
pub mod factory;
pub mod io;
pub mod metronome;
pub mod mixer;
pub mod output;
pub mod scheduler;
pub mod stream;
pub mod tempo;
pub mod tick;
pub mod visual;

pub use click_track::{ClickKind, ClickSample, ClickTrackBuffer, synthesize};
pub use error::{MetronomeError, Result};
pub use factory::{CancellationToken, ClickTrackFactory, TrackBuilder};
pub use io::{ClickSource, SynthClickSource, WavClickSource, export_click_track, import_wav};
pub use metronome::Metronome;
pub use output::{AudioOutput, NullOutput, SourceId};
pub use scheduler::{SchedulerEvent, SchedulerState, SessionChange};
pub use stream::{DeviceOutput, enumerate_output_devices};
pub use tempo::{HalfBeat, TempoConfig};
pub use tick::{Clock, ManualClock, SystemClock};

/// Rate used when no device is available to dictate one.
pub const FALLBACK_SAMPLE_RATE: u32 = 44100;
