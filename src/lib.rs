pub mod audio;
pub mod logging;
pub mod settings;
pub mod ui;

pub use audio::{HalfBeat, Metronome, MetronomeError, TempoConfig};
pub use settings::EngineSettings;
pub use ui::TerminalUI;
