pub mod terminal;

pub use terminal::{BeatCounter, TempoControls, TerminalUI};
