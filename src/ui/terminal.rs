use crossbeam::channel::{self, Receiver};
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use log::{error, warn};
use ratatui::{
    Frame, Terminal,
    backend::CrosstermBackend,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
};
use std::{
    io,
    time::{Duration, Instant},
};

use crate::audio::{HalfBeat, Metronome, SchedulerEvent};

const MIN_BPM: f64 = 1.0;
const MAX_BPM: f64 = 999.0;
const MAX_BEATS: u32 = 32;

/// What the user has dialed in. Every change is pushed to the engine as a
/// whole `{play, beats, bpm}`; the engine ignores repeats.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempoControls {
    pub playing: bool,
    pub beats: u32,
    pub bpm: f64,
}

impl TempoControls {
    pub fn new(beats: u32, bpm: f64) -> Self {
        Self {
            playing: false,
            beats: beats.clamp(1, MAX_BEATS),
            bpm: bpm.clamp(MIN_BPM, MAX_BPM),
        }
    }

    pub fn toggle_play(&mut self) {
        self.playing = !self.playing;
    }

    pub fn adjust_bpm(&mut self, delta: f64) {
        self.bpm = (self.bpm + delta).clamp(MIN_BPM, MAX_BPM);
    }

    pub fn adjust_beats(&mut self, delta: i32) {
        self.beats = self.beats.saturating_add_signed(delta).clamp(1, MAX_BEATS);
    }
}

/// Measure count plus the half-beat being shown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BeatCounter {
    pub measure: u64,
    pub current: Option<HalfBeat>,
}

impl BeatCounter {
    /// A new measure starts each time the display wraps back to 0.
    pub fn observe(&mut self, half_beat: HalfBeat) {
        if half_beat.is_measure_start() && half_beat.index > 0 {
            self.measure += 1;
        }
        self.current = Some(half_beat);
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, PartialEq)]
enum HeaderStatus {
    Success(String),
    Error(String),
}

pub struct TerminalUI {
    terminal: Terminal<CrosstermBackend<io::Stdout>>,
    metronome: Metronome,
    half_beats: Receiver<HalfBeat>,
    controls: TempoControls,
    counter: BeatCounter,
    output_name: String,
    is_running: bool,
    last_update: Instant,
    header_status: Option<HeaderStatus>,
    status_timer: Option<Instant>,
}

impl TerminalUI {
    pub fn new(
        metronome: Metronome,
        controls: TempoControls,
        output_name: &str,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let (half_beat_tx, half_beats) = channel::unbounded();
        metronome.on_half_beat(move |half_beat| {
            let _ = half_beat_tx.send(half_beat);
        });

        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen)?;

        let backend = CrosstermBackend::new(stdout);
        let terminal = Terminal::new(backend)?;

        Ok(Self {
            terminal,
            metronome,
            half_beats,
            controls,
            counter: BeatCounter::default(),
            output_name: output_name.to_string(),
            is_running: true,
            last_update: Instant::now(),
            header_status: None,
            status_timer: None,
        })
    }

    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.push_controls();

        while self.is_running {
            self.process_events()?;
            self.check_status_timer();

            // ~60 fps is plenty for a beat indicator
            if self.last_update.elapsed() >= Duration::from_millis(16) {
                self.draw()?;
                self.last_update = Instant::now();
            }

            std::thread::sleep(Duration::from_millis(1));
        }

        self.metronome.stop();
        Ok(())
    }

    fn process_events(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        if event::poll(Duration::from_millis(0))?
            && let Event::Key(key) = event::read()?
            && key.kind == KeyEventKind::Press
        {
            self.handle_key_event(key);
        }

        while let Ok(half_beat) = self.half_beats.try_recv() {
            self.counter.observe(half_beat);
        }

        while let Ok(event) = self.metronome.events().try_recv() {
            self.handle_scheduler_event(event);
        }

        Ok(())
    }

    fn handle_key_event(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => {
                self.is_running = false;
            }
            KeyCode::Char(' ') => {
                self.controls.toggle_play();
                self.counter.reset();
                self.push_controls();
            }
            KeyCode::Up => self.change_tempo(|c| c.adjust_bpm(1.0)),
            KeyCode::Down => self.change_tempo(|c| c.adjust_bpm(-1.0)),
            KeyCode::PageUp => self.change_tempo(|c| c.adjust_bpm(10.0)),
            KeyCode::PageDown => self.change_tempo(|c| c.adjust_bpm(-10.0)),
            KeyCode::Char('+') | KeyCode::Char('=') => self.change_tempo(|c| c.adjust_beats(1)),
            KeyCode::Char('-') | KeyCode::Char('_') => self.change_tempo(|c| c.adjust_beats(-1)),
            KeyCode::Left | KeyCode::Right => {
                self.metronome.skip();
                self.counter.reset();
            }
            KeyCode::Char('m') | KeyCode::Char('M') => {
                let muted = !self.metronome.is_muted();
                self.metronome.set_muted(muted);
                self.show_success(if muted { "Muted" } else { "Unmuted" });
            }
            _ => {}
        }
    }

    fn change_tempo(&mut self, change: impl FnOnce(&mut TempoControls)) {
        let before = self.controls;
        change(&mut self.controls);
        if self.controls != before {
            if self.controls.playing {
                self.counter.reset();
            }
            self.push_controls();
        }
    }

    fn push_controls(&mut self) {
        let TempoControls {
            playing,
            beats,
            bpm,
        } = self.controls;
        if let Err(e) = self.metronome.set_playback(playing, beats, bpm) {
            warn!("Rejected tempo change: {}", e);
            self.show_error(&e.to_string());
        }
    }

    fn handle_scheduler_event(&mut self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::Started(config) => self.show_success(&format!(
                "Playing {} beats @ {} bpm",
                config.beats_per_measure(),
                config.beats_per_minute()
            )),
            SchedulerEvent::Error(message) => {
                error!("Audio error: {}", message);
                self.show_error(&message);
            }
            SchedulerEvent::Stopped | SchedulerEvent::Discarded(_) => {}
        }
    }

    fn show_success(&mut self, message: &str) {
        self.header_status = Some(HeaderStatus::Success(message.to_string()));
        self.status_timer = Some(Instant::now());
    }

    fn show_error(&mut self, message: &str) {
        self.header_status = Some(HeaderStatus::Error(message.to_string()));
        self.status_timer = Some(Instant::now());
    }

    fn check_status_timer(&mut self) {
        if let Some(timer) = self.status_timer
            && timer.elapsed() >= Duration::from_secs(3)
        {
            self.header_status = None;
            self.status_timer = None;
        }
    }

    fn draw(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let controls = self.controls;
        let counter = self.counter;
        let muted = self.metronome.is_muted();
        let output_name = self.output_name.clone();
        let header_status = self.header_status.clone();

        self.terminal.draw(|f| {
            let chunks = Layout::default()
                .direction(Direction::Vertical)
                .constraints([
                    Constraint::Length(3), // Header
                    Constraint::Min(5),    // Beats
                    Constraint::Length(5), // Footer
                ])
                .split(f.area());

            Self::draw_header_static(f, chunks[0], &output_name, &header_status);
            Self::draw_beats_static(f, chunks[1], &controls, &counter);
            Self::draw_footer_static(f, chunks[2], &controls, &counter, muted);
        })?;
        Ok(())
    }

    fn draw_header_static(
        f: &mut Frame,
        area: Rect,
        output_name: &str,
        header_status: &Option<HeaderStatus>,
    ) {
        let (text, color) = match header_status {
            Some(HeaderStatus::Success(message)) => (format!("✓ {}", message), Color::White),
            Some(HeaderStatus::Error(message)) => (format!("✗ {}", message), Color::Red),
            None => (format!("Output: {}", output_name), Color::White),
        };

        let header = Paragraph::new(text)
            .style(Style::default().fg(color).add_modifier(Modifier::BOLD))
            .alignment(Alignment::Center)
            .block(Block::default().borders(Borders::ALL).title("Clicktrack"));
        f.render_widget(header, area);
    }

    fn draw_beats_static(
        f: &mut Frame,
        area: Rect,
        controls: &TempoControls,
        counter: &BeatCounter,
    ) {
        let current = counter.current.filter(|_| controls.playing);
        let lit_beat = current.map(|h| h.beat_number());
        let off_beat = current.is_some_and(|h| !h.is_on_beat());

        let mut spans = Vec::new();
        for beat in 1..=controls.beats {
            let lit = lit_beat == Some(beat);
            let symbol = match (lit, off_beat) {
                (true, false) => " ● ",
                (true, true) => " ◐ ",
                (false, _) => " ○ ",
            };
            let color = match (lit, beat == 1) {
                (true, true) => Color::Red,
                (true, false) => Color::Green,
                (false, _) => Color::DarkGray,
            };
            spans.push(Span::styled(
                symbol,
                Style::default().fg(color).add_modifier(Modifier::BOLD),
            ));
        }

        let beats = Paragraph::new(vec![Line::from(""), Line::from(spans)])
            .alignment(Alignment::Center)
            .block(Block::default().borders(Borders::ALL).title("Beat"));
        f.render_widget(beats, area);
    }

    fn draw_footer_static(
        f: &mut Frame,
        area: Rect,
        controls: &TempoControls,
        counter: &BeatCounter,
        muted: bool,
    ) {
        let key_color = Color::Yellow;
        let desc_color = Color::White;
        let sep_color = Color::DarkGray;

        let key_desc = |key: &str, desc: &str| -> Vec<Span> {
            vec![
                Span::styled(
                    key.to_string(),
                    Style::default().fg(key_color).add_modifier(Modifier::BOLD),
                ),
                Span::styled("=".to_string(), Style::default().fg(sep_color)),
                Span::styled(desc.to_string(), Style::default().fg(desc_color)),
            ]
        };
        let separator = || Span::styled(" | ".to_string(), Style::default().fg(sep_color));

        let mut line1_spans = Vec::new();
        line1_spans.extend(key_desc("Space", if controls.playing { "Pause" } else { "Play" }));
        line1_spans.push(separator());
        line1_spans.extend(key_desc("↑↓", "BPM ±1"));
        line1_spans.push(separator());
        line1_spans.extend(key_desc("PgUp/PgDn", "BPM ±10"));
        line1_spans.push(separator());
        line1_spans.extend(key_desc("+/-", "Beats"));

        let mut line2_spans = Vec::new();
        line2_spans.extend(key_desc("←→", "Skip"));
        line2_spans.push(separator());
        line2_spans.extend(key_desc("M", if muted { "Unmute" } else { "Mute" }));
        line2_spans.push(separator());
        line2_spans.extend(key_desc("Q", "Quit"));

        let status_line = Line::from(vec![
            Span::styled(
                format!(" BPM: {:.0} ", controls.bpm),
                Style::default()
                    .fg(Color::Cyan)
                    .add_modifier(Modifier::BOLD),
            ),
            Span::styled(
                format!(" Beats: {} ", controls.beats),
                Style::default()
                    .fg(Color::Cyan)
                    .add_modifier(Modifier::BOLD),
            ),
            Span::styled(
                format!(" Measure: {} ", counter.measure + 1),
                Style::default()
                    .fg(Color::Green)
                    .add_modifier(Modifier::BOLD),
            ),
        ]);

        let footer = Paragraph::new(vec![
            Line::from(line1_spans),
            Line::from(line2_spans),
            status_line,
        ])
        .block(Block::default().borders(Borders::ALL).title("Controls"));

        f.render_widget(footer, area);
    }
}

impl Drop for TerminalUI {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(self.terminal.backend_mut(), LeaveAlternateScreen);
    }
}
