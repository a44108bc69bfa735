use anyhow::Result;
use crossterm::event::{KeyCode, KeyModifiers};
use hashdupe::Progress;
use ratatui::{
    layout::{Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph, Wrap},
};
use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::tui::{self, Term};

const REDRAW_EVERY: Duration = Duration::from_millis(100);
const LOG_LINES: usize = 100;

/// Live hashing progress, drawn on the alternate screen when a terminal is
/// available and printed to stderr otherwise.
pub struct HashProgress {
    title: String,
    current: String,
    expected_files: u64,
    expected_bytes: u64,
    hashed: u64,
    bytes: u64,
    skipped: u64,
    failed: u64,
    log_lines: VecDeque<String>,
    start: Instant,
    last_draw: Option<Instant>,
    /// None in plain mode.
    terminal: Option<Term>,
    stop: Arc<AtomicBool>,
}

impl HashProgress {
    pub fn new(title: impl Into<String>, stop: Arc<AtomicBool>) -> Self {
        Self {
            title: title.into(),
            current: String::new(),
            expected_files: 0,
            expected_bytes: 0,
            hashed: 0,
            bytes: 0,
            skipped: 0,
            failed: 0,
            log_lines: VecDeque::new(),
            start: Instant::now(),
            last_draw: None,
            terminal: None,
            stop,
        }
    }

    /// Switch to the progress screen when `interactive`, if the terminal
    /// allows it.
    pub fn start(&mut self, interactive: bool) {
        self.start = Instant::now();
        if !interactive {
            return;
        }
        match tui::enter() {
            Ok(t) => {
                self.terminal = Some(t);
                self.redraw(true);
            }
            Err(e) => {
                eprintln!("(progress: plain output mode, {e})");
            }
        }
    }

    /// Leave the progress screen and print a one-line summary.
    pub fn finish(mut self) -> Result<()> {
        if let Some(mut t) = self.terminal.take() {
            tui::leave(&mut t)?;
        }
        eprintln!(
            "{} {} files ({}) in {:.1}s, {} skipped, {} failed",
            if self.stop.load(Ordering::Relaxed) {
                "Stopped after"
            } else {
                "Hashed"
            },
            self.hashed,
            tui::fmt_size(self.bytes),
            self.start.elapsed().as_secs_f64(),
            self.skipped,
            self.failed,
        );
        Ok(())
    }

    fn log(&mut self, msg: String) {
        if self.terminal.is_none() {
            eprintln!("{}", msg);
            return;
        }
        self.log_lines.push_back(msg);
        if self.log_lines.len() > LOG_LINES {
            self.log_lines.pop_front();
        }
        self.redraw(true);
    }

    fn redraw(&mut self, force: bool) {
        if self.terminal.is_none() {
            return;
        }
        let now = Instant::now();
        if !force && self.last_draw.is_some_and(|last| now - last < REDRAW_EVERY) {
            return;
        }
        self.last_draw = Some(now);
        self.poll_keys();
        if let Err(e) = self.render() {
            tracing::debug!("progress render failed: {e}");
        }
    }

    /// q, Esc or Ctrl-C asks the pipeline to stop.
    fn poll_keys(&mut self) {
        while let Ok(Some(key)) = tui::next_key(Duration::ZERO) {
            let interrupt = key.code == KeyCode::Char('c') && key.modifiers == KeyModifiers::CONTROL;
            if interrupt || tui::is_key(&key, KeyCode::Char('q')) || tui::is_key(&key, KeyCode::Esc) {
                if !self.stop.swap(true, Ordering::Relaxed) {
                    self.log_lines.push_back("Stopping after files in flight...".to_string());
                }
            }
        }
    }

    fn render(&mut self) -> Result<()> {
        let Some(ref mut terminal) = self.terminal else {
            return Ok(());
        };

        let ratio = if self.expected_bytes > 0 {
            (self.bytes as f64 / self.expected_bytes as f64).min(1.0)
        } else if self.expected_files > 0 {
            (self.hashed as f64 / self.expected_files as f64).min(1.0)
        } else {
            0.0
        };
        let title = format!(" hashdupe: {} ", self.title);
        let current = self.current.clone();
        let counts = [
            ("Hashed:    ", Color::Cyan, format!("{} / {} files", self.hashed, self.expected_files)),
            (
                "Read:      ",
                Color::Yellow,
                format!("{} / {}", tui::fmt_size(self.bytes), tui::fmt_size(self.expected_bytes)),
            ),
            ("Skipped:   ", Color::Blue, self.skipped.to_string()),
            ("Failed:    ", Color::Red, self.failed.to_string()),
            ("Elapsed:   ", Color::Green, format!("{:.1}s", self.start.elapsed().as_secs_f64())),
        ];
        let log_lines: Vec<String> = self.log_lines.iter().cloned().collect();

        terminal.draw(|f| {
            let chunks = Layout::default()
                .direction(Direction::Vertical)
                .constraints([
                    Constraint::Length(9),
                    Constraint::Length(3),
                    Constraint::Min(0),
                ])
                .split(f.area());

            // "Hashing: " is 9 chars; subtract 2 for borders.
            let path_width = (chunks[0].width as usize).saturating_sub(2 + 9);
            let mut status_text = vec![
                Line::from(vec![
                    Span::styled("Hashing: ", Style::default().add_modifier(Modifier::BOLD)),
                    Span::raw(tui::truncate_path(&current, path_width)),
                ]),
                Line::from(""),
            ];
            status_text.extend(counts.iter().map(|(label, color, value)| {
                Line::from(vec![
                    Span::styled(*label, Style::default().fg(*color)),
                    Span::raw(value.clone()),
                ])
            }));
            let status = Paragraph::new(status_text)
                .block(Block::default().borders(Borders::ALL).title(title.as_str()))
                .wrap(Wrap { trim: false });
            f.render_widget(status, chunks[0]);

            let gauge = Gauge::default()
                .block(Block::default().borders(Borders::ALL).title(" q to stop "))
                .gauge_style(Style::default().fg(Color::Green))
                .ratio(ratio);
            f.render_widget(gauge, chunks[1]);

            let log_text: Vec<Line> = log_lines.iter().map(|l| Line::from(l.as_str())).collect();
            let log = Paragraph::new(log_text)
                .block(Block::default().borders(Borders::ALL).title(" Log "))
                .wrap(Wrap { trim: true });
            f.render_widget(log, chunks[2]);
        })?;

        Ok(())
    }
}

impl Progress for HashProgress {
    fn batch_started(&mut self, expected_files: u64, expected_bytes: u64) {
        self.expected_files = expected_files;
        self.expected_bytes = expected_bytes;
        if self.terminal.is_none() {
            eprintln!(
                "{}: {} files ({})",
                self.title,
                expected_files,
                tui::fmt_size(expected_bytes)
            );
        }
        self.redraw(true);
    }

    fn hashed(&mut self, path: &Path, bytes: u64) {
        self.hashed += 1;
        self.bytes += bytes;
        if self.terminal.is_some() {
            self.current = path.display().to_string();
        }
        self.redraw(false);
    }

    fn skipped(&mut self, _path: &Path) {
        self.skipped += 1;
        self.redraw(false);
    }

    fn failed(&mut self, path: &Path, error: &io::Error) {
        self.failed += 1;
        self.log(format!("Failed: {}: {}", path.display(), error));
    }
}

impl Drop for HashProgress {
    fn drop(&mut self) {
        if let Some(mut t) = self.terminal.take() {
            let _ = tui::leave(&mut t);
        }
    }
}
