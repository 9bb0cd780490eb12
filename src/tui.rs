use std::collections::VecDeque;
use std::io::{self, Stdout};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossterm::ExecutableCommand;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use miette::IntoDiagnostic;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Clear, Paragraph, Wrap};

use crate::app::{ProgressEvent, ProgressSink, ProgressSinkKind};
use crate::classifier::CancelFlag;
use crate::error::CurateError;
use crate::review::{Confirmation, DeleteOutcome, ReviewView, Reviewer, SaveReport};
use crate::store::CurationStore;

const EVENTS_MAX: usize = 8;

type Screen = Terminal<CrosstermBackend<Stdout>>;

fn enter_screen() -> miette::Result<Screen> {
    let mut stdout = io::stdout();
    enable_raw_mode().into_diagnostic()?;
    stdout.execute(EnterAlternateScreen).into_diagnostic()?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).into_diagnostic()?;
    terminal.clear().into_diagnostic()?;
    Ok(terminal)
}

fn leave_screen() -> miette::Result<()> {
    disable_raw_mode().into_diagnostic()?;
    let mut stdout = io::stdout();
    stdout.execute(LeaveAlternateScreen).into_diagnostic()?;
    Ok(())
}

fn is_interrupt(key: &KeyEvent) -> bool {
    key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL)
}

/// Yes/no dialog on its own screen. Esc counts as no.
pub fn confirm(title: &str, question: &str) -> miette::Result<bool> {
    let mut terminal = enter_screen()?;

    let confirmed = loop {
        terminal
            .draw(|frame| {
                let block = Block::default().borders(Borders::ALL).title(title.to_string());
                let text = Paragraph::new(vec![
                    Line::from(question.to_string()),
                    Line::from("Press y to confirm, n to cancel."),
                ])
                .alignment(Alignment::Center)
                .block(block);
                frame.render_widget(text, frame.area());
            })
            .into_diagnostic()?;

        if event::poll(Duration::from_millis(100)).into_diagnostic()? {
            if let Event::Key(key) = event::read().into_diagnostic()? {
                match key.code {
                    KeyCode::Char('y') | KeyCode::Char('Y') => break true,
                    KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => break false,
                    _ if is_interrupt(&key) => break false,
                    _ => {}
                }
            }
        }
    };

    leave_screen()?;
    Ok(confirmed)
}

#[derive(Debug)]
struct ProgressState {
    phase: String,
    status: String,
    events: VecDeque<String>,
    started: Instant,
    cancel_requested: bool,
}

struct ScreenProgress {
    state: Arc<Mutex<ProgressState>>,
}

impl ProgressSink for ScreenProgress {
    fn event(&self, event: ProgressEvent) {
        if let Ok(mut state) = self.state.lock() {
            let message = event.message.trim().to_string();
            match parse_phase(&message) {
                Some((phase, status)) => {
                    state.phase = phase.to_string();
                    state.status = status.to_string();
                }
                None => state.status = message.clone(),
            }
            let line = match event.elapsed {
                Some(elapsed) => format!("{message} ({}ms)", elapsed.as_millis()),
                None => message,
            };
            state.events.push_back(line);
            while state.events.len() > EVENTS_MAX {
                state.events.pop_front();
            }
        }
    }
}

/// Full-screen progress display for a job running on a worker thread.
/// Esc, `q` or Ctrl-C raise the cancel flag; the job decides when to stop.
pub struct ProgressScreen {
    kind: ProgressSinkKind,
    cancel: CancelFlag,
    state: Arc<Mutex<ProgressState>>,
}

impl ProgressScreen {
    pub fn new(kind: ProgressSinkKind, cancel: CancelFlag) -> Self {
        Self {
            kind,
            cancel,
            state: Arc::new(Mutex::new(ProgressState {
                phase: "Start".to_string(),
                status: "starting".to_string(),
                events: VecDeque::new(),
                started: Instant::now(),
                cancel_requested: false,
            })),
        }
    }

    pub fn run<F, R>(&mut self, f: F) -> miette::Result<R>
    where
        F: FnOnce(&dyn ProgressSink) -> Result<R, CurateError> + Send + 'static,
        R: Send + 'static,
    {
        let mut terminal = enter_screen()?;

        let (tx, rx) = std::sync::mpsc::channel();
        let sink = ScreenProgress {
            state: self.state.clone(),
        };
        let handle = thread::spawn(move || tx.send(f(&sink)));

        let mut tick = 0usize;
        loop {
            if let Ok(state) = self.state.lock() {
                terminal
                    .draw(|frame| draw_progress(frame, self.kind, &state, tick))
                    .into_diagnostic()?;
            }

            if handle.is_finished() {
                leave_screen()?;
                let result = rx.try_recv();
                handle.join().ok();
                return match result {
                    Ok(result) => result.map_err(miette::Report::new),
                    Err(_) => Err(miette::Report::msg("worker thread stopped unexpectedly")),
                };
            }

            if event::poll(Duration::from_millis(120)).into_diagnostic()? {
                if let Event::Key(key) = event::read().into_diagnostic()? {
                    let stop = key.kind == KeyEventKind::Press
                        && (matches!(key.code, KeyCode::Esc | KeyCode::Char('q'))
                            || is_interrupt(&key));
                    if stop {
                        self.cancel.cancel();
                        if let Ok(mut state) = self.state.lock() {
                            state.cancel_requested = true;
                        }
                    }
                }
            }

            tick = tick.wrapping_add(1);
        }
    }
}

fn parse_phase(message: &str) -> Option<(&str, &str)> {
    let rest = message.strip_prefix("phase=")?;
    match rest.split_once(';') {
        Some((phase, status)) => Some((phase.trim(), status.trim())),
        None => Some((rest.trim(), "")),
    }
}

fn draw_progress(frame: &mut ratatui::Frame, kind: ProgressSinkKind, state: &ProgressState, tick: usize) {
    let area = frame.area();
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(2),
            Constraint::Length(4),
            Constraint::Min(3),
            Constraint::Length(1),
        ])
        .split(area);

    let heartbeat = if tick % 2 == 0 { "*" } else { " " };
    let op_label = match kind {
        ProgressSinkKind::Analyze => "Analyze",
        ProgressSinkKind::Clean => "Clean",
    };
    let header = Paragraph::new(Line::from(vec![
        Span::styled(
            "SERIES-CURATOR",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ),
        Span::raw(" "),
        Span::styled(env!("CARGO_PKG_VERSION"), Style::default().fg(Color::Gray)),
        Span::raw("   Op: "),
        Span::styled(op_label, Style::default().fg(Color::Cyan)),
        Span::raw("   "),
        Span::styled(heartbeat, Style::default().fg(Color::Green)),
    ]))
    .block(Block::default().borders(Borders::BOTTOM));
    frame.render_widget(header, chunks[0]);

    let phase_color = if state.cancel_requested {
        Color::Yellow
    } else {
        Color::Cyan
    };
    let status = Paragraph::new(vec![
        Line::from(vec![
            Span::styled("Phase: ", Style::default().fg(Color::Gray)),
            Span::styled(state.phase.clone(), Style::default().fg(phase_color)),
            Span::styled("   Elapsed: ", Style::default().fg(Color::Gray)),
            Span::raw(format!("{}s", state.started.elapsed().as_secs())),
        ]),
        Line::from(state.status.clone()),
        Line::from(if state.cancel_requested {
            Span::styled(
                "Cancelling after the current sequence...",
                Style::default().fg(Color::Yellow),
            )
        } else {
            Span::raw("")
        }),
    ])
    .wrap(Wrap { trim: true });
    frame.render_widget(status, chunks[1]);

    let events = state
        .events
        .iter()
        .map(|event| Line::from(format!("- {event}")))
        .collect::<Vec<_>>();
    let events = Paragraph::new(events)
        .block(Block::default().borders(Borders::TOP).title("Recent events"))
        .wrap(Wrap { trim: true });
    frame.render_widget(events, chunks[2]);

    let footer = Paragraph::new(Span::styled(
        "Esc/q: cancel",
        Style::default().fg(Color::Gray),
    ));
    frame.render_widget(footer, chunks[3]);
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Prompt {
    None,
    ConfirmDelete,
    ConfirmQuit,
    Notice(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReviewSummary {
    pub saved: usize,
    pub deleted: usize,
    pub discarded: usize,
}

/// Terminal front end of [`Reviewer`]. Keys map one-to-one onto reviewer
/// operations; destructive ones go through a y/n or save/discard prompt.
pub struct ReviewerUi<S: CurationStore> {
    reviewer: Reviewer<S>,
    prompt: Prompt,
    show_details: bool,
    status: String,
    summary: ReviewSummary,
}

impl<S: CurationStore> ReviewerUi<S> {
    pub fn new(reviewer: Reviewer<S>) -> Self {
        Self {
            reviewer,
            prompt: Prompt::None,
            show_details: false,
            status: String::new(),
            summary: ReviewSummary::default(),
        }
    }

    pub fn run(mut self) -> miette::Result<ReviewSummary> {
        if self.reviewer.is_empty() {
            return Ok(self.summary);
        }
        let mut terminal = enter_screen()?;

        loop {
            let view = self.reviewer.view();
            terminal
                .draw(|frame| draw_reviewer(frame, &self, view.as_ref()))
                .into_diagnostic()?;

            if event::poll(Duration::from_millis(100)).into_diagnostic()? {
                if let Event::Key(key) = event::read().into_diagnostic()? {
                    if key.kind != KeyEventKind::Press {
                        continue;
                    }
                    let code = if is_interrupt(&key) { KeyCode::Esc } else { key.code };
                    if self.handle_key(code) == Flow::Exit {
                        break;
                    }
                }
            }
        }

        leave_screen()?;
        Ok(self.summary)
    }

    fn handle_key(&mut self, code: KeyCode) -> Flow {
        match std::mem::replace(&mut self.prompt, Prompt::None) {
            Prompt::Notice(_) => Flow::Continue,
            Prompt::ConfirmDelete => self.answer_delete(code),
            Prompt::ConfirmQuit => self.answer_quit(code),
            Prompt::None => self.handle_browse_key(code),
        }
    }

    fn handle_browse_key(&mut self, code: KeyCode) -> Flow {
        match code {
            KeyCode::Left => {
                self.reviewer.previous_series();
            }
            KeyCode::Right => {
                self.reviewer.next_series();
            }
            KeyCode::Up => {
                self.reviewer.previous_image();
            }
            KeyCode::Down => {
                self.reviewer.next_image();
            }
            KeyCode::Char(' ') => {
                if self.reviewer.toggle_at_cursor() {
                    self.status = "toggled".to_string();
                }
            }
            KeyCode::Char('[') => {
                if !self.reviewer.move_cursor_up() {
                    self.status = "only included images can be reordered".to_string();
                }
            }
            KeyCode::Char(']') => {
                if !self.reviewer.move_cursor_down() {
                    self.status = "only included images can be reordered".to_string();
                }
            }
            KeyCode::Char('d') => self.prompt = Prompt::ConfirmDelete,
            KeyCode::Char('s') => {
                let report = self.reviewer.save();
                self.record_save(&report);
            }
            KeyCode::Char('r') => match self.reviewer.reset() {
                Ok(()) => self.status = "changes reverted".to_string(),
                Err(err) => self.prompt = Prompt::Notice(format!("Reset failed: {err}")),
            },
            KeyCode::Char('i') => self.show_details = !self.show_details,
            KeyCode::Char('q') | KeyCode::Esc => {
                if self.reviewer.has_unsaved_changes() {
                    self.prompt = Prompt::ConfirmQuit;
                } else {
                    return Flow::Exit;
                }
            }
            _ => {}
        }
        Flow::Continue
    }

    fn answer_delete(&mut self, code: KeyCode) -> Flow {
        let confirmation = match code {
            KeyCode::Char('y') | KeyCode::Char('Y') => Confirmation::Granted,
            KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => Confirmation::Denied,
            _ => {
                self.prompt = Prompt::ConfirmDelete;
                return Flow::Continue;
            }
        };
        match self.reviewer.delete_current(confirmation) {
            Ok(DeleteOutcome::Deleted { series_id }) => {
                self.summary.deleted += 1;
                self.status = format!("deleted series {series_id}");
                Flow::Continue
            }
            Ok(DeleteOutcome::Cancelled) => Flow::Continue,
            Ok(DeleteOutcome::NoSeriesRemaining) => {
                self.summary.deleted += 1;
                Flow::Exit
            }
            Err(err) => {
                self.prompt = Prompt::Notice(format!("Delete failed: {err}"));
                Flow::Continue
            }
        }
    }

    fn answer_quit(&mut self, code: KeyCode) -> Flow {
        match code {
            KeyCode::Char('s') | KeyCode::Char('S') => {
                let report = self.reviewer.save();
                self.record_save(&report);
                if report.is_clean() {
                    Flow::Exit
                } else {
                    Flow::Continue
                }
            }
            KeyCode::Char('d') | KeyCode::Char('D') => {
                self.summary.discarded = self.reviewer.unsaved_count();
                Flow::Exit
            }
            KeyCode::Char('c') | KeyCode::Char('C') | KeyCode::Esc => Flow::Continue,
            _ => {
                self.prompt = Prompt::ConfirmQuit;
                Flow::Continue
            }
        }
    }

    fn record_save(&mut self, report: &SaveReport) {
        self.summary.saved += report.saved.len();
        if report.is_clean() {
            self.status = format!("saved {} series", report.saved.len());
        } else {
            let failures = report
                .failed
                .iter()
                .map(|failure| format!("{}: {}", failure.base_name, failure.message))
                .collect::<Vec<_>>()
                .join("; ");
            self.prompt = Prompt::Notice(format!("Some series were not saved: {failures}"));
        }
    }
}

fn draw_reviewer<S: CurationStore>(frame: &mut ratatui::Frame, ui: &ReviewerUi<S>, view: Option<&ReviewView>) {
    let area = frame.area();
    let Some(view) = view else {
        frame.render_widget(Paragraph::new("No series to review."), area);
        return;
    };

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(2),
            Constraint::Length(4),
            Constraint::Min(4),
            Constraint::Length(2),
        ])
        .split(area);

    let mut header = vec![
        Span::styled(
            format!("Series {}/{}", view.position, view.total),
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ),
        Span::raw(format!("  {}  ", view.base_name)),
        Span::styled(
            format!("{}/{} included", view.included, view.images.len()),
            Style::default().fg(Color::Green),
        ),
        Span::raw(format!("  confidence {:.2}", view.confidence)),
    ];
    if view.dirty {
        header.push(Span::styled(" [modified]", Style::default().fg(Color::Yellow)));
    }
    frame.render_widget(
        Paragraph::new(Line::from(header)).block(Block::default().borders(Borders::BOTTOM)),
        chunks[0],
    );

    frame.render_widget(
        Paragraph::new(view.caption.clone())
            .block(Block::default().borders(Borders::BOTTOM).title("Caption"))
            .wrap(Wrap { trim: true }),
        chunks[1],
    );

    let body = if ui.show_details {
        Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
            .split(chunks[2])
    } else {
        Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(100)])
            .split(chunks[2])
    };

    let lines = view
        .images
        .iter()
        .enumerate()
        .map(|(index, image)| {
            let marker = match image.order {
                Some(order) => format!("[{order:>2}]"),
                None => "[ x]".to_string(),
            };
            let color = if image.included { Color::Green } else { Color::Red };
            let mut style = Style::default().fg(color);
            if index == view.cursor {
                style = style.add_modifier(Modifier::REVERSED);
            }
            Line::from(Span::styled(format!("{marker} {}", image.file_name), style))
        })
        .collect::<Vec<_>>();
    let scroll = view.cursor.saturating_sub(body[0].height.saturating_sub(3) as usize) as u16;
    frame.render_widget(
        Paragraph::new(lines)
            .block(Block::default().borders(Borders::ALL).title("Images"))
            .scroll((scroll, 0)),
        body[0],
    );

    if ui.show_details {
        let mut details = vec![
            Line::from(vec![
                Span::styled("Id: ", Style::default().fg(Color::Gray)),
                Span::raw(view.series_id.to_string()),
            ]),
            Line::from(vec![
                Span::styled("Reason: ", Style::default().fg(Color::Gray)),
                Span::raw(view.reason.clone()),
            ]),
        ];
        if let (Some(session), Some(image)) = (ui.reviewer.current(), view.images.get(view.cursor)) {
            details.push(Line::from(vec![
                Span::styled("Path: ", Style::default().fg(Color::Gray)),
                Span::raw(session.series().resolve_member(&image.file_name).to_string()),
            ]));
            details.push(Line::from(vec![
                Span::styled("Analyzed: ", Style::default().fg(Color::Gray)),
                Span::raw(session.series().created_at.format("%Y-%m-%d %H:%M").to_string()),
            ]));
        }
        frame.render_widget(
            Paragraph::new(details)
                .block(Block::default().borders(Borders::ALL).title("Details"))
                .wrap(Wrap { trim: true }),
            body[1],
        );
    }

    let mut footer = vec![Line::from(Span::styled(
        "←/→ series  ↑/↓ image  space toggle  [/] move  d delete  s save  r reset  i details  q quit",
        Style::default().fg(Color::Gray),
    ))];
    let mut status = ui.status.clone();
    if view.unsaved_series > 0 {
        status = format!("{} unsaved  {status}", view.unsaved_series);
    }
    footer.push(Line::from(status));
    frame.render_widget(Paragraph::new(footer), chunks[3]);

    let dialog = match &ui.prompt {
        Prompt::None => None,
        Prompt::ConfirmDelete => Some((
            "Delete",
            format!("Delete series {} from the database? (y/n)", view.base_name),
        )),
        Prompt::ConfirmQuit => Some((
            "Unsaved changes",
            "s: save and quit   d: discard and quit   c: cancel".to_string(),
        )),
        Prompt::Notice(message) => Some(("Notice", format!("{message}\n\nPress any key."))),
    };
    if let Some((title, text)) = dialog {
        let popup = centered(area, 60, 30);
        frame.render_widget(Clear, popup);
        frame.render_widget(
            Paragraph::new(text)
                .alignment(Alignment::Center)
                .wrap(Wrap { trim: true })
                .block(Block::default().borders(Borders::ALL).title(title)),
            popup,
        );
    }
}

fn centered(area: Rect, width_percent: u16, height_percent: u16) -> Rect {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - height_percent) / 2),
            Constraint::Percentage(height_percent),
            Constraint::Percentage((100 - height_percent) / 2),
        ])
        .split(area);
    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - width_percent) / 2),
            Constraint::Percentage(width_percent),
            Constraint::Percentage((100 - width_percent) / 2),
        ])
        .split(vertical[1])[1]
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;
    use crate::classifier::ClassificationOutcome;
    use crate::domain::{CandidateSequence, ClassificationResult, IncludedImage};
    use crate::store::{SeriesFilter, SqliteStore};

    fn reviewer_with_one_series() -> Reviewer<SqliteStore> {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let candidate = CandidateSequence::new(
            "a",
            vec![
                Utf8PathBuf::from("/p/a_01.jpg"),
                Utf8PathBuf::from("/p/a_02.jpg"),
                Utf8PathBuf::from("/p/a_03.jpg"),
            ],
        )
        .unwrap();
        let mut result = ClassificationResult::rejected("ok");
        result.is_series = true;
        result.included = vec![
            IncludedImage { path: "a_01.jpg".into(), order: 1 },
            IncludedImage { path: "a_02.jpg".into(), order: 2 },
        ];
        result.excluded = vec!["a_03.jpg".into()];
        let outcome = ClassificationOutcome {
            raw_response: "{}".into(),
            result,
            usage: None,
            skipped_images: 0,
        };
        store.create_series(&candidate, &outcome).unwrap();
        Reviewer::load(store, &SeriesFilter::confirmed()).unwrap()
    }

    #[test]
    fn phase_messages_split_into_phase_and_status() {
        assert_eq!(parse_phase("phase=Scan; scanning /x"), Some(("Scan", "scanning /x")));
        assert_eq!(parse_phase("phase=Done"), Some(("Done", "")));
        assert_eq!(parse_phase("plain"), None);
    }

    #[test]
    fn quit_with_unsaved_changes_asks_first() {
        let mut ui = ReviewerUi::new(reviewer_with_one_series());
        assert_eq!(ui.handle_key(KeyCode::Char(' ')), Flow::Continue);
        assert_eq!(ui.handle_key(KeyCode::Char('q')), Flow::Continue);
        assert_eq!(ui.prompt, Prompt::ConfirmQuit);
        assert_eq!(ui.handle_key(KeyCode::Char('c')), Flow::Continue);
        assert!(ui.reviewer.has_unsaved_changes());
        ui.handle_key(KeyCode::Char('q'));
        assert_eq!(ui.handle_key(KeyCode::Char('s')), Flow::Exit);
        assert_eq!(ui.summary.saved, 1);
    }

    #[test]
    fn denied_delete_keeps_the_series() {
        let mut ui = ReviewerUi::new(reviewer_with_one_series());
        ui.handle_key(KeyCode::Char('d'));
        assert_eq!(ui.prompt, Prompt::ConfirmDelete);
        ui.handle_key(KeyCode::Char('n'));
        assert_eq!(ui.reviewer.len(), 1);
        ui.handle_key(KeyCode::Char('d'));
        assert_eq!(ui.handle_key(KeyCode::Char('y')), Flow::Exit);
        assert_eq!(ui.summary.deleted, 1);
    }
}
