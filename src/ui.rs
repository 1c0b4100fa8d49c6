use crate::protocol::Role;
use crate::session::{ChatSession, Message};
use crossterm::cursor::MoveTo;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Paragraph, Widget, Wrap};
use ratatui::{Frame, Terminal, TerminalOptions, Viewport};
use std::collections::HashSet;
use std::io;
use std::io::Write;
use std::time::Duration;

type TuiTerminal = Terminal<CrosstermBackend<io::Stdout>>;
type UiResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const VIEWPORT_HEIGHT: u16 = 14;
const INPUT_HEIGHT: u16 = 6;
const SOURCE_PREVIEW_CHARS: usize = 80;

// Restores terminal settings even if the loop exits early.
struct TerminalGuard;

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = io::stdout().flush();
    }
}

#[derive(Debug, Clone)]
struct LineSpec {
    text: String,
    style: Style,
}

impl LineSpec {
    fn new(text: impl Into<String>, style: Style) -> Self {
        Self {
            text: text.into(),
            style,
        }
    }
}

fn message_lines(message: &Message) -> Vec<LineSpec> {
    let (label, color) = match message.role {
        Role::User => ("You:", Color::Blue),
        Role::Assistant if message.streaming => ("Assistant (streaming...):", Color::Yellow),
        Role::Assistant => ("Assistant:", Color::Yellow),
    };
    let header_style = Style::default().fg(color).add_modifier(Modifier::BOLD);
    let body_style = Style::default().fg(color);

    let mut lines = vec![LineSpec::new(label, header_style)];
    for line in message.content.lines() {
        lines.push(LineSpec::new(format!("  {line}"), body_style));
    }
    if message.streaming {
        lines.push(LineSpec::new("  ▌", body_style));
    }

    if let Some(sources) = message.sources.as_ref().filter(|s| !s.is_empty()) {
        let source_style = Style::default().fg(Color::Cyan);
        lines.push(LineSpec::new(
            "  Sources:",
            source_style.add_modifier(Modifier::BOLD),
        ));
        for source in sources {
            let score = source
                .relevance_score
                .map(|score| format!(" ({score:.2})"))
                .unwrap_or_default();
            let preview = truncate(&source.content.replace('\n', " "), SOURCE_PREVIEW_CHARS);
            lines.push(LineSpec::new(
                format!("  - {}{}: {}", source.document_id, score, preview),
                source_style,
            ));
        }
    }
    lines
}

fn notice_lines(notice: &str) -> Vec<LineSpec> {
    vec![LineSpec::new(
        format!("ℹ {notice}"),
        Style::default()
            .fg(Color::Gray)
            .add_modifier(Modifier::ITALIC),
    )]
}

fn to_text(specs: Vec<LineSpec>) -> Text<'static> {
    Text::from(
        specs
            .into_iter()
            .map(|spec| Line::from(Span::styled(spec.text, spec.style)))
            .collect::<Vec<_>>(),
    )
}

fn rendered_height(specs: &[LineSpec], width: u16) -> u16 {
    let width = width.max(1) as usize;
    let total: usize = specs
        .iter()
        .map(|spec| spec.text.chars().count().max(1).div_ceil(width))
        .sum();
    total.min(u16::MAX as usize) as u16
}

fn truncate(value: &str, max: usize) -> String {
    if value.chars().count() > max {
        let kept: String = value.chars().take(max).collect();
        format!("{kept}...")
    } else {
        value.to_string()
    }
}

/// What a submitted input line asks the session to do.
#[derive(Debug, PartialEq, Eq)]
enum Intent {
    Send(String),
    Clear,
    Switch(String),
    Reload,
    Unknown(String),
}

fn parse_intent(input: &str) -> Intent {
    let trimmed = input.trim();
    let Some(command) = trimmed.strip_prefix('/') else {
        return Intent::Send(input.to_string());
    };

    let mut parts = command.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some("clear"), None, _) => Intent::Clear,
        (Some("reload"), None, _) => Intent::Reload,
        (Some("kb"), Some(id), None) => Intent::Switch(id.to_string()),
        _ => Intent::Unknown(trimmed.to_string()),
    }
}

struct InputBuffer {
    lines: Vec<String>,
    // Cursor column counts chars, not bytes.
    cursor_x: usize,
    cursor_y: usize,
}

impl InputBuffer {
    fn new() -> Self {
        Self {
            lines: vec![String::new()],
            cursor_x: 0,
            cursor_y: 0,
        }
    }

    fn clear(&mut self) {
        self.lines = vec![String::new()];
        self.cursor_x = 0;
        self.cursor_y = 0;
    }

    fn line_len(&self) -> usize {
        self.lines[self.cursor_y].chars().count()
    }

    fn byte_offset(&self) -> usize {
        let line = &self.lines[self.cursor_y];
        line.char_indices()
            .nth(self.cursor_x)
            .map_or(line.len(), |(index, _)| index)
    }

    fn insert_char(&mut self, c: char) {
        let offset = self.byte_offset();
        self.lines[self.cursor_y].insert(offset, c);
        self.cursor_x += 1;
    }

    fn delete_char(&mut self) {
        if self.cursor_x > 0 {
            self.cursor_x -= 1;
            let offset = self.byte_offset();
            self.lines[self.cursor_y].remove(offset);
        } else if self.cursor_y > 0 {
            let removed = self.lines.remove(self.cursor_y);
            self.cursor_y -= 1;
            self.cursor_x = self.line_len();
            self.lines[self.cursor_y].push_str(&removed);
        }
    }

    fn new_line(&mut self) {
        let offset = self.byte_offset();
        let remaining = self.lines[self.cursor_y].split_off(offset);
        self.lines.insert(self.cursor_y + 1, remaining);
        self.cursor_y += 1;
        self.cursor_x = 0;
    }

    fn move_left(&mut self) {
        if self.cursor_x > 0 {
            self.cursor_x -= 1;
        } else if self.cursor_y > 0 {
            self.cursor_y -= 1;
            self.cursor_x = self.line_len();
        }
    }

    fn move_right(&mut self) {
        if self.cursor_x < self.line_len() {
            self.cursor_x += 1;
        } else if self.cursor_y < self.lines.len() - 1 {
            self.cursor_y += 1;
            self.cursor_x = 0;
        }
    }

    fn move_up(&mut self) {
        if self.cursor_y > 0 {
            self.cursor_y -= 1;
            self.cursor_x = self.cursor_x.min(self.line_len());
        }
    }

    fn move_down(&mut self) {
        if self.cursor_y < self.lines.len() - 1 {
            self.cursor_y += 1;
            self.cursor_x = self.cursor_x.min(self.line_len());
        }
    }

    fn text(&self) -> String {
        self.lines.join("\n")
    }

    fn is_empty(&self) -> bool {
        self.lines.iter().all(|l| l.is_empty())
    }

    fn render(&self) -> Text<'static> {
        if self.is_empty() {
            return Text::from(Span::styled(
                "Ask a question, or /clear, /reload, /kb ID",
                Style::default().fg(Color::DarkGray),
            ));
        }
        Text::from(
            self.lines
                .iter()
                .map(|l| Line::from(l.clone()))
                .collect::<Vec<_>>(),
        )
    }
}

struct App {
    session: ChatSession,
    input: InputBuffer,
    should_quit: bool,
    // Messages already written to the scrollback.
    printed: HashSet<String>,
    seen_generation: u64,
    seen_kb: String,
    seen_history_version: u64,
    notice: Option<String>,
}

impl App {
    fn new(session: ChatSession) -> Self {
        let seen_generation = session.generation();
        let seen_kb = session.knowledge_base_id().to_string();
        Self {
            session,
            input: InputBuffer::new(),
            should_quit: false,
            printed: HashSet::new(),
            seen_generation,
            seen_kb,
            seen_history_version: 0,
            notice: None,
        }
    }

    fn draw(&self, f: &mut Frame) {
        let [live_area, status_area, input_area] = Layout::vertical([
            Constraint::Min(1),
            Constraint::Length(1),
            Constraint::Length(INPUT_HEIGHT),
        ])
        .areas(f.area());

        let live = self
            .session
            .messages()
            .iter()
            .find(|m| m.streaming)
            .filter(|_| self.session.is_streaming());
        if let Some(live) = live {
            let specs = message_lines(live);
            // Keep the newest text visible while the reply outgrows the area.
            let scroll = rendered_height(&specs, live_area.width).saturating_sub(live_area.height);
            let paragraph = Paragraph::new(to_text(specs))
                .wrap(Wrap { trim: false })
                .scroll((scroll, 0));
            f.render_widget(paragraph, live_area);
        }

        f.render_widget(Paragraph::new(self.status_line()), status_area);

        let title = format!(
            " {} (Enter to send, Esc to {}) ",
            self.session.knowledge_base_id(),
            if self.session.is_replying() { "stop" } else { "quit" }
        );
        let input_paragraph = Paragraph::new(self.input.render())
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(title)
                    .border_style(Style::default().fg(Color::DarkGray)),
            )
            .wrap(Wrap { trim: false });
        f.render_widget(input_paragraph, input_area);

        let cursor_x = (self.input.cursor_x + 1) as u16;
        let cursor_y = self.input.cursor_y as u16;
        let x = (input_area.x + cursor_x).min(input_area.x + input_area.width - 2);
        let y = (input_area.y + 1 + cursor_y).min(input_area.y + input_area.height - 2);
        f.set_cursor_position((x, y));
    }

    fn status_line(&self) -> Line<'static> {
        if let Some(error) = self.session.error() {
            return Line::from(Span::styled(
                format!("Error: {error}"),
                Style::default().fg(Color::Red),
            ));
        }
        let status = if let Some(notice) = &self.notice {
            notice.clone()
        } else if self.session.is_loading_history() {
            "Loading history...".to_string()
        } else if self.session.is_replying() {
            "Thinking...".to_string()
        } else {
            String::new()
        };
        Line::from(Span::styled(status, Style::default().fg(Color::DarkGray)))
    }

    /// Blocks not yet in the scrollback: finished messages, plus notices for
    /// cleared, switched or reloaded conversations.
    fn scrollback_output(&mut self) -> Vec<Vec<LineSpec>> {
        let mut output = Vec::new();

        if self.session.generation() != self.seen_generation {
            self.seen_generation = self.session.generation();
            self.printed.clear();
            let kb_id = self.session.knowledge_base_id();
            let notice = if kb_id == self.seen_kb {
                "History cleared".to_string()
            } else {
                format!("Switched to knowledge base {kb_id}")
            };
            self.seen_kb = kb_id.to_string();
            output.push(notice_lines(&notice));
        }

        // A reload replaces every message id; reprint the list once under a notice.
        if self.session.history_version() != self.seen_history_version {
            self.seen_history_version = self.session.history_version();
            if !self.printed.is_empty() {
                self.printed.clear();
                output.push(notice_lines("History reloaded"));
            }
        }

        for message in self.session.messages() {
            if message.streaming {
                break;
            }
            if self.printed.insert(message.id.clone()) {
                output.push(message_lines(message));
            }
        }
        output
    }

    fn flush_finished(&mut self, terminal: &mut TuiTerminal) -> UiResult<()> {
        for specs in self.scrollback_output() {
            append_lines(terminal, specs)?;
        }
        Ok(())
    }

    fn submit(&mut self) {
        let text = self.input.text();
        if text.trim().is_empty() {
            return;
        }
        self.notice = None;

        match parse_intent(&text) {
            Intent::Send(message) => {
                if self.session.send(&message) {
                    self.input.clear();
                } else {
                    self.notice = Some("Wait for the current reply to finish".to_string());
                }
            }
            Intent::Clear => {
                self.session.clear_history();
                self.input.clear();
            }
            Intent::Switch(kb_id) => {
                self.session.switch_knowledge_base(kb_id);
                self.input.clear();
            }
            Intent::Reload => {
                if self.session.load_history() {
                    self.input.clear();
                } else {
                    self.notice = Some("Cannot reload while a reply is in progress".to_string());
                }
            }
            Intent::Unknown(command) => {
                self.notice = Some(format!("Unknown command: {command}"));
            }
        }
    }

    fn handle_key(&mut self, key: KeyEvent) {
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            self.should_quit = true;
            return;
        }

        match key.code {
            KeyCode::Esc => {
                if !self.session.stop() {
                    self.should_quit = true;
                }
            }
            KeyCode::Enter => {
                if key.modifiers.contains(KeyModifiers::SHIFT) {
                    self.input.new_line();
                } else {
                    self.submit();
                }
            }
            KeyCode::Char(c) => self.input.insert_char(c),
            KeyCode::Backspace => self.input.delete_char(),
            KeyCode::Left => self.input.move_left(),
            KeyCode::Right => self.input.move_right(),
            KeyCode::Up => self.input.move_up(),
            KeyCode::Down => self.input.move_down(),
            KeyCode::Home => self.input.cursor_x = 0,
            KeyCode::End => self.input.cursor_x = self.input.line_len(),
            _ => {}
        }
    }

    fn handle_events(&mut self, terminal: &mut TuiTerminal) -> UiResult<()> {
        self.session.poll();
        self.flush_finished(terminal)?;

        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    self.handle_key(key);
                }
            }
        }
        Ok(())
    }
}

fn append_lines(terminal: &mut TuiTerminal, specs: Vec<LineSpec>) -> UiResult<()> {
    let width = terminal.size()?.width;
    let height = rendered_height(&specs, width).saturating_add(1);
    let mut text = to_text(specs);
    text.extend(Text::raw("\n"));
    // Insert above the inline viewport so the log stays in scrollback.
    terminal.insert_before(height, |buf| {
        let paragraph = Paragraph::new(text).wrap(Wrap { trim: false });
        paragraph.render(buf.area, buf);
    })?;
    Ok(())
}

/// Runs the interactive chat until the user quits.
pub fn run(session: ChatSession) -> UiResult<()> {
    enable_raw_mode()?;
    let _guard = TerminalGuard;

    let mut stdout = io::stdout();
    let (_, rows) = size()?;
    if rows > 0 {
        // Push existing screen content into scrollback without clearing it.
        for _ in 0..rows {
            writeln!(stdout)?;
        }
        stdout.flush()?;
    }
    execute!(stdout, MoveTo(0, 0))?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::with_options(
        backend,
        TerminalOptions {
            viewport: Viewport::Inline(VIEWPORT_HEIGHT),
        },
    )?;

    let mut app = App::new(session);
    terminal.draw(|f| app.draw(f))?;

    while !app.should_quit {
        app.handle_events(&mut terminal)?;
        terminal.draw(|f| app.draw(f))?;
    }

    terminal.clear()?;
    Ok(())
}
