//! Chat TUI for a huddle room using ratatui

use anyhow::Result;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span, Text},
    widgets::{Block, Borders, List, ListItem, Paragraph, Wrap},
    Frame, Terminal,
};
use std::io;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::client::HuddleClient;
use crate::messages::{ChatMessage, MessageType, Participant, ServerEvent};

/// How long a typing notice stays in the status bar
const TYPING_TTL: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
enum EntryKind {
    Text,
    Code(String),
    /// Only visible to us; the room never saw it
    Flagged(String),
    Notice,
}

#[derive(Debug, Clone)]
struct Entry {
    id: Option<Uuid>,
    author: String,
    content: String,
    kind: EntryKind,
}

impl Entry {
    fn from_message(message: ChatMessage) -> Self {
        let kind = match (message.message_type, &message.metadata) {
            (MessageType::Code, Some(meta)) => EntryKind::Code(meta.language.clone()),
            (MessageType::Code, None) => EntryKind::Code("code".to_string()),
            _ => EntryKind::Text,
        };
        let content = if message.attachments.is_empty() {
            message.content
        } else {
            format!("{} [{}]", message.content, message.attachments.join(", "))
        };
        Self {
            id: Some(message.id),
            author: message.sender.name,
            content,
            kind,
        }
    }

    fn notice(content: impl Into<String>) -> Self {
        Self {
            id: None,
            author: String::new(),
            content: content.into(),
            kind: EntryKind::Notice,
        }
    }
}

/// Everything the screen shows, independent of the connection
struct ChatView {
    room_id: String,
    entries: Vec<Entry>,
    participants: Vec<Participant>,
    typing: Option<(String, Instant)>,
    input: String,
    scroll: usize,
    status: String,
}

impl ChatView {
    fn new(room_id: &str, participants: Vec<Participant>) -> Self {
        Self {
            room_id: room_id.to_string(),
            entries: Vec::new(),
            participants,
            typing: None,
            input: String::new(),
            scroll: 0,
            status: "Connected".to_string(),
        }
    }

    fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::RoomJoined(ack) => {
                self.participants = ack.participants;
            }
            ServerEvent::ReceiveMessage(message) => {
                if self.typing.as_ref().is_some_and(|(u, _)| *u == message.sender.id) {
                    self.typing = None;
                }
                self.entries.push(Entry::from_message(message));
            }
            ServerEvent::MessageFlagged(flagged) => {
                let mut entry = Entry::from_message(flagged.message);
                entry.kind = EntryKind::Flagged(flagged.reason);
                self.entries.push(entry);
            }
            ServerEvent::MessageFailed(failed) => {
                self.status = format!("Not sent: {}", failed.reason);
            }
            ServerEvent::UserTyping(typing) => {
                self.typing = Some((typing.user_id, Instant::now()));
            }
            ServerEvent::MessageDeleted(id) => {
                self.entries.retain(|e| e.id != Some(id));
            }
            ServerEvent::CodeSnippetCreated(snippet) => {
                self.entries.push(Entry::notice(format!(
                    "{} started a {} snippet",
                    snippet.created_by, snippet.language
                )));
            }
            ServerEvent::CodeFlagged(flagged) => {
                self.status = format!("Code blocked: {}", flagged.reason);
            }
            ServerEvent::WorkspaceCreated(workspace) => {
                let name = workspace["name"].as_str().unwrap_or("workspace");
                self.entries
                    .push(Entry::notice(format!("Workspace {} uploaded", name)));
            }
            ServerEvent::FileSaved(saved) => {
                let path = saved["filePath"].as_str().unwrap_or("file");
                self.entries.push(Entry::notice(format!("{} saved", path)));
            }
            ServerEvent::Error(e) => {
                self.status = format!("Error ({}): {}", e.code, e.message);
            }
            // Live editing events are not rendered in the chat view
            ServerEvent::CodeUpdate(_)
            | ServerEvent::WorkspaceFlagged(_)
            | ServerEvent::FileOpened(_)
            | ServerEvent::FileUpdated(_) => {}
        }
    }

    /// Name of whoever typed recently, if anyone
    fn typing_user(&self, now: Instant) -> Option<&str> {
        self.typing
            .as_ref()
            .filter(|(_, at)| now.duration_since(*at) < TYPING_TTL)
            .map(|(user, _)| user.as_str())
    }
}

/// Run the TUI
pub async fn run(mut client: HuddleClient, room_id: &str) -> Result<()> {
    let participants = client.join(room_id).await?;

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut view = ChatView::new(room_id, participants);
    let mut should_quit = false;
    let mut last_typing_sent: Option<Instant> = None;

    // Main loop
    loop {
        terminal.draw(|f| draw_ui(f, &view))?;

        // Handle events with timeout
        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                match (key.code, key.modifiers) {
                    (KeyCode::Char('c'), KeyModifiers::CONTROL)
                    | (KeyCode::Char('q'), KeyModifiers::CONTROL) => {
                        should_quit = true;
                    }
                    (KeyCode::Enter, _) => {
                        let content = std::mem::take(&mut view.input);
                        if !content.trim().is_empty() {
                            view.status = "Sending...".to_string();
                            if let Err(e) = client.send_message(room_id, content).await {
                                view.status = format!("Error: {}", e);
                            }
                        }
                    }
                    (KeyCode::Backspace, _) => {
                        view.input.pop();
                    }
                    (KeyCode::Char(c), _) => {
                        view.input.push(c);
                        // Don't flood the room with typing notices
                        if last_typing_sent.map_or(true, |at| at.elapsed() > Duration::from_secs(1))
                        {
                            let _ = client.typing(room_id).await;
                            last_typing_sent = Some(Instant::now());
                        }
                    }
                    (KeyCode::Up, _) => {
                        view.scroll = view.scroll.saturating_sub(1);
                    }
                    (KeyCode::Down, _) => {
                        view.scroll += 1;
                    }
                    (KeyCode::PageUp, _) => {
                        view.scroll = view.scroll.saturating_sub(10);
                    }
                    (KeyCode::PageDown, _) => {
                        view.scroll += 10;
                    }
                    _ => {}
                }
            }
        }

        // Check for server events
        while let Some(event) = client.try_recv() {
            if matches!(event, ServerEvent::ReceiveMessage(_)) {
                view.status = "Ready".to_string();
            }
            view.handle_server_event(event);
        }

        if should_quit {
            break;
        }
    }

    // Leaving is best effort; the server drops membership on close anyway
    let _ = client.leave(room_id).await;

    // Restore terminal
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    Ok(())
}

fn draw_ui(f: &mut Frame, view: &ChatView) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(10),   // Transcript
            Constraint::Length(3), // Input
            Constraint::Length(1), // Status bar
        ])
        .split(f.area());

    draw_transcript(f, view, chunks[0]);
    draw_input(f, view, chunks[1]);
    draw_status(f, view, chunks[2]);
}

fn draw_transcript(f: &mut Frame, view: &ChatView, area: Rect) {
    let items: Vec<ListItem> = view
        .entries
        .iter()
        .skip(view.scroll.min(view.entries.len()))
        .map(|entry| {
            let (style, tag) = match &entry.kind {
                EntryKind::Text => (Style::default().fg(Color::White), String::new()),
                EntryKind::Code(language) => {
                    (Style::default().fg(Color::Green), format!(" [{}]", language))
                }
                EntryKind::Flagged(reason) => (
                    Style::default().fg(Color::Red),
                    format!(" [blocked: {}]", reason),
                ),
                EntryKind::Notice => {
                    return ListItem::new(Line::from(Span::styled(
                        format!("* {}", entry.content),
                        Style::default()
                            .fg(Color::DarkGray)
                            .add_modifier(Modifier::ITALIC),
                    )));
                }
            };

            let lines: Vec<Line> = entry
                .content
                .lines()
                .enumerate()
                .map(|(i, line)| {
                    if i == 0 {
                        Line::from(vec![
                            Span::styled(
                                format!("{}: ", entry.author),
                                Style::default()
                                    .fg(Color::Cyan)
                                    .add_modifier(Modifier::BOLD),
                            ),
                            Span::styled(line.to_string(), style),
                            Span::styled(tag.clone(), Style::default().fg(Color::Yellow)),
                        ])
                    } else {
                        Line::from(Span::styled(format!("    {}", line), style))
                    }
                })
                .collect();
            ListItem::new(Text::from(lines))
        })
        .collect();

    let transcript = List::new(items).block(
        Block::default()
            .title(format!(" {} ", view.room_id))
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::White)),
    );

    f.render_widget(transcript, area);
}

fn draw_input(f: &mut Frame, view: &ChatView, area: Rect) {
    let display_text = if view.input.is_empty() {
        "Type a message...".to_string()
    } else {
        view.input.clone()
    };

    let input = Paragraph::new(display_text)
        .style(Style::default().fg(Color::White))
        .block(
            Block::default()
                .title(" Input ")
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::Cyan)),
        )
        .wrap(Wrap { trim: false });

    f.render_widget(input, area);
    f.set_cursor_position((area.x + 1 + view.input.chars().count() as u16, area.y + 1));
}

fn draw_status(f: &mut Frame, view: &ChatView, area: Rect) {
    let count = view.participants.len();
    let typing = view
        .typing_user(Instant::now())
        .map(|user| format!(" | {} is typing...", user))
        .unwrap_or_default();
    let status_text = format!(
        " {} | {} participant{}{} | Ctrl+C to quit",
        view.status,
        count,
        if count == 1 { "" } else { "s" },
        typing
    );

    let status = Paragraph::new(status_text).style(Style::default().fg(Color::White).bg(Color::DarkGray));

    f.render_widget(status, area);
}
