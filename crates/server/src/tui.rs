use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::Level;
use ratatui::Frame;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Cell, Gauge, List, ListItem, Paragraph, Row, Table, TableState};

use nightingale::{ClientInfo, NetworkStats};

use crate::relay::Notice;

const MAX_LOG_LINES: usize = 500;

struct LogEntry {
    at: Duration,
    level: Level,
    text: String,
}

pub struct TuiState {
    started: Instant,
    local_addr: Option<SocketAddr>,
    max_clients: usize,
    logs: VecDeque<LogEntry>,
    selected: usize,
    pending_drop: Option<u32>,
}

impl TuiState {
    pub fn new(local_addr: Option<SocketAddr>, max_clients: usize) -> Self {
        Self {
            started: Instant::now(),
            local_addr,
            max_clients,
            logs: VecDeque::with_capacity(MAX_LOG_LINES),
            selected: 0,
            pending_drop: None,
        }
    }

    pub fn push(&mut self, notice: Notice) {
        if self.logs.len() >= MAX_LOG_LINES {
            self.logs.pop_front();
        }
        self.logs.push_back(LogEntry {
            at: self.started.elapsed(),
            level: notice.level,
            text: notice.text,
        });
    }

    pub fn log_info(&mut self, text: impl Into<String>) {
        self.push(Notice {
            level: Level::Info,
            text: text.into(),
        });
    }

    pub fn select_prev(&mut self, client_count: usize) {
        if client_count > 0 {
            self.selected = self.selected.checked_sub(1).unwrap_or(client_count - 1);
        }
    }

    pub fn select_next(&mut self, client_count: usize) {
        if client_count > 0 {
            self.selected = (self.selected + 1) % client_count;
        }
    }

    pub fn request_drop(&mut self, clients: &[ClientInfo]) {
        self.pending_drop = clients.get(self.selected).map(|c| c.client_id);
    }

    pub fn take_pending_drop(&mut self) -> Option<u32> {
        self.pending_drop.take()
    }

    fn clamp_selection(&mut self, client_count: usize) {
        if client_count == 0 {
            self.selected = 0;
        } else if self.selected >= client_count {
            self.selected = client_count - 1;
        }
    }
}

pub fn render(frame: &mut Frame, state: &mut TuiState, stats: &NetworkStats, clients: &[ClientInfo]) {
    state.clamp_selection(clients.len());

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Min(6),
            Constraint::Length(6),
            Constraint::Length(10),
            Constraint::Length(3),
        ])
        .split(frame.area());

    render_header(frame, chunks[0], state, clients.len());
    render_capacity(frame, chunks[1], state, clients.len());
    render_clients(frame, chunks[2], state, clients);
    render_network(frame, chunks[3], stats);
    render_log(frame, chunks[4], state);
    render_help(frame, chunks[5]);
}

fn render_header(frame: &mut Frame, area: Rect, state: &TuiState, client_count: usize) {
    let title = format!(
        " Nightingale Relay - Uptime: {} ",
        format_duration(state.started.elapsed().as_secs())
    );
    let block = Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    let addr = state
        .local_addr
        .map_or_else(|| "not listening".to_owned(), |a| a.to_string());
    let text = format!("Listening: {}  |  Clients: {}", addr, client_count);

    frame.render_widget(
        Paragraph::new(text)
            .block(block)
            .style(Style::default().fg(Color::White)),
        area,
    );
}

fn render_capacity(frame: &mut Frame, area: Rect, state: &TuiState, client_count: usize) {
    let block = Block::default()
        .title(" Capacity ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Green));

    let ratio = if state.max_clients == 0 {
        0.0
    } else {
        client_count as f64 / state.max_clients as f64
    };
    let gauge = Gauge::default()
        .block(block)
        .gauge_style(Style::default().fg(Color::Green))
        .ratio(ratio.min(1.0))
        .label(format!("{}/{} clients", client_count, state.max_clients));

    frame.render_widget(gauge, area);
}

fn render_clients(frame: &mut Frame, area: Rect, state: &TuiState, clients: &[ClientInfo]) {
    let block = Block::default()
        .title(" Clients ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Blue));

    let header = Row::new(["ID", "Address", "Latency", "Connected", "Idle"])
        .style(Style::default().fg(Color::Gray).add_modifier(Modifier::BOLD));

    let rows = clients.iter().map(|client| {
        let latency = client
            .latency
            .map_or_else(|| "-".to_owned(), |l| format!("{}ms", l.as_millis()));
        Row::new([
            Cell::from(client.client_id.to_string()),
            Cell::from(client.addr.to_string()),
            Cell::from(latency),
            Cell::from(format_duration(client.connected_at.elapsed().as_secs())),
            Cell::from(format!("{:.1}s", client.last_receive_time.elapsed().as_secs_f32())),
        ])
    });

    let widths = [
        Constraint::Length(4),
        Constraint::Min(22),
        Constraint::Length(9),
        Constraint::Length(10),
        Constraint::Length(7),
    ];
    let table = Table::new(rows, widths)
        .header(header)
        .block(block)
        .row_highlight_style(Style::default().fg(Color::Black).bg(Color::Cyan))
        .highlight_symbol("> ");

    let mut table_state = TableState::default();
    if !clients.is_empty() {
        table_state.select(Some(state.selected));
    }
    frame.render_stateful_widget(table, area, &mut table_state);
}

fn render_network(frame: &mut Frame, area: Rect, stats: &NetworkStats) {
    let block = Block::default()
        .title(" Network ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Yellow));

    let label = |text: &'static str| Span::styled(text, Style::default().fg(Color::Gray));
    let value = |text: String| Span::styled(text, Style::default().fg(Color::White));

    let lines = vec![
        Line::from(vec![
            label("Packets: "),
            value(format!("{} sent / {} recv", stats.packets_sent, stats.packets_received)),
        ]),
        Line::from(vec![
            label("Bytes: "),
            value(format!(
                "{} sent / {} recv",
                format_bytes(stats.bytes_sent),
                format_bytes(stats.bytes_received)
            )),
        ]),
        Line::from(vec![
            label("Discarded: "),
            value(stats.packets_discarded.to_string()),
        ]),
        Line::from(vec![
            label("Simulated loss: "),
            Span::styled(
                format!(
                    "{} ({:.1}%)",
                    stats.packets_simulated_lost,
                    stats.simulated_loss_ratio() * 100.0
                ),
                Style::default().fg(if stats.packets_simulated_lost > 0 {
                    Color::Red
                } else {
                    Color::White
                }),
            ),
        ]),
    ];

    frame.render_widget(Paragraph::new(lines).block(block), area);
}

fn render_log(frame: &mut Frame, area: Rect, state: &TuiState) {
    let block = Block::default()
        .title(" Events ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Magenta));

    let visible = area.height.saturating_sub(2) as usize;
    let items: Vec<ListItem> = state
        .logs
        .iter()
        .skip(state.logs.len().saturating_sub(visible))
        .map(|entry| {
            let color = match entry.level {
                Level::Error => Color::Red,
                Level::Warn => Color::Yellow,
                _ => Color::White,
            };
            ListItem::new(Line::from(vec![
                Span::styled(
                    format!("{} ", format_duration(entry.at.as_secs())),
                    Style::default().fg(Color::DarkGray),
                ),
                Span::styled(entry.text.as_str(), Style::default().fg(color)),
            ]))
        })
        .collect();

    frame.render_widget(List::new(items).block(block), area);
}

fn render_help(frame: &mut Frame, area: Rect) {
    let block = Block::default()
        .title(" Controls ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray));

    let text = Paragraph::new("q/ESC quit  |  Up/Down select client  |  k drop selected client")
        .block(block)
        .style(
            Style::default()
                .fg(Color::DarkGray)
                .add_modifier(Modifier::ITALIC),
        );

    frame.render_widget(text, area);
}

pub fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;
    format!("{:02}:{:02}:{:02}", hours, mins, secs)
}

pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{}B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1}KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1}MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1}GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
