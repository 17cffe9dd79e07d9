mod console;
mod relay;
mod tui;

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::mpsc::Receiver;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;

use console::Console;
use nightingale::{PacketLossSimulation, Server, ServerConfig, ServerEvent};
use relay::Relay;
use tui::TuiState;

const UI_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Parser)]
#[command(name = "nightingale-server")]
#[command(about = "Chat relay over the Nightingale protocol")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    #[arg(short, long, default_value_t = nightingale::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value_t = nightingale::net::DEFAULT_MAX_CLIENTS)]
    max_clients: usize,

    #[arg(long, default_value_t = 3000, help = "Drop clients silent for this long (ms)")]
    client_timeout_ms: u64,

    #[arg(long)]
    headless: bool,

    #[arg(long, help = "Enable outbound packet loss simulation")]
    simulate_packet_loss: bool,

    #[arg(long, default_value_t = 0.0, help = "Packet loss percentage (0-100)")]
    loss_percent: f32,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = ServerConfig {
        client_timeout: Duration::from_millis(args.client_timeout_ms),
        max_clients: args.max_clients,
        packet_loss: args
            .simulate_packet_loss
            .then(|| PacketLossSimulation::new(args.loss_percent)),
    };
    let max_clients = config.max_clients;

    let (server, events) = Server::new(config);

    if args.headless {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    let bind_addr = SocketAddr::new(args.bind, args.port);
    server
        .start_on(bind_addr)
        .with_context(|| format!("could not start server on {}", bind_addr))?;

    if args.headless {
        run_headless(&server, events);
    } else {
        run_with_tui(&server, events, max_clients)?;
    }

    server.stop();
    Ok(())
}

fn run_headless(server: &Server, events: Receiver<ServerEvent>) {
    let mut relay = Relay::new(server.clone());
    for event in events {
        let stopped = event == ServerEvent::ServerStopped;
        for notice in relay.handle(event) {
            log::log!(notice.level, "{}", notice.text);
        }
        if stopped {
            break;
        }
    }
}

fn run_with_tui(server: &Server, events: Receiver<ServerEvent>, max_clients: usize) -> io::Result<()> {
    let mut console = Console::enter()?;
    let result = run_dashboard(console.terminal(), server, events, max_clients);
    console.restore()?;
    result
}

fn run_dashboard(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    server: &Server,
    events: Receiver<ServerEvent>,
    max_clients: usize,
) -> io::Result<()> {
    let mut relay = Relay::new(server.clone());
    let mut tui_state = TuiState::new(server.local_addr(), max_clients);
    if let Some(addr) = server.local_addr() {
        tui_state.log_info(format!("Server started on {}", addr));
    }

    let mut running = true;
    while running {
        while let Ok(event) = events.try_recv() {
            for notice in relay.handle(event) {
                tui_state.push(notice);
            }
        }

        if let Some(client_id) = tui_state.take_pending_drop() {
            if server.drop_client(client_id, "Dropped by operator.") {
                tui_state.log_info(format!("Dropping client {}", client_id));
            }
        }

        let clients = server.client_infos();

        if event::poll(UI_POLL_INTERVAL)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => running = false,
                        KeyCode::Up => tui_state.select_prev(clients.len()),
                        KeyCode::Down => tui_state.select_next(clients.len()),
                        KeyCode::Char('k') | KeyCode::Char('K') => tui_state.request_drop(&clients),
                        _ => {}
                    }
                }
            }
        }

        let stats = server.stats();
        terminal.draw(|frame| {
            tui::render(frame, &mut tui_state, &stats, &clients);
        })?;
    }

    Ok(())
}
