mod chat;

use std::io::{self, BufRead};
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use chat::{Chat, Command, Flow};
use nightingale::{ClientConfig, ClientConnection, PacketLossSimulation};

const INPUT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Parser)]
#[command(name = "nightingale-client")]
#[command(about = "Line-oriented chat client for a Nightingale relay")]
struct Args {
    #[arg(
        short,
        long,
        default_value = "127.0.0.1:27016",
        help = "Server address to connect to"
    )]
    server: String,

    #[arg(long, default_value_t = 3000, help = "Connect request timeout (ms)")]
    connect_timeout_ms: u64,

    #[arg(long, default_value_t = 3000, help = "Drop the connection after this much silence (ms)")]
    connection_timeout_ms: u64,

    #[arg(long, default_value_t = 1000, help = "Ping interval (ms)")]
    ping_interval_ms: u64,

    #[arg(long, help = "Enable outbound packet loss simulation")]
    simulate_packet_loss: bool,

    #[arg(long, default_value_t = 0.0, help = "Packet loss percentage (0-100)")]
    loss_percent: f32,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = ClientConfig {
        connect_timeout: Duration::from_millis(args.connect_timeout_ms),
        connection_timeout: Duration::from_millis(args.connection_timeout_ms),
        ping_interval: Duration::from_millis(args.ping_interval_ms),
        packet_loss: args
            .simulate_packet_loss
            .then(|| PacketLossSimulation::new(args.loss_percent)),
    };

    let (client, events) = ClientConnection::new(config);
    client
        .connect(&args.server)
        .with_context(|| format!("could not connect to {}", args.server))?;

    let (lines_tx, lines) = mpsc::channel();
    thread::Builder::new()
        .name("stdin".to_owned())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if lines_tx.send(line).is_err() {
                    break;
                }
            }
        })
        .context("could not start stdin reader")?;

    let mut chat = Chat::new(client.clone());
    'session: loop {
        loop {
            match events.try_recv() {
                Ok(event) => {
                    if print(chat.handle_event(event)) == Flow::Exit {
                        break 'session;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break 'session,
            }
        }

        let result = match lines.recv_timeout(INPUT_POLL_INTERVAL) {
            Ok(line) => chat.handle_command(Command::parse(&line)),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => chat.handle_command(Command::Quit),
        };
        if print(result) == Flow::Exit {
            break;
        }
    }

    client.disconnect();
    Ok(())
}

fn print((output, flow): (Vec<String>, Flow)) -> Flow {
    for line in output {
        println!("{}", line);
    }
    flow
}
