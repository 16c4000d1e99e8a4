// lanchat: LAN group chat over UDP multicast, terminal front end with optional HTTP bridge.

mod bridge;
mod config;
mod interfaces;
mod session;
mod transport;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use lanchat_core::Millis;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use crate::bridge::History;
use crate::session::{ChatHandler, Session};

#[derive(Debug, Parser)]
#[command(name = "lanchat", version, about = "Group chat on the local network")]
struct Args {
    /// Nickname shown to others.
    #[arg(long)]
    nick: Option<String>,
    /// Multicast group address.
    #[arg(long)]
    group: Option<Ipv4Addr>,
    /// UDP port.
    #[arg(long)]
    port: Option<u16>,
    /// Config file (default: $LANCHAT_CONFIG, ~/.config/lanchat/config.toml, /etc/lanchat/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Serve the HTTP bridge on 127.0.0.1:<port>.
    #[arg(long)]
    http_port: Option<u16>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = config::load(args.config.as_deref())?;
    if let Some(n) = args.nick {
        cfg.nickname = n;
    }
    if let Some(g) = args.group {
        cfg.group = g;
    }
    if let Some(p) = args.port {
        cfg.port = p;
    }
    if args.http_port.is_some() {
        cfg.http_port = args.http_port;
    }
    cfg.validate().context("invalid configuration")?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let history = cfg.http_port.map(|_| Arc::new(History::new(cfg.history_limit)));
    let terminal = Arc::new(Terminal {
        history: history.clone(),
    });
    let session = Arc::new(
        Session::join(cfg.session_config()?, cfg.group, cfg.port, terminal.clone())
            .await
            .context("could not join the chat group")?,
    );

    tracing::debug!(client_id = %session.client_id(), "session ready");

    let bridge = match (cfg.http_port, history.clone()) {
        (Some(port), Some(history)) => {
            let bind = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
            let session = session.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = bridge::run_bridge(bind, session, history).await {
                    tracing::error!(%bind, "HTTP bridge stopped: {}", e);
                }
            }))
        }
        _ => None,
    };

    println!(
        "Joined {}:{} as {}. Type /help for commands.",
        cfg.group,
        cfg.port,
        session.nickname()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        let line = tokio::select! {
            r = &mut shutdown => {
                if let Err(e) = r {
                    tracing::warn!("signal handler: {}", e);
                }
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        match parse_command(&line) {
            Command::Empty => {}
            Command::Quit => break,
            Command::Help => print_help(),
            Command::Users => {
                let users = session.users();
                if users.is_empty() {
                    println!("* nobody else is online");
                } else {
                    println!("* online: {}", users.join(", "));
                }
            }
            Command::Chat(text) => match session.send_chat(&text).await {
                Ok(()) => {
                    terminal.show(session.nickname(), &text, false);
                    if let Some(h) = &history {
                        h.push(session.nickname(), &text);
                    }
                }
                Err(e) => println!("* not sent: {e}"),
            },
            Command::Private { target, text } => {
                match session.send_private(&target, &text).await {
                    Ok(()) => println!("{} (to {target}) {text}", stamp()),
                    Err(e) => println!("* not sent: {e}"),
                }
            }
            Command::Unknown(cmd) => println!("* unknown command {cmd}; try /help"),
            Command::Usage(usage) => println!("* usage: {usage}"),
        }
    }

    if let Some(task) = bridge {
        task.abort();
        let _ = task.await;
    }
    session.shutdown().await;
    Ok(())
}

/// Prints events to stdout and records public lines for the bridge.
struct Terminal {
    history: Option<Arc<History>>,
}

impl Terminal {
    fn show(&self, sender: &str, text: &str, private: bool) {
        let tag = if private { " (private)" } else { "" };
        if sender.is_empty() {
            println!("{}{tag} {text}", stamp());
        } else {
            println!("{}{tag} {sender}: {text}", stamp());
        }
    }
}

impl ChatHandler for Terminal {
    fn on_chat_message(&self, sender: &str, text: &str) {
        self.show(sender, text, false);
        if let Some(h) = &self.history {
            h.push(sender, text);
        }
    }

    fn on_private_message(&self, sender: &str, text: &str) {
        self.show(sender, text, true);
    }

    fn on_presence_update(&self, nickname: &str, timestamp: Millis) {
        tracing::trace!(%nickname, timestamp, "heartbeat");
    }

    fn on_user_joined(&self, nickname: &str) {
        println!("* {nickname} joined");
    }

    fn on_user_left(&self, nickname: &str) {
        println!("* {nickname} left");
    }

    fn on_network_status(&self, info: &str) {
        println!("* {info}");
    }
}

fn stamp() -> String {
    chrono::Local::now().format("[%H:%M]").to_string()
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Empty,
    Chat(String),
    Private { target: String, text: String },
    Users,
    Help,
    Quit,
    Unknown(String),
    Usage(&'static str),
}

fn parse_command(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Command::Chat(line.to_string());
    };
    let (cmd, args) = rest
        .split_once(char::is_whitespace)
        .map(|(c, a)| (c, a.trim()))
        .unwrap_or((rest, ""));
    match cmd {
        "pm" | "msg" => match args.split_once(char::is_whitespace) {
            Some((target, text)) if !text.trim().is_empty() => Command::Private {
                target: target.to_string(),
                text: text.trim().to_string(),
            },
            _ => Command::Usage("/pm <nick> <text>"),
        },
        "users" | "who" => Command::Users,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        // "//text" sends a line starting with '/'.
        _ if rest.starts_with('/') => Command::Chat(rest.to_string()),
        _ => Command::Unknown(format!("/{cmd}")),
    }
}

fn print_help() {
    println!("* commands:");
    println!("*   <text>             send to everyone");
    println!("*   /pm <nick> <text>  send to one member");
    println!("*   /users             list who is online");
    println!("*   /quit              leave the group");
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
