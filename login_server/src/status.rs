//! Operator console.
//!
//! A line based TCP session for allowed hosts behind a password. Sessions that ask for
//! `RedirectLogger` also receive the operational notices the broker broadcasts, such as game
//! servers connecting or players entering the world.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use cmdparse::Parsable;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use smol::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use smol::net::{TcpListener, TcpStream};
use smol::stream::StreamExt;
use tracing::{error, info, warn};

use crate::services::Services;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownRequest {
    Stop,
    Restart,
}

impl ShutdownRequest {
    pub fn exit_code(self) -> i32 {
        match self {
            ShutdownRequest::Stop => 0,
            ShutdownRequest::Restart => 2,
        }
    }
}

/// Fan-out of operational notices to subscribed console sessions.
#[derive(Default)]
pub struct Notices {
    listeners: Mutex<Vec<flume::Sender<String>>>,
}

impl Notices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> flume::Receiver<String> {
        let (sender, receiver) = flume::unbounded();
        self.listeners.lock().push(sender);
        receiver
    }

    /// Logs `message` and forwards it to every live subscriber.
    pub fn broadcast(&self, message: &str) {
        info!("{message}");
        self.listeners
            .lock()
            .retain(|listener| listener.send(message.to_string()).is_ok());
    }
}

#[derive(Debug, PartialEq, Eq, Parsable)]
enum ConsoleCommand {
    Help,
    Status,
    Unblock(String),
    Shutdown,
    Restart,
    #[cmd(rename = "RedirectLogger")]
    RedirectLogger,
    #[cmd(alias = "exit")]
    Quit,
}

const HELP: &[&str] = &[
    "The following is a list of all available commands: ",
    "help                - shows this help.",
    "status              - displays basic server statistics.",
    "unblock <ip>        - removes <ip> from banlist.",
    "shutdown            - shuts down server.",
    "restart             - restarts the server.",
    "RedirectLogger      - Telnet will give you some info about server in real time.",
    "quit                - closes telnet session.",
    "",
];

/// Console password: the configured one, or a random one written to the log.
pub fn console_password(configured: Option<&str>) -> String {
    match configured {
        Some(password) => password.to_string(),
        None => {
            let password: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(10)
                .map(char::from)
                .collect();
            info!("Console password has not been set, using random password {password}");
            password
        }
    }
}

pub async fn accept_console_connections(services: Arc<Services>, shutdown: flume::Sender<ShutdownRequest>) {
    if let Err(e) = accept_console(services, shutdown).await {
        error!("Console listener stopped: {e}");
    }
}

async fn accept_console(services: Arc<Services>, shutdown: flume::Sender<ShutdownRequest>) -> Result<()> {
    let password = Arc::new(console_password(services.config.telnet_password.as_deref()));
    let listener = TcpListener::bind(("0.0.0.0", services.config.telnet_port)).await?;
    info!("Telnet server is listening on port {}", services.config.telnet_port);
    loop {
        let (stream, addr) = listener.accept().await?;
        let services = services.clone();
        let shutdown = shutdown.clone();
        let password = password.clone();
        smol::spawn(async move {
            if let Err(e) = run_console(stream, addr, services, shutdown, &password).await {
                warn!("There has been an error executing console session of {addr}: {e}");
            }
        })
        .detach();
    }
}

async fn run_console(
    stream: TcpStream,
    addr: SocketAddr,
    services: Arc<Services>,
    shutdown: flume::Sender<ShutdownRequest>,
    password: &str,
) -> Result<()> {
    if !services.config.telnet_hosts.contains(&addr.ip()) {
        info!("Console connection attempt from {addr} rejected");
        return Ok(());
    }
    info!("Console connection from {addr} accepted");

    // command replies and redirected notices share one writer
    let (lines, outgoing) = flume::unbounded::<String>();
    let mut writer = stream.clone();
    smol::spawn(async move {
        while let Ok(line) = outgoing.recv_async().await {
            if writer.write_all(line.as_bytes()).await.is_err() || writer.flush().await.is_err() {
                break;
            }
        }
    })
    .detach();

    let mut input = BufReader::new(stream).lines();
    lines.send("Welcome To The Aden Telnet Session.\r\nPlease Insert Your Password!\r\nPassword: ".to_string())?;
    match input.next().await {
        Some(Ok(line)) if line.trim_end() == password => {
            lines.send("Password Correct!\r\n[Aden Login Server]\r\n".to_string())?;
        }
        Some(Ok(_)) => {
            lines.send("Incorrect Password!\r\nDisconnected...\r\n".to_string())?;
            return Ok(());
        }
        _ => return Ok(()),
    }

    while let Some(line) = input.next().await {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match cmdparse::parse::<_, ConsoleCommand>(line, ()) {
            Ok(ConsoleCommand::Help) => lines.send(HELP.join("\r\n"))?,
            Ok(ConsoleCommand::Status) => {
                lines.send(format!("Registered Server Count: {}\r\n", services.game_servers.len()))?;
                lines.send(format!("Authenticated Sessions: {}\r\n", services.controller.session_count()))?;
                lines.send(format!("Banned IP Count: {}\r\n", services.bans.len()))?;
            }
            Ok(ConsoleCommand::Unblock(address)) => {
                let removed = address.parse().is_ok_and(|ip| services.bans.remove(ip));
                if removed {
                    warn!("IP {address} removed via console by host {addr}");
                    lines.send(format!("The IP {address} has been removed from the hack protection list!\r\n"))?;
                } else {
                    lines.send("IP not found in hack protection list...\r\n".to_string())?;
                }
            }
            Ok(ConsoleCommand::Shutdown) => {
                lines.send("Bye Bye!\r\n".to_string())?;
                shutdown.send(ShutdownRequest::Stop)?;
                return Ok(());
            }
            Ok(ConsoleCommand::Restart) => {
                lines.send("Bye Bye!\r\n".to_string())?;
                shutdown.send(ShutdownRequest::Restart)?;
                return Ok(());
            }
            Ok(ConsoleCommand::RedirectLogger) => {
                let notices = services.notices.subscribe();
                let lines = lines.clone();
                smol::spawn(async move {
                    while let Ok(notice) = notices.recv_async().await {
                        if lines.send(format!("{notice}\r\n")).is_err() {
                            break;
                        }
                    }
                })
                .detach();
            }
            Ok(ConsoleCommand::Quit) => break,
            Err(_) => lines.send("Invalid Command\r\n".to_string())?,
        }
    }

    lines.send("Bye Bye!\r\n".to_string())?;
    info!("Console connection from {addr} was closed by client");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse() {
        assert_eq!(cmdparse::parse::<_, ConsoleCommand>("status", ()).unwrap(), ConsoleCommand::Status);
        assert_eq!(
            cmdparse::parse::<_, ConsoleCommand>("unblock 10.0.0.1", ()).unwrap(),
            ConsoleCommand::Unblock("10.0.0.1".to_string())
        );
        assert_eq!(
            cmdparse::parse::<_, ConsoleCommand>("RedirectLogger", ()).unwrap(),
            ConsoleCommand::RedirectLogger
        );
        assert_eq!(cmdparse::parse::<_, ConsoleCommand>("exit", ()).unwrap(), ConsoleCommand::Quit);
        assert!(cmdparse::parse::<_, ConsoleCommand>("reboot", ()).is_err());
    }

    #[test]
    fn notices_reach_subscribers_until_they_leave() {
        let notices = Notices::new();
        let first = notices.subscribe();
        let second = notices.subscribe();
        notices.broadcast("GameServer [1] Server 1 connected");
        assert_eq!(first.try_recv().unwrap(), "GameServer [1] Server 1 connected");
        assert_eq!(second.try_recv().unwrap(), "GameServer [1] Server 1 connected");

        drop(second);
        notices.broadcast("again");
        assert_eq!(first.try_recv().unwrap(), "again");
        assert_eq!(notices.listeners.lock().len(), 1);
    }

    #[test]
    fn shutdown_requests_map_to_exit_codes() {
        assert_eq!(ShutdownRequest::Stop.exit_code(), 0);
        assert_eq!(ShutdownRequest::Restart.exit_code(), 2);
    }
}
