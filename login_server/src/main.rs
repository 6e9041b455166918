//! Login server entry point.
//!
//! Architecture overview:
//! - Two listeners: game clients on the login port, game servers on the internal port. Each
//!   accepted socket passes the admission gate and then gets a reader task (protocol state
//!   machine) and a writer task (cipher and socket write half) joined by a flume channel.
//! - Shared state lives in a handful of services built here once: the login controller (broker
//!   sessions), the game server registry, the ban list and the account store. Each guards its
//!   own state with a lock and keeps every check-then-act inside a single lock scope.
//! - Background tasks: the session reaper, the burst filter purge, the optional operator
//!   console and the optional scheduled restart.
//! - The process exits with 0 on shutdown and 2 when a restart was requested.

use std::sync::Arc;

use aden_account_db::{AccountDatabase, AccountStore, MemoryAccountStore};
use anyhow::{anyhow, Result};
use async_ctrlc::CtrlC;
use async_io::Timer;
use macro_rules_attribute::apply;
use smol_macros::main;
use time::macros::format_description;
use tracing::{info, warn};
use tracing_subscriber::{fmt::time::UtcTime, EnvFilter};

mod admission;
mod ban_list;
mod client;
mod codec;
mod config;
mod connection;
mod crypt;
mod game_server;
mod game_server_table;
mod keys;
mod listener;
mod login_controller;
mod mail;
mod services;
mod state;
mod status;

use crate::admission::{AddressFilter, AdmissionGate, FloodProtection};
use crate::ban_list::BanList;
use crate::config::ServerConfig;
use crate::game_server_table::GameServerTable;
use crate::keys::KeyManager;
use crate::mail::MailSystem;
use crate::services::Services;
use crate::status::ShutdownRequest;

#[apply(main!)]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let timer = UtcTime::new(format_description!("[day]-[month]-[year] [hour]:[minute]:[second]"));
    tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new("aden=info,sqlx=warn"))
        .with_env_filter(EnvFilter::from_default_env())
        .with_timer(timer)
        .init();

    info!("Login server starting");
    let config = Arc::new(ServerConfig::from_env());

    let store: Arc<dyn AccountStore> = match &config.database_url {
        Some(url) => {
            info!("Connecting to account database");
            Arc::new(AccountDatabase::new(url, config.db_connect_timeout).await?)
        }
        None => {
            warn!("LOGIN_DATABASE_URL is not set, accounts are kept in memory only");
            Arc::new(MemoryAccountStore::new())
        }
    };

    let bans = Arc::new(BanList::new());
    match bans.load_file(&config.banned_ips_file) {
        Ok(loaded) => info!("Loaded {loaded} banned IP addresses"),
        Err(e) => warn!("Could not read {}: {e}", config.banned_ips_file.display()),
    }

    info!("Generating RSA and Blowfish keys");
    let keys = Arc::new(smol::unblock(KeyManager::generate).await?);

    let game_servers = Arc::new(GameServerTable::new());
    game_servers.load(store.load_game_servers().await?);

    let mail = if config.email_enabled {
        match MailSystem::load(
            &config.email_template_dir,
            &config.email_server_name,
            &config.email_server_address,
            store.clone(),
        ) {
            Ok(mail) => Some(mail),
            Err(e) => {
                warn!("Email system disabled, could not load templates: {e}");
                None
            }
        }
    } else {
        None
    };

    let services = Services::new(config.clone(), store, keys, bans.clone(), game_servers, mail);

    let client_gate = Arc::new(AdmissionGate::new(
        AddressFilter::for_clients(config.denied_addresses.clone()),
        bans.clone(),
        None,
    ));
    let game_server_gate = Arc::new(AdmissionGate::new(
        AddressFilter::for_game_servers(config.denied_addresses.clone()),
        bans,
        config.flood_protection.then(|| FloodProtection::new(config.flood.clone())),
    ));

    // bind failures are fatal
    let game_server_listener = listener::bind(&config.game_server_host, config.game_server_port).await?;
    let login_listener = listener::bind(&config.login_host, config.login_port).await?;

    smol::spawn(listener::accept_connections(
        game_server_listener,
        game_server_gate,
        services.clone(),
        game_server::accept,
    ))
    .detach();
    smol::spawn(client_gate.clone().purge_idle_addresses()).detach();
    smol::spawn(listener::accept_connections(
        login_listener,
        client_gate,
        services.clone(),
        client::accept,
    ))
    .detach();
    smol::spawn(services.controller.clone().run_reaper()).detach();

    let (shutdown_sender, shutdown_receiver) = flume::unbounded();

    if config.telnet_enabled {
        smol::spawn(status::accept_console_connections(services.clone(), shutdown_sender.clone())).detach();
    }

    if config.restart_schedule {
        let sender = shutdown_sender.clone();
        let restart_after = config.restart_after;
        info!("Scheduled restart in {} hours", restart_after.as_secs() / 3600);
        smol::spawn(async move {
            Timer::after(restart_after).await;
            info!("Scheduled restart");
            sender.send(ShutdownRequest::Restart).ok();
        })
        .detach();
    }

    let ctrlc = CtrlC::new().map_err(|e| anyhow!("Failed to register ctrl+c abort handler: {e}"))?;
    smol::spawn(async move {
        ctrlc.await;
        info!("Detected Ctrl+C, shutting down");
        shutdown_sender.send(ShutdownRequest::Stop).ok();
    })
    .detach();

    let request = shutdown_receiver.recv_async().await?;
    info!("Login server shut down ({request:?})");
    std::process::exit(request.exit_code());
}
