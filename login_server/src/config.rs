//! Server settings read from the environment (optionally seeded from a `.env` file).
//!
//! Every value has a default; a missing or unparsable variable silently falls back to it.

use std::collections::HashSet;
use std::env;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::admission::FloodSettings;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub login_host: String,
    pub login_port: u16,
    pub game_server_host: String,
    pub game_server_port: u16,
    pub server_versions: Vec<u8>,

    pub login_try_before_ban: u32,
    pub login_block_after_ban: Duration,
    pub accept_new_game_server: bool,
    pub show_licence: bool,
    pub auto_create_accounts: bool,
    pub auto_create_access_level: i32,
    pub login_timeout: Duration,
    pub packet_workers: usize,

    pub flood_protection: bool,
    pub flood: FloodSettings,
    pub denied_addresses: HashSet<IpAddr>,
    pub banned_ips_file: PathBuf,

    pub restart_schedule: bool,
    pub restart_after: Duration,

    pub database_url: Option<String>,
    pub db_connect_timeout: Duration,

    pub telnet_enabled: bool,
    pub telnet_port: u16,
    pub telnet_password: Option<String>,
    pub telnet_hosts: Vec<IpAddr>,

    pub email_enabled: bool,
    pub email_template_dir: PathBuf,
    pub email_server_name: String,
    pub email_server_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            login_host: "0.0.0.0".to_string(),
            login_port: 2106,
            game_server_host: "127.0.0.1".to_string(),
            game_server_port: 9014,
            server_versions: vec![14],
            login_try_before_ban: 5,
            login_block_after_ban: Duration::from_secs(900),
            accept_new_game_server: true,
            show_licence: true,
            auto_create_accounts: true,
            auto_create_access_level: 0,
            login_timeout: Duration::from_secs(60),
            packet_workers: 6,
            flood_protection: true,
            flood: FloodSettings {
                fast_connection_limit: 15,
                normal_connection_time: Duration::from_millis(700),
                fast_connection_time: Duration::from_millis(350),
                max_connection_per_ip: 50,
            },
            denied_addresses: HashSet::new(),
            banned_ips_file: PathBuf::from("config/banned_ip.cfg"),
            restart_schedule: false,
            restart_after: Duration::from_secs(24 * 3600),
            database_url: None,
            db_connect_timeout: Duration::from_secs(5),
            telnet_enabled: false,
            telnet_port: 12345,
            telnet_password: None,
            telnet_hosts: vec![IpAddr::from([127, 0, 0, 1])],
            email_enabled: false,
            email_template_dir: PathBuf::from("data/mail"),
            email_server_name: "Aden".to_string(),
            email_server_address: "noreply@localhost".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            login_host: var_or("LOGIN_HOST", defaults.login_host),
            login_port: var_or("LOGIN_PORT", defaults.login_port),
            game_server_host: var_or("GAME_SERVER_HOST", defaults.game_server_host),
            game_server_port: var_or("GAME_SERVER_PORT", defaults.game_server_port),
            server_versions: list_or("SERVER_VERSIONS", defaults.server_versions),
            login_try_before_ban: var_or("LOGIN_TRY_BEFORE_BAN", defaults.login_try_before_ban),
            login_block_after_ban: Duration::from_secs(var_or("LOGIN_BLOCK_AFTER_BAN", defaults.login_block_after_ban.as_secs())),
            accept_new_game_server: var_or("ACCEPT_NEW_GAME_SERVER", defaults.accept_new_game_server),
            show_licence: var_or("SHOW_LICENCE", defaults.show_licence),
            auto_create_accounts: var_or("AUTO_CREATE_ACCOUNTS", defaults.auto_create_accounts),
            auto_create_access_level: var_or("AUTO_CREATE_ACCOUNTS_ACCESS_LEVEL", defaults.auto_create_access_level),
            login_timeout: Duration::from_secs(var_or("LOGIN_TIMEOUT_SECONDS", defaults.login_timeout.as_secs())),
            packet_workers: var_or("PACKET_WORKERS", defaults.packet_workers).max(1),
            flood_protection: var_or("ENABLE_FLOOD_PROTECTION", defaults.flood_protection),
            flood: FloodSettings {
                fast_connection_limit: var_or("FAST_CONNECTION_LIMIT", defaults.flood.fast_connection_limit),
                normal_connection_time: Duration::from_millis(var_or(
                    "NORMAL_CONNECTION_TIME",
                    defaults.flood.normal_connection_time.as_millis() as u64,
                )),
                fast_connection_time: Duration::from_millis(var_or(
                    "FAST_CONNECTION_TIME",
                    defaults.flood.fast_connection_time.as_millis() as u64,
                )),
                max_connection_per_ip: var_or("MAX_CONNECTION_PER_IP", defaults.flood.max_connection_per_ip),
            },
            denied_addresses: list_or::<IpAddr>("DENIED_ADDRESSES", Vec::new()).into_iter().collect(),
            banned_ips_file: var_or("BANNED_IPS_FILE", defaults.banned_ips_file),
            restart_schedule: var_or("LOGIN_RESTART_SCHEDULE", defaults.restart_schedule),
            restart_after: Duration::from_secs(3600 * var_or("LOGIN_RESTART_TIME", defaults.restart_after.as_secs() / 3600)),
            database_url: env::var("LOGIN_DATABASE_URL").ok().filter(|url| !url.is_empty()),
            db_connect_timeout: Duration::from_secs(var_or("DB_CONNECT_TIMEOUT_SECONDS", defaults.db_connect_timeout.as_secs())),
            telnet_enabled: var_or("TELNET_ENABLED", defaults.telnet_enabled),
            telnet_port: var_or("TELNET_PORT", defaults.telnet_port),
            telnet_password: env::var("TELNET_PASSWORD").ok().filter(|p| !p.is_empty()),
            telnet_hosts: list_or("TELNET_HOSTS", defaults.telnet_hosts),
            email_enabled: var_or("EMAIL_ENABLED", defaults.email_enabled),
            email_template_dir: var_or("EMAIL_TEMPLATE_DIR", defaults.email_template_dir),
            email_server_name: var_or("EMAIL_SERVER_NAME", defaults.email_server_name),
            email_server_address: var_or("EMAIL_SERVER_ADDRESS", defaults.email_server_address),
        }
    }

    pub fn supports_version(&self, version: u8) -> bool {
        self.server_versions.contains(&version)
    }
}

fn var_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name).ok().and_then(|x| x.trim().parse::<T>().ok()).unwrap_or(default)
}

/// Comma separated list; any unparsable item discards the whole value.
fn list_or<T: FromStr>(name: &str, default: Vec<T>) -> Vec<T> {
    env::var(name)
        .ok()
        .and_then(|x| {
            x.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(|item| item.parse::<T>())
                .collect::<Result<Vec<_>, _>>()
                .ok()
        })
        .unwrap_or(default)
}
