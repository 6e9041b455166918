use anyhow::Result;
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::time::Duration;

mod accounts;
mod game_servers;
mod memory;

pub use memory::{MemoryAccount, MemoryAccountStore};

/// Snapshot of an account row taken for a single login attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountInfo {
    pub login: String,
    pub password_hash: String,
    /// Negative while the account is inactive, banned or temporarily banned.
    pub access_level: i32,
    pub last_server: i32,
}

impl AccountInfo {
    pub fn check_password_hash(&self, hash: &str) -> bool {
        self.password_hash == hash
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpAuthKind {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpAuthRule {
    pub address: Ipv4Addr,
    pub kind: IpAuthKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DBGameServer {
    pub server_id: i32,
    /// Lowercase hex rendering of the identity bytes.
    pub hex_id: String,
    pub host: String,
}

/// Everything the login server needs from account persistence.
///
/// Implementations must be safe to call from many connection tasks at once; every method is a
/// single idempotent statement against the backing store.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn lookup(&self, login: &str) -> Result<Option<AccountInfo>>;
    async fn create(&self, login: &str, password_hash: &str, access_level: i32, ip: &str) -> Result<()>;
    async fn update_last_login(&self, login: &str, last_active_millis: i64, ip: &str) -> Result<()>;
    async fn update_access_level(&self, login: &str, access_level: i32) -> Result<()>;
    async fn record_last_server(&self, login: &str, server_id: i32) -> Result<()>;
    async fn record_traceroute(&self, login: &str, pc_ip: &str, hops: [&str; 4]) -> Result<()>;
    async fn list_ip_auth_rules(&self, login: &str) -> Result<Vec<IpAuthRule>>;
    async fn load_game_servers(&self) -> Result<Vec<DBGameServer>>;
    async fn register_game_server(&self, server_id: i32, hex_id: &str, host: &str) -> Result<()>;
    async fn set_temp_ban(&self, login: &str, expiry_millis: i64) -> Result<()>;
    /// Returns false when no account row was updated.
    async fn update_password(&self, login: &str, password_hash: &str) -> Result<bool>;
    async fn user_email(&self, login: &str) -> Result<Option<String>>;
}

pub struct AccountDatabase {
    connection_pool: sqlx::MySqlPool,
}

impl AccountDatabase {
    pub async fn new(conn_string: &str, timeout: Duration) -> Result<Self> {
        let pool = sqlx::mysql::MySqlPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(timeout)
            .connect(conn_string)
            .await?;

        Ok(Self { connection_pool: pool })
    }
}

#[async_trait]
impl AccountStore for AccountDatabase {
    async fn lookup(&self, login: &str) -> Result<Option<AccountInfo>> {
        self.get_account_by_login(login, now_millis()).await
    }

    async fn create(&self, login: &str, password_hash: &str, access_level: i32, ip: &str) -> Result<()> {
        self.create_account(login, password_hash, access_level, ip, now_millis()).await
    }

    async fn update_last_login(&self, login: &str, last_active_millis: i64, ip: &str) -> Result<()> {
        self.set_account_last_login(login, last_active_millis, ip).await
    }

    async fn update_access_level(&self, login: &str, access_level: i32) -> Result<()> {
        self.set_account_access_level(login, access_level).await
    }

    async fn record_last_server(&self, login: &str, server_id: i32) -> Result<()> {
        self.set_account_last_server(login, server_id).await
    }

    async fn record_traceroute(&self, login: &str, pc_ip: &str, hops: [&str; 4]) -> Result<()> {
        self.set_account_last_tracert(login, pc_ip, hops).await
    }

    async fn list_ip_auth_rules(&self, login: &str) -> Result<Vec<IpAuthRule>> {
        self.get_account_ip_auth(login).await
    }

    async fn load_game_servers(&self) -> Result<Vec<DBGameServer>> {
        self.get_all_game_servers().await
    }

    async fn register_game_server(&self, server_id: i32, hex_id: &str, host: &str) -> Result<()> {
        self.upsert_game_server(server_id, hex_id, host).await
    }

    async fn set_temp_ban(&self, login: &str, expiry_millis: i64) -> Result<()> {
        self.set_account_temp_ban(login, expiry_millis).await
    }

    async fn update_password(&self, login: &str, password_hash: &str) -> Result<bool> {
        self.set_account_password(login, password_hash).await
    }

    async fn user_email(&self, login: &str) -> Result<Option<String>> {
        self.get_account_email(login).await
    }
}

/// Wall clock in Unix milliseconds; ban expiries and last-login stamps use this unit.
pub fn now_millis() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
