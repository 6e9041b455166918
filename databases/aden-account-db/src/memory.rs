//! Process-local account store.
//!
//! Used when no database URL is configured and throughout the login server tests. It mirrors
//! the MySQL queries closely enough that callers cannot tell the two apart: temporary bans are
//! applied at lookup time, game server rows are upserted by id and ip auth rows are returned
//! exactly as stored.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

use crate::{now_millis, AccountInfo, AccountStore, DBGameServer, IpAuthRule};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryAccount {
    pub password_hash: String,
    pub access_level: i32,
    pub last_server: i32,
    pub last_active: i64,
    pub last_ip: String,
    pub email: Option<String>,
    pub pc_ip: String,
    pub hops: [String; 4],
}

#[derive(Default)]
struct MemoryState {
    accounts: HashMap<String, MemoryAccount>,
    ip_auth: HashMap<String, Vec<IpAuthRule>>,
    temp_bans: HashMap<String, i64>,
    game_servers: BTreeMap<i32, DBGameServer>,
}

#[derive(Default)]
pub struct MemoryAccountStore {
    state: Mutex<MemoryState>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_account(&self, login: &str, password_hash: &str, access_level: i32) {
        let account = MemoryAccount {
            password_hash: password_hash.to_string(),
            access_level,
            last_server: 1,
            ..Default::default()
        };
        self.state.lock().accounts.insert(login.to_string(), account);
    }

    pub fn set_email(&self, login: &str, email: &str) {
        if let Some(account) = self.state.lock().accounts.get_mut(login) {
            account.email = Some(email.to_string());
        }
    }

    pub fn add_ip_auth_rule(&self, login: &str, rule: IpAuthRule) {
        self.state.lock().ip_auth.entry(login.to_string()).or_default().push(rule);
    }

    /// Copy of the stored row, for inspection.
    pub fn account(&self, login: &str) -> Option<MemoryAccount> {
        self.state.lock().accounts.get(login).cloned()
    }

    pub fn temp_ban_expiry(&self, login: &str) -> Option<i64> {
        self.state.lock().temp_bans.get(login).copied()
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn lookup(&self, login: &str) -> Result<Option<AccountInfo>> {
        let now = now_millis();
        let state = self.state.lock();
        Ok(state.accounts.get(login).map(|account| {
            let temp_banned = state.temp_bans.get(login).is_some_and(|expiry| *expiry >= now);
            AccountInfo {
                login: login.to_string(),
                password_hash: account.password_hash.clone(),
                access_level: if temp_banned { -1 } else { account.access_level },
                last_server: account.last_server,
            }
        }))
    }

    async fn create(&self, login: &str, password_hash: &str, access_level: i32, ip: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.accounts.contains_key(login) {
            anyhow::bail!("Duplicate entry '{login}' for key 'PRIMARY'");
        }
        let account = MemoryAccount {
            password_hash: password_hash.to_string(),
            access_level,
            last_server: 1,
            last_active: now_millis(),
            last_ip: ip.to_string(),
            ..Default::default()
        };
        state.accounts.insert(login.to_string(), account);
        Ok(())
    }

    async fn update_last_login(&self, login: &str, last_active_millis: i64, ip: &str) -> Result<()> {
        if let Some(account) = self.state.lock().accounts.get_mut(login) {
            account.last_active = last_active_millis;
            account.last_ip = ip.to_string();
        }
        Ok(())
    }

    async fn update_access_level(&self, login: &str, access_level: i32) -> Result<()> {
        if let Some(account) = self.state.lock().accounts.get_mut(login) {
            account.access_level = access_level;
        }
        Ok(())
    }

    async fn record_last_server(&self, login: &str, server_id: i32) -> Result<()> {
        if let Some(account) = self.state.lock().accounts.get_mut(login) {
            account.last_server = server_id;
        }
        Ok(())
    }

    async fn record_traceroute(&self, login: &str, pc_ip: &str, hops: [&str; 4]) -> Result<()> {
        if let Some(account) = self.state.lock().accounts.get_mut(login) {
            account.pc_ip = pc_ip.to_string();
            account.hops = hops.map(str::to_string);
        }
        Ok(())
    }

    async fn list_ip_auth_rules(&self, login: &str) -> Result<Vec<IpAuthRule>> {
        Ok(self.state.lock().ip_auth.get(login).cloned().unwrap_or_default())
    }

    async fn load_game_servers(&self) -> Result<Vec<DBGameServer>> {
        Ok(self.state.lock().game_servers.values().cloned().collect())
    }

    async fn register_game_server(&self, server_id: i32, hex_id: &str, host: &str) -> Result<()> {
        let row = DBGameServer {
            server_id,
            hex_id: hex_id.to_string(),
            host: host.to_string(),
        };
        self.state.lock().game_servers.insert(server_id, row);
        Ok(())
    }

    async fn set_temp_ban(&self, login: &str, expiry_millis: i64) -> Result<()> {
        self.state.lock().temp_bans.insert(login.to_string(), expiry_millis);
        Ok(())
    }

    async fn update_password(&self, login: &str, password_hash: &str) -> Result<bool> {
        match self.state.lock().accounts.get_mut(login) {
            Some(account) => {
                account.password_hash = password_hash.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn user_email(&self, login: &str) -> Result<Option<String>> {
        Ok(self.state.lock().accounts.get(login).and_then(|a| a.email.clone()))
    }
}
