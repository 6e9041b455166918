//! Registry of game servers known to the broker.
//!
//! Registrations outlive connections: a game server that disconnects is only marked down, and
//! reconnecting with the same hex id re-attaches to its old entry. Every decision that reads
//! and then writes the table (registration, detaching, presence lookups) happens under a
//! single lock.

use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use aden_account_db::DBGameServer;
use anyhow::{anyhow, bail, Result};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::connection::ConnectionHandle;

pub const MIN_SERVER_ID: u8 = 1;
pub const MAX_SERVER_ID: u8 = 127;

/// Why a registration was refused; sent to the game server before closing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
pub enum LoginServerFailReason {
    WrongHexId = 3,
    IdReserved = 4,
    NoFreeId = 5,
    AlreadyLoggedIn = 7,
    InvalidGameServerVersion = 8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(i32)]
pub enum ServerStatus {
    Auto = 0,
    Good = 1,
    Normal = 2,
    Full = 3,
    Down = 4,
    GmOnly = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(i32)]
pub enum StatusAttribute {
    ListStatus = 1,
    ServerType = 2,
    SquareBrackets = 3,
    MaxPlayers = 4,
    TestServer = 5,
    AgeLimit = 6,
}

/// IPv4 network in `a.b.c.d/len` form; a bare address is a /32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    network: u32,
    mask: u32,
}

impl Subnet {
    pub fn contains(&self, address: Ipv4Addr) -> bool {
        u32::from(address) & self.mask == self.network
    }
}

impl FromStr for Subnet {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (address, prefix) = match s.split_once('/') {
            Some((address, prefix)) => (address, prefix.trim().parse::<u32>()?),
            None => (s, 32),
        };
        if prefix > 32 {
            bail!("Invalid subnet prefix /{prefix}");
        }
        let address: Ipv4Addr = address.trim().parse()?;
        let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
        Ok(Self {
            network: u32::from(address) & mask,
            mask,
        })
    }
}

/// Address a game server advertises to clients coming from `subnet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GameServerAddress {
    pub subnet: Subnet,
    pub address: Ipv4Addr,
}

/// Everything a game server announces in its auth packet, with hosts already resolved.
#[derive(Debug, Clone)]
pub struct Registration {
    pub desired_id: u8,
    pub accept_alternate: bool,
    pub hex_id: Vec<u8>,
    pub port: u16,
    pub max_players: i32,
    pub addresses: Vec<GameServerAddress>,
}

pub struct GameServerInfo {
    id: u8,
    hex_id: Vec<u8>,
    authed: bool,
    connection: Option<ConnectionHandle>,
    addresses: Vec<GameServerAddress>,
    port: u16,
    max_players: i32,
    status: ServerStatus,
    server_type: i32,
    age_limit: i32,
    pvp: bool,
    show_brackets: bool,
    accounts: HashSet<String>,
}

impl GameServerInfo {
    fn new(id: u8, hex_id: Vec<u8>) -> Self {
        Self {
            id,
            hex_id,
            authed: false,
            connection: None,
            addresses: Vec::new(),
            port: 0,
            max_players: 0,
            status: ServerStatus::Down,
            server_type: 1,
            age_limit: 0,
            pvp: true,
            show_brackets: false,
            accounts: HashSet::new(),
        }
    }

    fn attach(&mut self, connection: ConnectionHandle, registration: Registration) {
        self.authed = true;
        self.connection = Some(connection);
        self.port = registration.port;
        self.max_players = registration.max_players;
        self.addresses = registration.addresses;
        self.status = ServerStatus::Auto;
        self.accounts.clear();
    }

    fn address_for(&self, client: IpAddr) -> Ipv4Addr {
        let IpAddr::V4(client) = client else {
            return Ipv4Addr::LOCALHOST;
        };
        self.addresses
            .iter()
            .find(|a| a.subnet.contains(client))
            .map_or(Ipv4Addr::LOCALHOST, |a| a.address)
    }

    fn visible_status(&self, access_level: i32) -> ServerStatus {
        match self.status {
            _ if !self.authed => ServerStatus::Down,
            ServerStatus::GmOnly if access_level <= 0 => ServerStatus::Down,
            status => status,
        }
    }
}

/// One line of the client's server list, as seen from that client's address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerListEntry {
    pub id: u8,
    pub address: Ipv4Addr,
    pub port: u16,
    pub age_limit: u8,
    pub pvp: bool,
    pub current_players: u16,
    pub max_players: u16,
    pub up: bool,
    pub server_type: i32,
    pub brackets: bool,
}

#[derive(Default)]
pub struct GameServerTable {
    servers: Mutex<BTreeMap<u8, GameServerInfo>>,
}

pub fn server_name(id: u8) -> String {
    format!("Server {id}")
}

impl GameServerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the table with persisted registrations, all of them down.
    pub fn load(&self, rows: Vec<DBGameServer>) -> usize {
        let mut servers = self.servers.lock();
        for row in rows {
            let Ok(id) = u8::try_from(row.server_id) else {
                warn!("Skipped game server with out of range id {}", row.server_id);
                continue;
            };
            match hex::decode(&row.hex_id) {
                Ok(hex_id) => {
                    servers.insert(id, GameServerInfo::new(id, hex_id));
                }
                Err(e) => warn!("Skipped game server {id} with invalid hex id: {e}"),
            }
        }
        info!("Loaded {} registered game servers", servers.len());
        servers.len()
    }

    pub fn len(&self) -> usize {
        self.servers.lock().len()
    }

    /// Binds `connection` to a registration and returns the id it was given.
    ///
    /// A known id with the same hex id is re-attached unless it is already online. A known id
    /// with another hex id is moved to the first free id when both sides allow it. An unknown
    /// id is only accepted when new servers are.
    pub fn register(
        &self,
        registration: Registration,
        connection: ConnectionHandle,
        accept_new: bool,
    ) -> Result<u8, LoginServerFailReason> {
        let mut servers = self.servers.lock();
        let desired = registration.desired_id;
        let id = match servers.get(&desired) {
            Some(existing) if existing.hex_id == registration.hex_id => {
                if existing.authed {
                    return Err(LoginServerFailReason::AlreadyLoggedIn);
                }
                desired
            }
            Some(_) => {
                if !(accept_new && registration.accept_alternate) {
                    return Err(LoginServerFailReason::WrongHexId);
                }
                (MIN_SERVER_ID..=MAX_SERVER_ID)
                    .find(|id| !servers.contains_key(id))
                    .ok_or(LoginServerFailReason::NoFreeId)?
            }
            None => {
                if !accept_new {
                    return Err(LoginServerFailReason::WrongHexId);
                }
                if !(MIN_SERVER_ID..=MAX_SERVER_ID).contains(&desired) {
                    return Err(LoginServerFailReason::IdReserved);
                }
                desired
            }
        };

        let hex_id = registration.hex_id.clone();
        servers
            .entry(id)
            .or_insert_with(|| GameServerInfo::new(id, hex_id))
            .attach(connection, registration);
        Ok(id)
    }

    /// Detaches the server if `connection_id` is still the one bound to it.
    pub fn set_down(&self, id: u8, connection_id: u64) -> bool {
        let mut servers = self.servers.lock();
        let Some(server) = servers.get_mut(&id) else {
            return false;
        };
        if server.connection.as_ref().map(ConnectionHandle::id) != Some(connection_id) {
            return false;
        }
        server.authed = false;
        server.connection = None;
        server.status = ServerStatus::Down;
        server.accounts.clear();
        true
    }

    #[cfg(test)]
    pub fn hex_id(&self, id: u8) -> Option<Vec<u8>> {
        self.servers.lock().get(&id).map(|s| s.hex_id.clone())
    }

    pub fn add_accounts(&self, id: u8, accounts: impl IntoIterator<Item = String>) {
        if let Some(server) = self.servers.lock().get_mut(&id) {
            server.accounts.extend(accounts);
        }
    }

    pub fn remove_account(&self, id: u8, account: &str) -> bool {
        self.servers
            .lock()
            .get_mut(&id)
            .is_some_and(|server| server.accounts.remove(account))
    }

    /// The online server currently hosting `account`, if any.
    pub fn find_account(&self, account: &str) -> Option<(u8, ConnectionHandle)> {
        self.servers.lock().values().find_map(|server| match &server.connection {
            Some(connection) if server.authed && server.accounts.contains(account) => Some((server.id, connection.clone())),
            _ => None,
        })
    }

    pub fn authed_connections(&self) -> Vec<ConnectionHandle> {
        self.servers
            .lock()
            .values()
            .filter(|server| server.authed)
            .filter_map(|server| server.connection.clone())
            .collect()
    }

    pub fn apply_status(&self, id: u8, attribute: StatusAttribute, value: i32) -> Result<()> {
        let mut servers = self.servers.lock();
        let server = servers.get_mut(&id).ok_or_else(|| anyhow!("Unknown game server {id}"))?;
        match attribute {
            StatusAttribute::ListStatus => {
                server.status = ServerStatus::try_from(value).map_err(|_| anyhow!("Unknown server status {value}"))?;
            }
            StatusAttribute::ServerType => server.server_type = value,
            StatusAttribute::SquareBrackets => server.show_brackets = value == 1,
            StatusAttribute::MaxPlayers => server.max_players = value,
            StatusAttribute::AgeLimit => server.age_limit = value,
            StatusAttribute::TestServer => {}
        }
        Ok(())
    }

    /// An authenticated server with room that is not GM-only, or any authenticated server for
    /// staff accounts.
    pub fn login_possible(&self, id: u8, access_level: i32) -> bool {
        let servers = self.servers.lock();
        let Some(server) = servers.get(&id) else {
            return false;
        };
        if !server.authed {
            return false;
        }
        let has_room = (server.accounts.len() as i32) < server.max_players && server.status != ServerStatus::GmOnly;
        has_room || access_level > 0
    }

    pub fn server_list(&self, client: IpAddr, access_level: i32) -> Vec<ServerListEntry> {
        self.servers
            .lock()
            .values()
            .map(|server| ServerListEntry {
                id: server.id,
                address: server.address_for(client),
                port: server.port,
                age_limit: server.age_limit.clamp(0, u8::MAX as i32) as u8,
                pvp: server.pvp,
                current_players: server.accounts.len().min(u16::MAX as usize) as u16,
                max_players: server.max_players.clamp(0, u16::MAX as i32) as u16,
                up: server.visible_status(access_level) != ServerStatus::Down,
                server_type: server.server_type,
                brackets: server.show_brackets,
            })
            .collect()
    }
}
