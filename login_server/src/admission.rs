//! Connection admission, decided before a single protocol byte is exchanged.
//!
//! Order of checks: static address filter, ban list, then (game server listener only) flood
//! protection. A connection that passes holds an `Admitted` ticket whose drop releases its
//! slot in the flood table, whichever way the connection ends.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use aden_account_db::now_millis;
use async_io::Timer;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::ban_list::BanList;

const BURST_WINDOW_MILLIS: i64 = 1000;
const BURST_TRIES: i32 = 3;
const BURST_IDLE_MILLIS: i64 = 300_000;
const BURST_PURGE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Denied,
    Banned,
    Flooding,
}

struct BurstEntry {
    tries: i32,
    last_access: i64,
}

/// Static deny list plus, on the client listener, an IPv4-only rule with a short burst limit:
/// more than three connections that each follow the previous one within a second lock the
/// address out until it has been quiet for five minutes.
pub struct AddressFilter {
    denied: HashSet<IpAddr>,
    ipv4_only: bool,
    bursts: Option<Mutex<HashMap<Ipv4Addr, BurstEntry>>>,
}

impl AddressFilter {
    pub fn for_clients(denied: HashSet<IpAddr>) -> Self {
        Self {
            denied,
            ipv4_only: true,
            bursts: Some(Mutex::new(HashMap::new())),
        }
    }

    pub fn for_game_servers(denied: HashSet<IpAddr>) -> Self {
        Self {
            denied,
            ipv4_only: false,
            bursts: None,
        }
    }

    pub fn accepts(&self, address: IpAddr) -> bool {
        self.accepts_at(address, now_millis())
    }

    pub fn accepts_at(&self, address: IpAddr, now: i64) -> bool {
        if self.denied.contains(&address) {
            return false;
        }

        let v4 = match address {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(_) if self.ipv4_only => {
                info!("Someone tried to connect from something other than IPv4: {address}");
                return false;
            }
            IpAddr::V6(_) => return true,
        };

        let Some(bursts) = &self.bursts else {
            return true;
        };
        let mut bursts = bursts.lock();
        let Some(entry) = bursts.get_mut(&v4) else {
            bursts.insert(v4, BurstEntry { tries: 0, last_access: now });
            return true;
        };

        if entry.tries < 0 {
            entry.last_access = now;
            return false;
        }
        if entry.last_access + BURST_WINDOW_MILLIS > now {
            entry.last_access = now;
            if entry.tries >= BURST_TRIES {
                entry.tries = -1;
                return false;
            }
            entry.tries += 1;
        } else {
            entry.last_access = now;
        }
        true
    }

    pub fn purge_idle(&self, now: i64) {
        if let Some(bursts) = &self.bursts {
            bursts.lock().retain(|_, entry| entry.last_access >= now - BURST_IDLE_MILLIS);
        }
    }
}

#[derive(Debug, Clone)]
pub struct FloodSettings {
    pub fast_connection_limit: i32,
    pub normal_connection_time: Duration,
    pub fast_connection_time: Duration,
    pub max_connection_per_ip: i32,
}

struct ForeignConnection {
    connection_number: i32,
    last_connection: i64,
    flooding: bool,
}

pub struct FloodProtection {
    settings: FloodSettings,
    connections: Mutex<HashMap<IpAddr, ForeignConnection>>,
}

impl FloodProtection {
    pub fn new(settings: FloodSettings) -> Self {
        Self {
            settings,
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, address: IpAddr) -> bool {
        self.check_at(address, now_millis())
    }

    /// Counts a new connection from `address`, rejecting it when it arrives too fast or too
    /// many are already open. Rejected attempts still refresh the last connection time.
    pub fn check_at(&self, address: IpAddr, now: i64) -> bool {
        let mut connections = self.connections.lock();
        let Some(connection) = connections.get_mut(&address) else {
            connections.insert(
                address,
                ForeignConnection {
                    connection_number: 1,
                    last_connection: now,
                    flooding: false,
                },
            );
            return true;
        };

        connection.connection_number += 1;
        let elapsed = now - connection.last_connection;
        let normal = self.settings.normal_connection_time.as_millis() as i64;
        let fast = self.settings.fast_connection_time.as_millis() as i64;
        if (connection.connection_number > self.settings.fast_connection_limit && elapsed < normal)
            || elapsed < fast
            || connection.connection_number > self.settings.max_connection_per_ip
        {
            connection.last_connection = now;
            connection.connection_number -= 1;
            if !connection.flooding {
                warn!("Potential flood from {address}");
            }
            connection.flooding = true;
            return false;
        }

        if connection.flooding {
            connection.flooding = false;
            info!("Connection {address} is not considered as flooding anymore");
        }
        connection.last_connection = now;
        true
    }

    pub fn release(&self, address: IpAddr) {
        let mut connections = self.connections.lock();
        match connections.get_mut(&address) {
            Some(connection) => {
                connection.connection_number -= 1;
                if connection.connection_number <= 0 {
                    connections.remove(&address);
                }
            }
            None => warn!("Releasing flood protection for {address} which was not tracked"),
        }
    }

    #[cfg(test)]
    pub fn connection_count(&self, address: IpAddr) -> i32 {
        self.connections.lock().get(&address).map_or(0, |c| c.connection_number)
    }
}

pub struct AdmissionGate {
    filter: AddressFilter,
    bans: Arc<BanList>,
    flood: Option<FloodProtection>,
}

impl AdmissionGate {
    pub fn new(filter: AddressFilter, bans: Arc<BanList>, flood: Option<FloodProtection>) -> Self {
        Self { filter, bans, flood }
    }

    pub fn admit(self: &Arc<Self>, address: IpAddr) -> Result<Admitted, Admission> {
        if !self.filter.accepts(address) {
            return Err(Admission::Denied);
        }
        if self.bans.is_banned(address) {
            return Err(Admission::Banned);
        }
        if let Some(flood) = &self.flood {
            if !flood.check(address) {
                return Err(Admission::Flooding);
            }
        }
        Ok(Admitted {
            gate: self.clone(),
            address,
        })
    }

    fn release(&self, address: IpAddr) {
        if let Some(flood) = &self.flood {
            flood.release(address);
        }
    }

    #[cfg(test)]
    pub fn flood(&self) -> Option<&FloodProtection> {
        self.flood.as_ref()
    }

    /// Periodically forgets burst-filter entries that went quiet.
    pub async fn purge_idle_addresses(self: Arc<Self>) {
        loop {
            Timer::after(BURST_PURGE_INTERVAL).await;
            self.filter.purge_idle(now_millis());
        }
    }
}

/// Held for the lifetime of an accepted connection.
pub struct Admitted {
    gate: Arc<AdmissionGate>,
    address: IpAddr,
}

impl Drop for Admitted {
    fn drop(&mut self) {
        self.gate.release(self.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn settings(max_connection_per_ip: i32) -> FloodSettings {
        FloodSettings {
            fast_connection_limit: 15,
            normal_connection_time: Duration::from_millis(700),
            fast_connection_time: Duration::from_millis(350),
            max_connection_per_ip,
        }
    }

    #[test]
    fn fourth_rapid_connection_is_rejected() {
        let flood = FloodProtection::new(settings(3));
        let addr = ip("10.0.0.1");
        assert!(flood.check_at(addr, 0));
        assert!(flood.check_at(addr, 400));
        assert!(flood.check_at(addr, 800));
        assert!(!flood.check_at(addr, 1200));
        assert_eq!(flood.connection_count(addr), 3);

        flood.release(addr);
        assert!(flood.check_at(addr, 1200 + 701));
        assert_eq!(flood.connection_count(addr), 3);
    }

    #[test]
    fn attempts_inside_fast_window_are_rejected() {
        let flood = FloodProtection::new(settings(3));
        let addr = ip("10.0.0.2");
        assert!(flood.check_at(addr, 0));
        assert!(!flood.check_at(addr, 10));
        assert!(!flood.check_at(addr, 20));
        assert!(!flood.check_at(addr, 30));
        assert_eq!(flood.connection_count(addr), 1);

        // each rejection pushed the window forward
        assert!(!flood.check_at(addr, 300));
        assert!(flood.check_at(addr, 300 + 701));
    }

    #[test]
    fn release_removes_idle_entries() {
        let flood = FloodProtection::new(settings(3));
        let addr = ip("10.0.0.3");
        assert!(flood.check_at(addr, 0));
        flood.release(addr);
        assert_eq!(flood.connection_count(addr), 0);
        assert!(flood.check_at(addr, 1));
    }

    #[test]
    fn client_filter_refuses_ipv6_and_bursts() {
        let filter = AddressFilter::for_clients(HashSet::from([ip("10.9.9.9")]));
        assert!(!filter.accepts_at(ip("::1"), 0));
        assert!(!filter.accepts_at(ip("10.9.9.9"), 0));

        let addr = ip("10.0.0.4");
        for t in 0..4 {
            assert!(filter.accepts_at(addr, t * 100));
        }
        assert!(!filter.accepts_at(addr, 500));
        assert!(!filter.accepts_at(addr, 5_000));

        filter.purge_idle(5_000 + BURST_IDLE_MILLIS + 1);
        assert!(filter.accepts_at(addr, 5_000 + BURST_IDLE_MILLIS + 2));
    }

    #[test]
    fn gate_checks_bans_and_releases_on_drop() {
        let bans = Arc::new(BanList::new());
        bans.add(ip("10.1.0.0"), 0);
        let gate = Arc::new(AdmissionGate::new(
            AddressFilter::for_game_servers(HashSet::new()),
            bans,
            Some(FloodProtection::new(settings(3))),
        ));

        assert_eq!(gate.admit(ip("10.1.5.5")).err(), Some(Admission::Banned));

        let addr = ip("10.2.0.1");
        let ticket = gate.admit(addr).unwrap();
        assert_eq!(gate.flood().unwrap().connection_count(addr), 1);
        drop(ticket);
        assert_eq!(gate.flood().unwrap().connection_count(addr), 0);
    }
}
