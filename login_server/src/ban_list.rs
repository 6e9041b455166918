use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use aden_account_db::now_millis;
use anyhow::Result;
use parking_lot::Mutex;
use tracing::{info, warn};

/// Address bans keyed by exact address. An expiry of 0 never lapses.
///
/// Lookups also treat `a.b.c.0`, `a.b.0.0` and `a.0.0.0` entries as bans on the whole /24, /16
/// or /8 network, checked in that order after the exact address.
#[derive(Default)]
pub struct BanList {
    bans: Mutex<HashMap<IpAddr, i64>>,
}

impl BanList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps an existing ban untouched; the first ban on an address wins.
    pub fn add(&self, address: IpAddr, expiry_millis: i64) {
        self.bans.lock().entry(address).or_insert(expiry_millis);
    }

    pub fn add_for(&self, address: IpAddr, duration: Duration) {
        self.add(address, now_millis() + duration.as_millis() as i64);
    }

    pub fn is_banned(&self, address: IpAddr) -> bool {
        self.is_banned_at(address, now_millis())
    }

    /// Checks the exact address, then its /24, /16 and /8 wildcards. An expired match is
    /// dropped from the list on the spot.
    pub fn is_banned_at(&self, address: IpAddr, now_millis: i64) -> bool {
        let mut bans = self.bans.lock();
        let Some((key, expiry)) = ban_candidates(address).find_map(|candidate| bans.get(&candidate).map(|e| (candidate, *e))) else {
            return false;
        };

        if expiry > 0 && expiry < now_millis {
            bans.remove(&key);
            info!("Removed expired IP address ban {key}");
            return false;
        }
        true
    }

    pub fn remove(&self, address: IpAddr) -> bool {
        self.bans.lock().remove(&address).is_some()
    }

    pub fn len(&self) -> usize {
        self.bans.lock().len()
    }

    /// Loads `address[ expiry][ # comment]` lines. The expiry is a Unix timestamp in
    /// milliseconds; 0 or a missing value bans permanently. Returns the number of bans added.
    pub fn load_file(&self, path: &Path) -> Result<usize> {
        let contents = std::fs::read_to_string(path)?;
        let mut loaded = 0;
        for (line_number, line) in contents.lines().enumerate() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }

            let mut parts = line.split_whitespace();
            let Some(address) = parts.next().and_then(|a| a.parse::<IpAddr>().ok()) else {
                warn!("Skipped invalid ban address on line {} of {}", line_number + 1, path.display());
                continue;
            };
            let expiry = match parts.next().map(str::parse::<i64>) {
                None => 0,
                Some(Ok(expiry)) => expiry,
                Some(Err(_)) => {
                    warn!("Skipped invalid ban duration on line {} of {}", line_number + 1, path.display());
                    continue;
                }
            };
            self.add(address, expiry);
            loaded += 1;
        }
        Ok(loaded)
    }
}

fn ban_candidates(address: IpAddr) -> impl Iterator<Item = IpAddr> {
    let wildcards = match address {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            vec![Ipv4Addr::new(a, b, c, 0), Ipv4Addr::new(a, b, 0, 0), Ipv4Addr::new(a, 0, 0, 0)]
        }
        IpAddr::V6(_) => Vec::new(),
    };
    std::iter::once(address).chain(wildcards.into_iter().map(IpAddr::V4))
}
