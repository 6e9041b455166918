//! Authentication and presence arbitration.
//!
//! The controller owns the broker-tier session map: one entry per account that passed the
//! credential check and has not yet been claimed by a game server. Inserting into that map is
//! the single-login guarantee, so check-in decides and inserts under one lock. Together with
//! the game server registry's live account sets it keeps an account on at most one tier.
//!
//! Lifecycle of an entry:
//! 1. `try_checkin` inserts it with a fresh `SessionKey`.
//! 2. The client picks a game server and hands the key over; the game server presents it back
//!    through `claim_session`, which removes the entry exactly once.
//! 3. Entries that are never claimed are removed when their client disconnects, or by the
//!    reaper once they are older than the login timeout.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use aden_account_db::{now_millis, AccountInfo, AccountStore, IpAuthKind};
use async_io::Timer;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::Mutex;
use rand::Rng;
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use crate::ban_list::BanList;
use crate::client::packets::{login_fail, LoginFailReason};
use crate::config::ServerConfig;
use crate::connection::ConnectionHandle;
use crate::game_server::packets::{kick_player, request_characters};
use crate::game_server_table::GameServerTable;

const MIN_REAPER_INTERVAL: Duration = Duration::from_secs(1);

/// Token proving a client passed the broker. The login pair is echoed by the client, the play
/// pair travels through the client to the game server, which presents it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionKey {
    pub play_ok1: i32,
    pub play_ok2: i32,
    pub login_ok1: i32,
    pub login_ok2: i32,
}

impl SessionKey {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            play_ok1: rng.gen(),
            play_ok2: rng.gen(),
            login_ok1: rng.gen(),
            login_ok2: rng.gen(),
        }
    }

    pub fn check_login_pair(&self, login_ok1: i32, login_ok2: i32) -> bool {
        self.login_ok1 == login_ok1 && self.login_ok2 == login_ok2
    }

    /// Without the licence screen the client never learns the login pair, so only the play
    /// pair can be compared.
    pub fn matches(&self, other: &SessionKey, show_licence: bool) -> bool {
        if show_licence {
            self == other
        } else {
            self.play_ok1 == other.play_ok1 && self.play_ok2 == other.play_ok2
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthLoginResult {
    InvalidPassword,
    AccountInactive,
    AccountBanned,
    AlreadyOnLs,
    AlreadyOnGs,
    AuthSuccess(SessionKey),
}

/// Characters an account has on one game server, as reported by that server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerCharacters {
    pub count: u8,
    /// Unix milliseconds at which each pending deletion completes.
    pub deletion_times: Vec<i64>,
}

struct AuthedSession {
    connection: ConnectionHandle,
    key: SessionKey,
    connected_at: Instant,
    characters: BTreeMap<u8, ServerCharacters>,
}

pub fn hash_password(password: &str) -> String {
    STANDARD.encode(Sha1::digest(password.as_bytes()))
}

pub struct LoginController {
    config: Arc<ServerConfig>,
    store: Arc<dyn AccountStore>,
    bans: Arc<BanList>,
    game_servers: Arc<GameServerTable>,
    sessions: Mutex<HashMap<String, AuthedSession>>,
    failed_attempts: Mutex<HashMap<IpAddr, u32>>,
}

impl LoginController {
    pub fn new(
        config: Arc<ServerConfig>,
        store: Arc<dyn AccountStore>,
        bans: Arc<BanList>,
        game_servers: Arc<GameServerTable>,
    ) -> Self {
        Self {
            config,
            store,
            bans,
            game_servers,
            sessions: Mutex::new(HashMap::new()),
            failed_attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn show_licence(&self) -> bool {
        self.config.show_licence
    }

    /// Loads the account and checks the password. Unknown logins are created on the fly when
    /// auto creation is on. Every failure counts towards banning `address`.
    pub async fn retrieve_account_info(&self, address: IpAddr, login: &str, password: &str) -> Option<AccountInfo> {
        if self.bans.is_banned(address) {
            info!("Refused login for '{login}' from banned address {address}");
            return None;
        }
        match self.retrieve(address, login, password).await {
            Ok(info) => info,
            Err(e) => {
                warn!("Could not retrieve account info for '{login}': {e}");
                None
            }
        }
    }

    async fn retrieve(&self, address: IpAddr, login: &str, password: &str) -> anyhow::Result<Option<AccountInfo>> {
        let hash = hash_password(password);
        if let Some(info) = self.store.lookup(login).await? {
            if !info.check_password_hash(&hash) {
                self.record_failed_attempt(address);
                return Ok(None);
            }
            self.clear_failed_attempts(address);
            return Ok(Some(info));
        }

        if !self.config.auto_create_accounts {
            self.record_failed_attempt(address);
            return Ok(None);
        }

        self.store
            .create(login, &hash, self.config.auto_create_access_level, &address.to_string())
            .await?;
        info!("Auto created account '{login}'");

        // read back, but never create twice
        match self.store.lookup(login).await? {
            Some(info) if info.check_password_hash(&hash) => {
                self.clear_failed_attempts(address);
                Ok(Some(info))
            }
            _ => {
                self.record_failed_attempt(address);
                Ok(None)
            }
        }
    }

    fn record_failed_attempt(&self, address: IpAddr) {
        let attempts = {
            let mut failed = self.failed_attempts.lock();
            let attempts = failed.entry(address).or_insert(0);
            *attempts += 1;
            *attempts
        };

        if attempts >= self.config.login_try_before_ban {
            self.bans.add_for(address, self.config.login_block_after_ban);
            // a fresh set of attempts once the ban lapses
            self.clear_failed_attempts(address);
            warn!("Added banned address {address}, too many login attempts");
        }
    }

    fn clear_failed_attempts(&self, address: IpAddr) {
        self.failed_attempts.lock().remove(&address);
    }

    #[cfg(test)]
    pub fn failed_attempts(&self, address: IpAddr) -> u32 {
        self.failed_attempts.lock().get(&address).copied().unwrap_or(0)
    }

    /// Decides whether `info` may hold a broker session from `address` and, when it may,
    /// inserts that session for `connection`.
    pub async fn try_checkin(
        &self,
        connection: &ConnectionHandle,
        address: IpAddr,
        info: &AccountInfo,
        connected_at: Instant,
    ) -> AuthLoginResult {
        if info.access_level < 0 {
            if info.access_level == self.config.auto_create_access_level {
                return AuthLoginResult::AccountInactive;
            }
            return AuthLoginResult::AccountBanned;
        }

        if !self.can_checkin(address, info).await {
            return AuthLoginResult::InvalidPassword;
        }

        if self.game_servers.find_account(&info.login).is_some() {
            return AuthLoginResult::AlreadyOnGs;
        }

        match self.sessions.lock().entry(info.login.clone()) {
            Entry::Occupied(_) => AuthLoginResult::AlreadyOnLs,
            Entry::Vacant(slot) => {
                let key = SessionKey::generate();
                slot.insert(AuthedSession {
                    connection: connection.clone(),
                    key,
                    connected_at,
                    characters: BTreeMap::new(),
                });
                AuthLoginResult::AuthSuccess(key)
            }
        }
    }

    /// Applies the account's ip allow/deny rules and stamps the last login on success.
    async fn can_checkin(&self, address: IpAddr, info: &AccountInfo) -> bool {
        let rules = match self.store.list_ip_auth_rules(&info.login).await {
            Ok(rules) => rules,
            Err(e) => {
                warn!("Could not load ip rules of '{}': {e}", info.login);
                return false;
            }
        };

        {
            let listed = |kind: IpAuthKind| rules.iter().filter(move |rule| rule.kind == kind).map(|rule| IpAddr::V4(rule.address));
            let mut allowed = listed(IpAuthKind::Allow).peekable();
            if allowed.peek().is_some() && !allowed.any(|a| a == address) {
                warn!("Check-in attempt from {address} not on the allow list of '{}'", info.login);
                return false;
            }
            if listed(IpAuthKind::Deny).any(|a| a == address) {
                warn!("Check-in attempt from {address} on the deny list of '{}'", info.login);
                return false;
            }
        }

        if let Err(e) = self.store.update_last_login(&info.login, now_millis(), &address.to_string()).await {
            warn!("Could not update last login of '{}': {e}", info.login);
            return false;
        }
        true
    }

    /// Closes and forgets whatever session `login` holds at the broker.
    pub fn kick_authed_client(&self, login: &str) -> bool {
        let Some(session) = self.sessions.lock().remove(login) else {
            return false;
        };
        session.connection.close_with(login_fail(LoginFailReason::AccountInUse));
        true
    }

    /// Asks the game server hosting `login` to drop it.
    pub fn kick_from_game_server(&self, login: &str) -> bool {
        let Some((server_id, connection)) = self.game_servers.find_account(login) else {
            return false;
        };
        info!("Asking game server {server_id} to kick '{login}'");
        connection.send(kick_player(login));
        true
    }

    pub fn request_characters(&self, login: &str) {
        for connection in self.game_servers.authed_connections() {
            connection.send(request_characters(login));
        }
    }

    #[cfg(test)]
    pub fn session_key(&self, login: &str) -> Option<SessionKey> {
        self.sessions.lock().get(login).map(|session| session.key)
    }

    /// Hands the session over to a game server. Succeeds at most once per issued key.
    pub fn claim_session(&self, login: &str, key: &SessionKey) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get(login) {
            Some(session) if session.key.matches(key, self.config.show_licence) => {
                sessions.remove(login);
                true
            }
            _ => false,
        }
    }

    /// Compare-and-remove: only drops the entry if `connection_id` still owns it.
    pub fn remove_session(&self, login: &str, connection_id: u64) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get(login) {
            Some(session) if session.connection.id() == connection_id => {
                sessions.remove(login);
                true
            }
            _ => false,
        }
    }

    /// Cleanup for a disconnecting client. A client that went on to a game server keeps its
    /// entry until the game server claims it or the login timeout runs out.
    pub fn client_disconnected(&self, login: &str, connection_id: u64, joined_game_server: bool, connected_at: Instant) {
        if !joined_game_server || connected_at.elapsed() >= self.config.login_timeout {
            self.remove_session(login, connection_id);
        }
    }

    /// Replaces what `server_id` last reported; an empty reply clears the entry.
    pub fn set_characters(&self, login: &str, server_id: u8, count: u8, deletion_times: Vec<i64>) {
        if let Some(session) = self.sessions.lock().get_mut(login) {
            if count == 0 && deletion_times.is_empty() {
                session.characters.remove(&server_id);
            } else {
                session.characters.insert(server_id, ServerCharacters { count, deletion_times });
            }
        }
    }

    pub fn characters(&self, login: &str) -> BTreeMap<u8, ServerCharacters> {
        self.sessions
            .lock()
            .get(login)
            .map(|session| session.characters.clone())
            .unwrap_or_default()
    }

    /// Whether `server_id` takes this login now; remembers it as the account's last server.
    pub async fn is_login_possible(&self, login: &str, access_level: i32, last_server: i32, server_id: u8) -> bool {
        if !self.game_servers.login_possible(server_id, access_level) {
            return false;
        }
        if last_server != server_id as i32 {
            if let Err(e) = self.store.record_last_server(login, server_id as i32).await {
                warn!("Could not set last server of '{login}': {e}");
            }
        }
        true
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Force-closes every session older than the login timeout as of `now`.
    pub fn reap_expired(&self, now: Instant) -> usize {
        let timeout = self.config.login_timeout;
        let mut reaped = 0;
        self.sessions.lock().retain(|login, session| {
            if now.saturating_duration_since(session.connected_at) < timeout {
                return true;
            }
            debug!("Session of '{login}' timed out");
            session.connection.close_with(login_fail(LoginFailReason::AccessFailed));
            reaped += 1;
            false
        });
        reaped
    }

    fn reaper_interval(&self) -> Duration {
        (self.config.login_timeout / 2).max(MIN_REAPER_INTERVAL)
    }

    pub async fn run_reaper(self: Arc<Self>) {
        let interval = self.reaper_interval();
        loop {
            Timer::after(interval).await;
            let reaped = self.reap_expired(Instant::now());
            if reaped > 0 {
                info!("Closed {reaped} timed out login sessions");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::sent_packets;
    use crate::game_server_table::{GameServerAddress, Registration};
    use aden_account_db::{IpAuthRule, MemoryAccountStore};
    use macro_rules_attribute::apply;

    struct Fixture {
        controller: Arc<LoginController>,
        store: Arc<MemoryAccountStore>,
        bans: Arc<BanList>,
        game_servers: Arc<GameServerTable>,
    }

    fn fixture(config: ServerConfig) -> Fixture {
        let store = Arc::new(MemoryAccountStore::new());
        store.insert_account("alice", &hash_password("secret"), 0);
        let bans = Arc::new(BanList::new());
        let game_servers = Arc::new(GameServerTable::new());
        let controller = Arc::new(LoginController::new(
            Arc::new(config),
            store.clone(),
            bans.clone(),
            game_servers.clone(),
        ));
        Fixture {
            controller,
            store,
            bans,
            game_servers,
        }
    }

    fn client() -> (ConnectionHandle, crate::connection::OutboundQueue) {
        ConnectionHandle::channel("10.0.0.1:50000".parse().unwrap())
    }

    fn address() -> IpAddr {
        "10.0.0.1".parse().unwrap()
    }

    async fn login(f: &Fixture, connection: &ConnectionHandle) -> AuthLoginResult {
        let info = f.controller.retrieve_account_info(address(), "alice", "secret").await.unwrap();
        f.controller.try_checkin(connection, address(), &info, Instant::now()).await
    }

    #[test]
    fn password_hash_is_base64_sha1() {
        assert_eq!(hash_password("admin"), "0DPiKuNIrrVmD8IUCuw1hQxNqZc=");
    }

    #[test]
    fn concurrent_checkins_admit_exactly_one() {
        let f = fixture(ServerConfig::default());
        let info = smol::block_on(f.store.lookup("alice")).unwrap().unwrap();
        let barrier = std::sync::Barrier::new(2);
        let (barrier, controller, info) = (&barrier, &f.controller, &info);

        let results: Vec<AuthLoginResult> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    scope.spawn(move || {
                        let (connection, _receiver) = client();
                        barrier.wait();
                        smol::block_on(controller.try_checkin(&connection, address(), info, Instant::now()))
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let successes = results.iter().filter(|r| matches!(r, AuthLoginResult::AuthSuccess(_))).count();
        assert_eq!(successes, 1);
        assert!(results.contains(&AuthLoginResult::AlreadyOnLs));
        assert_eq!(f.controller.session_count(), 1);
    }

    #[apply(smol_macros::test!)]
    async fn session_key_is_claimed_once() {
        let f = fixture(ServerConfig::default());
        let (connection, _receiver) = client();
        let AuthLoginResult::AuthSuccess(key) = login(&f, &connection).await else {
            panic!("login should succeed");
        };

        let mut forged = key;
        forged.login_ok2 = forged.login_ok2.wrapping_add(1);
        assert!(!f.controller.claim_session("alice", &forged));

        assert!(f.controller.claim_session("alice", &key));
        assert!(!f.controller.claim_session("alice", &key));
        assert_eq!(f.controller.session_key("alice"), None);
    }

    #[apply(smol_macros::test!)]
    async fn without_licence_only_the_play_pair_counts() {
        let f = fixture(ServerConfig {
            show_licence: false,
            ..Default::default()
        });
        let (connection, _receiver) = client();
        let AuthLoginResult::AuthSuccess(key) = login(&f, &connection).await else {
            panic!("login should succeed");
        };

        let presented = SessionKey {
            login_ok1: 0,
            login_ok2: 0,
            ..key
        };
        assert!(f.controller.claim_session("alice", &presented));
    }

    #[apply(smol_macros::test!)]
    async fn repeated_failures_ban_the_address() {
        let f = fixture(ServerConfig {
            login_try_before_ban: 3,
            login_block_after_ban: Duration::from_millis(300),
            ..Default::default()
        });

        for attempt in 1..=2 {
            assert!(f.controller.retrieve_account_info(address(), "alice", "wrong").await.is_none());
            assert_eq!(f.controller.failed_attempts(address()), attempt);
        }
        assert!(f.controller.retrieve_account_info(address(), "alice", "wrong").await.is_none());
        assert!(f.bans.is_banned(address()));
        assert_eq!(f.controller.failed_attempts(address()), 0);

        // right password, still banned
        assert!(f.controller.retrieve_account_info(address(), "alice", "secret").await.is_none());

        Timer::after(Duration::from_millis(400)).await;
        assert_eq!(f.controller.failed_attempts(address()), 0);
        assert!(f.controller.retrieve_account_info(address(), "alice", "secret").await.is_some());
    }

    #[apply(smol_macros::test!)]
    async fn unknown_login_fails_without_auto_create() {
        let f = fixture(ServerConfig {
            auto_create_accounts: false,
            ..Default::default()
        });
        assert!(f.controller.retrieve_account_info(address(), "nobody", "pw").await.is_none());
        assert_eq!(f.controller.failed_attempts(address()), 1);
        assert!(f.store.account("nobody").is_none());
    }

    #[apply(smol_macros::test!)]
    async fn auto_created_accounts_can_log_in_again() {
        let f = fixture(ServerConfig {
            auto_create_access_level: 3,
            ..Default::default()
        });
        let created = f.controller.retrieve_account_info(address(), "newbie", "pw").await.unwrap();
        assert_eq!(created.access_level, 3);
        assert_eq!(f.store.account("newbie").unwrap().password_hash, hash_password("pw"));

        let again = f.controller.retrieve_account_info(address(), "newbie", "pw").await.unwrap();
        assert_eq!(again.access_level, 3);
        assert!(f.controller.retrieve_account_info(address(), "newbie", "other").await.is_none());
    }

    #[apply(smol_macros::test!)]
    async fn negative_access_levels_are_refused() {
        let f = fixture(ServerConfig {
            auto_create_access_level: -1,
            ..Default::default()
        });
        f.store.insert_account("banned", &hash_password("pw"), -5);
        let (connection, _receiver) = client();

        let fresh = f.controller.retrieve_account_info(address(), "fresh", "pw").await.unwrap();
        assert_eq!(
            f.controller.try_checkin(&connection, address(), &fresh, Instant::now()).await,
            AuthLoginResult::AccountInactive
        );

        let banned = f.controller.retrieve_account_info(address(), "banned", "pw").await.unwrap();
        assert_eq!(
            f.controller.try_checkin(&connection, address(), &banned, Instant::now()).await,
            AuthLoginResult::AccountBanned
        );
    }

    #[apply(smol_macros::test!)]
    async fn ip_rules_restrict_checkin() {
        let f = fixture(ServerConfig::default());
        f.store.add_ip_auth_rule(
            "alice",
            IpAuthRule {
                address: "10.9.9.9".parse().unwrap(),
                kind: IpAuthKind::Allow,
            },
        );
        let (connection, _receiver) = client();
        assert_eq!(login(&f, &connection).await, AuthLoginResult::InvalidPassword);
        assert_eq!(f.store.account("alice").unwrap().last_active, 0);

        let allowed: IpAddr = "10.9.9.9".parse().unwrap();
        let info = f.store.lookup("alice").await.unwrap().unwrap();
        let result = f.controller.try_checkin(&connection, allowed, &info, Instant::now()).await;
        assert!(matches!(result, AuthLoginResult::AuthSuccess(_)));
        assert_eq!(f.store.account("alice").unwrap().last_ip, "10.9.9.9");
    }

    #[apply(smol_macros::test!)]
    async fn accounts_in_game_are_reported_on_gs() {
        let f = fixture(ServerConfig::default());
        let (game_server, gs_receiver) = ConnectionHandle::channel("127.0.0.1:9014".parse().unwrap());
        f.game_servers
            .register(
                Registration {
                    desired_id: 1,
                    accept_alternate: false,
                    hex_id: vec![1],
                    port: 7777,
                    max_players: 10,
                    addresses: Vec::<GameServerAddress>::new(),
                },
                game_server,
                true,
            )
            .unwrap();
        f.game_servers.add_accounts(1, ["alice".to_string()]);

        let (connection, _receiver) = client();
        assert_eq!(login(&f, &connection).await, AuthLoginResult::AlreadyOnGs);
        assert!(f.controller.kick_from_game_server("alice"));
        let (packets, closed) = sent_packets(&gs_receiver);
        assert_eq!(packets, vec![kick_player("alice")]);
        assert!(!closed);
    }

    #[apply(smol_macros::test!)]
    async fn kicking_closes_the_previous_client() {
        let f = fixture(ServerConfig::default());
        let (first, first_receiver) = client();
        assert!(matches!(login(&f, &first).await, AuthLoginResult::AuthSuccess(_)));

        let (second, _receiver) = client();
        assert_eq!(login(&f, &second).await, AuthLoginResult::AlreadyOnLs);
        assert!(f.controller.kick_authed_client("alice"));
        assert!(matches!(login(&f, &second).await, AuthLoginResult::AuthSuccess(_)));

        let (packets, closed) = sent_packets(&first_receiver);
        assert_eq!(packets, vec![login_fail(LoginFailReason::AccountInUse)]);
        assert!(closed);

        // the old connection's cleanup must not drop the new session
        f.controller.client_disconnected("alice", first.id(), false, Instant::now());
        assert_eq!(f.controller.session_count(), 1);
        f.controller.client_disconnected("alice", second.id(), false, Instant::now());
        assert_eq!(f.controller.session_count(), 0);
    }

    #[apply(smol_macros::test!)]
    async fn joined_clients_keep_their_session_on_disconnect() {
        let f = fixture(ServerConfig::default());
        let (connection, _receiver) = client();
        let AuthLoginResult::AuthSuccess(key) = login(&f, &connection).await else {
            panic!("login should succeed");
        };
        f.controller.client_disconnected("alice", connection.id(), true, Instant::now());
        assert!(f.controller.claim_session("alice", &key));
    }

    #[apply(smol_macros::test!)]
    async fn reaper_closes_stale_sessions() {
        let f = fixture(ServerConfig {
            login_timeout: Duration::from_secs(60),
            ..Default::default()
        });
        let (connection, receiver) = client();
        let started = Instant::now();
        let info = f.store.lookup("alice").await.unwrap().unwrap();
        f.controller.try_checkin(&connection, address(), &info, started).await;

        assert_eq!(f.controller.reap_expired(started + Duration::from_secs(59)), 0);
        assert_eq!(f.controller.reap_expired(started + Duration::from_secs(61)), 1);
        assert_eq!(f.controller.session_count(), 0);
        let (packets, closed) = sent_packets(&receiver);
        assert_eq!(packets, vec![login_fail(LoginFailReason::AccessFailed)]);
        assert!(closed);
    }

    #[test]
    fn reaper_interval_never_drops_to_zero() {
        let f = fixture(ServerConfig {
            login_timeout: Duration::ZERO,
            ..Default::default()
        });
        assert_eq!(f.controller.reaper_interval(), Duration::from_secs(1));
        let f = fixture(ServerConfig {
            login_timeout: Duration::from_secs(60),
            ..Default::default()
        });
        assert_eq!(f.controller.reaper_interval(), Duration::from_secs(30));
    }

    #[apply(smol_macros::test!)]
    async fn characters_are_recorded_per_server() {
        let f = fixture(ServerConfig::default());
        let (connection, _receiver) = client();
        login(&f, &connection).await;
        f.controller.set_characters("alice", 2, 3, vec![5_000]);
        f.controller.set_characters("alice", 4, 0, vec![]);
        f.controller.set_characters("nobody", 2, 1, vec![]);

        let characters = f.controller.characters("alice");
        assert_eq!(characters.len(), 1);
        assert_eq!(characters[&2].count, 3);
        assert_eq!(characters[&2].deletion_times, vec![5_000]);
    }

    #[apply(smol_macros::test!)]
    async fn later_character_reply_replaces_earlier_one() {
        let f = fixture(ServerConfig::default());
        let (connection, _receiver) = client();
        login(&f, &connection).await;
        f.controller.set_characters("alice", 2, 3, vec![5_000]);
        f.controller.set_characters("alice", 2, 0, vec![9_000]);
        let characters = f.controller.characters("alice");
        assert_eq!(characters[&2].count, 0);
        assert_eq!(characters[&2].deletion_times, vec![9_000]);

        f.controller.set_characters("alice", 2, 0, vec![]);
        assert!(f.controller.characters("alice").is_empty());
    }
}
