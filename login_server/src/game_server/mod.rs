//! Game server links on the internal port.
//!
//! Handshake:
//! 1. On accept the broker sends InitLS with its RSA modulus, under the fixed bootstrap key.
//! 2. The game server answers with its own Blowfish key wrapped in that RSA key. Both cipher
//!    halves switch to it (`BlowfishConnected`).
//! 3. The game server authenticates with its desired id and hex id; the registry decides which
//!    id it gets, or why it is refused (`Authed`).
//!
//! Afterwards the link carries presence updates, session claims and account maintenance
//! requests. When the link drops, the registration is only marked down.

pub mod packets;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use smol::net::TcpStream;
use tracing::{debug, error, info, warn};

use crate::admission::Admitted;
use crate::codec::CodecError;
use crate::connection::{write_outbound, ConnectionHandle};
use crate::crypt::{read_frame, FrameCipher, FrameError, GameServerCrypt, CHECKSUM_SIZE};
use crate::game_server_table::{
    server_name, GameServerAddress, LoginServerFailReason, Registration, StatusAttribute, Subnet,
};
use crate::keys::raw_decrypt;
use crate::login_controller::{hash_password, SessionKey};
use crate::services::Services;
use crate::state::GameServerState;
use packets::{GameServerAuth, GameServerPacket};

pub struct GameServerLink {
    services: Arc<Services>,
    handle: ConnectionHandle,
    /// Inbound half of the link cipher; the writer task owns the outbound half.
    crypt: GameServerCrypt,
    state: GameServerState,
    server_id: Option<u8>,
    closing: bool,
}

/// Wires up a freshly admitted game server socket: starts its writer task, queues InitLS and
/// spawns the reader.
pub fn accept(services: Arc<Services>, stream: TcpStream, addr: SocketAddr, ticket: Admitted) -> Result<()> {
    let (handle, outbound) = ConnectionHandle::channel(addr);
    smol::spawn(write_outbound(stream.clone(), GameServerCrypt::bootstrap()?, outbound)).detach();

    handle.send(packets::init_ls(&services.keys.game_server_modulus()));
    let link = GameServerLink {
        services,
        handle,
        crypt: GameServerCrypt::bootstrap()?,
        state: GameServerState::Connected,
        server_id: None,
        closing: false,
    };
    smol::spawn(link.run(stream, ticket)).detach();
    Ok(())
}

impl GameServerLink {
    pub async fn run(mut self, stream: TcpStream, ticket: Admitted) {
        let addr = self.handle.address();
        info!("New game server connection from {addr}");
        match self.update(stream).await {
            Ok(()) => debug!("Game server link {addr} closed"),
            Err(e) => {
                let name = self.display_name();
                warn!("Game server {name} lost connection: {e}");
                self.services
                    .notices
                    .broadcast(&format!("Game Server {name} lost connection!"));
            }
        }
        self.disconnect();
        drop(ticket);
    }

    async fn update(&mut self, mut stream: TcpStream) -> Result<(), FrameError> {
        while !self.closing {
            let mut payload = read_frame(&mut stream).await?;
            self.crypt.open(&mut payload)?;
            let body = &payload[..payload.len() - CHECKSUM_SIZE];

            let services = Arc::clone(&self.services);
            let _permit = services.workers.acquire().await;
            self.dispatch(body).await;
        }
        Ok(())
    }

    async fn dispatch(&mut self, body: &[u8]) {
        let addr = self.handle.address();
        match self.decode(body) {
            Ok(Some(packet)) => {
                if let Err(e) = self.handle_packet(packet).await {
                    error!("Error handling packet from game server {addr}: {e:?}");
                }
            }
            Ok(None) => warn!(
                "Unexpected opcode {:#04x} in state {:?} from game server {addr}",
                body.first().copied().unwrap_or_default(),
                self.state
            ),
            Err(e) => warn!("Malformed packet in state {:?} from game server {addr}: {e}", self.state),
        }
    }

    fn decode(&self, body: &[u8]) -> Result<Option<GameServerPacket>, CodecError> {
        packets::decode(self.state, body, self.services.mail_enabled())
    }

    async fn handle_packet(&mut self, packet: GameServerPacket) -> Result<()> {
        match packet {
            GameServerPacket::BlowFishKey { encrypted_key } => self.handle_blowfish_key(&encrypted_key)?,
            GameServerPacket::Auth(auth) => self.handle_auth(auth).await,
            GameServerPacket::PlayerInGame { accounts } => self.handle_player_in_game(accounts)?,
            GameServerPacket::PlayerLogout { account } => self.handle_player_logout(&account)?,
            GameServerPacket::ChangeAccessLevel { level, account } => {
                self.services.store.update_access_level(&account, level).await?;
                info!("Changed access level of '{account}' to {level}");
            }
            GameServerPacket::PlayerAuthRequest { account, key } => self.handle_player_auth(&account, &key),
            GameServerPacket::ServerStatus { attributes } => self.handle_server_status(&attributes)?,
            GameServerPacket::PlayerTracert { account, pc_ip, hops } => {
                let hops = hops.each_ref().map(String::as_str);
                self.services.store.record_traceroute(&account, &pc_ip, hops).await?;
            }
            GameServerPacket::ReplyCharacters {
                account,
                count,
                deletion_times,
            } => {
                let id = self.server_id()?;
                self.services.controller.set_characters(&account, id, count, deletion_times);
            }
            GameServerPacket::RequestSendMail { account, mail_id, args } => {
                if let Some(mail) = &self.services.mail {
                    mail.send_mail(&account, &mail_id, &args).await;
                }
            }
            GameServerPacket::RequestTempBan {
                account,
                ip,
                expiry_millis,
                reason,
            } => self.handle_temp_ban(&account, &ip, expiry_millis, reason.as_deref()).await?,
            GameServerPacket::ChangePassword {
                account,
                character,
                current,
                new,
            } => self.handle_change_password(&account, &character, &current, &new).await,
        }
        Ok(())
    }

    fn handle_blowfish_key(&mut self, encrypted_key: &[u8]) -> Result<()> {
        let decrypted = raw_decrypt(self.services.keys.game_server_key(), encrypted_key)?;
        // the key was left-padded with zeros to the RSA block size
        let start = decrypted.iter().position(|b| *b != 0).unwrap_or(decrypted.len());
        let key = &decrypted[start..];
        self.crypt.rekey(key)?;
        self.handle.rekey(key.to_vec());
        self.state = GameServerState::BlowfishConnected;
        debug!("New Blowfish key received from game server {}", self.handle.address());
        Ok(())
    }

    async fn handle_auth(&mut self, auth: GameServerAuth) {
        let config = self.services.config.clone();
        if !config.supports_version(auth.version) {
            warn!("Game server {} uses unsupported version {}", self.handle.address(), auth.version);
            self.close(packets::login_server_fail(LoginServerFailReason::InvalidGameServerVersion));
            return;
        }

        let registration = Registration {
            desired_id: auth.desired_id,
            accept_alternate: auth.accept_alternate,
            hex_id: auth.hex_id.clone(),
            port: auth.port,
            max_players: auth.max_players,
            addresses: resolve_hosts(&auth.hosts).await,
        };
        let result = self
            .services
            .game_servers
            .register(registration, self.handle.clone(), config.accept_new_game_server);
        let id = match result {
            Ok(id) => id,
            Err(reason) => {
                warn!(
                    "Refused game server {} asking for id {}: {reason:?}",
                    self.handle.address(),
                    auth.desired_id
                );
                self.close(packets::login_server_fail(reason));
                return;
            }
        };

        self.server_id = Some(id);
        self.state = GameServerState::Authed;
        let host = self.handle.address().ip().to_string();
        if let Err(e) = self
            .services
            .store
            .register_game_server(id as i32, &hex::encode(&auth.hex_id), &host)
            .await
        {
            warn!("Could not store registration of game server {id}: {e}");
        }
        self.handle.send(packets::auth_response(id, &server_name(id)));
        info!("Game server {id} enabled with version {}", auth.version);
        self.services
            .notices
            .broadcast(&format!("GameServer [{id}] {} is connected", server_name(id)));
    }

    fn handle_player_in_game(&mut self, accounts: Vec<String>) -> Result<()> {
        let id = self.server_id()?;
        for account in &accounts {
            self.services
                .notices
                .broadcast(&format!("Account {account} logged in GameServer {id}"));
        }
        self.services.game_servers.add_accounts(id, accounts);
        Ok(())
    }

    fn handle_player_logout(&mut self, account: &str) -> Result<()> {
        let id = self.server_id()?;
        self.services.game_servers.remove_account(id, account);
        self.services
            .notices
            .broadcast(&format!("Player {account} disconnected from Game Server {id}."));
        Ok(())
    }

    fn handle_player_auth(&mut self, account: &str, key: &SessionKey) {
        let accepted = self.services.controller.claim_session(account, key);
        if !accepted {
            warn!("Game server {:?} presented an unknown session for '{account}'", self.server_id);
        }
        self.handle.send(packets::player_auth_response(account, accepted));
    }

    fn handle_server_status(&mut self, attributes: &[(i32, i32)]) -> Result<()> {
        let id = self.server_id()?;
        for &(kind, value) in attributes {
            let Ok(attribute) = StatusAttribute::try_from(kind) else {
                warn!("Game server {id} sent unknown status attribute {kind}");
                continue;
            };
            if let Err(e) = self.services.game_servers.apply_status(id, attribute, value) {
                warn!("Game server {id} sent a bad {attribute:?} value: {e}");
            }
        }
        Ok(())
    }

    async fn handle_temp_ban(&mut self, account: &str, ip: &str, expiry_millis: i64, reason: Option<&str>) -> Result<()> {
        info!(
            "Temporary ban of '{account}' ({ip}) until {expiry_millis}, reason: {}",
            reason.unwrap_or("none")
        );
        if let Err(e) = self.services.store.set_temp_ban(account, expiry_millis).await {
            warn!("Could not store temporary ban of '{account}': {e}");
        }
        let address: IpAddr = ip.parse().map_err(|e| anyhow!("Invalid address '{ip}' to ban: {e}"))?;
        self.services.bans.add(address, expiry_millis);
        Ok(())
    }

    /// Answered through whichever game server currently hosts the account.
    async fn handle_change_password(&mut self, account: &str, character: &str, current: &str, new: &str) {
        let Some((_, host)) = self.services.game_servers.find_account(account) else {
            return;
        };
        let message = match self.change_password(account, current, new).await {
            Ok(message) => message,
            Err(e) => {
                warn!("Error while changing password of '{account}' requested by {character}: {e}");
                return;
            }
        };
        host.send(packets::change_password_response(character, message));
    }

    async fn change_password(&self, account: &str, current: &str, new: &str) -> Result<&'static str> {
        if current.is_empty() || new.is_empty() {
            return Ok("Invalid password data! Try again.");
        }
        let stored = self.services.store.lookup(account).await?;
        if !stored.is_some_and(|info| info.check_password_hash(&hash_password(current))) {
            return Ok("The typed current password doesn't match with your current one.");
        }
        if self.services.store.update_password(account, &hash_password(new)).await? {
            info!("The password of '{account}' has been changed");
            Ok("You have successfully changed your password!")
        } else {
            Ok("The password change was unsuccessful!")
        }
    }

    fn server_id(&self) -> Result<u8> {
        self.server_id.ok_or_else(|| anyhow!("Game server link has no id"))
    }

    fn display_name(&self) -> String {
        match self.server_id {
            Some(id) => format!("[{id}] {}", server_name(id)),
            None => format!("({})", self.handle.address().ip()),
        }
    }

    fn close(&mut self, body: Vec<u8>) {
        self.closing = true;
        self.handle.close_with(body);
    }

    fn disconnect(&mut self) {
        if let Some(id) = self.server_id {
            if self.services.game_servers.set_down(id, self.handle.id()) {
                info!("{} is now disconnected", self.display_name());
            }
        }
        self.handle.close();
    }
}

/// Turns advertised (subnet, host) pairs into routing entries. Hosts may be names; pairs that
/// do not parse or resolve are skipped.
async fn resolve_hosts(hosts: &[(String, String)]) -> Vec<GameServerAddress> {
    let mut addresses = Vec::with_capacity(hosts.len());
    for (subnet, host) in hosts {
        let subnet: Subnet = match subnet.parse() {
            Ok(subnet) => subnet,
            Err(e) => {
                warn!("Invalid subnet '{subnet}' for host {host}: {e}");
                continue;
            }
        };
        match resolve_host(host).await {
            Ok(address) => {
                info!("Game server address {address} for subnet {subnet:?}");
                addresses.push(GameServerAddress { subnet, address });
            }
            Err(e) => warn!("There has been an error resolving host name {host}: {e}"),
        }
    }
    addresses
}

async fn resolve_host(host: &str) -> Result<Ipv4Addr> {
    if let Ok(address) = host.parse() {
        return Ok(address);
    }
    smol::net::resolve((host, 0))
        .await?
        .into_iter()
        .find_map(|addr| match addr.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| anyhow!("No IPv4 address for {host}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ban_list::BanList;
    use crate::codec::PacketWriter;
    use crate::config::ServerConfig;
    use crate::connection::tests::sent_packets;
    use crate::connection::OutboundQueue;
    use crate::game_server_table::GameServerTable;
    use crate::keys::tests::shared_keys;
    use crate::mail::MailSystem;
    use aden_account_db::{now_millis, MemoryAccountStore};
    use macro_rules_attribute::apply;

    fn services(store: Arc<MemoryAccountStore>, mail: Option<MailSystem>) -> Arc<Services> {
        Services::new(
            Arc::new(ServerConfig::default()),
            store,
            shared_keys(),
            Arc::new(BanList::new()),
            Arc::new(GameServerTable::new()),
            mail,
        )
    }

    /// A link that already finished the handshake and holds `id`.
    fn authed_link(services: &Arc<Services>, id: u8) -> (GameServerLink, OutboundQueue) {
        let (handle, outbound) = ConnectionHandle::channel(format!("10.0.0.{id}:9014").parse().unwrap());
        let registration = Registration {
            desired_id: id,
            accept_alternate: false,
            hex_id: vec![id; 4],
            port: 7777,
            max_players: 100,
            addresses: vec![],
        };
        assert_eq!(services.game_servers.register(registration, handle.clone(), true), Ok(id));
        let link = GameServerLink {
            services: services.clone(),
            handle,
            crypt: GameServerCrypt::bootstrap().unwrap(),
            state: GameServerState::Authed,
            server_id: Some(id),
            closing: false,
        };
        (link, outbound)
    }

    fn change_password_body(current: &str, new: &str) -> Vec<u8> {
        PacketWriter::new(0x0b)
            .write_s("alice")
            .write_s("Gandalf")
            .write_s(current)
            .write_s(new)
            .finish()
    }

    #[apply(smol_macros::test!)]
    async fn temp_ban_flags_account_and_bans_address() {
        let store = Arc::new(MemoryAccountStore::new());
        store.insert_account("alice", &hash_password("secret"), 0);
        let services = services(store.clone(), None);
        let (mut link, _outbound) = authed_link(&services, 1);

        let expiry = now_millis() + 60_000;
        let body = PacketWriter::new(0x0a)
            .write_s("alice")
            .write_s("10.1.2.3")
            .write_q(expiry)
            .write_c(1)
            .write_s("botting")
            .finish();
        link.dispatch(&body).await;

        assert_eq!(store.temp_ban_expiry("alice"), Some(expiry));
        assert!(services.bans.is_banned("10.1.2.3".parse().unwrap()));
        assert!(!services.bans.is_banned("10.1.2.4".parse().unwrap()));
    }

    #[apply(smol_macros::test!)]
    async fn password_change_is_answered_through_hosting_server() {
        let store = Arc::new(MemoryAccountStore::new());
        store.insert_account("alice", &hash_password("secret"), 0);
        let services = services(store.clone(), None);
        let (mut requester, requester_out) = authed_link(&services, 1);
        let (_host, host_out) = authed_link(&services, 2);
        services.game_servers.add_accounts(2, ["alice".to_string()]);

        requester.dispatch(&change_password_body("wrong", "hunter2")).await;
        requester.dispatch(&change_password_body("secret", "hunter2")).await;

        let (packets, _) = sent_packets(&host_out);
        assert_eq!(
            packets,
            vec![
                packets::change_password_response(
                    "Gandalf",
                    "The typed current password doesn't match with your current one."
                ),
                packets::change_password_response("Gandalf", "You have successfully changed your password!"),
            ]
        );
        assert_eq!(sent_packets(&requester_out).0, Vec::<Vec<u8>>::new());
        assert_eq!(store.account("alice").unwrap().password_hash, hash_password("hunter2"));
    }

    #[apply(smol_macros::test!)]
    async fn password_change_for_offline_account_is_ignored() {
        let store = Arc::new(MemoryAccountStore::new());
        store.insert_account("alice", &hash_password("secret"), 0);
        let services = services(store.clone(), None);
        let (mut link, outbound) = authed_link(&services, 1);

        link.dispatch(&change_password_body("secret", "hunter2")).await;
        assert_eq!(sent_packets(&outbound).0, Vec::<Vec<u8>>::new());
        assert_eq!(store.account("alice").unwrap().password_hash, hash_password("secret"));
    }

    #[apply(smol_macros::test!)]
    async fn send_mail_is_only_accepted_with_mail_loaded() {
        let mail_body = PacketWriter::new(0x09)
            .write_s("alice")
            .write_s("MailChangePassword")
            .write_c(1)
            .write_s("Gandalf")
            .finish();
        let store = Arc::new(MemoryAccountStore::new());
        store.insert_account("alice", &hash_password("secret"), 0);
        store.set_email("alice", "alice@aden.test");

        let without_mail = services(store.clone(), None);
        let (link, _outbound) = authed_link(&without_mail, 1);
        assert_eq!(link.decode(&mail_body).unwrap(), None);

        let dir = std::env::temp_dir().join(format!("aden-link-mail-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("MailChangePassword.html"), "Password changed\n%var0% changed it.").unwrap();
        let mail = MailSystem::load(&dir, "Aden", "admin@aden.test", store.clone()).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();

        let with_mail = services(store, Some(mail));
        let (mut link, _outbound) = authed_link(&with_mail, 1);
        let Some(GameServerPacket::RequestSendMail { account, mail_id, args }) = link.decode(&mail_body).unwrap() else {
            panic!("expected a send mail request");
        };
        assert_eq!((account.as_str(), mail_id.as_str()), ("alice", "MailChangePassword"));
        let sent = with_mail.mail.as_ref().unwrap().send_mail(&account, &mail_id, &args).await.unwrap();
        assert_eq!(sent.body, "Gandalf changed it.");
        link.dispatch(&mail_body).await;
    }

    #[apply(smol_macros::test!)]
    async fn hosts_are_resolved_and_bad_pairs_skipped() {
        let hosts = vec![
            ("10.0.0.0/8".to_string(), "10.0.0.5".to_string()),
            ("not a subnet".to_string(), "10.0.0.6".to_string()),
            ("0.0.0.0/0".to_string(), "localhost".to_string()),
        ];
        let addresses = resolve_hosts(&hosts).await;
        assert_eq!(addresses.len(), 2);
        assert_eq!(addresses[0].address, Ipv4Addr::new(10, 0, 0, 5));
        assert!(addresses[0].subnet.contains(Ipv4Addr::new(10, 1, 2, 3)));
        assert_eq!(addresses[1].address, Ipv4Addr::LOCALHOST);
    }
}
