//! Game client connections on the login port.
//!
//! A client walks `Connected -> AuthedGameGuard -> AuthedLogin`:
//! 1. On accept the broker sends Init with this connection's session id, a scrambled RSA
//!    modulus and the Blowfish key for the rest of the session.
//! 2. The client echoes the session id (AuthGameGuard).
//! 3. The client submits its credentials as an RSA block (RequestAuthLogin). The controller
//!    checks them and arbitrates presence; on success the client gets a `SessionKey`.
//! 4. The client asks for the server list and picks a game server (RequestServerList,
//!    RequestServerLogin) and then leaves for that game server with the play pair.
//!
//! Opcodes that do not fit the current state are logged and dropped. Only framing errors end
//! the connection from this side; authentication failures close it with a reason packet.

pub mod packets;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use aden_account_db::{now_millis, AccountInfo};
use anyhow::Result;
use smol::net::TcpStream;
use tracing::{debug, error, info, warn};

use crate::admission::Admitted;
use crate::connection::{write_outbound, ConnectionHandle};
use crate::crypt::{read_frame, FrameCipher, FrameError, LoginCrypt, CHECKSUM_SIZE};
use crate::keys::{raw_decrypt, ScrambledKeyPair};
use crate::login_controller::{AuthLoginResult, SessionKey};
use crate::services::Services;
use crate::state::ClientState;
use packets::{AccountKickedReason, ClientPacket, Credentials, LoginFailReason, PlayFailReason};

pub struct LoginClient {
    services: Arc<Services>,
    handle: ConnectionHandle,
    /// Inbound half of the session cipher; the writer task owns the outbound half.
    crypt: LoginCrypt,
    key_pair: Arc<ScrambledKeyPair>,
    session_id: i32,
    state: ClientState,
    account: Option<AccountInfo>,
    session_key: Option<SessionKey>,
    joined_game_server: bool,
    connected_at: Instant,
    closing: bool,
}

/// Wires up a freshly admitted client socket: starts its writer task, queues Init and
/// spawns the reader.
pub fn accept(services: Arc<Services>, stream: TcpStream, addr: SocketAddr, ticket: Admitted) -> Result<()> {
    let blowfish_key = services.keys.random_blowfish_key();
    let (handle, outbound) = ConnectionHandle::channel(addr);
    smol::spawn(write_outbound(stream.clone(), LoginCrypt::new(&blowfish_key)?, outbound)).detach();

    let client = LoginClient {
        crypt: LoginCrypt::new(&blowfish_key)?,
        key_pair: services.keys.random_client_pair(),
        session_id: rand::random(),
        state: ClientState::Connected,
        account: None,
        session_key: None,
        joined_game_server: false,
        connected_at: Instant::now(),
        closing: false,
        handle,
        services,
    };
    client.handle.send(packets::init(
        client.session_id,
        client.key_pair.scrambled_modulus(),
        &blowfish_key,
    ));
    smol::spawn(client.run(stream, ticket)).detach();
    Ok(())
}

impl LoginClient {
    /// Reads until the peer leaves or the broker closes the connection, then cleans up. The
    /// admission ticket is released last.
    pub async fn run(mut self, stream: TcpStream, ticket: Admitted) {
        let addr = self.handle.address();
        info!("New client connection from {addr}");
        match self.update(stream).await {
            Ok(()) | Err(FrameError::Closed) => debug!("Client {addr} disconnected"),
            Err(e) => warn!("Closing client {addr}: {e}"),
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
        match packets::decode(self.state, body) {
            Ok(Some(packet)) => {
                if let Err(e) = self.handle_packet(packet).await {
                    error!("Error handling packet from client {addr}: {e:?}");
                }
            }
            Ok(None) => warn!(
                "Unexpected opcode {:#04x} in state {:?} from client {addr}",
                body.first().copied().unwrap_or_default(),
                self.state
            ),
            Err(e) => warn!("Malformed packet in state {:?} from client {addr}: {e}", self.state),
        }
    }

    async fn handle_packet(&mut self, packet: ClientPacket) -> Result<()> {
        match packet {
            ClientPacket::AuthGameGuard { session_id } => self.handle_auth_game_guard(session_id),
            ClientPacket::RequestAuthLogin { block } => self.handle_auth_login(&block).await?,
            ClientPacket::RequestServerList { login_ok1, login_ok2 } => self.handle_server_list(login_ok1, login_ok2),
            ClientPacket::RequestServerLogin {
                login_ok1,
                login_ok2,
                server_id,
            } => self.handle_server_login(login_ok1, login_ok2, server_id).await,
        }
        Ok(())
    }

    fn handle_auth_game_guard(&mut self, session_id: i32) {
        if session_id != self.session_id {
            self.close(packets::login_fail(LoginFailReason::AccessFailed));
            return;
        }
        self.state = ClientState::AuthedGameGuard;
        self.handle.send(packets::gg_auth(session_id));
    }

    async fn handle_auth_login(&mut self, block: &[u8]) -> Result<()> {
        let decrypted = raw_decrypt(self.key_pair.private_key(), block)?;
        let credentials = Credentials::from_block(&decrypted)?;
        let address = self.handle.address().ip();
        let controller = self.services.controller.clone();

        let Some(info) = controller
            .retrieve_account_info(address, &credentials.login, &credentials.password)
            .await
        else {
            self.close(packets::login_fail(LoginFailReason::UserOrPassWrong));
            return Ok(());
        };

        let mut result = controller.try_checkin(&self.handle, address, &info, self.connected_at).await;
        // a stale broker session for the same account gives way to the new connection
        if result == AuthLoginResult::AlreadyOnLs && controller.kick_authed_client(&info.login) {
            result = controller.try_checkin(&self.handle, address, &info, self.connected_at).await;
        }

        match result {
            AuthLoginResult::AuthSuccess(key) => {
                info!("Account '{}' logged in from {address}", info.login);
                controller.request_characters(&info.login);
                self.account = Some(info);
                self.session_key = Some(key);
                self.state = ClientState::AuthedLogin;
                if controller.show_licence() {
                    self.handle.send(packets::login_ok(&key));
                } else {
                    self.send_server_list();
                }
            }
            AuthLoginResult::InvalidPassword => self.close(packets::login_fail(LoginFailReason::UserOrPassWrong)),
            AuthLoginResult::AccountInactive => self.close(packets::login_fail(LoginFailReason::Inactive)),
            AuthLoginResult::AccountBanned => {
                self.close(packets::account_kicked(AccountKickedReason::PermanentlyBanned));
            }
            AuthLoginResult::AlreadyOnLs => self.close(packets::login_fail(LoginFailReason::AccountInUse)),
            AuthLoginResult::AlreadyOnGs => {
                self.close(packets::login_fail(LoginFailReason::AccountInUse));
                controller.kick_from_game_server(&info.login);
            }
        }
        Ok(())
    }

    fn handle_server_list(&mut self, login_ok1: i32, login_ok2: i32) {
        if self.session_key.is_some_and(|key| key.check_login_pair(login_ok1, login_ok2)) {
            self.send_server_list();
        } else {
            self.close(packets::login_fail(LoginFailReason::AccessFailed));
        }
    }

    async fn handle_server_login(&mut self, login_ok1: i32, login_ok2: i32, server_id: u8) {
        let (Some(key), Some(info)) = (self.session_key, self.account.as_ref()) else {
            self.close(packets::login_fail(LoginFailReason::AccessFailed));
            return;
        };
        if self.services.config.show_licence && !key.check_login_pair(login_ok1, login_ok2) {
            self.close(packets::login_fail(LoginFailReason::AccessFailed));
            return;
        }

        let possible = self
            .services
            .controller
            .is_login_possible(&info.login, info.access_level, info.last_server, server_id)
            .await;
        if possible {
            debug!("Account '{}' is joining game server {server_id}", info.login);
            self.joined_game_server = true;
            self.handle.send(packets::play_ok(&key));
        } else {
            self.close(packets::play_fail(PlayFailReason::TooManyPlayers));
        }
    }

    fn send_server_list(&self) {
        let Some(info) = self.account.as_ref() else {
            return;
        };
        let servers = self
            .services
            .game_servers
            .server_list(self.handle.address().ip(), info.access_level);
        let characters = self.services.controller.characters(&info.login);
        let last_server = u8::try_from(info.last_server).unwrap_or_default();
        self.handle
            .send(packets::server_list(&servers, last_server, &characters, now_millis()));
    }

    fn close(&mut self, body: Vec<u8>) {
        self.closing = true;
        self.handle.close_with(body);
    }

    fn disconnect(&mut self) {
        if let Some(info) = &self.account {
            self.services.controller.client_disconnected(
                &info.login,
                self.handle.id(),
                self.joined_game_server,
                self.connected_at,
            );
        }
        self.handle.close();
    }
}
