use std::collections::BTreeMap;

use num_enum::IntoPrimitive;

use crate::codec::{CodecError, PacketReader, PacketWriter};
use crate::game_server_table::ServerListEntry;
use crate::login_controller::{ServerCharacters, SessionKey};
use crate::state::ClientState;

pub const RSA_BLOCK_SIZE: usize = 128;
const PROTOCOL_REVISION: i32 = 0xc621;
const LOGIN_OK_FLAGS: i32 = 0x3ea;

const LOGIN_OFFSET: usize = 0x5e;
const LOGIN_LENGTH: usize = 14;
const PASSWORD_OFFSET: usize = 0x6c;
const PASSWORD_LENGTH: usize = 16;
const OTP_OFFSET: usize = 0x7c;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(i32)]
pub enum LoginFailReason {
    UserOrPassWrong = 0x02,
    AccountInUse = 0x07,
    AccessFailed = 0x15,
    Inactive = 0x24,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(i32)]
pub enum AccountKickedReason {
    PermanentlyBanned = 0x20,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
pub enum PlayFailReason {
    TooManyPlayers = 0x0f,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientPacket {
    AuthGameGuard { session_id: i32 },
    RequestAuthLogin { block: Vec<u8> },
    RequestServerLogin { login_ok1: i32, login_ok2: i32, server_id: u8 },
    RequestServerList { login_ok1: i32, login_ok2: i32 },
}

/// Decodes `body` if its opcode is valid in `state`. `Ok(None)` means the opcode is not
/// accepted in this state.
pub fn decode(state: ClientState, body: &[u8]) -> Result<Option<ClientPacket>, CodecError> {
    let mut reader = PacketReader::new(body);
    let opcode = reader.read_c()?;
    let packet = match (state, opcode) {
        (ClientState::Connected, 0x07) => {
            let session_id = reader.read_d()?;
            // four opaque game guard words
            reader.read_b(16)?;
            ClientPacket::AuthGameGuard { session_id }
        }
        (ClientState::AuthedGameGuard, 0x00) => ClientPacket::RequestAuthLogin {
            block: reader.read_b(RSA_BLOCK_SIZE)?.to_vec(),
        },
        (ClientState::AuthedLogin, 0x02) => ClientPacket::RequestServerLogin {
            login_ok1: reader.read_d()?,
            login_ok2: reader.read_d()?,
            server_id: reader.read_c()?,
        },
        (ClientState::AuthedLogin, 0x05) => ClientPacket::RequestServerList {
            login_ok1: reader.read_d()?,
            login_ok2: reader.read_d()?,
        },
        _ => return Ok(None),
    };
    Ok(Some(packet))
}

/// Login and password fields of a decrypted credential block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub login: String,
    pub password: String,
    /// Parsed but never checked.
    pub one_time_password: i32,
}

impl Credentials {
    /// `block` is the RSA plaintext, left-padded to the full block size.
    pub fn from_block(block: &[u8]) -> Result<Self, CodecError> {
        if block.len() < RSA_BLOCK_SIZE {
            return Err(CodecError::Underflow {
                needed: RSA_BLOCK_SIZE,
                remaining: block.len(),
            });
        }
        let mut reader = PacketReader::new(&block[OTP_OFFSET..]);
        Ok(Self {
            login: field(&block[LOGIN_OFFSET..LOGIN_OFFSET + LOGIN_LENGTH]).to_lowercase(),
            password: field(&block[PASSWORD_OFFSET..PASSWORD_OFFSET + PASSWORD_LENGTH]),
            one_time_password: reader.read_d()?,
        })
    }
}

/// Fixed width text field; the client pads with zeros.
fn field(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_matches(|c: char| c <= ' ')
        .to_string()
}

pub fn init(session_id: i32, scrambled_modulus: &[u8], blowfish_key: &[u8]) -> Vec<u8> {
    PacketWriter::new(0x00)
        .write_d(session_id)
        .write_d(PROTOCOL_REVISION)
        .write_b(scrambled_modulus)
        // game guard constants
        .write_d(0x29dd954e)
        .write_d(0x77c39cfc)
        .write_d(0x97adb620u32 as i32)
        .write_d(0x07bde0f7)
        .write_b(blowfish_key)
        .write_c(0)
        .finish()
}

pub fn gg_auth(session_id: i32) -> Vec<u8> {
    PacketWriter::new(0x0b)
        .write_d(session_id)
        .write_d(0)
        .write_d(0)
        .write_d(0)
        .write_d(0)
        .finish()
}

pub fn login_ok(key: &SessionKey) -> Vec<u8> {
    PacketWriter::new(0x03)
        .write_d(key.login_ok1)
        .write_d(key.login_ok2)
        .write_d(0)
        .write_d(0)
        .write_d(LOGIN_OK_FLAGS)
        .write_d(0)
        .write_d(0)
        .write_d(0)
        .write_b(&[0; 16])
        .finish()
}

pub fn login_fail(reason: LoginFailReason) -> Vec<u8> {
    PacketWriter::new(0x01).write_d(reason.into()).finish()
}

pub fn account_kicked(reason: AccountKickedReason) -> Vec<u8> {
    PacketWriter::new(0x02).write_d(reason.into()).finish()
}

pub fn play_fail(reason: PlayFailReason) -> Vec<u8> {
    PacketWriter::new(0x06).write_c(reason.into()).finish()
}

pub fn play_ok(key: &SessionKey) -> Vec<u8> {
    PacketWriter::new(0x07)
        .write_d(key.play_ok1)
        .write_d(key.play_ok2)
        .finish()
}

/// Server entries followed by the account's character counts and pending deletions, given as
/// seconds left relative to `now_millis`.
pub fn server_list(
    servers: &[ServerListEntry],
    last_server: u8,
    characters: &BTreeMap<u8, ServerCharacters>,
    now_millis: i64,
) -> Vec<u8> {
    let mut packet = PacketWriter::new(0x04);
    packet.write_c(servers.len() as u8).write_c(last_server);
    for server in servers {
        packet
            .write_c(server.id)
            .write_b(&server.address.octets())
            .write_d(server.port as i32)
            .write_c(server.age_limit)
            .write_c(server.pvp as u8)
            .write_h(server.current_players)
            .write_h(server.max_players)
            .write_c(server.up as u8)
            .write_d(server.server_type)
            .write_c(server.brackets as u8);
    }
    packet.write_h(0xa4);
    for (server_id, summary) in characters {
        packet
            .write_c(*server_id)
            .write_c(summary.count)
            .write_c(summary.deletion_times.len() as u8);
        for delete_at in &summary.deletion_times {
            packet.write_d(seconds_until(*delete_at, now_millis));
        }
    }
    packet.finish()
}

fn seconds_until(at_millis: i64, now_millis: i64) -> i32 {
    let seconds = at_millis.saturating_sub(now_millis) / 1000;
    seconds.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn opcodes_are_gated_by_state() {
        let mut gg = vec![0x07];
        gg.extend_from_slice(&42i32.to_le_bytes());
        gg.extend_from_slice(&[0; 16]);
        assert_eq!(
            decode(ClientState::Connected, &gg).unwrap(),
            Some(ClientPacket::AuthGameGuard { session_id: 42 })
        );
        assert_eq!(decode(ClientState::AuthedLogin, &gg).unwrap(), None);

        let mut list = vec![0x05];
        list.extend_from_slice(&1i32.to_le_bytes());
        list.extend_from_slice(&2i32.to_le_bytes());
        assert_eq!(decode(ClientState::Connected, &list).unwrap(), None);
        assert_eq!(
            decode(ClientState::AuthedLogin, &list).unwrap(),
            Some(ClientPacket::RequestServerList { login_ok1: 1, login_ok2: 2 })
        );

        assert!(decode(ClientState::AuthedGameGuard, &[0x00, 1, 2, 3]).is_err());
    }

    #[test]
    fn credentials_are_trimmed_and_lowercased() {
        let mut block = vec![0u8; RSA_BLOCK_SIZE];
        block[LOGIN_OFFSET..LOGIN_OFFSET + 6].copy_from_slice(b" Alice");
        block[PASSWORD_OFFSET..PASSWORD_OFFSET + 6].copy_from_slice(b"Secret");
        block[OTP_OFFSET..OTP_OFFSET + 4].copy_from_slice(&77i32.to_le_bytes());

        let credentials = Credentials::from_block(&block).unwrap();
        assert_eq!(credentials.login, "alice");
        assert_eq!(credentials.password, "Secret");
        assert_eq!(credentials.one_time_password, 77);
        assert!(Credentials::from_block(&block[..100]).is_err());
    }

    #[test]
    fn server_list_layout() {
        let servers = [ServerListEntry {
            id: 1,
            address: Ipv4Addr::new(10, 0, 0, 1),
            port: 7777,
            age_limit: 18,
            pvp: true,
            current_players: 3,
            max_players: 100,
            up: true,
            server_type: 1,
            brackets: false,
        }];
        let characters = BTreeMap::from([(
            1,
            ServerCharacters {
                count: 2,
                deletion_times: vec![61_000],
            },
        )]);
        let packet = server_list(&servers, 1, &characters, 1_000);

        let mut expected = vec![0x04, 1, 1, 1, 10, 0, 0, 1];
        expected.extend_from_slice(&7777i32.to_le_bytes());
        expected.extend_from_slice(&[18, 1, 3, 0, 100, 0, 1]);
        expected.extend_from_slice(&1i32.to_le_bytes());
        expected.push(0);
        expected.extend_from_slice(&[0xa4, 0x00, 1, 2, 1]);
        expected.extend_from_slice(&60i32.to_le_bytes());
        assert_eq!(packet, expected);
    }

    #[test]
    fn deletion_countdown_saturates() {
        assert_eq!(seconds_until(61_500, 1_000), 60);
        assert_eq!(seconds_until(i64::MAX, 0), i32::MAX);
        assert_eq!(seconds_until(i64::MIN, 1_000), i32::MIN);
    }

    #[test]
    fn login_fail_carries_reason_word() {
        assert_eq!(login_fail(LoginFailReason::AccessFailed), vec![0x01, 0x15, 0, 0, 0]);
        assert_eq!(play_fail(PlayFailReason::TooManyPlayers), vec![0x06, 0x0f]);
    }
}
