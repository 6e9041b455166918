use crate::codec::{CodecError, PacketReader, PacketWriter};
use crate::game_server_table::LoginServerFailReason;
use crate::login_controller::SessionKey;
use crate::state::GameServerState;

const PROTOCOL_REVISION: i32 = 0x0106;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameServerAuth {
    pub version: u8,
    pub desired_id: u8,
    pub accept_alternate: bool,
    pub reserve_host: bool,
    pub port: u16,
    pub max_players: i32,
    pub hex_id: Vec<u8>,
    /// (subnet, host) pairs as announced.
    pub hosts: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameServerPacket {
    BlowFishKey { encrypted_key: Vec<u8> },
    Auth(GameServerAuth),
    PlayerInGame { accounts: Vec<String> },
    PlayerLogout { account: String },
    ChangeAccessLevel { level: i32, account: String },
    PlayerAuthRequest { account: String, key: SessionKey },
    ServerStatus { attributes: Vec<(i32, i32)> },
    PlayerTracert { account: String, pc_ip: String, hops: [String; 4] },
    ReplyCharacters { account: String, count: u8, deletion_times: Vec<i64> },
    RequestSendMail { account: String, mail_id: String, args: Vec<String> },
    RequestTempBan { account: String, ip: String, expiry_millis: i64, reason: Option<String> },
    ChangePassword { account: String, character: String, current: String, new: String },
}

/// Decodes `body` if its opcode is valid in `state`; `mail_enabled` gates the send-mail opcode.
pub fn decode(state: GameServerState, body: &[u8], mail_enabled: bool) -> Result<Option<GameServerPacket>, CodecError> {
    let mut reader = PacketReader::new(body);
    let opcode = reader.read_c()?;
    let packet = match (state, opcode) {
        (GameServerState::Connected, 0x00) => {
            let size = reader.read_d()?.max(0) as usize;
            GameServerPacket::BlowFishKey {
                encrypted_key: reader.read_b(size)?.to_vec(),
            }
        }
        (GameServerState::BlowfishConnected, 0x01) => GameServerPacket::Auth(read_auth(&mut reader)?),
        (GameServerState::Authed, 0x02) => {
            let count = reader.read_h()?;
            let accounts = (0..count).map(|_| reader.read_s()).collect::<Result<_, _>>()?;
            GameServerPacket::PlayerInGame { accounts }
        }
        (GameServerState::Authed, 0x03) => GameServerPacket::PlayerLogout { account: reader.read_s()? },
        (GameServerState::Authed, 0x04) => GameServerPacket::ChangeAccessLevel {
            level: reader.read_d()?,
            account: reader.read_s()?,
        },
        (GameServerState::Authed, 0x05) => GameServerPacket::PlayerAuthRequest {
            account: reader.read_s()?,
            key: SessionKey {
                play_ok1: reader.read_d()?,
                play_ok2: reader.read_d()?,
                login_ok1: reader.read_d()?,
                login_ok2: reader.read_d()?,
            },
        },
        (GameServerState::Authed, 0x06) => {
            let count = reader.read_d()?.max(0);
            let attributes = (0..count)
                .map(|_| Ok((reader.read_d()?, reader.read_d()?)))
                .collect::<Result<_, CodecError>>()?;
            GameServerPacket::ServerStatus { attributes }
        }
        (GameServerState::Authed, 0x07) => GameServerPacket::PlayerTracert {
            account: reader.read_s()?,
            pc_ip: reader.read_s()?,
            hops: [reader.read_s()?, reader.read_s()?, reader.read_s()?, reader.read_s()?],
        },
        (GameServerState::Authed, 0x08) => {
            let account = reader.read_s()?;
            let count = reader.read_c()?;
            let pending = reader.read_c()?;
            let deletion_times = (0..pending).map(|_| reader.read_q()).collect::<Result<_, _>>()?;
            GameServerPacket::ReplyCharacters {
                account,
                count,
                deletion_times,
            }
        }
        (GameServerState::Authed, 0x09) if mail_enabled => {
            let account = reader.read_s()?;
            let mail_id = reader.read_s()?;
            let count = reader.read_c()?;
            let args = (0..count).map(|_| reader.read_s()).collect::<Result<_, _>>()?;
            GameServerPacket::RequestSendMail { account, mail_id, args }
        }
        (GameServerState::Authed, 0x0a) => {
            let account = reader.read_s()?;
            let ip = reader.read_s()?;
            let expiry_millis = reader.read_q()?;
            let reason = match reader.read_c()? {
                0 => None,
                _ => Some(reader.read_s()?),
            };
            GameServerPacket::RequestTempBan {
                account,
                ip,
                expiry_millis,
                reason,
            }
        }
        (GameServerState::Authed, 0x0b) => GameServerPacket::ChangePassword {
            account: reader.read_s()?,
            character: reader.read_s()?,
            current: reader.read_s()?,
            new: reader.read_s()?,
        },
        _ => return Ok(None),
    };
    Ok(Some(packet))
}

fn read_auth(reader: &mut PacketReader<'_>) -> Result<GameServerAuth, CodecError> {
    let version = reader.read_c()?;
    let desired_id = reader.read_c()?;
    let accept_alternate = reader.read_c()? != 0;
    let reserve_host = reader.read_c()? != 0;
    let port = reader.read_h()?;
    let max_players = reader.read_d()?;
    let size = reader.read_d()?.max(0) as usize;
    let hex_id = reader.read_b(size)?.to_vec();
    let pairs = reader.read_d()?.max(0);
    let hosts = (0..pairs)
        .map(|_| Ok((reader.read_s()?, reader.read_s()?)))
        .collect::<Result<_, CodecError>>()?;
    Ok(GameServerAuth {
        version,
        desired_id,
        accept_alternate,
        reserve_host,
        port,
        max_players,
        hex_id,
        hosts,
    })
}

pub fn init_ls(modulus: &[u8]) -> Vec<u8> {
    PacketWriter::new(0x00)
        .write_d(PROTOCOL_REVISION)
        .write_d(modulus.len() as i32)
        .write_b(modulus)
        .finish()
}

pub fn login_server_fail(reason: LoginServerFailReason) -> Vec<u8> {
    PacketWriter::new(0x01).write_c(reason.into()).finish()
}

pub fn auth_response(server_id: u8, server_name: &str) -> Vec<u8> {
    PacketWriter::new(0x02).write_c(server_id).write_s(server_name).finish()
}

pub fn player_auth_response(account: &str, accepted: bool) -> Vec<u8> {
    PacketWriter::new(0x03).write_s(account).write_c(accepted as u8).finish()
}

pub fn kick_player(account: &str) -> Vec<u8> {
    PacketWriter::new(0x04).write_s(account).finish()
}

pub fn request_characters(account: &str) -> Vec<u8> {
    PacketWriter::new(0x05).write_s(account).finish()
}

pub fn change_password_response(character: &str, message: &str) -> Vec<u8> {
    PacketWriter::new(0x06).write_s(character).write_s(message).finish()
}
