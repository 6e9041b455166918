//! Frame layer: length prefix, Blowfish cipher and XOR-folded checksum.
//!
//! A frame on the wire is `u16 length (LE, includes itself) || ciphertext`. The plaintext is a
//! packet body padded to the Blowfish block size whose final 32-bit word carries the checksum.
//!
//! Client and game server links pad differently, so each gets its own `FrameCipher`:
//! - `LoginCrypt` seals the very first client packet with a fixed key and a rolling XOR pass,
//!   then switches to the per-session key. Its padding always adds between 1 and 8 bytes,
//!   which is what the client's cipher engine expects.
//! - `GameServerCrypt` starts on a fixed bootstrap key and is re-keyed once the game server
//!   has delivered its own key over RSA. It only pads when the body is not block aligned.

use blowfish::cipher::{Block, BlockDecrypt, BlockEncrypt, KeyInit};
use blowfish::BlowfishLE;
use byteorder::{ByteOrder, LittleEndian};
use smol::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const BLOCK_SIZE: usize = 8;
pub const CHECKSUM_SIZE: usize = 4;

const STATIC_CLIENT_KEY: [u8; 16] = [
    0x6b, 0x60, 0xcb, 0x5b, 0x82, 0xce, 0x90, 0xb1, 0xcc, 0x2b, 0x6c, 0x55, 0x6c, 0x6c, 0x6c, 0x6c,
];

pub const GAME_SERVER_BOOTSTRAP_KEY: &[u8] = b"_;v.]05-31!|+-%xT!^[$\0";

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("connection closed by peer")]
    Closed,
    #[error("invalid frame length {0}")]
    InvalidLength(usize),
    #[error("frame truncated before its declared length")]
    Truncated,
    #[error("frame payload of {0} bytes is not block aligned")]
    Misaligned(usize),
    #[error("frame checksum mismatch")]
    Checksum,
    #[error("unusable blowfish key of {0} bytes")]
    InvalidKey(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Blowfish in ECB mode over little-endian words.
pub struct GameCrypt {
    cipher: BlowfishLE,
}

impl GameCrypt {
    pub fn new(key: &[u8]) -> Result<Self, FrameError> {
        let cipher = BlowfishLE::new_from_slice(key).map_err(|_| FrameError::InvalidKey(key.len()))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, data: &mut [u8]) -> Result<(), FrameError> {
        if data.len() % BLOCK_SIZE != 0 {
            return Err(FrameError::Misaligned(data.len()));
        }
        for chunk in data.chunks_mut(BLOCK_SIZE) {
            self.cipher.encrypt_block(Block::<BlowfishLE>::from_mut_slice(chunk));
        }
        Ok(())
    }

    pub fn decrypt(&self, data: &mut [u8]) -> Result<(), FrameError> {
        if data.len() % BLOCK_SIZE != 0 {
            return Err(FrameError::Misaligned(data.len()));
        }
        for chunk in data.chunks_mut(BLOCK_SIZE) {
            self.cipher.decrypt_block(Block::<BlowfishLE>::from_mut_slice(chunk));
        }
        Ok(())
    }
}

fn fold_words(data: &[u8]) -> u32 {
    data.chunks_exact(4).fold(0, |acc, word| acc ^ LittleEndian::read_u32(word))
}

/// Overwrites the last word of `data` with the XOR of every word before it.
pub fn append_checksum(data: &mut [u8]) {
    let tail = data.len() - CHECKSUM_SIZE;
    let checksum = fold_words(&data[..tail]);
    LittleEndian::write_u32(&mut data[tail..], checksum);
}

pub fn verify_checksum(data: &[u8]) -> bool {
    if data.len() % 4 != 0 || data.len() <= CHECKSUM_SIZE {
        return false;
    }
    let tail = data.len() - CHECKSUM_SIZE;
    fold_words(&data[..tail]) == LittleEndian::read_u32(&data[tail..])
}

/// Rolling XOR applied to the first client packet. Words from offset 4 up to the last eight
/// bytes are chained through an accumulator seeded with `key`; the final accumulator is stored
/// right after them so the client can run the pass backwards.
pub fn enc_xor_pass(data: &mut [u8], key: i32) {
    let stop = data.len() - 8;
    let mut position = 4;
    let mut ecx = key as u32;
    while position < stop {
        let mut edx = LittleEndian::read_u32(&data[position..]);
        ecx = ecx.wrapping_add(edx);
        edx ^= ecx;
        LittleEndian::write_u32(&mut data[position..], edx);
        position += 4;
    }
    LittleEndian::write_u32(&mut data[position..], ecx);
}

/// Per-connection symmetric state for one direction of a link.
pub trait FrameCipher: Send + 'static {
    /// Pads, checksums and encrypts an outbound packet body.
    fn seal(&mut self, body: &[u8]) -> Result<Vec<u8>, FrameError>;

    /// Decrypts an inbound payload in place and validates its checksum.
    fn open(&self, payload: &mut [u8]) -> Result<(), FrameError>;

    fn rekey(&mut self, key: &[u8]) -> Result<(), FrameError>;
}

pub struct LoginCrypt {
    static_crypt: GameCrypt,
    crypt: GameCrypt,
    first_packet: bool,
}

impl LoginCrypt {
    pub fn new(key: &[u8]) -> Result<Self, FrameError> {
        Ok(Self {
            static_crypt: GameCrypt::new(&STATIC_CLIENT_KEY)?,
            crypt: GameCrypt::new(key)?,
            first_packet: true,
        })
    }

    /// A cipher past its initial packet, as the client side of an open session sees it.
    #[cfg(test)]
    pub fn established(key: &[u8]) -> Result<Self, FrameError> {
        let mut crypt = Self::new(key)?;
        crypt.first_packet = false;
        Ok(crypt)
    }
}

impl FrameCipher for LoginCrypt {
    fn seal(&mut self, body: &[u8]) -> Result<Vec<u8>, FrameError> {
        if self.first_packet {
            // checksum slot plus xor key slot
            let mut size = body.len() + CHECKSUM_SIZE + 4;
            size += BLOCK_SIZE - size % BLOCK_SIZE;
            let mut data = body.to_vec();
            data.resize(size, 0);
            enc_xor_pass(&mut data, rand::random());
            self.static_crypt.encrypt(&mut data)?;
            self.first_packet = false;
            Ok(data)
        } else {
            let mut size = body.len() + CHECKSUM_SIZE;
            size += BLOCK_SIZE - size % BLOCK_SIZE;
            let mut data = body.to_vec();
            data.resize(size, 0);
            append_checksum(&mut data);
            self.crypt.encrypt(&mut data)?;
            Ok(data)
        }
    }

    fn open(&self, payload: &mut [u8]) -> Result<(), FrameError> {
        self.crypt.decrypt(payload)?;
        if !verify_checksum(payload) {
            return Err(FrameError::Checksum);
        }
        Ok(())
    }

    fn rekey(&mut self, key: &[u8]) -> Result<(), FrameError> {
        self.crypt = GameCrypt::new(key)?;
        Ok(())
    }
}

pub struct GameServerCrypt {
    crypt: GameCrypt,
}

impl GameServerCrypt {
    pub fn bootstrap() -> Result<Self, FrameError> {
        Self::with_key(GAME_SERVER_BOOTSTRAP_KEY)
    }

    pub fn with_key(key: &[u8]) -> Result<Self, FrameError> {
        Ok(Self { crypt: GameCrypt::new(key)? })
    }
}

impl FrameCipher for GameServerCrypt {
    fn seal(&mut self, body: &[u8]) -> Result<Vec<u8>, FrameError> {
        let mut data = body.to_vec();
        data.extend_from_slice(&[0; CHECKSUM_SIZE]);
        let misalignment = data.len() % BLOCK_SIZE;
        if misalignment != 0 {
            data.resize(data.len() + BLOCK_SIZE - misalignment, 0);
        }
        append_checksum(&mut data);
        self.crypt.encrypt(&mut data)?;
        Ok(data)
    }

    fn open(&self, payload: &mut [u8]) -> Result<(), FrameError> {
        self.crypt.decrypt(payload)?;
        if !verify_checksum(payload) {
            return Err(FrameError::Checksum);
        }
        Ok(())
    }

    fn rekey(&mut self, key: &[u8]) -> Result<(), FrameError> {
        self.crypt = GameCrypt::new(key)?;
        Ok(())
    }
}

/// Reads one length-prefixed frame and returns its still encrypted payload.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    let mut header = [0u8; 2];
    if let Err(e) = reader.read_exact(&mut header).await {
        return Err(match e.kind() {
            std::io::ErrorKind::UnexpectedEof => FrameError::Closed,
            _ => FrameError::Io(e),
        });
    }

    let length = LittleEndian::read_u16(&header) as usize;
    if length <= 2 {
        return Err(FrameError::InvalidLength(length));
    }

    let mut payload = vec![0u8; length - 2];
    if let Err(e) = reader.read_exact(&mut payload).await {
        return Err(match e.kind() {
            std::io::ErrorKind::UnexpectedEof => FrameError::Truncated,
            _ => FrameError::Io(e),
        });
    }
    Ok(payload)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError> {
    let length = payload.len() + 2;
    if length > u16::MAX as usize {
        return Err(FrameError::InvalidLength(length));
    }
    let mut frame = vec![0u8; 2];
    LittleEndian::write_u16(&mut frame, length as u16);
    frame.extend_from_slice(payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reverses `enc_xor_pass` and the static key, the way a game client reads its first packet.
#[cfg(test)]
pub fn open_init_packet(payload: &mut [u8]) -> Result<(), FrameError> {
    GameCrypt::new(&STATIC_CLIENT_KEY)?.decrypt(payload)?;
    let size = payload.len();
    let mut ecx = LittleEndian::read_u32(&payload[size - 8..]);
    let mut position = size - 12;
    while position >= 4 {
        let mut edx = LittleEndian::read_u32(&payload[position..]);
        edx ^= ecx;
        ecx = ecx.wrapping_sub(edx);
        LittleEndian::write_u32(&mut payload[position..], edx);
        position -= 4;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[test]
    fn game_server_frames_round_trip() {
        let key = b"0123456789abcdef0123456789abcdef01234567";
        let mut sender = GameServerCrypt::with_key(key).unwrap();
        let receiver = GameServerCrypt::with_key(key).unwrap();

        for len in [4, 12, 20, 61] {
            let body = sample_body(len);
            let mut payload = sender.seal(&body).unwrap();
            assert_eq!(payload.len() % BLOCK_SIZE, 0);
            receiver.open(&mut payload).unwrap();
            let decoded = &payload[..payload.len() - CHECKSUM_SIZE];
            // aligned bodies come back exactly, the rest carry zero padding
            assert_eq!(&decoded[..len], &body[..]);
            assert!(decoded[len..].iter().all(|b| *b == 0));
            if (len + CHECKSUM_SIZE) % BLOCK_SIZE == 0 {
                assert_eq!(decoded, &body[..]);
            }
        }
    }

    #[test]
    fn client_frames_always_pad() {
        let key = [7u8; 16];
        let mut server = LoginCrypt::new(&key).unwrap();
        let _init = server.seal(&sample_body(10)).unwrap();

        // 12 bytes plus checksum is already aligned but still grows by a whole block
        let body = sample_body(12);
        let mut payload = server.seal(&body).unwrap();
        assert_eq!(payload.len(), 24);

        let client = LoginCrypt::established(&key).unwrap();
        client.open(&mut payload).unwrap();
        assert_eq!(&payload[..12], &body[..]);
    }

    #[test]
    fn first_client_packet_uses_static_key_and_xor_pass() {
        let mut server = LoginCrypt::new(&[9u8; 16]).unwrap();
        let body = sample_body(170);
        let mut payload = server.seal(&body).unwrap();
        assert_eq!(payload.len() % BLOCK_SIZE, 0);
        assert!(payload.len() >= body.len() + 8);

        open_init_packet(&mut payload).unwrap();
        assert_eq!(&payload[..body.len()], &body[..]);
    }

    #[test]
    fn checksum_detects_a_flip_in_every_word() {
        let mut data = sample_body(32);
        append_checksum(&mut data);
        assert!(verify_checksum(&data));

        for word in 0..data.len() / 4 {
            for offset in 0..4 {
                let mut mutated = data.clone();
                mutated[word * 4 + offset] ^= 0x01;
                assert!(!verify_checksum(&mutated), "flip at byte {} went unnoticed", word * 4 + offset);
            }
        }
    }

    #[test]
    fn checksum_rejects_bad_sizes() {
        assert!(!verify_checksum(&[0; 4]));
        assert!(!verify_checksum(&[0; 10]));
    }

    #[test]
    fn tampered_ciphertext_fails_to_open() {
        let mut sender = GameServerCrypt::bootstrap().unwrap();
        let receiver = GameServerCrypt::bootstrap().unwrap();
        let mut payload = sender.seal(&sample_body(20)).unwrap();
        payload[3] ^= 0x80;
        assert!(matches!(receiver.open(&mut payload), Err(FrameError::Checksum)));

        let mut short = vec![0u8; 12];
        assert!(matches!(receiver.open(&mut short), Err(FrameError::Misaligned(12))));
    }

    #[test]
    fn frames_are_length_prefixed() {
        smol::block_on(async {
            let mut wire = Vec::new();
            write_frame(&mut wire, &[1, 2, 3, 4, 5, 6, 7, 8]).await.unwrap();
            assert_eq!(&wire[..2], &[10, 0]);

            let mut reader = &wire[..];
            assert_eq!(read_frame(&mut reader).await.unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
            assert!(matches!(read_frame(&mut reader).await, Err(FrameError::Closed)));

            let mut truncated = &wire[..6];
            assert!(matches!(read_frame(&mut truncated).await, Err(FrameError::Truncated)));

            let mut bogus: &[u8] = &[2, 0];
            assert!(matches!(read_frame(&mut bogus).await, Err(FrameError::InvalidLength(2))));
        });
    }
}
