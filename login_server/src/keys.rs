//! Key material generated once at startup.
//!
//! Clients receive one of a small pool of RSA public keys, with its modulus scrambled the way
//! the client expects, plus one of a pool of Blowfish keys. Game servers all share a single
//! broker RSA key pair which they use to wrap their own Blowfish key.

use std::sync::Arc;

use anyhow::{bail, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey};
use tracing::info;

pub const CLIENT_KEY_PAIRS: usize = 10;
pub const CLIENT_KEY_BITS: usize = 1024;
pub const GAME_SERVER_KEY_BITS: usize = 512;
pub const BLOWFISH_KEYS: usize = 20;
pub const BLOWFISH_KEY_SIZE: usize = 16;

/// A client-facing RSA pair together with the obfuscated modulus sent in the Init packet.
pub struct ScrambledKeyPair {
    private_key: RsaPrivateKey,
    scrambled_modulus: Vec<u8>,
}

impl ScrambledKeyPair {
    pub fn new(private_key: RsaPrivateKey) -> Self {
        let modulus = left_pad(&private_key.n().to_bytes_be(), private_key.size());
        let scrambled_modulus = scramble_modulus(modulus);
        Self {
            private_key,
            scrambled_modulus,
        }
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    pub fn scrambled_modulus(&self) -> &[u8] {
        &self.scrambled_modulus
    }
}

/// Byte shuffle the client undoes before using the modulus. Expects a 128 byte modulus.
pub fn scramble_modulus(mut modulus: Vec<u8>) -> Vec<u8> {
    for i in 0..4 {
        modulus.swap(i, 0x4d + i);
    }
    for i in 0..0x40 {
        modulus[i] ^= modulus[0x40 + i];
    }
    for i in 0..4 {
        modulus[0x0d + i] ^= modulus[0x34 + i];
    }
    for i in 0..0x40 {
        modulus[0x40 + i] ^= modulus[i];
    }
    modulus
}

pub struct KeyManager {
    client_pairs: Vec<Arc<ScrambledKeyPair>>,
    blowfish_keys: Vec<[u8; BLOWFISH_KEY_SIZE]>,
    game_server_key: RsaPrivateKey,
}

impl KeyManager {
    pub fn generate() -> Result<Self> {
        Self::generate_with(CLIENT_KEY_PAIRS, CLIENT_KEY_BITS, GAME_SERVER_KEY_BITS)
    }

    pub fn generate_with(client_pairs: usize, client_bits: usize, game_server_bits: usize) -> Result<Self> {
        if client_pairs == 0 {
            bail!("At least one client key pair is required");
        }
        let mut rng = rand::thread_rng();

        let mut pairs = Vec::with_capacity(client_pairs);
        for _ in 0..client_pairs {
            let key = RsaPrivateKey::new(&mut rng, client_bits)?;
            pairs.push(Arc::new(ScrambledKeyPair::new(key)));
        }
        info!("Cached {} key pairs for RSA communication", pairs.len());

        let blowfish_keys = (0..BLOWFISH_KEYS)
            .map(|_| {
                let mut key = [0u8; BLOWFISH_KEY_SIZE];
                key.iter_mut().for_each(|b| *b = rng.gen_range(1..=255));
                key
            })
            .collect::<Vec<_>>();
        info!("Stored {} keys for Blowfish communication", blowfish_keys.len());

        let game_server_key = RsaPrivateKey::new(&mut rng, game_server_bits)?;
        info!("Generated {game_server_bits} bit RSA key pair for game server links");

        Ok(Self {
            client_pairs: pairs,
            blowfish_keys,
            game_server_key,
        })
    }

    pub fn random_client_pair(&self) -> Arc<ScrambledKeyPair> {
        let mut rng = rand::thread_rng();
        self.client_pairs
            .choose(&mut rng)
            .cloned()
            .unwrap_or_else(|| self.client_pairs[0].clone())
    }

    pub fn random_blowfish_key(&self) -> [u8; BLOWFISH_KEY_SIZE] {
        self.blowfish_keys[rand::thread_rng().gen_range(0..self.blowfish_keys.len())]
    }

    pub fn game_server_key(&self) -> &RsaPrivateKey {
        &self.game_server_key
    }

    /// Modulus as a signed big-endian integer: a leading zero is kept when the top bit is set.
    pub fn game_server_modulus(&self) -> Vec<u8> {
        let modulus = self.game_server_key.n().to_bytes_be();
        if modulus.first().is_some_and(|b| b & 0x80 != 0) {
            let mut signed = Vec::with_capacity(modulus.len() + 1);
            signed.push(0);
            signed.extend_from_slice(&modulus);
            signed
        } else {
            modulus
        }
    }
}

/// Textbook RSA decryption with no padding scheme, output left-padded to the key size.
pub fn raw_decrypt(key: &RsaPrivateKey, block: &[u8]) -> Result<Vec<u8>> {
    let cipher = BigUint::from_bytes_be(block);
    if &cipher >= key.n() {
        bail!("RSA block is not smaller than the modulus");
    }
    let plain = cipher.modpow(key.d(), key.n());
    Ok(left_pad(&plain.to_bytes_be(), key.size()))
}

fn left_pad(bytes: &[u8], size: usize) -> Vec<u8> {
    if bytes.len() >= size {
        return bytes.to_vec();
    }
    let mut padded = vec![0u8; size - bytes.len()];
    padded.extend_from_slice(bytes);
    padded
}
