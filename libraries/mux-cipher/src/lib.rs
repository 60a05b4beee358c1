//! Password-derived block ciphers, the controller's "cipher module"
//! (spec §6). Keys are derived with `blake3::derive_key` exactly the way
//! `sillad-sosistab3::state::State` derives its send/recv keys from a
//! shared secret — here the "shared secret" is the configured password.

use chacha20poly1305::{aead::AeadInPlace, ChaCha20Poly1305, KeyInit};

/// How many independently-labeled ciphers a candidate list carries for a
/// single password. A server trying to authenticate an incoming underlay
/// tries each of a user's candidates in turn (spec §4.G).
pub const CANDIDATE_SLOTS: u32 = 3;

/// A single password-derived ChaCha20-Poly1305 key, plus a public tag
/// (`key_id`) that lets a listener pick the matching cipher out of a
/// candidate list without trial-decrypting with every one of them.
#[derive(Clone)]
pub struct BlockCipher {
    key: [u8; 32],
    aead: ChaCha20Poly1305,
    label: String,
}

impl BlockCipher {
    fn from_key(key: [u8; 32], label: impl Into<String>) -> Self {
        let aead = ChaCha20Poly1305::new((&key).into());
        Self {
            key,
            aead,
            label: label.into(),
        }
    }

    /// A public, non-secret tag identifying this derived key. Safe to send
    /// on the wire so a listener can select the right candidate cipher.
    pub fn key_id(&self) -> blake3::Hash {
        blake3::derive_key("mux-cipher/key-id", &self.key)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Encrypts `plaintext` under a nonce derived from `counter`, returning
    /// ciphertext with the authentication tag appended.
    pub fn seal(&self, counter: u64, plaintext: &[u8]) -> Vec<u8> {
        let mut buf = plaintext.to_vec();
        let nonce = nonce_from_counter(counter);
        let tag = self
            .aead
            .encrypt_in_place_detached(&nonce, &[], &mut buf)
            .expect("chacha20poly1305 encryption cannot fail for valid inputs");
        buf.extend_from_slice(&tag);
        buf
    }

    /// Decrypts a buffer produced by `seal` under the same counter value.
    pub fn open(&self, counter: u64, sealed: &[u8]) -> std::io::Result<Vec<u8>> {
        if sealed.len() < 16 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "sealed buffer shorter than an authentication tag",
            ));
        }
        let (body, tag) = sealed.split_at(sealed.len() - 16);
        let mut buf = body.to_vec();
        let nonce = nonce_from_counter(counter);
        self.aead
            .decrypt_in_place_detached(&nonce, &[], &mut buf, tag.into())
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "authentication failed")
            })?;
        Ok(buf)
    }
}

fn nonce_from_counter(counter: u64) -> chacha20poly1305::Nonce {
    let mut nonce = [0u8; 12];
    nonce[..8].copy_from_slice(&counter.to_le_bytes());
    nonce.into()
}

/// A derived cipher tagged with the username it authenticates, attached to
/// every member of a server's candidate cipher list (spec §4.G).
#[derive(Clone)]
pub struct BlockContext {
    pub username: String,
    pub cipher: BlockCipher,
}

impl BlockContext {
    pub fn new(username: impl Into<String>, cipher: BlockCipher) -> Self {
        Self {
            username: username.into(),
            cipher,
        }
    }
}

/// Hashes a plaintext password together with a username using the standard
/// hash (spec §4.G: "derive the password from the plaintext password and
/// username"), for users whose record carries no pre-hashed password.
pub fn hash_password(plaintext: &str, username: &str) -> Vec<u8> {
    blake3::derive_key(&format!("mux-password/{username}"), plaintext.as_bytes()).to_vec()
}

/// Derives a single block cipher from a password, for one transport kind.
pub fn block_cipher_from_password(password: &[u8], datagram: bool) -> BlockCipher {
    let label = if datagram {
        "mux-cipher/datagram/0"
    } else {
        "mux-cipher/stream/0"
    };
    let key = blake3::derive_key(label, password);
    BlockCipher::from_key(key, label)
}

/// Derives [`CANDIDATE_SLOTS`] independently-labeled ciphers from the same
/// password. The candidate cipher list a server builds from its user map
/// concatenates these per-user lists (spec §4.G); a client only ever uses
/// slot 0 (`block_cipher_from_password`), but the listener tries every slot
/// so the key schedule can be rotated server-side without reissuing
/// passwords.
pub fn block_cipher_list_from_password(password: &[u8], datagram: bool) -> Vec<BlockCipher> {
    let prefix = if datagram {
        "mux-cipher/datagram"
    } else {
        "mux-cipher/stream"
    };
    (0..CANDIDATE_SLOTS)
        .map(|slot| {
            let label = format!("{prefix}/{slot}");
            let key = blake3::derive_key(&label, password);
            BlockCipher::from_key(key, label)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let cipher = block_cipher_from_password(b"hunter2", false);
        let sealed = cipher.seal(0, b"hello world");
        let opened = cipher.open(0, &sealed).unwrap();
        assert_eq!(opened, b"hello world");
    }

    #[test]
    fn wrong_counter_fails_to_open() {
        let cipher = block_cipher_from_password(b"hunter2", false);
        let sealed = cipher.seal(0, b"hello world");
        assert!(cipher.open(1, &sealed).is_err());
    }

    #[test]
    fn candidate_list_contains_the_default_slot_under_a_different_label() {
        let list = block_cipher_list_from_password(b"hunter2", false);
        assert_eq!(list.len(), CANDIDATE_SLOTS as usize);
        let default = block_cipher_from_password(b"hunter2", false);
        assert!(list.iter().any(|c| c.key_id() == default.key_id()));
    }

    #[test]
    fn stream_and_datagram_derive_different_keys() {
        let stream = block_cipher_from_password(b"hunter2", false);
        let datagram = block_cipher_from_password(b"hunter2", true);
        assert_ne!(stream.key_id(), datagram.key_id());
    }

    #[test]
    fn derivation_is_a_pure_function_of_the_password() {
        let a = block_cipher_list_from_password(b"hunter2", false);
        let b = block_cipher_list_from_password(b"hunter2", false);
        let mut a_ids: Vec<_> = a.iter().map(|c| c.key_id()).collect();
        let mut b_ids: Vec<_> = b.iter().map(|c| c.key_id()).collect();
        a_ids.sort_by_key(|h| *h.as_bytes());
        b_ids.sort_by_key(|h| *h.as_bytes());
        assert_eq!(a_ids, b_ids);
    }

    #[test]
    fn hash_password_is_keyed_by_username() {
        let a = hash_password("hunter2", "alice");
        let b = hash_password("hunter2", "bob");
        assert_ne!(a, b);
    }
}
