//! HMAC and hashing primitives shared by the admission gates.
//!
//! Signature verification must not leak how many leading bytes of a
//! candidate match the expected value. `constant_time_eq` therefore MACs
//! both sides under a fresh random key and compares the full-length
//! digests, which also defeats prefix-matching shortcuts inside the
//! platform's byte compare.

use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use subtle::ConstantTimeEq;

/// Digest algorithms accepted for request signatures. Selected by
/// configuration only, never by request input.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashAlgorithm {
    #[serde(rename = "SHA-1", alias = "sha-1", alias = "sha1")]
    Sha1,
    #[default]
    #[serde(rename = "SHA-256", alias = "sha-256", alias = "sha256")]
    Sha256,
    #[serde(rename = "SHA-384", alias = "sha-384", alias = "sha384")]
    Sha384,
    #[serde(rename = "SHA-512", alias = "sha-512", alias = "sha512")]
    Sha512,
}

/// Lowercase hex HMAC of `message` under `key`.
pub fn hmac_hex(key: &[u8], message: &[u8], algorithm: HashAlgorithm) -> String {
    match algorithm {
        HashAlgorithm::Sha1 => {
            let mut mac =
                Hmac::<Sha1>::new_from_slice(key).expect("hmac accepts any key length");
            mac.update(message);
            hex::encode(mac.finalize().into_bytes())
        }
        HashAlgorithm::Sha256 => {
            let mut mac =
                Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
            mac.update(message);
            hex::encode(mac.finalize().into_bytes())
        }
        HashAlgorithm::Sha384 => {
            let mut mac =
                Hmac::<Sha384>::new_from_slice(key).expect("hmac accepts any key length");
            mac.update(message);
            hex::encode(mac.finalize().into_bytes())
        }
        HashAlgorithm::Sha512 => {
            let mut mac =
                Hmac::<Sha512>::new_from_slice(key).expect("hmac accepts any key length");
            mac.update(message);
            hex::encode(mac.finalize().into_bytes())
        }
    }
}

/// Lowercase hex SHA-256 of `data`; used to check passthrough tokens
/// against the configured token hash.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Equality whose runtime does not depend on how many leading bytes
/// match or on the input lengths.
pub fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);

    let mut mac = Hmac::<Sha256>::new_from_slice(&key).expect("hmac accepts any key length");
    mac.update(left);
    let left_mac = mac.finalize().into_bytes();

    let mut mac = Hmac::<Sha256>::new_from_slice(&key).expect("hmac accepts any key length");
    mac.update(right);
    let right_mac = mac.finalize().into_bytes();

    left_mac.ct_eq(&right_mac).into()
}
