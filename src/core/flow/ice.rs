// src/core/flow/ice.rs

//! Deterministic credential derivation for a flow handshake (§4.8 step 3):
//! a keyed preshared key and a set of ICE username/password slices, both
//! pure functions of the four actors' stable identifiers so that the same
//! `(client, client_pubkey, node, node_pubkey)` tuple always reproduces the
//! same credentials (Testable Property 9).

use base32::Alphabet;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// The four credential halves exchanged between a client and a serving node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCredentials {
    pub client_user: String,
    pub client_pass: String,
    pub node_user: String,
    pub node_pass: String,
}

/// Keyed hash over the client/node pair, signed with the process-wide flow
/// secret so a PSK can't be forged without it.
pub fn derive_preshared_key(flow_secret: &[u8], client_id: &str, client_pubkey: &str, node_id: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(flow_secret).expect("HMAC accepts a key of any length");
    mac.update(client_id.as_bytes());
    mac.update(b":");
    mac.update(client_pubkey.as_bytes());
    mac.update(b":");
    mac.update(node_id.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

/// Derives the four ICE credential slices deterministically from the
/// handshake's stable inputs (§4.8 step 3): sha256 the joined identifiers,
/// base32-lowercase the digest, then slice fixed byte ranges. The gaps
/// between `[0..3]`, `[4..25]`, `[26..29]` and `[30..52]` are deliberate
/// separators, not truncation.
pub fn derive_ice_credentials(
    client_id: &str,
    client_pubkey: &str,
    node_id: &str,
    node_pubkey: &str,
) -> IceCredentials {
    let mut hasher = Sha256::new();
    hasher.update(client_id.as_bytes());
    hasher.update(b":");
    hasher.update(client_pubkey.as_bytes());
    hasher.update(b":");
    hasher.update(node_id.as_bytes());
    hasher.update(b":");
    hasher.update(node_pubkey.as_bytes());
    let digest = hasher.finalize();

    let encoded = base32::encode(Alphabet::RFC4648 { padding: false }, &digest).to_lowercase();
    let bytes = encoded.as_bytes();

    let slice = |range: std::ops::Range<usize>| -> String {
        String::from_utf8(bytes[range].to_vec()).expect("base32 alphabet is ASCII")
    };

    IceCredentials {
        client_user: slice(0..3),
        client_pass: slice(4..25),
        node_user: slice(26..29),
        node_pass: slice(30..52),
    }
}
