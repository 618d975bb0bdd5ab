//! Profile identities: ed25519 keypairs used as iroh endpoint identities.
//!
//! Keys travel through the control API as unpadded URL-safe base64 of the
//! raw 32 bytes. The peer id is the iroh endpoint id derived from the public
//! key, and it is what contacts use as their dial address.

use data_encoding::BASE64URL_NOPAD;
use iroh::{EndpointId, SecretKey};
use serde::Serialize;

const KEY_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid key encoding: {0}")]
    Encoding(#[from] data_encoding::DecodeError),

    #[error("key must be 32 bytes, got {0}")]
    Length(usize),

    #[error("invalid peer id: {0}")]
    PeerId(String),
}

/// Freshly issued key material, as returned by the control API.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedIdentity {
    pub private_key: String,
    pub public_key: String,
    pub peer_id: String,
}

/// Generate a new keypair.
pub fn issue() -> IssuedIdentity {
    let secret = SecretKey::generate(&mut rand::rng());
    let public = secret.public();
    IssuedIdentity {
        private_key: encode_secret_key(&secret),
        public_key: BASE64URL_NOPAD.encode(public.as_bytes()),
        peer_id: public.to_string(),
    }
}

pub fn encode_secret_key(secret: &SecretKey) -> String {
    BASE64URL_NOPAD.encode(&secret.to_bytes())
}

pub fn decode_secret_key(encoded: &str) -> Result<SecretKey, IdentityError> {
    let bytes = BASE64URL_NOPAD.decode(encoded.trim().as_bytes())?;
    let arr: [u8; KEY_LEN] = bytes
        .try_into()
        .map_err(|v: Vec<u8>| IdentityError::Length(v.len()))?;
    Ok(SecretKey::from_bytes(&arr))
}

pub fn parse_peer_id(peer_id: &str) -> Result<EndpointId, IdentityError> {
    peer_id
        .trim()
        .parse::<EndpointId>()
        .map_err(|e| IdentityError::PeerId(e.to_string()))
}
