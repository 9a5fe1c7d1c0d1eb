//! Meshtastic-compatible AES-128-CTR channel decryption
//!
//! Packets on a channel configured with the default PSK are encrypted with AES-128 in
//! counter mode. An observer that knows the well-known default key can therefore recover
//! the `Data` payload of any packet sent on such a channel.
//!
//! ## Nonce Construction
//!
//! The 16-byte initial counter block is built from the packet header:
//! ```text
//! Bytes 0-7:   packet_id (u64, little-endian)
//! Bytes 8-15:  from node id (u64, little-endian)
//! ```
//!
//! CTR mode has no integrity check, so a wrong key "succeeds" with garbage output.
//! Decryption is only reported as successful when the plaintext parses as a `Data`
//! message.

use super::packet::NodeId;
use super::proto;

#[cfg(feature = "crypto")]
use aes::Aes128;
#[cfg(feature = "crypto")]
use ctr::cipher::{KeyIvInit, StreamCipher};
#[cfg(feature = "crypto")]
use ctr::Ctr128BE;
#[cfg(feature = "crypto")]
use prost::Message;

/// Default Pre-Shared Key (PSK) for the default channel
/// This is the well-known key used by default Meshtastic channels (`AQ==` shorthand)
pub const DEFAULT_PSK: [u8; 16] = [
    0xd4, 0xf1, 0xbb, 0x3a, 0x20, 0x29, 0x07, 0x59,
    0xf0, 0xbc, 0xff, 0xab, 0xcf, 0x4e, 0x69, 0x01,
];

/// Crypto error types
#[derive(Debug, Clone, PartialEq)]
pub enum CryptoError {
    /// Nothing to decrypt
    EmptyCiphertext,
    /// Keystream applied but the plaintext is not a valid `Data` message
    DecryptionFailed(String),
    /// Crypto feature not enabled
    FeatureNotEnabled,
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::EmptyCiphertext => write!(f, "Empty ciphertext"),
            CryptoError::DecryptionFailed(reason) => write!(f, "Decryption failed: {}", reason),
            CryptoError::FeatureNotEnabled => {
                write!(f, "Crypto feature not enabled, compile with --features crypto")
            }
        }
    }
}

impl std::error::Error for CryptoError {}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Channel key used for opportunistic decryption
#[derive(Clone)]
pub struct ChannelKey {
    key: [u8; 16],
}

impl ChannelKey {
    /// Create from raw 16-byte AES-128 key
    pub fn from_raw(key: [u8; 16]) -> Self {
        Self { key }
    }

    /// The default channel key
    pub fn default_psk() -> Self {
        Self::from_raw(DEFAULT_PSK)
    }

    /// Get the raw key bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.key
    }
}

impl Default for ChannelKey {
    fn default() -> Self {
        Self::default_psk()
    }
}

impl std::fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Crypto context for a channel
#[derive(Debug, Clone, Default)]
pub struct CryptoContext {
    key: ChannelKey,
}

impl CryptoContext {
    /// Create a context for the given key
    pub fn new(key: ChannelKey) -> Self {
        Self { key }
    }

    /// Create with default PSK
    pub fn with_default_psk() -> Self {
        Self::new(ChannelKey::default_psk())
    }

    /// Construct the 16-byte initial counter block for AES-CTR
    pub fn make_nonce(packet_id: u32, from: NodeId) -> [u8; 16] {
        let mut nonce = [0u8; 16];
        nonce[0..8].copy_from_slice(&u64::from(packet_id).to_le_bytes());
        nonce[8..16].copy_from_slice(&u64::from(from.to_u32()).to_le_bytes());
        nonce
    }

    /// Apply the keystream for `(packet_id, from)` to `data`
    ///
    /// CTR is symmetric: the same call encrypts and decrypts.
    #[cfg(feature = "crypto")]
    pub fn apply_keystream(&self, data: &[u8], packet_id: u32, from: NodeId) -> Vec<u8> {
        let nonce = Self::make_nonce(packet_id, from);
        let mut out = data.to_vec();
        let mut cipher = Ctr128BE::<Aes128>::new(self.key.as_bytes().into(), &nonce.into());
        cipher.apply_keystream(&mut out);
        out
    }

    /// Decrypt an encrypted packet body into its `Data` payload
    #[cfg(feature = "crypto")]
    pub fn decrypt_data(
        &self,
        ciphertext: &[u8],
        packet_id: u32,
        from: NodeId,
    ) -> CryptoResult<proto::Data> {
        if ciphertext.is_empty() {
            return Err(CryptoError::EmptyCiphertext);
        }

        let plaintext = self.apply_keystream(ciphertext, packet_id, from);
        proto::Data::decode(plaintext.as_slice())
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }

    /// Stub decrypt when crypto feature is disabled
    #[cfg(not(feature = "crypto"))]
    pub fn decrypt_data(
        &self,
        _ciphertext: &[u8],
        _packet_id: u32,
        _from: NodeId,
    ) -> CryptoResult<proto::Data> {
        Err(CryptoError::FeatureNotEnabled)
    }
}

#[cfg(all(test, feature = "crypto"))]
mod tests {
    use super::*;
    use crate::mesh::proto::PortNum;

    #[test]
    fn test_nonce_layout() {
        let nonce = CryptoContext::make_nonce(0x0102_0304, NodeId::from_u32(0xa1b2_c3d4));
        assert_eq!(&nonce[0..8], &[0x04, 0x03, 0x02, 0x01, 0, 0, 0, 0]);
        assert_eq!(&nonce[8..16], &[0xd4, 0xc3, 0xb2, 0xa1, 0, 0, 0, 0]);
    }

    #[test]
    fn test_decrypt_roundtrip() {
        let ctx = CryptoContext::with_default_psk();
        let from = NodeId::from_u32(0x1122_3344);
        let data = proto::Data {
            portnum: PortNum::TextMessageApp as i32,
            payload: b"Hello, Meshtastic!".to_vec(),
            ..Default::default()
        };

        let ciphertext = ctx.apply_keystream(&data.encode_to_vec(), 12345, from);
        assert_ne!(ciphertext, data.encode_to_vec());

        let decrypted = ctx.decrypt_data(&ciphertext, 12345, from).expect("decrypt");
        assert_eq!(decrypted, data);
    }

    #[test]
    fn test_wrong_nonce_does_not_yield_same_payload() {
        let ctx = CryptoContext::with_default_psk();
        let from = NodeId::from_u32(0x1122_3344);
        let data = proto::Data {
            portnum: PortNum::TextMessageApp as i32,
            payload: b"Secret message".to_vec(),
            ..Default::default()
        };
        let ciphertext = ctx.apply_keystream(&data.encode_to_vec(), 1, from);

        match ctx.decrypt_data(&ciphertext, 2, from) {
            Ok(other) => assert_ne!(other, data),
            Err(e) => assert!(matches!(e, CryptoError::DecryptionFailed(_))),
        }
    }

    #[test]
    fn test_empty_ciphertext() {
        let ctx = CryptoContext::default();
        let result = ctx.decrypt_data(&[], 1, NodeId::from_u32(1));
        assert_eq!(result, Err(CryptoError::EmptyCiphertext));
    }

    #[test]
    fn test_key_is_redacted_in_debug() {
        let debug = format!("{:?}", ChannelKey::default_psk());
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("d4"));
    }
}
