//! Pairing bundles.
//!
//! A bundle is the one-shot payload a peer CLI publishes out-of-band
//! (QR code URL fragment) so this side can create the first Olm session:
//! the CLI's Curve25519 identity key, its Ed25519 signing key, one
//! Curve25519 one-time key, and an Ed25519 signature over the signed
//! portion.
//!
//! # Binary format (v6, fixed 161 bytes)
//!
//! ```text
//! [version:1][curve25519 identity:32][ed25519 signing:32][one-time key:32][signature:64]
//! ```
//!
//! The signature covers bytes `0..97` (everything before itself). QR URLs
//! carry the bundle BASE32_NOPAD-encoded in the `#` fragment so the relay
//! server never sees it. A JSON dictionary form exists for refresh flows
//! that already run inside an established channel.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use data_encoding::BASE32_NOPAD;
use serde::{Deserialize, Serialize};
use vodozemac::{Ed25519PublicKey, Ed25519Signature};

use super::CryptoError;

/// Protocol version for pairing bundles.
pub const BUNDLE_VERSION: u8 = 6;

/// Binary format constants for the fixed 161-byte bundle.
pub mod binary_format {
    //! Byte offsets and sizes of the serialized bundle.

    /// Byte offset: format version (1 byte).
    pub const VERSION_OFFSET: usize = 0;
    /// Byte offset: Curve25519 identity key (32 bytes).
    pub const CURVE25519_KEY_OFFSET: usize = 1;
    /// Byte offset: Ed25519 signing key (32 bytes).
    pub const ED25519_KEY_OFFSET: usize = 33;
    /// Byte offset: one-time key (32 bytes).
    pub const ONE_TIME_KEY_OFFSET: usize = 65;
    /// Byte offset: Ed25519 signature (64 bytes).
    pub const SIGNATURE_OFFSET: usize = 97;

    /// Size of Curve25519 key in bytes.
    pub const CURVE25519_KEY_SIZE: usize = 32;
    /// Size of Ed25519 key in bytes.
    pub const ED25519_KEY_SIZE: usize = 32;
    /// Size of one-time key in bytes.
    pub const ONE_TIME_KEY_SIZE: usize = 32;
    /// Size of Ed25519 signature in bytes.
    pub const SIGNATURE_SIZE: usize = 64;
    /// Length of the signed prefix (version + three keys).
    pub const SIGNED_SIZE: usize = SIGNATURE_OFFSET;
    /// Total fixed bundle size.
    pub const BUNDLE_SIZE: usize = 1 + 32 + 32 + 32 + 64; // 161 bytes
}

/// Decode base64 that may or may not have padding.
pub(crate) fn decode_b64(input: &str) -> Result<Vec<u8>, CryptoError> {
    STANDARD_NO_PAD
        .decode(input)
        .or_else(|_| STANDARD.decode(input))
        .map_err(|_| CryptoError::BundleMalformed("invalid base64".into()))
}

/// A peer's pairing bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingBundle {
    /// Protocol version (0x06).
    #[serde(default = "default_version")]
    pub version: u8,
    /// Curve25519 identity key (base64 unpadded).
    pub curve25519_key: String,
    /// Ed25519 signing key (base64 unpadded).
    pub ed25519_key: String,
    /// One-time key for session establishment (Curve25519, base64 unpadded).
    pub one_time_key: String,
    /// Identifier of the one-time key, when the JSON form carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    /// Ed25519 signature over the 97-byte signed prefix (base64 unpadded).
    pub signature: String,
}

fn default_version() -> u8 {
    BUNDLE_VERSION
}

impl PairingBundle {
    /// Deserialize from the compact 161-byte binary format.
    pub fn from_binary(bytes: &[u8]) -> Result<Self, CryptoError> {
        use binary_format::*;

        if bytes.len() < BUNDLE_SIZE {
            return Err(CryptoError::BundleMalformed(format!(
                "binary bundle too small: {} < {BUNDLE_SIZE}",
                bytes.len()
            )));
        }

        Ok(Self {
            version: bytes[VERSION_OFFSET],
            curve25519_key: STANDARD_NO_PAD
                .encode(&bytes[CURVE25519_KEY_OFFSET..CURVE25519_KEY_OFFSET + CURVE25519_KEY_SIZE]),
            ed25519_key: STANDARD_NO_PAD
                .encode(&bytes[ED25519_KEY_OFFSET..ED25519_KEY_OFFSET + ED25519_KEY_SIZE]),
            one_time_key: STANDARD_NO_PAD
                .encode(&bytes[ONE_TIME_KEY_OFFSET..ONE_TIME_KEY_OFFSET + ONE_TIME_KEY_SIZE]),
            key_id: None,
            signature: STANDARD_NO_PAD
                .encode(&bytes[SIGNATURE_OFFSET..SIGNATURE_OFFSET + SIGNATURE_SIZE]),
        })
    }

    /// Decode from a QR URL fragment (BASE32_NOPAD over the binary form).
    pub fn from_base32_fragment(fragment: &str) -> Result<Self, CryptoError> {
        let bytes = BASE32_NOPAD
            .decode(fragment.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| CryptoError::BundleMalformed("invalid base32 fragment".into()))?;
        Self::from_binary(&bytes)
    }

    /// Parse from a JSON dictionary (refresh flows).
    pub fn from_json(value: &serde_json::Value) -> Result<Self, CryptoError> {
        serde_json::from_value(value.clone())
            .map_err(|e| CryptoError::BundleMalformed(format!("bundle dictionary: {e}")))
    }

    /// Serialize to the compact binary format.
    pub fn to_binary(&self) -> Result<Vec<u8>, CryptoError> {
        use binary_format::*;

        let mut buf = vec![0u8; BUNDLE_SIZE];
        buf[VERSION_OFFSET] = self.version;
        copy_field(&mut buf, CURVE25519_KEY_OFFSET, CURVE25519_KEY_SIZE, &self.curve25519_key)?;
        copy_field(&mut buf, ED25519_KEY_OFFSET, ED25519_KEY_SIZE, &self.ed25519_key)?;
        copy_field(&mut buf, ONE_TIME_KEY_OFFSET, ONE_TIME_KEY_SIZE, &self.one_time_key)?;
        copy_field(&mut buf, SIGNATURE_OFFSET, SIGNATURE_SIZE, &self.signature)?;
        Ok(buf)
    }

    /// The signed prefix: `[version][identity][signing][one-time key]`.
    pub fn signed_prefix(&self) -> Result<Vec<u8>, CryptoError> {
        let binary = self.to_binary()?;
        Ok(binary[..binary_format::SIGNED_SIZE].to_vec())
    }

    /// Verify the bundle's Ed25519 signature with its embedded signing key.
    pub fn verify(&self) -> Result<(), CryptoError> {
        let signed = self.signed_prefix()?;

        let signing_key_bytes = decode_b64(&self.ed25519_key)?;
        let key_array: [u8; 32] = signing_key_bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::BundleMalformed("signing key wrong size".into()))?;
        let key = Ed25519PublicKey::from_slice(&key_array)
            .map_err(|_| CryptoError::BundleMalformed("invalid Ed25519 signing key".into()))?;

        let sig_bytes = decode_b64(&self.signature)?;
        let sig = Ed25519Signature::from_slice(&sig_bytes)
            .map_err(|_| CryptoError::BundleMalformed("invalid signature encoding".into()))?;

        key.verify(&signed, &sig)
            .map_err(|_| CryptoError::SignatureInvalid)
    }
}

fn copy_field(
    buf: &mut [u8],
    offset: usize,
    size: usize,
    field: &str,
) -> Result<(), CryptoError> {
    let bytes = decode_b64(field)?;
    if bytes.len() != size {
        return Err(CryptoError::BundleMalformed(format!(
            "field wrong size: {} != {size}",
            bytes.len()
        )));
    }
    buf[offset..offset + size].copy_from_slice(&bytes);
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use vodozemac::olm::Account;

    /// Build a properly signed bundle from a fresh account, the way the
    /// peer CLI does it.
    pub(crate) fn signed_test_bundle(account: &mut Account) -> (PairingBundle, String) {
        account.generate_one_time_keys(1);
        let otk = account
            .one_time_keys()
            .into_iter()
            .next()
            .map(|(_, key)| key.to_base64())
            .expect("one-time key generated");
        account.mark_keys_as_published();

        let mut bundle = PairingBundle {
            version: BUNDLE_VERSION,
            curve25519_key: account.curve25519_key().to_base64(),
            ed25519_key: account.ed25519_key().to_base64(),
            one_time_key: otk.clone(),
            key_id: None,
            signature: STANDARD_NO_PAD.encode([0u8; 64]),
        };
        let signed = bundle.signed_prefix().expect("prefix");
        bundle.signature = account.sign(&signed).to_base64();
        (bundle, otk)
    }

    #[test]
    fn test_binary_roundtrip() {
        let bundle = PairingBundle {
            version: BUNDLE_VERSION,
            curve25519_key: STANDARD_NO_PAD.encode([1u8; 32]),
            ed25519_key: STANDARD_NO_PAD.encode([2u8; 32]),
            one_time_key: STANDARD_NO_PAD.encode([3u8; 32]),
            key_id: None,
            signature: STANDARD_NO_PAD.encode([4u8; 64]),
        };

        let bytes = bundle.to_binary().unwrap();
        assert_eq!(bytes.len(), binary_format::BUNDLE_SIZE);

        let restored = PairingBundle::from_binary(&bytes).unwrap();
        assert_eq!(restored.curve25519_key, bundle.curve25519_key);
        assert_eq!(restored.ed25519_key, bundle.ed25519_key);
        assert_eq!(restored.one_time_key, bundle.one_time_key);
        assert_eq!(restored.signature, bundle.signature);
    }

    #[test]
    fn test_base32_fragment_roundtrip() {
        let mut account = Account::new();
        let (bundle, _) = signed_test_bundle(&mut account);

        let fragment = BASE32_NOPAD.encode(&bundle.to_binary().unwrap());
        let restored = PairingBundle::from_base32_fragment(&fragment).unwrap();
        assert_eq!(restored.curve25519_key, bundle.curve25519_key);
        restored.verify().expect("signature survives transcoding");
    }

    #[test]
    fn test_signature_verifies() {
        let mut account = Account::new();
        let (bundle, _) = signed_test_bundle(&mut account);
        bundle.verify().expect("fresh bundle verifies");
    }

    #[test]
    fn test_tampered_bundle_rejected() {
        let mut account = Account::new();
        let (mut bundle, _) = signed_test_bundle(&mut account);

        // Swap in a different one-time key; the signature no longer covers it.
        bundle.one_time_key = STANDARD_NO_PAD.encode([9u8; 32]);
        assert!(matches!(bundle.verify(), Err(CryptoError::SignatureInvalid)));
    }

    #[test]
    fn test_signature_from_wrong_key_rejected() {
        let mut account = Account::new();
        let (mut bundle, _) = signed_test_bundle(&mut account);

        let imposter = Account::new();
        let signed = bundle.signed_prefix().unwrap();
        bundle.signature = imposter.sign(&signed).to_base64();
        assert!(matches!(bundle.verify(), Err(CryptoError::SignatureInvalid)));
    }

    #[test]
    fn test_truncated_binary_rejected() {
        assert!(matches!(
            PairingBundle::from_binary(&[0u8; 42]),
            Err(CryptoError::BundleMalformed(_))
        ));
    }

    #[test]
    fn test_json_form() {
        let mut account = Account::new();
        let (bundle, _) = signed_test_bundle(&mut account);

        let value = serde_json::to_value(&bundle).unwrap();
        let restored = PairingBundle::from_json(&value).unwrap();
        restored.verify().expect("JSON form verifies");
    }

    #[test]
    fn test_json_missing_field_rejected() {
        let value = serde_json::json!({ "curve25519_key": "abc" });
        assert!(matches!(
            PairingBundle::from_json(&value),
            Err(CryptoError::BundleMalformed(_))
        ));
    }

    #[test]
    fn test_padded_base64_accepted() {
        let mut account = Account::new();
        let (mut bundle, _) = signed_test_bundle(&mut account);
        // Legacy encoders pad their base64.
        let raw = decode_b64(&bundle.curve25519_key).unwrap();
        bundle.curve25519_key = STANDARD.encode(raw);
        bundle.verify().expect("padded key still verifies");
    }
}
