use crate::error::TufError;
use crate::signature::canonical::to_canonical_bytes;

use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{Pss, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Modulus size of generated RSA keys.
pub const RSA_KEY_BITS: usize = 4096;

pub const RSA_PSS_SHA256_METHOD: &str = "rsassa-pss-sha256";
pub const ED25519_METHOD: &str = "ed25519";

/// Supported signing algorithms.
///
/// This is the only polymorphism axis of the engine: everything else is
/// written once against [`Signer`] and [`TufKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    /// RSA-4096 with PSS padding over SHA-256
    Rsa,
    /// Ed25519 over the raw message
    Ed25519,
}

impl KeyType {
    pub const ALL: [KeyType; 2] = [KeyType::Rsa, KeyType::Ed25519];

    /// Name used in key documents (`keytype`).
    pub fn name(&self) -> &'static str {
        match self {
            KeyType::Rsa => "RSA",
            KeyType::Ed25519 => "ED25519",
        }
    }

    /// Name used in signatures (`method`).
    pub fn sig_method(&self) -> &'static str {
        match self {
            KeyType::Rsa => RSA_PSS_SHA256_METHOD,
            KeyType::Ed25519 => ED25519_METHOD,
        }
    }

    /// Whether the message is hashed before being handed to the primitive.
    pub fn prehashed(&self) -> bool {
        matches!(self, KeyType::Rsa)
    }

    pub fn from_sig_method(method: &str) -> Result<Self, TufError> {
        match method {
            RSA_PSS_SHA256_METHOD => Ok(KeyType::Rsa),
            ED25519_METHOD => Ok(KeyType::Ed25519),
            other => Err(TufError::UnsupportedKeyType(format!(
                "signature method '{}'",
                other
            ))),
        }
    }

    /// Generate a fresh key pair of this type.
    pub fn generate_key(&self) -> Result<Signer, TufError> {
        match self {
            KeyType::Rsa => {
                let key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)?;
                Ok(Signer::Rsa(Box::new(key)))
            }
            KeyType::Ed25519 => Ok(Signer::Ed25519(ed25519_compact::KeyPair::from_seed(
                ed25519_compact::Seed::generate(),
            ))),
        }
    }

    /// Parse the serialized private half (`keyval.private`) into a signer.
    pub fn parse_key(&self, private: &str) -> Result<Signer, TufError> {
        match self {
            KeyType::Rsa => {
                let key = RsaPrivateKey::from_pkcs1_pem(private)
                    .or_else(|_| RsaPrivateKey::from_pkcs8_pem(private))
                    .map_err(|e| {
                        TufError::CryptoError(format!("Invalid RSA private key: {}", e))
                    })?;
                key.validate()?;
                Ok(Signer::Rsa(Box::new(key)))
            }
            KeyType::Ed25519 => {
                let raw = hex::decode(private.trim()).map_err(|e| {
                    TufError::CryptoError(format!("Invalid Ed25519 private key hex: {}", e))
                })?;
                let kp = match raw.len() {
                    64 => ed25519_compact::KeyPair::from_slice(&raw)?,
                    32 => ed25519_compact::KeyPair::from_seed(ed25519_compact::Seed::from_slice(
                        &raw,
                    )?),
                    n => {
                        return Err(TufError::CryptoError(format!(
                            "Invalid Ed25519 private key length: {} bytes",
                            n
                        )))
                    }
                };
                Ok(Signer::Ed25519(kp))
            }
        }
    }
}

impl FromStr for KeyType {
    type Err = TufError;

    /// Case-insensitive: `rsa`, `RSA`, `ed25519`, `ED25519`...
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rsa" => Ok(KeyType::Rsa),
            "ed25519" => Ok(KeyType::Ed25519),
            _ => Err(TufError::UnsupportedKeyType(s.to_string())),
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for KeyType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for KeyType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Key material of a key document. Exactly one half is set.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct KeyVal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<String>,
}

/// A key document: `{"keytype": "RSA", "keyval": {"public": "..."}}`.
///
/// The same shape is used inside root metadata (public half only) and in
/// the offline credentials archive (`.pub` and `.sec` entries).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TufKey {
    pub keytype: KeyType,
    pub keyval: KeyVal,
}

impl TufKey {
    /// Build a public key document.
    pub fn public(keytype: KeyType, value: impl Into<String>) -> Self {
        Self {
            keytype,
            keyval: KeyVal {
                public: Some(value.into()),
                private: None,
            },
        }
    }

    /// Build a private key document.
    pub fn private(keytype: KeyType, value: impl Into<String>) -> Self {
        Self {
            keytype,
            keyval: KeyVal {
                public: None,
                private: Some(value.into()),
            },
        }
    }

    pub fn public_value(&self) -> Option<&str> {
        self.keyval.public.as_deref()
    }

    pub fn private_value(&self) -> Option<&str> {
        self.keyval.private.as_deref()
    }

    /// Deterministic key id: hex SHA-256 of the canonical public key document.
    pub fn key_id(&self) -> Result<String, TufError> {
        let public = self.public_value().ok_or_else(|| {
            TufError::InvalidArgument("Key id requires the public half of a key".to_string())
        })?;
        let doc = TufKey::public(self.keytype, public);
        let canonical = to_canonical_bytes(&doc)?;
        Ok(hex::encode(hmac_sha256::Hash::hash(&canonical)))
    }

    /// Parse the private half into a signer.
    pub fn to_signer(&self) -> Result<Signer, TufError> {
        let private = self.private_value().ok_or_else(|| {
            TufError::InvalidArgument("Not a private key document".to_string())
        })?;
        self.keytype.parse_key(private)
    }

    /// Verify `sig` over `msg` made with `method` by this public key.
    pub fn verify(&self, method: &str, msg: &[u8], sig: &[u8]) -> Result<(), TufError> {
        if KeyType::from_sig_method(method)? != self.keytype {
            return Err(TufError::CryptoError(format!(
                "Signature method '{}' does not match key type {}",
                method, self.keytype
            )));
        }
        let public = self.public_value().ok_or_else(|| {
            TufError::InvalidArgument("Verification requires a public key".to_string())
        })?;
        match self.keytype {
            KeyType::Rsa => {
                let pk = RsaPublicKey::from_public_key_pem(public)
                    .or_else(|_| RsaPublicKey::from_pkcs1_pem(public))
                    .map_err(|e| TufError::CryptoError(format!("Invalid RSA public key: {}", e)))?;
                let digest = Sha256::digest(msg);
                pk.verify(Pss::new::<Sha256>(), &digest, sig)?;
                Ok(())
            }
            KeyType::Ed25519 => {
                let raw = hex::decode(public.trim()).map_err(|e| {
                    TufError::CryptoError(format!("Invalid Ed25519 public key hex: {}", e))
                })?;
                let pk = ed25519_compact::PublicKey::from_slice(&raw)?;
                let sig = ed25519_compact::Signature::from_slice(sig)?;
                pk.verify(msg, &sig)?;
                Ok(())
            }
        }
    }

    pub fn from_json(data: &[u8]) -> Result<Self, TufError> {
        serde_json::from_slice(data)
            .map_err(|e| TufError::ParseError(format!("Invalid key document: {}", e)))
    }

    pub fn to_json(&self) -> Result<Vec<u8>, TufError> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl fmt::Debug for TufKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let half = if self.keyval.private.is_some() {
            "private"
        } else {
            "public"
        };
        write!(
            f,
            "TufKey {{ {} {} - key_id: {:?} }}",
            self.keytype,
            half,
            self.key_id().ok()
        )
    }
}

/// A private key able to produce signatures.
#[derive(Clone)]
pub enum Signer {
    Rsa(Box<RsaPrivateKey>),
    Ed25519(ed25519_compact::KeyPair),
}

impl Signer {
    pub fn key_type(&self) -> KeyType {
        match self {
            Signer::Rsa(_) => KeyType::Rsa,
            Signer::Ed25519(_) => KeyType::Ed25519,
        }
    }

    /// Public key document of this signer.
    pub fn public_key(&self) -> Result<TufKey, TufError> {
        match self {
            Signer::Rsa(key) => {
                let pem = key
                    .to_public_key()
                    .to_public_key_pem(LineEnding::LF)
                    .map_err(|e| TufError::CryptoError(format!("RSA public key PEM: {}", e)))?;
                Ok(TufKey::public(KeyType::Rsa, pem))
            }
            Signer::Ed25519(kp) => Ok(TufKey::public(
                KeyType::Ed25519,
                hex::encode(kp.pk.as_ref()),
            )),
        }
    }

    /// Private key document of this signer.
    pub fn private_key(&self) -> Result<TufKey, TufError> {
        match self {
            Signer::Rsa(key) => {
                let pem = key
                    .to_pkcs1_pem(LineEnding::LF)
                    .map_err(|e| TufError::CryptoError(format!("RSA private key PEM: {}", e)))?;
                Ok(TufKey::private(KeyType::Rsa, pem.as_str()))
            }
            Signer::Ed25519(kp) => Ok(TufKey::private(
                KeyType::Ed25519,
                hex::encode(kp.sk.as_ref()),
            )),
        }
    }

    pub fn key_id(&self) -> Result<String, TufError> {
        self.public_key()?.key_id()
    }

    /// Sign `msg`, pre-hashing it when the algorithm requires it.
    pub fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, TufError> {
        match self {
            Signer::Rsa(key) => {
                let digest = Sha256::digest(msg);
                Ok(key.sign_with_rng(&mut OsRng, Pss::new::<Sha256>(), &digest)?)
            }
            Signer::Ed25519(kp) => Ok(kp.sk.sign(msg, None).as_ref().to_vec()),
        }
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Signer {{ {} - key_id: {:?} }}",
            self.key_type(),
            self.key_id().ok()
        )
    }
}

/// Serialize both halves of a signer: `(private, public)`.
pub fn save_key_pair(signer: &Signer) -> Result<(TufKey, TufKey), TufError> {
    Ok((signer.private_key()?, signer.public_key()?))
}
