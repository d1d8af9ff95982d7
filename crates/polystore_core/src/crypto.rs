//! Field-level encryption using AES-256-GCM.
//!
//! Fields a schema declares [`crate::FieldDef::encrypted`] are sealed
//! before the record reaches overflow handling, a backend or the cache,
//! and opened after overflow restore on the way out. A sealed value is
//! stored as `{"$encrypted": <bytes>}` where the bytes are
//! `nonce (12) || ciphertext || tag (16)` over the canonical encoding of
//! the plaintext value. Null is never sealed, so "is null" filters keep
//! working.
//!
//! Each tenant gets its own key, expanded from the master key with
//! HKDF-SHA256. The associated data binds a ciphertext to its tenant,
//! model, field and record id: a sealed value copied into another record
//! does not open.
//!
//! Audit entries record sealed values as stored. The audit trail shows
//! that an encrypted field changed, never what it changed to.

use crate::error::{CoreError, CoreResult};
use crate::record::{field, Record};
use crate::schema::ModelSchema;
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use polystore_codec::{decode_canonical, encode_canonical, Value};
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Field name marking a sealed value.
pub const ENCRYPTED_MARKER: &str = "$encrypted";

const PASSWORD_INFO: &[u8] = b"polystore-master-key-v1";
const TENANT_SALT: &[u8] = b"polystore-field-key-v1";

/// Master key for field encryption.
///
/// Zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl EncryptionKey {
    /// Generates a random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Creates a key from raw bytes.
    ///
    /// # Errors
    ///
    /// `InvalidKeySize` unless `bytes` is exactly 32 bytes long.
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(CoreError::invalid_key_size(bytes.len(), KEY_SIZE));
        }
        let mut key_bytes = [0u8; KEY_SIZE];
        key_bytes.copy_from_slice(bytes);
        Ok(Self { bytes: key_bytes })
    }

    /// Derives a key from high-entropy secret material with HKDF-SHA256.
    ///
    /// HKDF does not stretch weak input; use it with generated passphrases,
    /// not user-chosen passwords.
    ///
    /// # Errors
    ///
    /// `EncryptionFailed` if expansion fails.
    pub fn derive_from_password(password: &[u8], salt: &[u8]) -> CoreResult<Self> {
        let hk = Hkdf::<Sha256>::new(Some(salt), password);
        let mut bytes = [0u8; KEY_SIZE];
        hk.expand(PASSWORD_INFO, &mut bytes)
            .map_err(|_| CoreError::encryption_failed("HKDF expand failed"))?;
        Ok(Self { bytes })
    }

    /// Raw key bytes. Never log or serialize these.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Where a sealed value lives; authenticated alongside the ciphertext.
struct Scope<'a> {
    tenant: &'a str,
    model: &'a str,
    field: &'a str,
    id: &'a str,
}

impl Scope<'_> {
    fn aad(&self) -> Vec<u8> {
        [self.tenant, self.model, self.field, self.id].join("\0").into_bytes()
    }
}

/// Seals and opens encrypted fields.
#[derive(Debug)]
pub struct FieldEncryption {
    master: EncryptionKey,
}

impl FieldEncryption {
    /// Encrypts under `master`.
    #[must_use]
    pub fn new(master: EncryptionKey) -> Self {
        Self { master }
    }

    fn cipher(&self, tenant: &str) -> CoreResult<Aes256Gcm> {
        let hk = Hkdf::<Sha256>::new(Some(TENANT_SALT), self.master.as_bytes());
        let mut key = EncryptionKey {
            bytes: [0u8; KEY_SIZE],
        };
        hk.expand(tenant.as_bytes(), &mut key.bytes)
            .map_err(|_| CoreError::encryption_failed("HKDF expand failed"))?;
        Ok(Aes256Gcm::new(GenericArray::from_slice(key.as_bytes())))
    }

    /// Returns true if `value` has the sealed shape.
    #[must_use]
    pub fn is_sealed(value: &Value) -> bool {
        sealed_bytes(value).is_some()
    }

    fn seal(&self, scope: &Scope<'_>, value: &Value) -> CoreResult<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let mut plaintext = encode_canonical(value);
        let aad = scope.aad();
        let sealed = self.cipher(scope.tenant)?.encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: &plaintext,
                aad: &aad,
            },
        );
        plaintext.zeroize();
        let ciphertext = sealed.map_err(|_| CoreError::encryption_failed("AES-GCM encryption error"))?;

        let mut bytes = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        bytes.extend_from_slice(&nonce_bytes);
        bytes.extend(ciphertext);
        Ok(Value::text_map([(ENCRYPTED_MARKER, Value::Bytes(bytes))]))
    }

    fn open(&self, scope: &Scope<'_>, value: &Value) -> CoreResult<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        let fail = |message: &str| CoreError::decryption_failed(scope.model, scope.field, message);
        let bytes = sealed_bytes(value).ok_or_else(|| fail("stored value is not sealed"))?;
        if bytes.len() < NONCE_SIZE + TAG_SIZE {
            return Err(fail("ciphertext too short"));
        }
        let aad = scope.aad();
        let mut plaintext = self
            .cipher(scope.tenant)?
            .decrypt(
                Nonce::from_slice(&bytes[..NONCE_SIZE]),
                Payload {
                    msg: &bytes[NONCE_SIZE..],
                    aad: &aad,
                },
            )
            .map_err(|_| fail("authentication failed"))?;
        let decoded = decode_canonical(&plaintext);
        plaintext.zeroize();
        decoded.map_err(|err| fail(&format!("plaintext does not decode: {err}")))
    }

    /// Seals every encrypted field present in `record`, which belongs to
    /// record `id` of `tenant`.
    ///
    /// # Errors
    ///
    /// `EncryptionFailed` if the cipher fails.
    pub fn seal_record(
        &self,
        schema: &ModelSchema,
        tenant: &str,
        id: &str,
        record: Record,
    ) -> CoreResult<Record> {
        let mut record = record;
        for name in schema.encrypted_fields() {
            let Some(value) = record.get(name) else {
                continue;
            };
            let scope = Scope {
                tenant,
                model: &schema.name,
                field: name,
                id,
            };
            let sealed = self.seal(&scope, value)?;
            record.set(name, sealed);
        }
        Ok(record)
    }

    /// Opens every encrypted field present in a stored `record`, keyed by
    /// its own tenant and id.
    ///
    /// # Errors
    ///
    /// `DecryptionFailed` for a wrong key, tampered or relocated
    /// ciphertext, or a stored value that was never sealed.
    pub fn open_record(&self, schema: &ModelSchema, record: Record) -> CoreResult<Record> {
        let mut record = record;
        for name in schema.encrypted_fields() {
            let Some(value) = record.get(name) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let (Some(tenant), Some(id)) = (record.tenant_id(), record.id()) else {
                return Err(CoreError::decryption_failed(
                    &schema.name,
                    name,
                    format!("record lacks {} or {}", field::TENANT_ID, field::ID),
                ));
            };
            let scope = Scope {
                tenant,
                model: &schema.name,
                field: name,
                id,
            };
            let opened = self.open(&scope, value)?;
            record.set(name, opened);
        }
        Ok(record)
    }
}

fn sealed_bytes(value: &Value) -> Option<&[u8]> {
    let [(marker, inner)] = value.as_map()? else {
        return None;
    };
    if marker.as_text() != Some(ENCRYPTED_MARKER) {
        return None;
    }
    inner.as_bytes()
}
