//! Encrypted signing-material store.
//!
//! Key refs (`vault://name`) map to passphrase-encrypted secrets: either a
//! BIP-39 mnemonic or a raw 64-hex private key. Scheme: PBKDF2-HMAC-SHA256
//! (200k iterations) derives a 64-byte block split into encryption and MAC
//! keys; the payload is XORed with a SHA-256 counter stream and authenticated
//! with HMAC-SHA256 over nonce||ciphertext. Everything at rest is base64.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::RngCore;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::db::Db;

type HmacSha256 = Hmac<Sha256>;

const PBKDF2_ITERATIONS: u32 = 200_000;
const SALT_SIZE: usize = 16;
const NONCE_SIZE: usize = 16;

#[derive(Debug, Clone, Serialize)]
pub struct VaultKeyRow {
    pub key_ref: String,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

struct EncryptedBlob {
    ciphertext_b64: String,
    salt_b64: String,
    nonce_b64: String,
    mac_b64: String,
}

/// PBKDF2-HMAC-SHA256 with a 64-byte output, split into (enc_key, mac_key).
fn derive_keys(passphrase: &str, salt: &[u8]) -> ([u8; 32], [u8; 32]) {
    let mut material = [0u8; 64];
    for (block_index, chunk) in material.chunks_mut(32).enumerate() {
        let mut mac = HmacSha256::new_from_slice(passphrase.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(salt);
        mac.update(&(block_index as u32 + 1).to_be_bytes());
        let mut u = mac.finalize().into_bytes();
        let mut acc = u;
        for _ in 1..PBKDF2_ITERATIONS {
            let mut mac = HmacSha256::new_from_slice(passphrase.as_bytes())
                .expect("hmac accepts any key length");
            mac.update(&u);
            u = mac.finalize().into_bytes();
            for (a, b) in acc.iter_mut().zip(u.iter()) {
                *a ^= b;
            }
        }
        chunk.copy_from_slice(&acc);
    }
    let mut enc_key = [0u8; 32];
    let mut mac_key = [0u8; 32];
    enc_key.copy_from_slice(&material[..32]);
    mac_key.copy_from_slice(&material[32..]);
    (enc_key, mac_key)
}

/// SHA-256 counter-mode keystream XOR. Symmetric: applying twice restores.
fn xor_stream(data: &[u8], key: &[u8], nonce: &[u8]) -> Vec<u8> {
    let mut stream = Vec::with_capacity(data.len() + 32);
    let mut counter: u32 = 0;
    while stream.len() < data.len() {
        let mut hasher = Sha256::new();
        hasher.update(key);
        hasher.update(nonce);
        hasher.update(counter.to_be_bytes());
        stream.extend_from_slice(&hasher.finalize());
        counter += 1;
    }
    data.iter().zip(stream.iter()).map(|(a, b)| a ^ b).collect()
}

fn compute_mac(mac_key: &[u8], nonce: &[u8], ciphertext: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(mac_key).expect("hmac accepts any key length");
    mac.update(nonce);
    mac.update(ciphertext);
    mac.finalize().into_bytes().to_vec()
}

fn encrypt_secret(secret: &str, passphrase: &str) -> EncryptedBlob {
    let mut salt = [0u8; SALT_SIZE];
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut nonce);

    let (enc_key, mac_key) = derive_keys(passphrase, &salt);
    let ciphertext = xor_stream(secret.as_bytes(), &enc_key, &nonce);
    let mac = compute_mac(&mac_key, &nonce, &ciphertext);

    EncryptedBlob {
        ciphertext_b64: B64.encode(&ciphertext),
        salt_b64: B64.encode(salt),
        nonce_b64: B64.encode(nonce),
        mac_b64: B64.encode(mac),
    }
}

fn decrypt_blob(blob: &EncryptedBlob, passphrase: &str) -> Result<String> {
    let salt = B64.decode(&blob.salt_b64).context("decode salt")?;
    let nonce = B64.decode(&blob.nonce_b64).context("decode nonce")?;
    let ciphertext = B64.decode(&blob.ciphertext_b64).context("decode ciphertext")?;
    let expected_mac = B64.decode(&blob.mac_b64).context("decode mac")?;

    let (enc_key, mac_key) = derive_keys(passphrase, &salt);
    let mut mac = HmacSha256::new_from_slice(&mac_key).expect("hmac accepts any key length");
    mac.update(&nonce);
    mac.update(&ciphertext);
    if mac.verify_slice(&expected_mac).is_err() {
        bail!("vault mac mismatch (wrong passphrase or corrupted blob)");
    }

    let plaintext = xor_stream(&ciphertext, &enc_key, &nonce);
    String::from_utf8(plaintext).context("decrypted secret is not utf-8")
}

fn normalize_secret(secret: &str) -> String {
    secret.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_hex_private_key(secret: &str) -> bool {
    let trimmed = secret.strip_prefix("0x").unwrap_or(secret);
    trimmed.len() == 64 && trimmed.chars().all(|c| c.is_ascii_hexdigit())
}

fn validate_secret(secret: &str) -> Result<()> {
    if is_hex_private_key(secret) {
        return Ok(());
    }
    let words = secret.split(' ').count();
    if !matches!(words, 12 | 15 | 18 | 21 | 24) {
        bail!("secret must be a 64-hex private key or a 12/15/18/21/24 word mnemonic");
    }
    Ok(())
}

#[derive(Clone)]
pub struct VaultStore {
    db: Db,
}

impl VaultStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn upsert_key(&self, key_ref: &str, secret: &str, passphrase: &str) -> Result<()> {
        if !key_ref.starts_with("vault://") {
            bail!("key_ref must start with vault://");
        }
        if passphrase.is_empty() {
            bail!("vault passphrase is empty");
        }
        let normalized = normalize_secret(secret);
        validate_secret(&normalized)?;

        let blob = encrypt_secret(&normalized, passphrase);
        let now = Utc::now().timestamp();
        let conn = self.db.conn().await;
        conn.execute(
            "INSERT INTO vault_keys(
                key_ref, ciphertext_b64, salt_b64, nonce_b64, mac_b64,
                status, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6, ?6)
             ON CONFLICT(key_ref) DO UPDATE SET
                ciphertext_b64 = excluded.ciphertext_b64,
                salt_b64 = excluded.salt_b64,
                nonce_b64 = excluded.nonce_b64,
                mac_b64 = excluded.mac_b64,
                status = 'active',
                updated_at = excluded.updated_at",
            params![
                key_ref,
                blob.ciphertext_b64,
                blob.salt_b64,
                blob.nonce_b64,
                blob.mac_b64,
                now
            ],
        )?;
        Ok(())
    }

    pub async fn get_secret(&self, key_ref: &str, passphrase: &str) -> Result<String> {
        if passphrase.is_empty() {
            bail!("vault passphrase is not set");
        }
        let conn = self.db.conn().await;
        let blob = conn
            .query_row(
                "SELECT ciphertext_b64, salt_b64, nonce_b64, mac_b64
                 FROM vault_keys
                 WHERE key_ref = ?1 AND status = 'active'",
                [key_ref],
                |row| {
                    Ok(EncryptedBlob {
                        ciphertext_b64: row.get(0)?,
                        salt_b64: row.get(1)?,
                        nonce_b64: row.get(2)?,
                        mac_b64: row.get(3)?,
                    })
                },
            )
            .optional()?;
        let Some(blob) = blob else {
            bail!("vault key_ref not found: {key_ref}");
        };
        let secret = decrypt_blob(&blob, passphrase)?;
        conn.execute(
            "UPDATE vault_keys SET last_used_at = ?1 WHERE key_ref = ?2",
            params![Utc::now().timestamp(), key_ref],
        )?;
        Ok(secret)
    }

    pub async fn key_ref_exists(&self, key_ref: &str) -> Result<bool> {
        let conn = self.db.conn().await;
        let row = conn
            .query_row(
                "SELECT 1 FROM vault_keys WHERE key_ref = ?1 AND status = 'active'",
                [key_ref],
                |_| Ok(()),
            )
            .optional()?;
        Ok(row.is_some())
    }

    pub async fn list_keys(&self) -> Result<Vec<VaultKeyRow>> {
        let conn = self.db.conn().await;
        let mut stmt = conn.prepare_cached(
            "SELECT key_ref, status, created_at, updated_at
             FROM vault_keys
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(VaultKeyRow {
                key_ref: row.get(0)?,
                status: row.get(1)?,
                created_at: row.get(2)?,
                updated_at: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}
