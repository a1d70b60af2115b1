//! Signer resolution and CLOB request authentication.
//!
//! A vault secret is either a raw 64-hex private key (used directly) or a
//! BIP-39 mnemonic (account #0 on the default derivation path). Orders are
//! authorized with an EIP-191 signature over the order digest; API requests
//! carry L2 headers HMAC-signed with credentials derived from the wallet.

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE as B64_URL;
use base64::Engine;
use ethers_core::types::H256;
use ethers_core::utils::keccak256;
use ethers_signers::{coins_bip39::English, LocalWallet, MnemonicBuilder, Signer};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Signed message the venue uses to bind API credentials to a wallet.
const CLOB_AUTH_MESSAGE: &str = "This message attests that I control the given wallet";

pub fn wallet_from_secret(secret: &str) -> Result<LocalWallet> {
    let trimmed = secret.trim();
    let bare = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    if bare.len() == 64 && bare.chars().all(|c| c.is_ascii_hexdigit()) {
        return bare.parse::<LocalWallet>().context("parse private key");
    }

    let phrase = trimmed.split_whitespace().collect::<Vec<_>>().join(" ");
    MnemonicBuilder::<English>::default()
        .phrase(phrase.as_str())
        .index(0u32)
        .context("set derivation index")?
        .build()
        .context("derive account #0 from mnemonic")
}

pub fn wallet_address(wallet: &LocalWallet) -> String {
    format!("0x{}", hex::encode(wallet.address().as_bytes()))
}

/// API credentials derived deterministically from the wallet, mirroring the
/// venue's create-or-derive flow: the signature over the attestation message
/// seeds both the key id and the HMAC secret.
#[derive(Debug, Clone)]
pub struct ApiCreds {
    pub key: String,
    pub secret: Vec<u8>,
    pub passphrase: String,
}

pub fn derive_api_creds(wallet: &LocalWallet) -> Result<ApiCreds> {
    let digest = H256::from(keccak256(CLOB_AUTH_MESSAGE.as_bytes()));
    let sig = wallet.sign_hash(digest).context("sign auth message")?;
    let sig_bytes = sig.to_vec();

    let key_material = keccak256(&sig_bytes);
    let secret_material = keccak256([&sig_bytes[..], b"secret"].concat());
    let pass_material = keccak256([&sig_bytes[..], b"passphrase"].concat());

    Ok(ApiCreds {
        key: uuid::Uuid::from_slice(&key_material[..16])
            .context("derive api key id")?
            .to_string(),
        secret: secret_material.to_vec(),
        passphrase: hex::encode(&pass_material[..16]),
    })
}

/// L2 header signature: HMAC-SHA256 over timestamp + method + path + body.
pub fn l2_signature(creds: &ApiCreds, timestamp: i64, method: &str, path: &str, body: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(&creds.secret).expect("hmac accepts any key length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(method.as_bytes());
    mac.update(path.as_bytes());
    mac.update(body.as_bytes());
    B64_URL.encode(mac.finalize().into_bytes())
}

/// EIP-191 signature over the keccak digest of the order's economic fields.
#[allow(clippy::too_many_arguments)]
pub fn sign_order_digest(
    wallet: &LocalWallet,
    chain_id: u64,
    salt: u64,
    token_id: &str,
    maker_amount: u64,
    taker_amount: u64,
    side_code: u8,
) -> Result<String> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&chain_id.to_be_bytes());
    payload.extend_from_slice(&salt.to_be_bytes());
    payload.extend_from_slice(wallet.address().as_bytes());
    payload.extend_from_slice(&keccak256(token_id.as_bytes()));
    payload.extend_from_slice(&maker_amount.to_be_bytes());
    payload.extend_from_slice(&taker_amount.to_be_bytes());
    payload.push(side_code);

    let digest = H256::from(keccak256(&payload));
    let sig = wallet.sign_hash(digest).context("sign order digest")?;
    Ok(format!("0x{}", hex::encode(sig.to_vec())))
}
