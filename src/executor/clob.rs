//! Live CLOB executor.
//!
//! Places GTC limit orders priced around the source fill, quantized to what
//! the venue accepts. Size precision walks a 5 -> 4 -> 3 decimal ladder when
//! the venue rejects with an invalid-amounts error; every other rejection is
//! terminal for the attempt.

use reqwest::Client;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

use super::book::{parse_book_message, BookMessage, BookTop};
use super::price::{
    buy_reference_price, decimal_from_f64, quantize_buy, quantize_sell, sell_reference_price,
    SIZE_PRECISION_LADDER,
};
use super::signing::{
    derive_api_creds, l2_signature, sign_order_digest, wallet_from_secret, ApiCreds,
};
use super::{ExecutionResult, VenueExecutor};
use crate::config::ClobConfig;
use crate::models::{QueuedOrder, Side, StaleSentOrder};
use crate::store::VaultStore;

const HTTP_TIMEOUT_SECS: u64 = 10;
const USDC_UNITS: u64 = 1_000_000;

pub struct ClobExecutor {
    http: Client,
    cfg: ClobConfig,
    vault: VaultStore,
    passphrase: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    #[serde(default)]
    success: bool,
    #[serde(default, rename = "errorMsg")]
    error_msg: Option<String>,
    #[serde(default, rename = "orderID")]
    order_id: Option<String>,
    #[serde(default, rename = "transactionHash")]
    transaction_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CancelResponse {
    #[serde(default)]
    canceled: Vec<String>,
    #[serde(default)]
    success: Option<bool>,
}

fn is_invalid_amounts(message: &str) -> bool {
    message.to_ascii_lowercase().contains("invalid amount")
}

fn is_marketable_min_size(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("min size: $1") && lower.contains("invalid amount for a marketable buy order")
}

impl ClobExecutor {
    pub fn new(cfg: ClobConfig, vault: VaultStore, passphrase: Option<String>) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .user_agent("copybot-executor/1.0")
            .build()
            .expect("build clob http client");
        Self {
            http,
            cfg,
            vault,
            passphrase,
        }
    }

    async fn fetch_book_top(&self, token_id: &str) -> BookTop {
        let url = format!("{}/book", self.cfg.host);
        let result = async {
            let resp = self
                .http
                .get(&url)
                .query(&[("token_id", token_id)])
                .send()
                .await
                .ok()?;
            if !resp.status().is_success() {
                return None;
            }
            let value: serde_json::Value = resp.json().await.ok()?;
            match parse_book_message(&value) {
                BookMessage::Book(top) => Some(top),
                BookMessage::Heartbeat | BookMessage::Err(_) => None,
            }
        }
        .await;

        result.unwrap_or_else(|| {
            debug!(token_id, "book fetch failed, using tick fallback");
            BookTop::default()
        })
    }

    fn headers_for(
        &self,
        creds: &ApiCreds,
        address: &str,
        method: &str,
        path: &str,
        body: &str,
    ) -> Vec<(&'static str, String)> {
        let timestamp = chrono::Utc::now().timestamp();
        vec![
            ("POLY_ADDRESS", address.to_string()),
            ("POLY_API_KEY", creds.key.clone()),
            ("POLY_PASSPHRASE", creds.passphrase.clone()),
            ("POLY_TIMESTAMP", timestamp.to_string()),
            (
                "POLY_SIGNATURE",
                l2_signature(creds, timestamp, method, path, body),
            ),
        ]
    }

    #[allow(clippy::too_many_arguments)]
    async fn submit_order(
        &self,
        creds: &ApiCreds,
        address: &str,
        token_id: &str,
        side: Side,
        price: Decimal,
        maker_amount: u64,
        taker_amount: u64,
        signature: &str,
        salt: u64,
    ) -> Result<OrderResponse, String> {
        let body = json!({
            "order": {
                "salt": salt,
                "maker": address,
                "signer": address,
                "taker": "0x0000000000000000000000000000000000000000",
                "tokenId": token_id,
                "makerAmount": maker_amount.to_string(),
                "takerAmount": taker_amount.to_string(),
                "price": price.to_string(),
                "side": side.as_str().to_uppercase(),
                "expiration": "0",
                "nonce": "0",
                "feeRateBps": "0",
                "signatureType": 0,
                "signature": signature,
            },
            "owner": creds.key,
            "orderType": "GTC",
        })
        .to_string();

        let url = format!("{}/order", self.cfg.host);
        let mut request = self.http.post(&url);
        for (name, value) in self.headers_for(creds, address, "POST", "/order", &body) {
            request = request.header(name, value);
        }
        let resp = request
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| format!("live_rpc_error:{e}"))?;

        resp.json::<OrderResponse>()
            .await
            .map_err(|e| format!("live_rpc_error:decode:{e}"))
    }

    fn resolve_wallet(&self, secret: &str) -> Result<ethers_signers::LocalWallet, String> {
        wallet_from_secret(secret).map_err(|e| format!("key_resolve_failed:{e}"))
    }
}

#[async_trait::async_trait]
impl VenueExecutor for ClobExecutor {
    async fn execute(&self, order: &QueuedOrder) -> ExecutionResult {
        let Some(token_id) = order.token_id.as_deref() else {
            return ExecutionResult::failed("missing_token_id");
        };
        let Some(passphrase) = self.passphrase.as_deref() else {
            return ExecutionResult::failed("vault_passphrase_missing");
        };

        let secret = match self.vault.get_secret(&order.key_ref, passphrase).await {
            Ok(secret) => secret,
            Err(e) => return ExecutionResult::failed(format!("key_resolve_failed:{e}")),
        };
        let wallet = match self.resolve_wallet(&secret) {
            Ok(wallet) => wallet,
            Err(reason) => return ExecutionResult::failed(reason),
        };
        let creds = match derive_api_creds(&wallet) {
            Ok(creds) => creds,
            Err(e) => return ExecutionResult::failed(format!("key_resolve_failed:{e}")),
        };
        let address = super::signing::wallet_address(&wallet);

        let book = self.fetch_book_top(token_id).await;
        let source_price = order.source_price.and_then(decimal_from_f64);
        let price = match order.side {
            Side::Buy => buy_reference_price(
                source_price,
                book.best_bid,
                book.best_ask,
                book.tick_size,
                order.is_reprice_retry(),
            ),
            Side::Sell => {
                sell_reference_price(source_price, book.best_bid, book.best_ask, book.tick_size)
            }
        };

        let notional = match decimal_from_f64(order.adjusted_notional_usdc) {
            Some(n) if n > Decimal::ZERO => n,
            _ => return ExecutionResult::failed("invalid_notional"),
        };

        let salt = chrono::Utc::now().timestamp_millis() as u64 ^ order.id as u64;
        let price_f64 = price.to_f64();

        for size_dp in SIZE_PRECISION_LADDER {
            let (maker_amount, taker_amount) = match order.side {
                Side::Buy => {
                    let (quote, size) = quantize_buy(notional, price, size_dp);
                    let maker = (quote * Decimal::from(USDC_UNITS)).trunc();
                    let taker = (size * Decimal::from(USDC_UNITS)).trunc();
                    (maker.to_u64(), taker.to_u64())
                }
                Side::Sell => {
                    let size = quantize_sell(notional, price, size_dp);
                    let maker = (size * Decimal::from(USDC_UNITS)).trunc();
                    let taker = (size * price * Decimal::from(USDC_UNITS)).trunc();
                    (maker.to_u64(), taker.to_u64())
                }
            };
            let (Some(maker_amount), Some(taker_amount)) = (maker_amount, taker_amount) else {
                return ExecutionResult::failed("invalid_notional");
            };
            if maker_amount == 0 || taker_amount == 0 {
                return ExecutionResult::failed("computed_zero_size");
            }

            let signature = match sign_order_digest(
                &wallet,
                self.cfg.chain_id,
                salt,
                token_id,
                maker_amount,
                taker_amount,
                match order.side {
                    Side::Buy => 0,
                    Side::Sell => 1,
                },
            ) {
                Ok(sig) => sig,
                Err(e) => return ExecutionResult::failed(format!("key_resolve_failed:{e}")),
            };

            let response = match self
                .submit_order(
                    &creds,
                    &address,
                    token_id,
                    order.side,
                    price,
                    maker_amount,
                    taker_amount,
                    &signature,
                    salt,
                )
                .await
            {
                Ok(response) => response,
                Err(reason) => return ExecutionResult::failed(reason),
            };

            if response.success {
                let exec_ref = response.order_id.filter(|r| !r.is_empty());
                let tx_hash = response.transaction_hash.filter(|t| !t.is_empty());
                return if tx_hash.is_some() {
                    ExecutionResult::filled(tx_hash, price_f64, exec_ref)
                } else {
                    ExecutionResult::sent(price_f64, exec_ref)
                };
            }

            let message = response.error_msg.unwrap_or_else(|| "unknown".to_string());
            if is_marketable_min_size(&message) {
                return ExecutionResult::failed(format!("exchange_rejected:{message}"));
            }
            if is_invalid_amounts(&message) {
                warn!(
                    order_id = order.id,
                    size_dp,
                    reject = %message,
                    "venue rejected amounts, tightening precision"
                );
                continue;
            }
            let mut result = ExecutionResult::failed(format!("exchange_rejected:{message}"));
            result.executor_ref = response.order_id.filter(|r| !r.is_empty());
            return result;
        }

        ExecutionResult::failed("invalid_amounts_after_retry")
    }

    async fn cancel(&self, order: &StaleSentOrder) -> ExecutionResult {
        let Some(exec_ref) = order.executor_ref.as_deref().filter(|r| !r.is_empty()) else {
            // Submit timed out before the venue returned a ref: nothing rests.
            return ExecutionResult::canceled();
        };
        let Some(passphrase) = self.passphrase.as_deref() else {
            return ExecutionResult::failed("cancel_failed_or_not_supported:vault_passphrase_missing");
        };

        let auth = async {
            let secret = self
                .vault
                .get_secret(&order.key_ref, passphrase)
                .await
                .map_err(|e| e.to_string())?;
            let wallet = wallet_from_secret(&secret).map_err(|e| e.to_string())?;
            let creds = derive_api_creds(&wallet).map_err(|e| e.to_string())?;
            Ok::<_, String>((super::signing::wallet_address(&wallet), creds))
        }
        .await;
        let (address, creds) = match auth {
            Ok(pair) => pair,
            Err(reason) => {
                return ExecutionResult::failed(format!(
                    "cancel_failed_or_not_supported:{reason}"
                ))
            }
        };

        let body = json!({ "orderID": exec_ref }).to_string();
        let url = format!("{}/order", self.cfg.host);
        let mut request = self.http.delete(&url);
        for (name, value) in self.headers_for(&creds, &address, "DELETE", "/order", &body) {
            request = request.header(name, value);
        }
        let resp = match request
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                return ExecutionResult::failed(format!("cancel_failed_or_not_supported:{e}"))
            }
        };
        if !resp.status().is_success() {
            return ExecutionResult::failed(format!(
                "cancel_failed_or_not_supported:http_{}",
                resp.status().as_u16()
            ));
        }

        let confirmed = resp
            .json::<CancelResponse>()
            .await
            .map(|r| r.success.unwrap_or(false) || r.canceled.iter().any(|c| c == exec_ref))
            .unwrap_or(false);
        if confirmed {
            ExecutionResult::canceled()
        } else {
            ExecutionResult::failed("cancel_failed_or_not_supported:not_confirmed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_classification() {
        assert!(is_invalid_amounts("Invalid amounts for order"));
        assert!(is_invalid_amounts(
            "invalid amount for a marketable buy order. min size: $1"
        ));
        assert!(!is_invalid_amounts("not enough balance / allowance"));

        assert!(is_marketable_min_size(
            "invalid amount for a marketable buy order. min size: $1"
        ));
        assert!(!is_marketable_min_size("invalid amounts"));
    }
}
