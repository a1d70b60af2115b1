//! OrderFilled log decoding and per-address trade classification.
//!
//! The exchange emits one OrderFilled per fill:
//!   topics[1] = order hash, topics[2] = maker, topics[3] = taker
//!   data = (makerAssetId, takerAssetId, makerAmountFilled,
//!           takerAmountFilled, fee) as five uint256 words.
//! Asset id 0 is the USDC collateral leg; a non-zero id is the outcome
//! token. Whichever watched party pays the USDC leg is buying.

use anyhow::{bail, Result};
use ethers_core::utils::keccak256;
use num_bigint::BigUint;

use crate::chain::rpc::RawLog;
use crate::models::Side;

pub const ORDER_FILLED_SIGNATURE: &str =
    "OrderFilled(bytes32,address,address,uint256,uint256,uint256,uint256,uint256)";

const USDC_DECIMALS_DIVISOR: f64 = 1_000_000.0;

pub fn order_filled_topic0() -> String {
    format!("0x{}", hex::encode(keccak256(ORDER_FILLED_SIGNATURE.as_bytes())))
}

/// Decoded OrderFilled event.
#[derive(Debug, Clone)]
pub struct FilledLog {
    pub maker: String,
    pub taker: String,
    pub maker_asset_id: BigUint,
    pub taker_asset_id: BigUint,
    pub maker_amount: u128,
    pub taker_amount: u128,
}

fn topic_to_address(topic: &str) -> Result<String> {
    let trimmed = topic.trim().trim_start_matches("0x");
    if trimmed.len() != 64 {
        bail!("address topic has unexpected length: {}", trimmed.len());
    }
    Ok(format!("0x{}", &trimmed[24..].to_ascii_lowercase()))
}

fn word_to_biguint(word: &str) -> Result<BigUint> {
    BigUint::parse_bytes(word.as_bytes(), 16)
        .ok_or_else(|| anyhow::anyhow!("bad uint256 word: {word}"))
}

fn word_to_u128(word: &str) -> Result<u128> {
    // Fill amounts fit u128 by a wide margin; a larger value is garbage.
    if !word[..32].bytes().all(|b| b == b'0') {
        bail!("amount word overflows u128: {word}");
    }
    Ok(u128::from_str_radix(&word[32..], 16)?)
}

pub fn parse_order_filled(log: &RawLog) -> Result<FilledLog> {
    if log.topics.len() < 4 {
        bail!("OrderFilled log has {} topics, expected 4", log.topics.len());
    }
    let data = log.data.trim().trim_start_matches("0x");
    if data.len() < 5 * 64 {
        bail!("OrderFilled data too short: {} hex chars", data.len());
    }
    let words: Vec<&str> = (0..5).map(|i| &data[i * 64..(i + 1) * 64]).collect();

    Ok(FilledLog {
        maker: topic_to_address(&log.topics[2])?,
        taker: topic_to_address(&log.topics[3])?,
        maker_asset_id: word_to_biguint(words[0])?,
        taker_asset_id: word_to_biguint(words[1])?,
        maker_amount: word_to_u128(words[2])?,
        taker_amount: word_to_u128(words[3])?,
    })
}

/// One classified trade leg for a watched address.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedTrade {
    pub side: Side,
    pub token_id: String,
    pub notional_usdc: f64,
    pub price: Option<f64>,
}

/// Classify the fill from `address`'s perspective. Returns `None` when the
/// address is not a party, neither leg is USDC, or the USDC amount is zero.
pub fn detect_trade_for_address(address: &str, fill: &FilledLog) -> Option<DetectedTrade> {
    let addr = address.to_ascii_lowercase();
    let is_maker = addr == fill.maker;
    let is_taker = addr == fill.taker;
    if !is_maker && !is_taker {
        return None;
    }

    let zero = BigUint::from(0u32);
    let (token_id, usdc_amount, share_amount, side) = if fill.maker_asset_id == zero {
        // Maker pays USDC, receives outcome tokens.
        (
            fill.taker_asset_id.to_str_radix(10),
            fill.maker_amount,
            fill.taker_amount,
            if is_maker { Side::Buy } else { Side::Sell },
        )
    } else if fill.taker_asset_id == zero {
        (
            fill.maker_asset_id.to_str_radix(10),
            fill.taker_amount,
            fill.maker_amount,
            if is_maker { Side::Sell } else { Side::Buy },
        )
    } else {
        // Token-for-token fill (neg-risk conversions); not a USDC trade.
        return None;
    };

    let notional_usdc = usdc_amount as f64 / USDC_DECIMALS_DIVISOR;
    if notional_usdc <= 0.0 {
        return None;
    }
    let shares = share_amount as f64 / USDC_DECIMALS_DIVISOR;
    let price = if shares > 0.0 {
        Some(notional_usdc / shares)
    } else {
        None
    };

    Some(DetectedTrade {
        side,
        token_id,
        notional_usdc,
        price,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAKER: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const TAKER: &str = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    fn raw_log(maker_asset: u128, taker_asset: u128, maker_amt: u128, taker_amt: u128) -> RawLog {
        let word = |v: u128| format!("{v:064x}");
        RawLog {
            address: "0xc5d563a36ae78145c45a50134d48a1215220f80a".into(),
            topics: vec![
                order_filled_topic0(),
                format!("0x{:064x}", 1u8),
                format!("0x{:0>64}", MAKER.trim_start_matches("0x")),
                format!("0x{:0>64}", TAKER.trim_start_matches("0x")),
            ],
            data: format!(
                "0x{}{}{}{}{}",
                word(maker_asset),
                word(taker_asset),
                word(maker_amt),
                word(taker_amt),
                word(0)
            ),
            block_number: "0x64".into(),
            transaction_hash: "0xdeadbeef".into(),
            log_index: "0x2".into(),
        }
    }

    #[test]
    fn topic0_shape() {
        let topic = order_filled_topic0();
        assert!(topic.starts_with("0x"));
        assert_eq!(topic.len(), 66);
    }

    #[test]
    fn maker_pays_usdc_buy_for_maker() {
        // maker-asset=0 (USDC), 25 USDC for 48 shares of token 7777.
        let log = raw_log(0, 7777, 25_000_000, 48_000_000);
        let fill = parse_order_filled(&log).unwrap();

        let maker_view = detect_trade_for_address(MAKER, &fill).unwrap();
        assert_eq!(maker_view.side, Side::Buy);
        assert_eq!(maker_view.token_id, "7777");
        assert!((maker_view.notional_usdc - 25.0).abs() < 1e-9);
        let price = maker_view.price.unwrap();
        assert!((price - 25.0 / 48.0).abs() < 1e-9);

        let taker_view = detect_trade_for_address(TAKER, &fill).unwrap();
        assert_eq!(taker_view.side, Side::Sell);
    }

    #[test]
    fn taker_pays_usdc_symmetric() {
        let log = raw_log(9999, 0, 10_000_000, 5_000_000);
        let fill = parse_order_filled(&log).unwrap();

        let maker_view = detect_trade_for_address(MAKER, &fill).unwrap();
        assert_eq!(maker_view.side, Side::Sell);
        assert_eq!(maker_view.token_id, "9999");
        assert!((maker_view.notional_usdc - 5.0).abs() < 1e-9);

        let taker_view = detect_trade_for_address(TAKER, &fill).unwrap();
        assert_eq!(taker_view.side, Side::Buy);
    }

    #[test]
    fn token_for_token_is_skipped() {
        let log = raw_log(1, 2, 1_000_000, 1_000_000);
        let fill = parse_order_filled(&log).unwrap();
        assert!(detect_trade_for_address(MAKER, &fill).is_none());
    }

    #[test]
    fn zero_usdc_is_skipped() {
        let log = raw_log(0, 7777, 0, 48_000_000);
        let fill = parse_order_filled(&log).unwrap();
        assert!(detect_trade_for_address(MAKER, &fill).is_none());
    }

    #[test]
    fn unrelated_address_is_skipped() {
        let log = raw_log(0, 7777, 25_000_000, 48_000_000);
        let fill = parse_order_filled(&log).unwrap();
        assert!(detect_trade_for_address("0xcccccccccccccccccccccccccccccccccccccccc", &fill)
            .is_none());
    }

    #[test]
    fn short_data_is_a_parse_error() {
        let mut log = raw_log(0, 7777, 25_000_000, 48_000_000);
        log.data = "0x1234".into();
        assert!(parse_order_filled(&log).is_err());
    }

    #[test]
    fn huge_token_id_survives_as_decimal_string() {
        let word = |v: &str| format!("{v:0>64}");
        let log = RawLog {
            address: "0xc5d563a36ae78145c45a50134d48a1215220f80a".into(),
            topics: vec![
                order_filled_topic0(),
                format!("0x{:064x}", 1u8),
                format!("0x{:0>64}", MAKER.trim_start_matches("0x")),
                format!("0x{:0>64}", TAKER.trim_start_matches("0x")),
            ],
            data: format!(
                "0x{}{}{}{}{}",
                word("0"),
                // A 256-bit outcome token id, as Polymarket actually mints.
                "f".repeat(64),
                format!("{:064x}", 25_000_000u128),
                format!("{:064x}", 48_000_000u128),
                word("0")
            ),
            block_number: "0x64".into(),
            transaction_hash: "0xdeadbeef".into(),
            log_index: "0x0".into(),
        };
        let fill = parse_order_filled(&log).unwrap();
        let trade = detect_trade_for_address(MAKER, &fill).unwrap();
        // 2^256 - 1 in decimal.
        assert!(trade.token_id.starts_with("115792089237316195423570985008687907853"));
    }
}
