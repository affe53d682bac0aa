//! Pricing of payouts through the public calculator and fee API

use bigdecimal::BigDecimal;
use bridge_operator::db::TransferRequest;
use bridge_operator::payout::fees::{prepare_send, total_fee, FeeSettings};
use bridge_operator::types::{RequestKind, RequestStatus};
use bridge_operator::{ConversionRateCalculator, ErrorKind, PayoutError};
use std::str::FromStr;
use tokio_test::{assert_err, assert_ok};

fn dec(s: &str) -> BigDecimal {
    BigDecimal::from_str(s).unwrap()
}

fn unwrap_request(amount: u64) -> TransferRequest {
    TransferRequest {
        kind: RequestKind::Unwrap,
        source_address: "0xholder".into(),
        amount,
        destination_address: "TRECIPIENT".into(),
        deposit_transaction_hash: "0xdeposit".into(),
        deposit_transaction_height: 1_234,
        deposit_transaction_subindex: 2,
        status: RequestStatus::Unprocessed,
        payout_transaction_hash: None,
        payout_net_amount: None,
        payout_total_fee: None,
        payout_conversion_rate: None,
        payout_transaction_height: None,
        payout_transaction_timestamp: None,
        failure_reason: None,
    }
}

#[test]
fn outstanding_supply_sets_the_rate() {
    // 1200 issued, 200 redeemed, 1000 held
    let calculator = ConversionRateCalculator::new(1000, 1200, 200);
    assert!(calculator.is_ready());
    assert_eq!(calculator.rate(), BigDecimal::from(1));
    assert_eq!(calculator.to_wrapped_amount(0), 0);
    assert_eq!(calculator.to_wrapped_amount(12_345), 12_345);
}

#[test]
fn wrap_then_unwrap_never_gains_value() {
    let calculators = [
        ConversionRateCalculator::new(3, 2, 0),
        ConversionRateCalculator::new(997, 1_000_003, 17),
        ConversionRateCalculator::new(1_000_000_007, 3, 0),
    ];
    for calculator in calculators {
        for amount in [1u64, 2, 3, 10, 999, 1_000_000, 123_456_789_012] {
            let wrapped = calculator.to_conversion_function(false).convert(amount);
            let back = calculator.to_conversion_function(true).convert(wrapped);
            assert!(back <= amount, "{:?} {} -> {} -> {}", calculator, amount, wrapped, back);
        }
    }
}

#[test]
fn unwrap_payout_is_priced_in_native_units() {
    // 4 wrapped units per native unit
    let calculator = ConversionRateCalculator::new(250, 1_000, 0);
    let conversion = calculator.to_conversion_function(true);
    let settings = FeeSettings {
        percentage_conversion_fee: dec("0.01"),
        max_transfer_amount: 1_000_000,
    };

    let prepared = assert_ok!(prepare_send(&unwrap_request(4_000), &conversion, &BigDecimal::from(1), &settings));
    assert_eq!(prepared.gross_amount, 1_000);
    assert_eq!(prepared.conversion_rate, BigDecimal::from(4));
    assert_eq!(prepared.memo, "0xdeposit");

    // 3 + 1% of 1000
    assert_eq!(assert_ok!(prepared.net_amount(&settings, 3)), (987, 13));
}

#[test]
fn business_rejections_are_permanent() {
    let calculator = ConversionRateCalculator::new(1, 1, 0);
    let conversion = calculator.to_conversion_function(false);
    let settings = FeeSettings {
        percentage_conversion_fee: dec("0.5"),
        max_transfer_amount: 150,
    };

    let err = assert_err!(prepare_send(&unwrap_request(151), &conversion, &BigDecimal::from(1), &settings));
    assert_eq!(err.kind(), ErrorKind::Permanent);

    let prepared = assert_ok!(prepare_send(&unwrap_request(100), &conversion, &BigDecimal::from(1), &settings));
    let err = assert_err!(prepared.net_amount(&settings, 60));
    assert!(matches!(err, PayoutError::FeeExceedsAmount { amount: 100, fee: 110 }));
    assert_eq!(err.kind(), ErrorKind::Permanent);
}

#[test]
fn fee_multiplier_scales_the_whole_fee() {
    assert_eq!(total_fee(&dec("2"), 5, &dec("0.001"), 10_000), 30);
    assert_eq!(total_fee(&dec("0.5"), 5, &dec("0.001"), 10_000), 8);
}

#[test]
fn zero_calculator_prices_nothing() {
    let calculator = ConversionRateCalculator::zero();
    assert!(!calculator.is_ready());
    assert_eq!(calculator.to_conversion_function(false).convert(1_000), 0);
    assert_eq!(calculator.to_conversion_function(true).convert(1_000), 0);
}
