//! Position sizing against the default limits

use proptest::prelude::*;
use risk_manager::{AccountSnapshot, OpenExposure, PositionSizer, RiskGate, RiskLimits, SizingError};
use rstest::*;
use services_common::PositionSide;

const TEST_BALANCE: f64 = 10_000.0;

#[fixture]
fn sizer() -> PositionSizer {
    PositionSizer::new(RiskLimits::default())
}

fn winning(size: f64, entry: f64, mark: f64) -> OpenExposure {
    OpenExposure {
        symbol: "BTCUSDT".to_string(),
        side: PositionSide::Long,
        size,
        entry_price: entry,
        mark_price: mark,
        leverage: 1,
        unrealized_pnl: (mark - entry) * size,
    }
}

#[rstest]
fn test_risk_based_quantity_for_signal(sizer: PositionSizer) {
    // (10000 * 1%) / (100 - 98) = 50 units, exactly the 0.5 fraction cap
    let quantity = sizer
        .risk_based_quantity(TEST_BALANCE, 1.0, 100.0, 98.0, 1)
        .expect("valid inputs");
    assert!((quantity - 50.0).abs() < 1e-9);
}

#[rstest]
fn test_risk_based_quantity_capped_by_fraction(sizer: PositionSizer) {
    // 100 / 0.5 = 200 units uncapped, cap is 50
    let quantity = sizer
        .risk_based_quantity(TEST_BALANCE, 1.0, 100.0, 99.5, 1)
        .expect("valid inputs");
    assert!((quantity - 50.0).abs() < 1e-9);
}

#[rstest]
#[case::zero_distance(100.0, 100.0, 1)]
#[case::zero_leverage(100.0, 98.0, 0)]
#[case::too_much_leverage(100.0, 98.0, 126)]
fn test_risk_based_quantity_rejects(sizer: PositionSizer, #[case] entry: f64, #[case] stop: f64, #[case] leverage: u32) {
    assert!(sizer.risk_based_quantity(TEST_BALANCE, 1.0, entry, stop, leverage).is_err());
}

#[rstest]
fn test_pyramid_below_threshold_is_none(sizer: PositionSizer) {
    let gate = RiskGate::new(RiskLimits::default());
    let position = winning(10.0, 100.0, 101.0);
    let account = AccountSnapshot {
        positions: vec![position.clone()],
        ..AccountSnapshot::with_balance(TEST_BALANCE)
    };
    assert_eq!(sizer.pyramid_size(&position, &account, 0.02, &gate), None);
}

#[rstest]
fn test_pyramid_adds_half_the_theoretical_increase(sizer: PositionSizer) {
    let gate = RiskGate::new(RiskLimits::default());
    // 4% up with a 2% threshold: 10 * 2 * 0.5 = 10 more units
    let position = winning(10.0, 100.0, 104.0);
    let account = AccountSnapshot {
        positions: vec![position.clone()],
        ..AccountSnapshot::with_balance(TEST_BALANCE)
    };
    let additional = sizer.pyramid_size(&position, &account, 0.02, &gate).expect("pyramid allowed");
    assert!((additional - 10.0).abs() < 1e-9);
}

#[rstest]
fn test_pyramid_refused_past_position_limit(sizer: PositionSizer) {
    let gate = RiskGate::new(RiskLimits::default());
    let position = winning(45.0, 100.0, 104.0);
    let account = AccountSnapshot {
        positions: vec![position.clone()],
        ..AccountSnapshot::with_balance(TEST_BALANCE)
    };
    assert_eq!(sizer.pyramid_size(&position, &account, 0.02, &gate), None);
}

#[rstest]
fn test_ladder_steps_down(sizer: PositionSizer) {
    let rungs = sizer.ladder_sizes(100.0, TEST_BALANCE, 0.02, 5).expect("valid ladder");
    assert_eq!(rungs.len(), 5);
    for (i, (price, size)) in rungs.iter().enumerate() {
        assert!((price - 100.0 * (1.0 - 0.02 * i as f64)).abs() < 1e-9);
        assert!((size - rungs[0].1).abs() < 1e-9);
    }
    assert!(rungs.windows(2).all(|w| w[0].0 > w[1].0));
    assert!(matches!(
        sizer.ladder_sizes(100.0, TEST_BALANCE, 0.02, 0),
        Err(SizingError::InvalidInput { field: "num_orders", .. })
    ));
}

#[rstest]
#[case(0.1, 10)]
#[case(0.05, 20)]
fn test_ladder_reaching_zero_price_is_refused(sizer: PositionSizer, #[case] interval: f64, #[case] deepest: usize) {
    let ladder = sizer
        .ladder_sizes(100.0, TEST_BALANCE, interval, deepest)
        .expect("last rung stays above zero");
    assert!(ladder.iter().all(|(price, _)| *price > 0.0));
    assert!(matches!(
        sizer.ladder_sizes(100.0, TEST_BALANCE, interval, deepest + 1),
        Err(SizingError::InvalidInput { field: "interval_pct", .. })
    ));
}

proptest! {
    #[test]
    fn prop_fixed_size_never_exceeds_cap(
        balance in 1.0f64..1e7,
        risk in 0.0001f64..0.5,
        stop in 0.001f64..0.1,
        leverage in 1u32..=125,
    ) {
        let sizer = PositionSizer::new(RiskLimits::default());
        let size = sizer.fixed_or_risk_based(balance, risk, stop, leverage).expect("valid inputs");
        prop_assert!(size <= balance * 0.5 * f64::from(leverage) * (1.0 + 1e-12));
        prop_assert!(sizer.validate_position_size(size, balance, leverage));
    }

    #[test]
    fn prop_quantity_notional_within_cap(
        entry in 1.0f64..100_000.0,
        stop_offset in 0.001f64..0.2,
        risk in 0.1f64..10.0,
        leverage in 1u32..=125,
    ) {
        let sizer = PositionSizer::new(RiskLimits::default());
        let stop = entry * (1.0 - stop_offset);
        let quantity = sizer.risk_based_quantity(TEST_BALANCE, risk, entry, stop, leverage).expect("valid inputs");
        prop_assert!(quantity > 0.0);
        prop_assert!(quantity * entry <= TEST_BALANCE * 0.5 * f64::from(leverage) * (1.0 + 1e-9));
    }
}
