//! Order and position lifecycle against a scripted exchange

mod common;

use common::{BTC, ETH, Harness, approx, harness, harness_with_limits};
use oms::{
    ExchangeError, ExchangeErrorKind, OmsError, OmsEvent, OpenPositionRequest, OrderAmendment,
    OrderRequest, OrderStatus, OrderType, PositionStatus,
};
use pretty_assertions::assert_eq;
use risk_manager::{RiskLimits, RiskRejection};
use rstest::rstest;
use services_common::{MarginType, PositionSide, Side};
use std::sync::Arc;
use std::sync::atomic::Ordering;

fn long_btc() -> OpenPositionRequest {
    OpenPositionRequest::new(BTC, PositionSide::Long, 1.0, 10)
}

async fn open_protected(h: &Harness) -> oms::Position {
    h.manager
        .open_position(long_btc().with_stops(Some(95.0), Some(110.0)))
        .await
        .expect("position opens")
}

#[tokio::test]
async fn test_market_entry_places_protective_orders() {
    let h = harness();
    let mut events = h.manager.subscribe();

    let position = open_protected(&h).await;

    assert_eq!(position.status, PositionStatus::Open);
    assert_eq!(position.side, PositionSide::Long);
    assert!(approx(position.entry_price, 100.0));
    assert!(approx(position.size, 1.0));
    assert_eq!(position.stop_loss, Some(95.0));
    assert_eq!(position.take_profit, Some(110.0));
    assert_eq!(
        h.exchange.placed_types(),
        vec![OrderType::Market, OrderType::StopMarket, OrderType::TakeProfitMarket]
    );
    assert_eq!(h.exchange.called("leverage BTCUSDT 10"), 1);
    assert_eq!(h.exchange.called("margin_type BTCUSDT CROSSED"), 1);

    let sl = h
        .manager
        .get_order(&position.stop_loss_order_id.expect("stop loss order"))
        .expect("tracked");
    assert_eq!(sl.side, Side::Sell);
    assert!(sl.reduce_only);
    assert_eq!(sl.position_id, Some(position.id));
    assert_eq!(sl.status, OrderStatus::New);

    let entry = h
        .manager
        .get_order(&position.entry_order_id.expect("entry order"))
        .expect("tracked");
    assert_eq!(entry.status, OrderStatus::Filled);
    assert_eq!(entry.position_id, Some(position.id));

    assert_eq!(h.store.position(&position.id).map(|p| p.status), Some(PositionStatus::Open));
    assert_eq!(h.store.order_count(), 3);

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(match event {
            OmsEvent::OrderCreated(_) => "order",
            OmsEvent::PositionOpened(_) => "opened",
            OmsEvent::PositionUpdated(_) => "updated",
            _ => "other",
        });
    }
    assert_eq!(kinds, vec!["order", "opened", "order", "order", "updated"]);

    let metrics = h.manager.get_metrics();
    assert_eq!(metrics.orders_created, 3);
    assert_eq!(metrics.positions_opened, 1);
    assert_eq!(metrics.active_orders, 2);
    assert_eq!(metrics.open_positions, 1);
}

#[tokio::test]
async fn test_limit_entry_books_requested_price() {
    let h = harness();
    let position = h
        .manager
        .open_position(long_btc().with_entry_price(99.5))
        .await
        .expect("position opens");

    assert!(approx(position.entry_price, 99.5));
    let requests = h.exchange.placed_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].order_type, OrderType::Limit);
    assert_eq!(requests[0].price, Some(99.5));

    let entry = h.manager.get_order(&position.entry_order_id.expect("entry")).expect("tracked");
    assert_eq!(entry.status, OrderStatus::New);

    // Linked entry fills do not resize the position booked at open
    let exchange_id = entry.exchange_order_id.clone();
    let report = h.exchange.fill(&exchange_id, 1.0, 99.5);
    h.manager.on_order_update(report).await.expect("report applies");
    let position = h.manager.get_position(&position.id).expect("tracked");
    assert!(approx(position.size, 1.0));
}

#[rstest]
#[case::stop_above_entry(Some(101.0), None)]
#[case::take_profit_below_entry(None, Some(99.0))]
#[case::non_positive_stop(Some(0.0), None)]
#[tokio::test]
async fn test_protective_levels_on_wrong_side_are_rejected(
    #[case] stop_loss: Option<f64>,
    #[case] take_profit: Option<f64>,
) {
    let h = harness();
    let result = h
        .manager
        .open_position(long_btc().with_entry_price(100.0).with_stops(stop_loss, take_profit))
        .await;

    assert!(matches!(result, Err(OmsError::Validation { .. })));
    assert!(h.exchange.placed_requests().is_empty());
    assert!(h.manager.open_position_for(BTC).is_none());
}

#[tokio::test]
async fn test_risk_gate_rejects_before_any_exchange_call() {
    let h = harness();
    let result = h
        .manager
        .open_position(OpenPositionRequest::new(BTC, PositionSide::Long, 1.0, 200))
        .await;
    assert_eq!(
        result.err(),
        Some(OmsError::RiskRejected(RiskRejection::LeverageTooHigh { requested: 200, max: 125 }))
    );

    // 200 BTC at 100 on 10_000 balance at 1x exceeds half the balance
    let result = h
        .manager
        .open_position(OpenPositionRequest::new(BTC, PositionSide::Long, 200.0, 1))
        .await;
    assert!(matches!(
        result,
        Err(OmsError::RiskRejected(RiskRejection::PositionTooLarge { .. }))
    ));
    assert_eq!(h.exchange.called("place"), 0);
    assert_eq!(h.exchange.called("leverage"), 0);
    assert_eq!(h.manager.gate().get_metrics().rejected, 2);
}

#[tokio::test]
async fn test_position_count_limit_uses_open_positions() {
    let h = harness_with_limits(RiskLimits {
        max_positions: 1,
        ..RiskLimits::default()
    });
    h.manager.open_position(long_btc()).await.expect("first opens");

    let result = h
        .manager
        .open_position(OpenPositionRequest::new(ETH, PositionSide::Short, 10.0, 5))
        .await;
    assert!(matches!(
        result,
        Err(OmsError::RiskRejected(RiskRejection::TooManyPositions { open: 1, max: 1 }))
    ));
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let h = harness();
    h.exchange.fail_next_placements([
        ExchangeError::from_code(-1001, "Internal error; unable to process your request."),
        ExchangeError::rate_limited("Too many requests", None),
    ]);

    let position = h.manager.open_position(long_btc()).await.expect("opens on third attempt");

    assert!(position.is_open());
    assert_eq!(h.exchange.called("place MARKET"), 3);
    assert_eq!(h.manager.get_metrics().placement_retries, 2);
}

#[tokio::test]
async fn test_exhausted_retries_report_placement_failure() {
    let h = harness();
    h.exchange.fail_next_placements((0..3).map(|_| ExchangeError::transport("connection reset")));

    let result = h.manager.open_position(long_btc()).await;

    match result {
        Err(OmsError::PlacementFailed { attempts, source }) => {
            assert_eq!(attempts, 3);
            assert_eq!(source.kind, ExchangeErrorKind::Transport);
        }
        other => panic!("expected placement failure, got {other:?}"),
    }
    assert!(h.manager.open_position_for(BTC).is_none());
    assert!(h.manager.positions(None).is_empty());
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let h = harness();
    h.exchange
        .fail_next_placements([ExchangeError::from_code(-1010, "Account has insufficient balance")]);

    let result = h.manager.open_position(long_btc()).await;

    match result {
        Err(OmsError::Exchange(e)) => assert_eq!(e.kind, ExchangeErrorKind::InsufficientBalance),
        other => panic!("expected exchange error, got {other:?}"),
    }
    assert_eq!(h.exchange.called("place"), 1);
}

#[tokio::test]
async fn test_second_position_on_symbol_is_refused() {
    let h = harness();
    h.manager.open_position(long_btc()).await.expect("first opens");

    let result = h
        .manager
        .open_position(OpenPositionRequest::new(BTC, PositionSide::Short, 1.0, 10))
        .await;
    assert!(matches!(result, Err(OmsError::InvalidPositionState { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_opens_on_one_symbol_serialize() {
    let h = harness();
    let manager = Arc::new(h.manager);

    let (a, b) = tokio::join!(
        {
            let manager = manager.clone();
            async move { manager.open_position(long_btc()).await }
        },
        {
            let manager = manager.clone();
            async move { manager.open_position(long_btc()).await }
        }
    );

    assert_eq!(usize::from(a.is_ok()) + usize::from(b.is_ok()), 1);
    assert_eq!(manager.positions(Some(PositionStatus::Open)).len(), 1);
    assert_eq!(h.exchange.called("place MARKET"), 1);
}

#[tokio::test]
async fn test_close_cancels_protection_and_realizes_pnl() {
    let h = harness();
    let position = open_protected(&h).await;
    h.exchange.set_mark(BTC, 110.0);

    let closed = h.manager.close_position(position.id, None).await.expect("closes");

    assert_eq!(closed.status, PositionStatus::Closed);
    assert!(approx(closed.realized_pnl, 10.0));
    assert!(approx(closed.unrealized_pnl, 0.0));
    assert!(closed.closed_at.is_some());
    assert!(h.manager.open_position_for(BTC).is_none());

    for id in [closed.stop_loss_order_id, closed.take_profit_order_id] {
        let order = h.manager.get_order(&id.expect("protective id")).expect("tracked");
        assert_eq!(order.status, OrderStatus::Canceled);
    }
    assert_eq!(h.exchange.called("cancel"), 2);

    let close_request = h.exchange.placed_requests().pop().expect("close order");
    assert_eq!(close_request.order_type, OrderType::Market);
    assert_eq!(close_request.side, Side::Sell);
    assert!(close_request.reduce_only);

    let account = h.manager.account_snapshot().await.expect("snapshot");
    assert!(approx(account.daily_realized_pnl, 10.0));
    assert!(account.positions.is_empty());

    let again = h.manager.close_position(position.id, None).await;
    assert!(matches!(again, Err(OmsError::InvalidPositionState { .. })));
}

#[tokio::test]
async fn test_close_tolerates_orders_gone_on_exchange() {
    let h = harness();
    let position = open_protected(&h).await;
    h.exchange
        .cancel_failures
        .lock()
        .push_back(ExchangeError::from_code(-2013, "Order does not exist."));

    let closed = h.manager.close_position(position.id, Some(105.0)).await.expect("closes");

    assert_eq!(closed.status, PositionStatus::Closed);
    assert!(approx(closed.realized_pnl, 5.0));
    let close_request = h.exchange.placed_requests().pop().expect("close order");
    assert_eq!(close_request.order_type, OrderType::Limit);
    assert_eq!(close_request.price, Some(105.0));
}

#[tokio::test]
async fn test_stop_loss_fill_closes_position_and_cancels_take_profit() {
    let h = harness();
    let position = open_protected(&h).await;
    let mut events = h.manager.subscribe();

    let sl = h.manager.get_order(&position.stop_loss_order_id.expect("sl")).expect("tracked");
    let report = h.exchange.fill(&sl.exchange_order_id, 1.0, 95.0);
    let updated = h.manager.on_order_update(report).await.expect("report applies");
    assert_eq!(updated.status, OrderStatus::Filled);

    let position = h.manager.get_position(&position.id).expect("tracked");
    assert_eq!(position.status, PositionStatus::Closed);
    assert!(approx(position.realized_pnl, -5.0));

    let tp = h.manager.get_order(&position.take_profit_order_id.expect("tp")).expect("tracked");
    assert_eq!(tp.status, OrderStatus::Canceled);

    let mut closed = false;
    while let Ok(event) = events.try_recv() {
        closed |= matches!(event, OmsEvent::PositionClosed(ref p) if p.id == position.id);
    }
    assert!(closed);
    assert_eq!(h.manager.get_metrics().positions_closed, 1);
}

#[tokio::test]
async fn test_standalone_fills_add_reduce_and_flip() {
    let h = harness();

    h.manager
        .place_order(OrderRequest::market(BTC, Side::Buy, 0.5))
        .await
        .expect("buy fills");
    let position = h.manager.open_position_for(BTC).expect("opened by fill");
    assert_eq!(position.side, PositionSide::Long);
    assert!(approx(position.size, 0.5));

    h.exchange.set_mark(BTC, 120.0);
    h.manager
        .place_order(OrderRequest::market(BTC, Side::Sell, 0.2))
        .await
        .expect("sell fills");
    let position = h.manager.open_position_for(BTC).expect("still open");
    assert!(approx(position.size, 0.3));
    assert!(approx(position.realized_pnl, 4.0));

    h.manager
        .place_order(OrderRequest::market(BTC, Side::Sell, 0.5))
        .await
        .expect("sell fills");
    let closed = h.manager.get_position(&position.id).expect("tracked");
    assert_eq!(closed.status, PositionStatus::Closed);
    assert!(approx(closed.realized_pnl, 10.0));

    let flipped = h.manager.open_position_for(BTC).expect("flipped short");
    assert_eq!(flipped.side, PositionSide::Short);
    assert!(approx(flipped.size, 0.2));
    assert!(approx(flipped.entry_price, 120.0));
}

#[tokio::test]
async fn test_reduce_only_fill_without_position_is_ignored() {
    let h = harness();
    h.manager
        .place_order(OrderRequest::market(BTC, Side::Sell, 0.5).reduce_only())
        .await
        .expect("order accepted");
    assert!(h.manager.open_position_for(BTC).is_none());
}

#[tokio::test]
async fn test_refresh_books_partial_fill() {
    let h = harness();
    let order = h
        .manager
        .place_order(OrderRequest::limit(BTC, Side::Buy, 1.0, 95.0))
        .await
        .expect("rests");
    assert_eq!(order.status, OrderStatus::New);

    h.exchange.fill(&order.exchange_order_id, 0.4, 95.0);
    let refreshed = h.manager.refresh_order(order.id).await.expect("refreshes");

    assert_eq!(refreshed.status, OrderStatus::PartiallyFilled);
    assert!(approx(refreshed.executed_quantity, 0.4));
    let position = h.manager.open_position_for(BTC).expect("opened by fill");
    assert!(approx(position.size, 0.4));
    assert!(approx(position.entry_price, 95.0));
}

#[tokio::test]
async fn test_cancel_only_active_orders() {
    let h = harness();
    let order = h
        .manager
        .place_order(OrderRequest::limit(BTC, Side::Buy, 1.0, 95.0))
        .await
        .expect("rests");

    let cancelled = h.manager.cancel_order(order.id).await.expect("cancels");
    assert_eq!(cancelled.status, OrderStatus::Canceled);
    assert_eq!(h.manager.get_metrics().orders_cancelled, 1);

    let again = h.manager.cancel_order(order.id).await;
    assert!(matches!(again, Err(OmsError::InvalidOrderState { .. })));

    let unknown = h.manager.cancel_order(uuid::Uuid::new_v4()).await;
    assert!(matches!(unknown, Err(OmsError::OrderNotFound { .. })));
}

#[tokio::test]
async fn test_update_order_replaces_it() {
    let h = harness();
    let order = h
        .manager
        .place_order(OrderRequest::limit(BTC, Side::Buy, 1.0, 95.0))
        .await
        .expect("rests");

    let replacement = h
        .manager
        .update_order(
            order.id,
            OrderAmendment {
                price: Some(96.0),
                ..OrderAmendment::default()
            },
        )
        .await
        .expect("replaced");

    assert_ne!(replacement.id, order.id);
    assert_eq!(replacement.price, Some(96.0));
    assert!(approx(replacement.quantity, 1.0));
    assert_eq!(h.manager.get_order(&order.id).map(|o| o.status), Some(OrderStatus::Canceled));
    assert_eq!(h.manager.active_orders().len(), 1);
}

#[tokio::test]
async fn test_update_protective_order_relinks_position() {
    let h = harness();
    let position = open_protected(&h).await;
    let old_sl = position.stop_loss_order_id.expect("sl");

    let replacement = h
        .manager
        .update_order(
            old_sl,
            OrderAmendment {
                stop_price: Some(94.0),
                ..OrderAmendment::default()
            },
        )
        .await
        .expect("replaced");

    assert!(replacement.reduce_only);
    assert_eq!(replacement.position_id, Some(position.id));
    let position = h.manager.get_position(&position.id).expect("tracked");
    assert_eq!(position.stop_loss_order_id, Some(replacement.id));
    assert_eq!(position.stop_loss, Some(94.0));
}

#[tokio::test]
async fn test_move_stop_loss_keeps_take_profit() {
    let h = harness();
    let position = open_protected(&h).await;
    let old_tp = position.take_profit_order_id;

    let updated = h
        .manager
        .update_stop_loss_take_profit(position.id, Some(97.0), Some(110.0))
        .await
        .expect("updated");

    assert_eq!(updated.stop_loss, Some(97.0));
    assert_ne!(updated.stop_loss_order_id, position.stop_loss_order_id);
    assert_eq!(updated.take_profit_order_id, old_tp);
    assert_eq!(h.exchange.called("cancel"), 1);

    let wrong_side = h
        .manager
        .update_stop_loss_take_profit(position.id, Some(101.0), None)
        .await;
    assert!(matches!(wrong_side, Err(OmsError::Validation { .. })));
}

#[tokio::test]
async fn test_isolated_margin_moves_liquidation_price() {
    let h = harness();
    let position = h
        .manager
        .open_position(long_btc().with_margin_type(MarginType::Isolated))
        .await
        .expect("opens");
    assert_eq!(h.exchange.called("margin_type BTCUSDT ISOLATED"), 1);
    assert!(approx(position.isolated_margin, 10.0));
    assert!(approx(position.liquidation_price.expect("liq"), 90.4));

    let position = h.manager.add_margin(position.id, 5.0).await.expect("adds");
    assert!(approx(position.isolated_margin, 15.0));
    assert!(approx(position.liquidation_price.expect("liq"), 85.4));

    let result = h.manager.reduce_margin(position.id, 100.0).await;
    assert!(matches!(result, Err(OmsError::InsufficientMargin { .. })));
    assert_eq!(h.exchange.called("transfer"), 1);
    let unchanged = h.manager.get_position(&position.id).expect("tracked");
    assert!(approx(unchanged.isolated_margin, 15.0));
}

#[tokio::test]
async fn test_crossed_position_refuses_margin_transfer() {
    let h = harness();
    let position = h.manager.open_position(long_btc()).await.expect("opens");

    let result = h.manager.add_margin(position.id, 5.0).await;

    assert!(matches!(result, Err(OmsError::InvalidMarginType { .. })));
    assert_eq!(h.exchange.called("transfer"), 0);
}

#[tokio::test]
async fn test_mark_through_liquidation_price_liquidates() {
    let h = harness();
    let position = h.manager.open_position(long_btc()).await.expect("opens");
    let mut events = h.manager.subscribe();

    let marked = h
        .manager
        .update_mark_price(BTC, 95.0)
        .await
        .expect("marks")
        .expect("open position");
    assert!(approx(marked.unrealized_pnl, -5.0));
    assert!(approx(marked.roe, -50.0));

    let liquidated = h
        .manager
        .update_mark_price(BTC, 90.0)
        .await
        .expect("marks")
        .expect("position");
    assert_eq!(liquidated.status, PositionStatus::Liquidated);
    assert!(approx(liquidated.realized_pnl, -9.6));
    assert!(h.manager.open_position_for(BTC).is_none());
    assert_eq!(h.manager.get_metrics().positions_liquidated, 1);
    assert_eq!(h.store.position(&position.id).map(|p| p.status), Some(PositionStatus::Liquidated));

    let mut seen = false;
    while let Ok(event) = events.try_recv() {
        seen |= matches!(event, OmsEvent::PositionLiquidated(_));
    }
    assert!(seen);

    assert!(h.manager.update_mark_price(BTC, 80.0).await.expect("marks").is_none());
}

#[tokio::test]
async fn test_duplicate_exchange_id_is_refused() {
    let h = harness();
    h.manager
        .place_order(OrderRequest::limit(BTC, Side::Buy, 1.0, 95.0))
        .await
        .expect("rests");

    h.exchange.next_id.store(1000, Ordering::Relaxed);
    let result = h
        .manager
        .place_order(OrderRequest::limit(BTC, Side::Buy, 1.0, 94.0))
        .await;

    assert!(matches!(result, Err(OmsError::DuplicateOrder { .. })));
    assert_eq!(h.manager.get_orders(Some(BTC), None).len(), 1);
}

#[tokio::test]
async fn test_filters_reject_misaligned_orders() {
    let h = harness();
    let result = h
        .manager
        .place_order(OrderRequest::limit(BTC, Side::Buy, 0.0005, 95.0))
        .await;
    assert!(matches!(result, Err(OmsError::Validation { .. })));

    let result = h
        .manager
        .place_order(OrderRequest::market("DOGEUSDT", Side::Buy, 1.0))
        .await;
    assert!(matches!(result, Err(OmsError::Validation { .. })));
    assert_eq!(h.exchange.called("place"), 0);
}

#[tokio::test]
async fn test_unknown_report_is_rejected() {
    let h = harness();
    let report = oms::ExchangeOrder {
        order_id: "999999".to_string(),
        client_order_id: String::new(),
        symbol: BTC.to_string(),
        status: OrderStatus::Filled,
        quantity: 1.0,
        executed_quantity: 1.0,
        average_price: Some(100.0),
        update_time: 1,
    };
    let result = h.manager.on_order_update(report).await;
    assert!(matches!(result, Err(OmsError::OrderNotFound { .. })));
}
