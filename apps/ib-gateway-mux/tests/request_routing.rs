//! Request Routing Integration Tests
//!
//! Admission, permissions, rate windows and concurrent dispatch through the
//! `GatewayMux` facade against an in-memory gateway.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;

use common::{FakeGateway, fast_config, mux_with, no_params};
use ib_gateway_mux::{
    DispatchMode, ErrorClass, GatewayError, ManualClock, Operation, PermissionSet, ProxyError,
    RateLimitPolicy,
};

fn permissions(ops: &[Operation]) -> PermissionSet {
    ops.iter().copied().collect()
}

#[tokio::test]
async fn client_ids_stay_unique_across_removals() {
    let gateway = FakeGateway::new();
    let mux = mux_with(&gateway, fast_config(), &ManualClock::new());

    let mut seen = HashSet::new();
    for round in 0..20 {
        let identity = format!("client-{}", round % 3);
        let id = mux.connect(&identity, PermissionSet::all()).unwrap();
        assert!(seen.insert(id), "id {id} reused");
        if round % 2 == 0 {
            mux.disconnect(&identity);
        }
    }
}

#[tokio::test]
async fn denied_operation_never_reaches_gateway() {
    let gateway = FakeGateway::new();
    let mux = mux_with(&gateway, fast_config(), &ManualClock::new());
    mux.sessions().connect().await.unwrap();
    mux.connect("reporting", permissions(&[Operation::GetAccountInfo]))
        .unwrap();

    for op in ["get_trades", "get_portfolio", "get_mid_price"] {
        let response = mux.handle("reporting", op, no_params()).await;
        let err = response.error().unwrap();
        assert!(matches!(err, ProxyError::PermissionDenied { .. }), "{op}: {err:?}");
        assert_eq!(err.class(), ErrorClass::FixRequest);
    }
    assert_eq!(gateway.calls(), 0);

    let response = mux.handle("reporting", "get_account_info", no_params()).await;
    assert!(response.is_ok());
    assert_eq!(gateway.calls(), 1);
}

#[tokio::test]
async fn sixth_request_in_window_is_rate_limited() {
    let gateway = FakeGateway::new();
    let clock = ManualClock::new();
    let mut config = fast_config();
    config.registry.rate_limit = RateLimitPolicy {
        window: Duration::from_secs(60),
        max_requests: 5,
    };
    let mux = mux_with(&gateway, config, &clock);
    mux.sessions().connect().await.unwrap();
    mux.connect("scanner", PermissionSet::all()).unwrap();

    for _ in 0..5 {
        let response = mux.handle("scanner", "get_trades", no_params()).await;
        assert!(response.is_ok());
    }

    clock.advance(Duration::from_secs(20));
    let sixth = mux.handle("scanner", "get_trades", no_params()).await;
    match sixth.error() {
        Some(ProxyError::RateLimitExceeded { retry_after }) => {
            assert_eq!(*retry_after, Duration::from_secs(40));
        }
        other => panic!("expected rate limit, got {other:?}"),
    }
    assert_eq!(gateway.calls(), 5);

    clock.advance(Duration::from_secs(40));
    let next = mux.handle("scanner", "get_trades", no_params()).await;
    assert!(next.is_ok());

    let usage = &mux.get_status().per_client_usage[0];
    assert_eq!(usage.window_request_count, 1);
    assert_eq!(usage.rate_limited, 1);
}

#[tokio::test]
async fn portfolio_client_scenario() {
    let gateway = FakeGateway::new();
    let clock = ManualClock::new();
    let mut config = fast_config();
    config.registry.rate_limit = RateLimitPolicy {
        window: Duration::from_secs(60),
        max_requests: 50,
    };
    let mux = mux_with(&gateway, config, &clock);
    mux.sessions().connect().await.unwrap();
    mux.connect("client-a", permissions(&[Operation::GetPortfolio]))
        .unwrap();

    let first = mux
        .handle_value("client-a", "get_portfolio", json!({"account_id": "U1234567"}))
        .await;
    assert_eq!(first.into_result().unwrap()["operation"], "get_portfolio");

    let trades = mux.handle("client-a", "get_trades", no_params()).await;
    assert!(matches!(
        trades.error(),
        Some(ProxyError::PermissionDenied { operation }) if operation == "get_trades"
    ));

    clock.advance(Duration::from_secs(60));
    let mut succeeded = 0;
    let mut limited = 0;
    for i in 0..100 {
        let response = mux.handle("client-a", "get_portfolio", no_params()).await;
        match response.error() {
            None => {
                assert!(i < 50, "request {i} should have been limited");
                succeeded += 1;
            }
            Some(ProxyError::RateLimitExceeded { .. }) => {
                assert!(i >= 50, "request {i} should have succeeded");
                limited += 1;
            }
            Some(other) => panic!("unexpected error {other:?}"),
        }
    }
    assert_eq!((succeeded, limited), (50, 50));
    assert_eq!(gateway.calls(), 51);
}

#[tokio::test]
async fn remove_is_idempotent_and_isolated() {
    let gateway = FakeGateway::new();
    let mux = mux_with(&gateway, fast_config(), &ManualClock::new());
    mux.sessions().connect().await.unwrap();
    let a = mux.connect("a", PermissionSet::all()).unwrap();
    let b = mux.connect("b", PermissionSet::all()).unwrap();
    assert!(mux.handle("b", "get_trades", no_params()).await.is_ok());

    assert!(mux.registry().remove(a));
    assert!(!mux.registry().remove(a));

    let status = mux.get_status();
    assert_eq!(status.connected_client_count, 1);
    let usage = &status.per_client_usage[0];
    assert_eq!(usage.client_id, b);
    assert_eq!(usage.window_request_count, 1);
    assert_eq!(usage.succeeded, 1);

    let gone = mux.handle("a", "get_trades", no_params()).await;
    assert_eq!(gone.error().map(ProxyError::code), Some("not_found"));
}

#[tokio::test]
async fn concurrent_clients_do_not_share_rate_windows() {
    const CLIENTS: usize = 16;

    let gateway = FakeGateway::new();
    gateway.delay_calls(Duration::from_millis(10));
    let mut config = fast_config();
    config.registry.rate_limit = RateLimitPolicy {
        window: Duration::from_secs(60),
        max_requests: 1,
    };
    let mux = Arc::new(mux_with(&gateway, config, &ManualClock::new()));
    mux.sessions().connect().await.unwrap();

    for i in 0..CLIENTS {
        mux.connect(&format!("client-{i}"), PermissionSet::all())
            .unwrap();
    }

    let responses = join_all((0..CLIENTS).map(|i| {
        let mux = Arc::clone(&mux);
        async move {
            mux.handle(&format!("client-{i}"), "get_trades", no_params())
                .await
        }
    }))
    .await;

    assert!(responses.iter().all(|r| r.is_ok()));
    assert_eq!(gateway.calls(), u32::try_from(CLIENTS).unwrap());
    assert!(
        gateway.max_active_calls() > 1,
        "concurrent dispatch should overlap calls"
    );
    for usage in mux.get_status().per_client_usage {
        assert_eq!(usage.window_request_count, 1, "{}", usage.identity);
    }
}

#[tokio::test]
async fn single_flight_serializes_gateway_calls() {
    let gateway = FakeGateway::new();
    gateway.delay_calls(Duration::from_millis(5));
    let mut config = fast_config();
    config.router.dispatch_mode = DispatchMode::SingleFlight;
    let mux = Arc::new(mux_with(&gateway, config, &ManualClock::new()));
    mux.sessions().connect().await.unwrap();
    mux.connect("a", PermissionSet::all()).unwrap();
    mux.connect("b", PermissionSet::all()).unwrap();

    let responses = join_all((0..8).map(|i| {
        let mux = Arc::clone(&mux);
        let identity = if i % 2 == 0 { "a" } else { "b" };
        async move { mux.handle(identity, "get_trades", no_params()).await }
    }))
    .await;

    assert!(responses.iter().all(|r| r.is_ok()));
    assert_eq!(gateway.max_active_calls(), 1);
}

#[tokio::test]
async fn responses_correlate_with_their_requests() {
    let gateway = FakeGateway::new();
    let mux = Arc::new(mux_with(&gateway, fast_config(), &ManualClock::new()));
    mux.sessions().connect().await.unwrap();
    mux.connect("a", PermissionSet::all()).unwrap();

    let responses = join_all((0..5).map(|conid| {
        let mux = Arc::clone(&mux);
        async move {
            mux.handle_value("a", "get_mid_price", json!({"conid": conid}))
                .await
        }
    }))
    .await;

    let mut sequences: Vec<u64> = responses.iter().map(|r| r.sequence).collect();
    sequences.sort_unstable();
    sequences.dedup();
    assert_eq!(sequences.len(), 5);
    for response in responses {
        assert_eq!(response.operation, Some(Operation::GetMidPrice));
        assert!(response.completed_at >= response.correlates_to_request_at);
    }
}

#[tokio::test]
async fn upstream_failure_is_typed() {
    let gateway = FakeGateway::new();
    let mux = mux_with(&gateway, fast_config(), &ManualClock::new());
    mux.sessions().connect().await.unwrap();
    mux.connect("a", PermissionSet::all()).unwrap();
    gateway.fail_calls(Some(GatewayError::Rejected {
        status: 500,
        message: "internal error".to_string(),
    }));

    let response = mux.handle("a", "get_trades", no_params()).await;
    let err = response.error().unwrap();
    assert_eq!(err.code(), "upstream_error");
    assert_eq!(err.class(), ErrorClass::Upstream);
    assert_eq!(
        mux.get_status().session_state,
        ib_gateway_mux::SessionState::Authenticated,
        "a rejected call does not affect the session"
    );
}

#[tokio::test]
async fn slow_gateway_call_times_out_as_upstream() {
    let gateway = FakeGateway::new();
    gateway.delay_calls(Duration::from_millis(300));
    let mut config = fast_config();
    config.router.call_timeout = Duration::from_millis(30);
    let mux = mux_with(&gateway, config, &ManualClock::new());
    mux.sessions().connect().await.unwrap();
    mux.connect("a", PermissionSet::all()).unwrap();

    let response = mux.handle("a", "get_trades", no_params()).await;
    match response.error() {
        Some(err @ ProxyError::Upstream { cause, timed_out }) => {
            assert!(*timed_out);
            assert_eq!(*cause, GatewayError::Timeout);
            assert_eq!(err.code(), "upstream_timeout");
            assert_eq!(err.class(), ErrorClass::Upstream);
        }
        other => panic!("expected upstream timeout, got {other:?}"),
    }
    assert_eq!(
        mux.get_status().session_state,
        ib_gateway_mux::SessionState::Degraded,
        "a timed-out call puts the session under suspicion"
    );
}

#[tokio::test]
async fn unknown_identity_is_not_found_before_operation_is_parsed() {
    let gateway = FakeGateway::new();
    let mux = mux_with(&gateway, fast_config(), &ManualClock::new());
    mux.connect("a", PermissionSet::all()).unwrap();

    let ghost = mux.handle("ghost", "place_order", no_params()).await;
    assert_eq!(ghost.error().map(ProxyError::code), Some("not_found"));

    let known = mux.handle("a", "place_order", no_params()).await;
    assert_eq!(known.error().map(ProxyError::code), Some("permission_denied"));
    assert_eq!(mux.get_status().per_client_usage[0].window_request_count, 0);
    assert_eq!(gateway.calls(), 0);
}

#[tokio::test]
async fn capacity_is_enforced_at_admission() {
    let gateway = FakeGateway::new();
    let mut config = fast_config();
    config.registry.max_clients = 2;
    let mux = mux_with(&gateway, config, &ManualClock::new());

    mux.connect("a", PermissionSet::all()).unwrap();
    mux.connect("b", PermissionSet::all()).unwrap();
    let err = mux.connect("c", PermissionSet::all()).unwrap_err();
    assert_eq!(err, ProxyError::CapacityExceeded { max: 2 });

    mux.disconnect("a");
    assert!(mux.connect("c", PermissionSet::all()).is_ok());
}

#[tokio::test]
async fn permissions_beyond_allow_list_are_refused() {
    let gateway = FakeGateway::new();
    let mut config = fast_config();
    config.registry.allowed_operations = permissions(&[
        Operation::CheckConnection,
        Operation::GetMarketData,
    ]);
    let mux = mux_with(&gateway, config, &ManualClock::new());

    let err = mux
        .connect_with_names("quotes", ["get_market_data", "get_portfolio"])
        .unwrap_err();
    assert_eq!(err.code(), "permission_denied");
    assert!(err.to_string().contains("get_portfolio"));
    assert_eq!(mux.get_status().connected_client_count, 0);
}

#[tokio::test]
async fn idle_clients_are_swept() {
    let gateway = FakeGateway::new();
    let clock = ManualClock::new();
    let mut config = fast_config();
    config.registry.idle_timeout = Duration::from_secs(300);
    let mux = mux_with(&gateway, config, &clock);
    mux.sessions().connect().await.unwrap();
    mux.connect("idle", PermissionSet::all()).unwrap();
    mux.connect("busy", PermissionSet::all()).unwrap();

    clock.advance(Duration::from_secs(200));
    assert!(mux.handle("busy", "get_trades", no_params()).await.is_ok());
    clock.advance(Duration::from_secs(200));

    let evicted = mux.registry().sweep_idle();
    assert_eq!(evicted.len(), 1);
    assert!(mux.registry().resolve("idle").is_none());
    assert!(mux.registry().resolve("busy").is_some());
}
