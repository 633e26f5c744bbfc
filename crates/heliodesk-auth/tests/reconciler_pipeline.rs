//! Integration tests for the callback reconciliation pipeline.


use std::sync::Arc;
use std::time::Duration;

use fixtures::{harness, harness_without_debounce, rejected, session, transport};
use heliodesk_auth::{
    AuthChange, AuthChangeEvent, CallbackEvent, ReconcileErrorKind, Reconciliation, SkipReason,
};

#[tokio::test]
async fn test_unrelated_url_does_not_run_pipeline() {
    let h = harness();
    h.storage.set_signing_in().unwrap();

    for url in [
        "https://app/",
        "https://app/settings?tab=widgets",
        "https://app/#notes",
        "not a url at all",
    ] {
        let outcome = h.reconciler.handle_callback(&CallbackEvent::browser(url)).await;
        assert_eq!(outcome, Reconciliation::Skipped(SkipReason::NoAuthParams));
    }

    assert!(h.backend.calls().is_empty());
    assert!(h.reconciler.current_session().is_none());
    assert!(h.browser.replaced().is_empty());
    assert!(h.notifier.messages().is_empty());
    // Unrelated navigation leaves an outstanding sign-in alone.
    assert!(h.storage.is_signing_in());
}

#[tokio::test]
async fn test_unrelated_url_does_not_arm_debounce() {
    let h = harness();

    h.reconciler
        .handle_callback(&CallbackEvent::browser("https://app/"))
        .await;
    let outcome = h
        .reconciler
        .handle_callback(&CallbackEvent::browser("https://app/?code=ABC123"))
        .await;

    assert!(matches!(outcome, Reconciliation::Adopted(_)));
}

#[tokio::test]
async fn test_token_pair_callback_adopts_session_and_strips_url() {
    let h = harness();
    h.storage.set_signing_in().unwrap();

    let outcome = h
        .reconciler
        .handle_callback(&CallbackEvent::browser(
            "https://app/#access_token=AT1&refresh_token=RT1",
        ))
        .await;

    assert_eq!(outcome, Reconciliation::Adopted(session("token-pair")));
    assert_eq!(h.reconciler.current_session(), Some(session("token-pair")));
    assert!(!h.storage.is_signing_in());
    assert_eq!(h.browser.replaced(), vec!["https://app/".to_string()]);
    assert_eq!(h.backend.calls(), vec!["get_session", "set_session"]);
}

#[tokio::test]
async fn test_deep_link_success_leaves_browser_url_alone() {
    let h = harness();

    let outcome = h
        .reconciler
        .handle_callback(&CallbackEvent::runtime_deep_link(
            "heliodesk://auth/callback?code=XYZ",
        ))
        .await;

    assert_eq!(outcome, Reconciliation::Adopted(session("exchanged")));
    assert!(h.browser.replaced().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_code_within_window_exchanges_once() {
    let h = harness();
    let url = "https://app/?code=ABC123";

    let first = h.reconciler.handle_callback(&CallbackEvent::browser(url)).await;
    assert!(matches!(first, Reconciliation::Adopted(_)));

    tokio::time::advance(Duration::from_millis(50)).await;
    let second = h
        .reconciler
        .handle_callback(&CallbackEvent::runtime_deep_link(url))
        .await;

    assert_eq!(second, Reconciliation::Skipped(SkipReason::Debounced));
    assert_eq!(h.backend.count("exchange_code_for_session"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_callback_after_window_is_processed() {
    let h = harness();
    h.backend.set_existing(Ok(None));

    h.reconciler
        .handle_callback(&CallbackEvent::browser("https://app/?error=access_denied"))
        .await;
    tokio::time::advance(Duration::from_millis(1500)).await;
    let retry = h
        .reconciler
        .handle_callback(&CallbackEvent::browser("https://app/?code=RETRY"))
        .await;

    assert!(matches!(retry, Reconciliation::Adopted(_)));
    assert_eq!(h.backend.count("exchange_code_for_session"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_duplicates_exchange_once() {
    let h = harness();
    let gate = h.backend.gate_exchange();
    let url = "https://app/?code=ABC123";

    let reconciler = Arc::clone(&h.reconciler);
    let first = tokio::spawn(async move {
        reconciler
            .handle_callback(&CallbackEvent::browser(url))
            .await
    });
    h.backend.exchange_entered.notified().await;

    let focus = h
        .reconciler
        .handle_callback(&CallbackEvent::app_focus(url))
        .await;
    assert_eq!(focus, Reconciliation::Skipped(SkipReason::Debounced));

    gate.notify_one();
    assert!(matches!(first.await.unwrap(), Reconciliation::Adopted(_)));
    assert_eq!(h.backend.count("exchange_code_for_session"), 1);
}

#[tokio::test]
async fn test_in_flight_guard_drops_overlapping_callback() {
    let h = harness_without_debounce();
    let gate = h.backend.gate_exchange();

    let reconciler = Arc::clone(&h.reconciler);
    let first = tokio::spawn(async move {
        reconciler
            .handle_callback(&CallbackEvent::browser("https://app/?code=ONE"))
            .await
    });
    h.backend.exchange_entered.notified().await;

    let overlapping = h
        .reconciler
        .handle_callback(&CallbackEvent::runtime_deep_link(
            "heliodesk://auth?code=TWO",
        ))
        .await;
    assert_eq!(overlapping, Reconciliation::Skipped(SkipReason::InFlight));

    gate.notify_one();
    first.await.unwrap();

    // The guard is released once the first pipeline finishes.
    *h.backend.exchange_gate.lock().unwrap() = None;
    let later = h
        .reconciler
        .handle_callback(&CallbackEvent::runtime_deep_link(
            "heliodesk://auth?code=THREE",
        ))
        .await;
    assert!(matches!(later, Reconciliation::Adopted(_)));
    assert_eq!(h.backend.count("exchange_code_for_session"), 2);
}

#[tokio::test]
async fn test_existing_session_short_circuits_exchange() {
    let h = harness();
    h.storage.set_signing_in().unwrap();
    h.backend.set_existing(Ok(Some(session("existing"))));

    let outcome = h
        .reconciler
        .handle_callback(&CallbackEvent::browser("https://app/?code=ABC123"))
        .await;

    assert_eq!(outcome, Reconciliation::Adopted(session("existing")));
    assert_eq!(h.backend.calls(), vec!["get_session"]);
    assert!(!h.storage.is_signing_in());
    assert_eq!(h.browser.replaced(), vec!["https://app/".to_string()]);
}

#[tokio::test]
async fn test_session_adopted_during_exchange_is_not_overwritten() {
    let h = harness();
    let gate = h.backend.gate_exchange();

    let reconciler = Arc::clone(&h.reconciler);
    let pipeline = tokio::spawn(async move {
        reconciler
            .handle_callback(&CallbackEvent::startup_deep_link(
                "heliodesk://auth?code=ABC123",
            ))
            .await
    });
    h.backend.exchange_entered.notified().await;

    // Another path observes the session the backend already established.
    h.backend.set_existing(Ok(Some(session("existing"))));
    assert_eq!(h.reconciler.restore().await, Some(session("existing")));

    gate.notify_one();
    let outcome = pipeline.await.unwrap();

    assert_eq!(outcome, Reconciliation::Adopted(session("existing")));
    assert_eq!(h.reconciler.current_session(), Some(session("existing")));
}

#[tokio::test]
async fn test_error_payload_fails_without_exchange() {
    let h = harness();
    h.storage.set_signing_in().unwrap();

    let outcome = h
        .reconciler
        .handle_callback(&CallbackEvent::browser("https://app/?error=access_denied"))
        .await;

    let Reconciliation::Failed(err) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(err.kind, ReconcileErrorKind::AuthorizationDenied);
    assert_eq!(h.backend.calls(), vec!["get_session"]);
    assert!(!h.storage.is_signing_in());
    assert_eq!(
        h.notifier.messages(),
        vec!["Authentication failed: access_denied".to_string()]
    );
    assert!(h.browser.replaced().is_empty());
}

#[tokio::test]
async fn test_access_token_alone_is_no_credentials() {
    let h = harness();
    h.storage.set_signing_in().unwrap();

    let outcome = h
        .reconciler
        .handle_callback(&CallbackEvent::browser("https://app/#access_token=AT1"))
        .await;

    let Reconciliation::Failed(err) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(err.kind, ReconcileErrorKind::NoCredentials);
    assert!(!h.storage.is_signing_in());
    assert_eq!(h.backend.calls(), vec!["get_session"]);
}

#[tokio::test]
async fn test_exchange_failures_map_to_kinds_and_clear_flag() {
    let cases = [
        (Err(rejected("invalid flow state")), ReconcileErrorKind::ExchangeFailure),
        (Err(transport("connection refused")), ReconcileErrorKind::TransportFailure),
        (Ok(None), ReconcileErrorKind::ExchangeFailure),
    ];

    for (result, expected) in cases {
        let h = harness();
        h.storage.set_signing_in().unwrap();
        *h.backend.exchange_result.lock().unwrap() = result;

        let outcome = h
            .reconciler
            .handle_callback(&CallbackEvent::browser("https://app/?code=ABC123"))
            .await;

        let Reconciliation::Failed(err) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(err.kind, expected);
        assert!(!h.storage.is_signing_in());
        assert_eq!(h.notifier.messages().len(), 1);
        assert!(h.reconciler.current_session().is_none());
    }
}

#[tokio::test]
async fn test_token_pair_rejection_fails() {
    let h = harness();
    *h.backend.set_session_result.lock().unwrap() = Err(rejected("invalid JWT"));

    let outcome = h
        .reconciler
        .handle_callback(&CallbackEvent::browser(
            "https://app/#access_token=AT1&refresh_token=RT1",
        ))
        .await;

    assert!(matches!(
        outcome,
        Reconciliation::Failed(ref err) if err.kind == ReconcileErrorKind::ExchangeFailure
    ));
    assert!(h.browser.replaced().is_empty());
}

#[tokio::test]
async fn test_failure_keeps_existing_session() {
    let h = harness();
    h.reconciler.apply_auth_change(AuthChange::new(
        AuthChangeEvent::SignedIn,
        Some(session("current")),
    ));
    // The backend check fails, so the pipeline cannot short-circuit.
    h.backend.set_existing(Err(transport("offline")));
    *h.backend.exchange_result.lock().unwrap() = Err(rejected("code already used"));

    let outcome = h
        .reconciler
        .handle_callback(&CallbackEvent::runtime_deep_link(
            "heliodesk://auth?code=STALE",
        ))
        .await;

    assert!(matches!(outcome, Reconciliation::Failed(_)));
    assert_eq!(h.reconciler.current_session(), Some(session("current")));
}

#[tokio::test]
async fn test_session_check_error_falls_through_to_exchange() {
    let h = harness();
    h.backend.set_existing(Err(transport("offline")));

    let outcome = h
        .reconciler
        .handle_callback(&CallbackEvent::browser("https://app/?code=ABC123"))
        .await;

    assert_eq!(outcome, Reconciliation::Adopted(session("exchanged")));
    assert_eq!(
        h.backend.calls(),
        vec!["get_session", "exchange_code_for_session"]
    );
}

#[tokio::test]
async fn test_subscribers_see_adopted_session() {
    let h = harness();
    let mut rx = h.reconciler.subscribe();

    h.reconciler
        .handle_callback(&CallbackEvent::browser("https://app/?code=ABC123"))
        .await;

    rx.changed().await.unwrap();
    assert_eq!(*rx.borrow(), Some(session("exchanged")));
}
