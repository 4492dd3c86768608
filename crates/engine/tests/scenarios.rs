mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Context;
use rebound_events::EventEnvelope;

use rebound_engine::{
    Clock, ExecutionMode, RetryConfig, RetryOutcome, RetryPolicy, RetryStatus, RetryStore,
};

use common::{Fixture, always_failing, flaky};

fn doubling_policy() -> RetryPolicy {
    RetryPolicy::exponential(3, Duration::from_secs(1), Duration::from_secs(60)).with_jitter(0.0)
}

#[derive(Debug, thiserror::Error)]
#[error("payload is malformed")]
struct MalformedPayload;

#[test]
fn transient_failures_then_success_in_blocking_mode() {
    let fx = Fixture::new();
    let service = fx
        .builder()
        .config(RetryConfig {
            mode: ExecutionMode::Blocking,
            ..RetryConfig::default()
        })
        .build();
    let calls = Arc::new(AtomicU32::new(0));
    let event = fx.publish("order.placed");

    let result = service
        .execute_with_retry(&event, &flaky(2, calls.clone()), &doubling_policy())
        .unwrap();

    assert!(result.is_success());
    assert_eq!(result.attempts, 3);
    assert_eq!(result.result(), Some(&serde_json::json!({"call": 3})));
    // 1s then 2s of backoff.
    assert_eq!(result.total_time, Duration::from_secs(3));
    assert!(fx.store.find_by_event_id(event.event_id()).unwrap().is_none());
    assert!(fx.dlq.is_empty());
}

#[test]
fn transient_failures_then_success_through_the_reconciler() {
    let fx = Fixture::new();
    let calls = Arc::new(AtomicU32::new(0));
    let service = fx
        .builder()
        .processor_with_policy("order.placed", flaky(2, calls.clone()), doubling_policy())
        .build();
    let event = fx.publish("order.placed");
    let t0 = fx.clock.now();

    let first = service.execute(&event).unwrap();
    assert_eq!(
        first.outcome,
        RetryOutcome::Scheduled {
            next_retry_at: t0 + chrono::Duration::seconds(1),
            error: Some("transient failure #1".to_string()),
        }
    );

    // Not due yet.
    assert_eq!(service.sweep_once().unwrap().claimed, 0);

    fx.clock.advance(Duration::from_secs(1));
    let report = service.sweep_once().unwrap();
    assert_eq!(report.rescheduled, 1);
    let record = fx.store.find_by_event_id(event.event_id()).unwrap().unwrap();
    assert_eq!(record.attempts, 2);
    assert_eq!(
        record.next_retry_at,
        Some(t0 + chrono::Duration::seconds(3))
    );

    fx.clock.advance(Duration::from_secs(2));
    let report = service.sweep_once().unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(fx.store.find_by_event_id(event.event_id()).unwrap().is_none());
}

#[test]
fn exhausted_budget_is_dead_lettered_once() {
    let fx = Fixture::new();
    let service = fx
        .builder()
        .config(RetryConfig {
            mode: ExecutionMode::Blocking,
            ..RetryConfig::default()
        })
        .build();
    let calls = Arc::new(AtomicU32::new(0));
    let event = fx.publish("order.placed");
    let policy = RetryPolicy::fixed(2, Duration::from_millis(500));

    let result = service
        .execute_with_retry(&event, &always_failing(calls.clone()), &policy)
        .unwrap();

    assert_eq!(
        result.outcome,
        RetryOutcome::DeadLettered {
            error: "transient failure #2".to_string()
        }
    );
    assert_eq!(result.attempts, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let parked = fx.dlq.entries();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].event.event_id(), event.event_id());
    assert_eq!(parked[0].attempts, 2);

    let record = fx.store.find_by_event_id(event.event_id()).unwrap().unwrap();
    assert_eq!(record.status, RetryStatus::DeadLetter);
    assert_eq!(record.attempts, record.max_attempts);
    assert_eq!(record.next_retry_at, None);
}

#[test]
fn non_retryable_error_skips_remaining_attempts() {
    let fx = Fixture::new();
    let service = fx.builder().build();
    let event = fx.publish("order.placed");
    let policy = RetryPolicy::fixed(5, Duration::from_secs(1)).fatal_on::<MalformedPayload>();
    let processor = |_: &EventEnvelope| -> anyhow::Result<serde_json::Value> {
        Err(MalformedPayload).context("decoding order")
    };

    let result = service.execute_with_retry(&event, &processor, &policy).unwrap();

    assert_eq!(result.attempts, 1);
    assert_eq!(
        result.error(),
        Some("decoding order: payload is malformed")
    );
    assert!(matches!(result.outcome, RetryOutcome::DeadLettered { .. }));
    assert_eq!(fx.dlq.len(), 1);
    let record = fx.store.find_by_event_id(event.event_id()).unwrap().unwrap();
    assert_eq!(record.status, RetryStatus::DeadLetter);
    assert_eq!(record.attempts, 1);
}

#[test]
fn handoff_failure_marks_the_record_failed() {
    let fx = Fixture::new();
    fx.dlq.set_failing(true);
    let service = fx
        .builder()
        .config(RetryConfig {
            mode: ExecutionMode::Blocking,
            ..RetryConfig::default()
        })
        .build();
    let event = fx.publish("order.placed");
    let policy = RetryPolicy::fixed(2, Duration::from_millis(500));

    let result = service
        .execute_with_retry(&event, &always_failing(Arc::new(AtomicU32::new(0))), &policy)
        .unwrap();

    assert_eq!(
        result.outcome,
        RetryOutcome::Failed {
            error: "transient failure #2".to_string(),
            handoff_error: "dead-letter queue unavailable".to_string(),
        }
    );
    let record = fx.store.find_by_event_id(event.event_id()).unwrap().unwrap();
    assert_eq!(record.status, RetryStatus::Failed);
    assert!(
        record
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("dead-letter queue unavailable"))
    );
    assert!(fx.dlq.is_empty());
}

#[test]
fn cleanup_removes_only_old_terminal_records() {
    let fx = Fixture::new();
    let service = fx.builder().build();
    let policy = RetryPolicy::fixed(3, Duration::from_secs(1));
    let failing = always_failing(Arc::new(AtomicU32::new(0)));
    let now = fx.clock.now();

    // Records written 40 days ago.
    fx.clock.set(now - chrono::Duration::days(40));
    let old_parked = fx.publish("order.placed");
    service
        .execute_with_retry(&old_parked, &failing, &RetryPolicy::no_retry())
        .unwrap();
    let old_retrying = fx.publish("order.placed");
    service.execute_with_retry(&old_retrying, &failing, &policy).unwrap();

    fx.clock.set(now);
    let fresh_parked = fx.publish("order.placed");
    service
        .execute_with_retry(&fresh_parked, &failing, &RetryPolicy::no_retry())
        .unwrap();

    let removed = service
        .cleanup_old_retry_records(Duration::from_secs(30 * 24 * 60 * 60))
        .unwrap();

    assert_eq!(removed, 1);
    assert!(fx.store.find_by_event_id(old_parked.event_id()).unwrap().is_none());
    let retrying = fx.store.find_by_event_id(old_retrying.event_id()).unwrap().unwrap();
    assert_eq!(retrying.status, RetryStatus::Retrying);
    assert!(fx.store.find_by_event_id(fresh_parked.event_id()).unwrap().is_some());

    // Same window through the configured retention.
    assert_eq!(service.cleanup_expired().unwrap(), 0);
}

#[test]
fn duplicate_submission_reuses_the_record() {
    let fx = Fixture::new();
    let service = fx.builder().build();
    let calls = Arc::new(AtomicU32::new(0));
    let processor = always_failing(calls.clone());
    let policy = RetryPolicy::fixed(3, Duration::from_secs(10));
    let event = fx.publish("order.placed");

    service.execute_with_retry(&event, &processor, &policy).unwrap();
    let duplicate = service.execute_with_retry(&event, &processor, &policy).unwrap();

    assert_eq!(duplicate.attempts, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(fx.store.len(), 1);
    assert_eq!(service.get_retry_statistics().unwrap().total_retries, 1);
}

#[test]
fn statistics_match_known_outcomes() {
    let fx = Fixture::new();
    let service = fx
        .builder()
        .config(RetryConfig {
            retain_succeeded: true,
            ..RetryConfig::default()
        })
        .build();
    let ok = |_: &EventEnvelope| -> anyhow::Result<serde_json::Value> { Ok(serde_json::Value::Null) };
    let failing = always_failing(Arc::new(AtomicU32::new(0)));
    let retrying = RetryPolicy::fixed(3, Duration::from_secs(1));

    for _ in 0..3 {
        let e = fx.publish("order.placed");
        service.execute_with_retry(&e, &ok, &retrying).unwrap();
    }
    for _ in 0..2 {
        let e = fx.publish("invoice.issued");
        service
            .execute_with_retry(&e, &failing, &RetryPolicy::no_retry())
            .unwrap();
    }
    fx.dlq.set_failing(true);
    let e = fx.publish("invoice.issued");
    service
        .execute_with_retry(&e, &failing, &RetryPolicy::no_retry())
        .unwrap();
    let e = fx.publish("order.placed");
    service.execute_with_retry(&e, &failing, &retrying).unwrap();

    let stats = service.get_retry_statistics().unwrap();

    assert_eq!(stats.total_retries, 7);
    assert_eq!(stats.successful, 3);
    assert_eq!(stats.dead_lettered, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.retrying, 1);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.average_attempts, 1.0);

    let orders = &stats.by_event_type["order.placed"];
    assert_eq!(orders.total, 4);
    assert_eq!(orders.successful, 3);
    let invoices = &stats.by_event_type["invoice.issued"];
    assert_eq!(invoices.total, 3);
    assert_eq!(invoices.dead_lettered, 2);
    assert_eq!(invoices.failed, 1);
}
