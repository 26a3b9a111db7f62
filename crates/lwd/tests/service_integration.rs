//! Integration tests for the service coordinator: channel management,
//! mode reconciliation, and authorization.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

#[macro_use]
mod common;

use std::time::Duration;

use common::*;
use lw_core::{DeliveryMode, Handle, Priority};
use lwd::push::SessionState;
use lwd::registry::RegistryError;
use lwd::service::{spawn_reassignment_task, CheckOutcome, ServiceError};
use tokio_util::sync::CancellationToken;

fn harness(dir: &tempfile::TempDir, capacity: usize) -> Harness {
    Harness::builder()
        .capacity(capacity)
        .identity("alpha", "1")
        .identity("beta", "2")
        .identity("gamma", "3")
        .identity("delta", "4")
        .build(dir.path())
}

async fn mode_of(h: &Harness, handle: &str) -> DeliveryMode {
    h.registry
        .get(&Handle::parse(handle).unwrap())
        .await
        .unwrap()
        .delivery_mode
}

// ============================================================================
// Channel Management
// ============================================================================

#[tokio::test]
async fn test_add_resolves_identity() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&dir, 3);

    let record = h.service.add_channel("  @Alpha ", Priority::High).await.unwrap();

    assert_eq!(record.channel_id.as_str(), "1");
    assert_eq!(record.handle.as_str(), "alpha");
    assert_eq!(record.display_name, "ALPHA");
    assert_eq!(record.priority, Priority::High);
    assert_eq!(h.registry.len().await, 1);
}

#[tokio::test]
async fn test_add_sets_initial_liveness_without_notifying() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&dir, 3);
    h.liveness.set_live("1", true);

    let record = h.service.add_channel("alpha", Priority::Normal).await.unwrap();

    assert!(record.is_live);
    assert_eq!(h.notifier.count(), 0);
}

#[tokio::test]
async fn test_add_tolerates_failed_liveness_query() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&dir, 3);
    h.liveness.fail_for("1");

    let record = h.service.add_channel("alpha", Priority::Normal).await.unwrap();

    assert!(!record.is_live);
    assert_eq!(h.registry.len().await, 1);
}

#[tokio::test]
async fn test_add_rejections() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&dir, 3);
    h.service.add_channel("alpha", Priority::Normal).await.unwrap();

    let err = h.service.add_channel("ALPHA", Priority::High).await.unwrap_err();
    assert!(matches!(err, ServiceError::AlreadyTracked(_)));

    let err = h.service.add_channel("nobody", Priority::Normal).await.unwrap_err();
    assert!(matches!(err, ServiceError::Api(_)));

    let err = h.service.add_channel("not a handle!", Priority::Normal).await.unwrap_err();
    assert!(matches!(err, ServiceError::InvalidHandle(_)));

    assert_eq!(h.registry.len().await, 1);
}

#[tokio::test]
async fn test_add_rejects_same_channel_under_other_handle() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::builder()
        .identity("alpha", "1")
        .identity("alpha_old", "1")
        .build(dir.path());
    h.service.add_channel("alpha", Priority::Normal).await.unwrap();

    let err = h.service.add_channel("alpha_old", Priority::Normal).await.unwrap_err();

    assert!(matches!(
        err,
        ServiceError::Registry(RegistryError::DuplicateChannel { .. })
    ));
}

#[tokio::test]
async fn test_remove_and_set_priority_unknown() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&dir, 3);

    let err = h.service.remove_channel("alpha").await.unwrap_err();
    assert!(matches!(err, ServiceError::NotTracked(_)));

    let err = h.service.set_priority("alpha", Priority::High).await.unwrap_err();
    assert!(matches!(err, ServiceError::NotTracked(_)));
}

#[tokio::test]
async fn test_remove_returns_record() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&dir, 3);
    h.service.add_channel("alpha", Priority::Normal).await.unwrap();

    let removed = h.service.remove_channel("Alpha").await.unwrap();

    assert_eq!(removed.channel_id.as_str(), "1");
    assert!(h.service.list().await.is_empty());
}

// ============================================================================
// Assignment
// ============================================================================

#[tokio::test]
async fn test_capacity_two_three_highs() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&dir, 2);

    for name in ["alpha", "beta", "gamma"] {
        h.service.add_channel(name, Priority::High).await.unwrap();
    }
    assert!(h.service.reconcile().await.unwrap());

    assert_eq!(mode_of(&h, "alpha").await, DeliveryMode::Push);
    assert_eq!(mode_of(&h, "beta").await, DeliveryMode::Push);
    assert_eq!(mode_of(&h, "gamma").await, DeliveryMode::Pull);

    // Idempotent
    assert!(!h.service.reconcile().await.unwrap());

    // Freeing a slot promotes the next high in insertion order
    h.service.remove_channel("alpha").await.unwrap();
    assert!(h.service.reconcile().await.unwrap());
    assert_eq!(mode_of(&h, "gamma").await, DeliveryMode::Push);
}

#[tokio::test]
async fn test_demoted_channel_loses_push_slot() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&dir, 1);

    h.service.add_channel("alpha", Priority::High).await.unwrap();
    h.service.add_channel("beta", Priority::High).await.unwrap();
    h.service.reconcile().await.unwrap();
    assert_eq!(mode_of(&h, "alpha").await, DeliveryMode::Push);

    h.service.set_priority("alpha", Priority::Normal).await.unwrap();
    h.service.reconcile().await.unwrap();

    assert_eq!(mode_of(&h, "alpha").await, DeliveryMode::Pull);
    assert_eq!(mode_of(&h, "beta").await, DeliveryMode::Push);
}

#[tokio::test]
async fn test_reassignment_task_follows_registry_changes() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&dir, 1);
    let cancel = CancellationToken::new();
    let task = spawn_reassignment_task(h.service.clone(), Duration::from_secs(60), cancel.clone());

    h.service.add_channel("alpha", Priority::High).await.unwrap();
    assert!(wait_until!(mode_of(&h, "alpha").await == DeliveryMode::Push));

    h.service.set_priority("alpha", Priority::Normal).await.unwrap();
    assert!(wait_until!(mode_of(&h, "alpha").await == DeliveryMode::Pull));

    cancel.cancel();
    task.await.unwrap();
}

// ============================================================================
// Manual Check
// ============================================================================

#[tokio::test]
async fn test_check_all_reports_and_records_without_notifying() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&dir, 3);
    h.service.add_channel("alpha", Priority::Normal).await.unwrap();
    h.service.add_channel("beta", Priority::Normal).await.unwrap();
    h.liveness.set_live("2", true);

    let checks = h.service.check_all().await;

    assert_eq!(checks.len(), 2);
    assert_eq!(checks[0].outcome, CheckOutcome::Offline);
    assert!(matches!(&checks[1].outcome, CheckOutcome::Live(s) if s.channel_id.as_str() == "2"));
    assert!(checks[1].record.is_live);
    assert!(
        h.registry
            .get(&Handle::parse("beta").unwrap())
            .await
            .unwrap()
            .is_live
    );
    assert_eq!(h.notifier.count(), 0);
}

#[tokio::test]
async fn test_check_all_reports_failed_batch() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&dir, 3);
    h.service.add_channel("alpha", Priority::Normal).await.unwrap();
    h.liveness.fail_for("1");

    let checks = h.service.check_all().await;

    assert_eq!(checks.len(), 1);
    assert!(matches!(checks[0].outcome, CheckOutcome::Failed(_)));
}

// ============================================================================
// Authorization / Status
// ============================================================================

#[tokio::test]
async fn test_status_reports_authorization_needed() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&dir, 2);
    h.service.add_channel("alpha", Priority::High).await.unwrap();
    h.service.add_channel("beta", Priority::Normal).await.unwrap();
    h.service.reconcile().await.unwrap();

    let status = h.service.status().await;

    assert_eq!(status.tracked, 2);
    assert_eq!(status.assignment.push, 1);
    assert_eq!(status.assignment.pull, 1);
    assert_eq!(status.push_capacity, 2);
    assert_eq!(status.push_state, SessionState::Disconnected);
    assert_eq!(status.authorization_url.as_deref(), Some(AUTH_URL));
}

#[tokio::test]
async fn test_complete_authorization_starts_push() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&dir, 2);
    h.service.add_channel("alpha", Priority::High).await.unwrap();
    h.service.reconcile().await.unwrap();
    assert_eq!(h.dialer.dials(), 0);

    h.service.complete_authorization("code").await.unwrap();

    assert!(wait_until!(h.dialer.dials() == 1));
    let status = h.service.status().await;
    assert!(status.authorization_url.is_none());
    assert!(status.user_credential_expires_at.is_some());
}

#[tokio::test]
async fn test_rejected_authorization_code() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&dir, 2);
    h.service.add_channel("alpha", Priority::High).await.unwrap();
    h.service.reconcile().await.unwrap();

    let err = h.service.complete_authorization("bad").await.unwrap_err();

    assert!(matches!(err, ServiceError::Credential(_)));
    assert!(!err.is_authorization_required());
    assert_eq!(h.dialer.dials(), 0);
}

#[tokio::test]
async fn test_reload_authorization_picks_up_stored_credential() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&dir, 2);
    h.service.add_channel("alpha", Priority::High).await.unwrap();
    h.service.reconcile().await.unwrap();
    assert!(!h.service.reload_authorization().await);

    // Another process completes authorization against the same data dir
    let other = harness(&dir, 2);
    other.credentials.complete_authorization("elsewhere").await.unwrap();

    assert!(h.service.reload_authorization().await);
    assert!(wait_until!(h.dialer.dials() == 1));
}

#[tokio::test]
async fn test_reauthorization_subscribes_channels_missed_while_expired() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::builder()
        .user_lifetime_secs(1)
        .identity("alpha", "1")
        .identity("beta", "2")
        .build(dir.path());
    h.service.add_channel("alpha", Priority::High).await.unwrap();
    h.authorize().await;
    h.service.reconcile().await.unwrap();
    assert!(wait_until!(h.dialer.dials() == 1));
    h.dialer.connection(0).send(welcome("s1"));
    assert!(wait_until!(
        h.push.state().await == SessionState::Active && h.subscriptions_held().await == 2
    ));

    // The user credential lapses; a newly promoted channel cannot subscribe
    tokio::time::sleep(Duration::from_millis(1100)).await;
    h.service.add_channel("beta", Priority::High).await.unwrap();
    h.service.reconcile().await.unwrap();
    assert_eq!(mode_of(&h, "beta").await, DeliveryMode::Push);
    assert_eq!(h.subscriptions_held().await, 2);

    h.service.complete_authorization("again").await.unwrap();

    assert_eq!(h.subscriptions_held().await, 4);
    let beta: Vec<_> = h
        .subscriptions
        .created()
        .into_iter()
        .filter(|(_, channel, _)| channel.as_str() == "2")
        .collect();
    assert_eq!(beta.len(), 2);
    assert!(beta.iter().all(|(_, _, session)| session == "s1"));
    assert_eq!(h.dialer.dials(), 1, "existing session is reused");
}

#[tokio::test]
async fn test_reassignment_task_retries_failed_subscriptions() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&dir, 3);
    h.service.add_channel("alpha", Priority::High).await.unwrap();
    h.service.add_channel("beta", Priority::High).await.unwrap();
    h.subscriptions.fail_for("2");
    h.authorize().await;

    let cancel = CancellationToken::new();
    let task = spawn_reassignment_task(h.service.clone(), Duration::from_millis(50), cancel.clone());
    assert!(wait_until!(h.dialer.dials() == 1));
    h.dialer.connection(0).send(welcome("s1"));
    assert!(wait_until!(
        h.push.state().await == SessionState::Active && h.subscriptions_held().await == 2
    ));

    h.subscriptions.recover("2");

    assert!(wait_until!(h.subscriptions_held().await == 4));
    assert_eq!(h.dialer.dials(), 1);

    cancel.cancel();
    task.await.unwrap();
}
