use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};

use tollway::domain::{OrderStatus, OrderType};
use tollway::gateway::GatewayKind;
use tollway::orchestrator::TransitionOutcome;
use tollway::provisioning::ProvisioningError;
use tollway::scheduler::{ScheduledTransitionRunner, SweepReport};
use tollway::testing::{MockGateway, TestHarness};

#[tokio::test]
async fn test_sweep_activates_due_downgrade() {
    let expires_at = Utc::now() + Duration::days(3);
    let harness = TestHarness::new(GatewayKind::PayProGlobal);
    harness
        .subscribe("user_1", "pro", GatewayKind::PayProGlobal, "ppg_1", Some(expires_at))
        .await
        .unwrap();
    let TransitionOutcome::DowngradeScheduled { order_id, .. } =
        harness.orchestrator.downgrade("user_1", "starter").await.unwrap()
    else {
        panic!("expected a scheduled downgrade");
    };
    let runner = ScheduledTransitionRunner::new(harness.orchestrator.clone());

    // Not due yet.
    let report = runner.run_once(Utc::now()).await.unwrap();
    assert_eq!(report, SweepReport::default());

    let report = runner.run_once(expires_at + Duration::minutes(1)).await.unwrap();
    assert_eq!(report.users, 1);
    assert_eq!(report.activated, 1);
    assert_eq!(report.failed, 0);

    let ledger = harness.ledger("user_1").await.unwrap();
    assert_eq!(ledger.order(order_id).unwrap().status, OrderStatus::Completed);
    let license = ledger.active_license().unwrap();
    assert_eq!(license.package_id, "starter");
    assert_eq!(license.gateway_subscription_id.as_deref(), Some("ppg_1"));
    assert_eq!(license.license_key.as_deref(), Some("STARTER-001"));

    // No gateway call: the plan change happens locally.
    assert!(harness.gateway(GatewayKind::PayProGlobal).unwrap().calls().is_empty());

    let report = runner.run_once(expires_at + Duration::minutes(2)).await.unwrap();
    assert_eq!(report.users, 0);
}

#[tokio::test]
async fn test_sweep_moves_free_downgrade_off_gateway() {
    let expires_at = Utc::now() + Duration::days(1);
    let harness = TestHarness::new(GatewayKind::Paddle);
    harness
        .subscribe("user_1", "starter", GatewayKind::Paddle, "sub_1", Some(expires_at))
        .await
        .unwrap();
    harness.orchestrator.downgrade("user_1", "free").await.unwrap();
    assert_eq!(harness.gateway(GatewayKind::Paddle).unwrap().call_count("cancel"), 1);

    let report = ScheduledTransitionRunner::new(harness.orchestrator.clone())
        .run_once(expires_at)
        .await
        .unwrap();
    assert_eq!(report.activated, 1);

    let ledger = harness.ledger("user_1").await.unwrap();
    let license = ledger.active_license().unwrap();
    assert_eq!(license.package_id, "free");
    assert!(license.gateway.is_none());
    assert!(license.expires_at.is_none());
    assert!(ledger.account.subscription_id.is_none());
}

#[tokio::test]
async fn test_sweep_finalizes_due_cancellation() {
    let expires_at = Utc::now() + Duration::days(7);
    let harness = TestHarness::new(GatewayKind::FastSpring);
    harness
        .subscribe("user_1", "pro", GatewayKind::FastSpring, "sub_1", Some(expires_at))
        .await
        .unwrap();
    harness.orchestrator.cancel("user_1").await.unwrap();
    let runner = ScheduledTransitionRunner::new(harness.orchestrator.clone());

    let report = runner.run_once(expires_at - Duration::hours(1)).await.unwrap();
    assert_eq!(report.canceled, 0);
    assert!(harness.ledger("user_1").await.unwrap().active_license().is_some());

    let report = runner.run_once(expires_at).await.unwrap();
    assert_eq!(report.canceled, 1);

    let ledger = harness.ledger("user_1").await.unwrap();
    assert!(ledger.active_license().is_none());
    assert!(!ledger.account.is_subscribed);
    let cancellation = ledger
        .orders
        .iter()
        .find(|o| o.order_type == OrderType::Cancellation)
        .unwrap();
    assert_eq!(cancellation.status, OrderStatus::Completed);
}

#[tokio::test]
async fn test_cancellation_without_termination_date_waits_for_gateway() {
    let harness = TestHarness::new(GatewayKind::Paddle);
    harness
        .subscribe("user_1", "pro", GatewayKind::Paddle, "sub_1", None)
        .await
        .unwrap();
    harness.orchestrator.cancel("user_1").await.unwrap();

    let report = ScheduledTransitionRunner::new(harness.orchestrator.clone())
        .run_once(Utc::now() + Duration::days(365))
        .await
        .unwrap();

    assert_eq!(report.users, 0);
    assert!(harness.ledger("user_1").await.unwrap().pending_cancellation().is_some());
}

#[tokio::test]
async fn test_sweep_failure_is_counted_and_retried_next_time() {
    let expires_at = Utc::now() + Duration::days(1);
    let harness = TestHarness::new(GatewayKind::PayProGlobal);
    harness
        .subscribe("user_1", "pro", GatewayKind::PayProGlobal, "ppg_1", Some(expires_at))
        .await
        .unwrap();
    harness.orchestrator.downgrade("user_1", "starter").await.unwrap();
    harness.provisioning.fail_next(
        "list_license_codes",
        ProvisioningError::transient("list_license_codes", "upstream timeout"),
        3,
    );
    let runner = ScheduledTransitionRunner::new(harness.orchestrator.clone());

    let report = runner.run_once(expires_at).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.activated, 0);
    assert!(harness.ledger("user_1").await.unwrap().scheduled_downgrade().is_some());

    let report = runner.run_once(expires_at).await.unwrap();
    assert_eq!(report.activated, 1);
}

#[tokio::test]
async fn test_spawned_runner_sweeps_and_shuts_down() {
    let harness = TestHarness::builder()
        .with_gateway(MockGateway::new(GatewayKind::PayProGlobal))
        .build();
    // Already lapsed, so the first tick activates the downgrade.
    harness
        .subscribe(
            "user_1",
            "pro",
            GatewayKind::PayProGlobal,
            "ppg_1",
            Some(Utc::now() - Duration::minutes(1)),
        )
        .await
        .unwrap();
    harness.orchestrator.downgrade("user_1", "starter").await.unwrap();

    let handle = ScheduledTransitionRunner::new(harness.orchestrator.clone())
        .spawn(StdDuration::from_millis(10));

    let mut activated = false;
    for _ in 0..100 {
        let ledger = harness.ledger("user_1").await.unwrap();
        if ledger.active_license().map(|l| l.package_id.as_str()) == Some("starter") {
            activated = true;
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    assert!(activated);

    assert!(!handle.is_finished());
    handle.shutdown().await;
}
