//! Scheduler Loop Behavioral Tests - BDD Style
//!
//! Following BDD naming convention: given_<context>_when_<action>_then_<outcome>
//!
//! These tests run the full controller (workers, change listener, resync
//! ticker and poller) against the in-memory cluster.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::panic)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use keel_reconciler::{
    ActionResult, Controller, ControllerConfig, DesiredAttributes, Health, InMemoryCluster,
    ManagedSystem, PollConfig, ReconcilePhase, ResourceId, ResourceSpec, ResourceStatus,
};

const WAIT: Duration = Duration::from_secs(5);

fn fast_config() -> ControllerConfig {
    ControllerConfig::default()
        .with_workers(2)
        .with_resync_interval(Duration::from_millis(200))
        .with_poll(PollConfig {
            interval: Duration::from_millis(20),
            tick: Duration::from_millis(10),
            stale_after_failures: 3,
        })
}

fn controller(cluster: &Arc<InMemoryCluster>) -> Controller {
    Controller::new(Arc::clone(cluster) as Arc<dyn ManagedSystem>, fast_config())
        .unwrap_or_else(|err| panic!("test config should be valid: {err}"))
}

fn web_id() -> ResourceId {
    ResourceId::deployment("shop", "web")
}

fn web(replicas: u32) -> ResourceSpec {
    ResourceSpec::new(
        web_id(),
        DesiredAttributes::with_image("registry.local/web:1")
            .replicas(replicas)
            .label("app", "web"),
    )
}

/// Poll `check` until it holds or the wait budget runs out.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(WAIT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}

async fn wait_for_status<P>(controller: &Controller, predicate: P) -> bool
where
    P: Fn(&ResourceStatus) -> bool,
{
    let predicate = &predicate;
    eventually(move || async move {
        controller
            .status(&web_id())
            .await
            .is_some_and(|s| predicate(&s))
    })
    .await
}

#[tokio::test]
async fn given_running_loop_when_spec_submitted_then_resource_converges() {
    // GIVEN: A running controller
    let cluster = Arc::new(InMemoryCluster::new());
    let controller = controller(&cluster);
    let running = controller.start();

    // WHEN: A spec is submitted
    let accepted = controller.submit(web(3)).await;
    assert_eq!(accepted.ok().map(|s| s.generation), Some(1));

    // THEN: The cluster converges and the status reports it
    assert!(wait_for_status(&controller, |s| s.is_converged_at(1)).await);
    assert_eq!(cluster.observed(&web_id()).await.map(|o| o.replicas), Some(3));
    assert_eq!(
        controller.status(&web_id()).await.map(|s| s.health),
        Some(Health::Healthy)
    );

    assert!(running.shutdown().await.is_ok());
}

#[tokio::test]
async fn given_permanently_degraded_resource_when_changed_spec_submitted_then_it_recovers() {
    // GIVEN: A resource degraded by a permanent failure
    let cluster = Arc::new(InMemoryCluster::new());
    cluster
        .script(&web_id(), [ActionResult::Permanent("quota exceeded".to_string())])
        .await;
    let controller = controller(&cluster);
    let running = controller.start();
    let _ = controller.submit(web(2)).await;
    assert!(wait_for_status(&controller, |s| s.phase == ReconcilePhase::Degraded).await);

    // WHEN: A changed spec is submitted
    let accepted = controller.submit(web(3)).await;
    assert_eq!(accepted.ok().map(|s| s.generation), Some(2));

    // THEN: It leaves Degraded right away and converges on the new generation
    let phase = controller.status(&web_id()).await.map(|s| s.phase);
    assert_ne!(phase, Some(ReconcilePhase::Degraded));
    assert!(wait_for_status(&controller, |s| s.is_converged_at(2)).await);
    assert_eq!(cluster.observed(&web_id()).await.map(|o| o.replicas), Some(3));

    assert!(running.shutdown().await.is_ok());
}

#[tokio::test]
async fn given_converged_resource_when_cluster_drifts_then_drift_is_corrected() {
    // GIVEN: A converged resource
    let cluster = Arc::new(InMemoryCluster::new());
    let controller = controller(&cluster);
    let running = controller.start();
    let _ = controller.submit(web(3)).await;
    assert!(wait_for_status(&controller, |s| s.is_converged_at(1)).await);

    // WHEN: Someone scales it down and strips a label behind our back
    cluster
        .mutate(&web_id(), |observed| {
            observed.replicas = 1;
            observed.labels.clear();
        })
        .await;

    // THEN: The poller notices and the reconciler restores the desired state
    let cluster_ref = &cluster;
    let restored = eventually(move || async move {
        cluster_ref
            .observed(&web_id())
            .await
            .is_some_and(|o| o.replicas == 3 && o.labels.contains_key("app"))
    })
    .await;
    assert!(restored);
    assert!(controller.metrics().await.drift_detected >= 1);

    assert!(running.shutdown().await.is_ok());
}

#[tokio::test]
async fn given_unreachable_cluster_when_polls_keep_failing_then_status_goes_stale() {
    // GIVEN: A converged resource
    let cluster = Arc::new(InMemoryCluster::new());
    let controller = controller(&cluster);
    let running = controller.start();
    let _ = controller.submit(web(2)).await;
    assert!(wait_for_status(&controller, |s| s.is_converged_at(1)).await);

    // WHEN: Every poll fails from now on
    cluster.fail_polls(&web_id(), u32::MAX).await;

    // THEN: Health becomes Unknown while the last observation is kept
    assert!(
        wait_for_status(&controller, |s| s.health == Health::Unknown
            && s.consecutive_poll_failures >= 3)
        .await
    );
    assert_eq!(
        controller.status(&web_id()).await.map(|s| s.observed.replicas),
        Some(2)
    );

    // AND: Recovery restores health on the next successful poll
    cluster.fail_polls(&web_id(), 0).await;
    assert!(wait_for_status(&controller, |s| s.health == Health::Healthy).await);

    assert!(running.shutdown().await.is_ok());
}

#[tokio::test]
async fn given_managed_resource_when_removed_then_loop_leaves_it_alone() {
    // GIVEN: A converged resource
    let cluster = Arc::new(InMemoryCluster::new());
    let controller = controller(&cluster);
    let running = controller.start();
    let _ = controller.submit(web(2)).await;
    assert!(wait_for_status(&controller, |s| s.is_converged_at(1)).await);

    // WHEN: It is removed and then drifts
    assert!(controller.remove(&web_id()).await.is_ok());
    cluster.mutate(&web_id(), |observed| observed.replicas = 9).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    // THEN: Nothing is corrected and nothing is deleted
    assert_eq!(cluster.observed(&web_id()).await.map(|o| o.replicas), Some(9));
    assert!(controller.status(&web_id()).await.is_none());

    assert!(running.shutdown().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn given_two_workers_when_two_resources_submitted_then_they_reconcile_in_parallel() {
    // GIVEN: A cluster where every call takes a second, and two idle workers
    let cluster = Arc::new(InMemoryCluster::new().with_latency(Duration::from_secs(1)));
    let quiet = ControllerConfig::default()
        .with_workers(2)
        .with_resync_interval(Duration::from_secs(600))
        .with_poll(PollConfig {
            interval: Duration::from_secs(600),
            tick: Duration::from_secs(600),
            stale_after_failures: 3,
        });
    let controller = Controller::new(Arc::clone(&cluster) as Arc<dyn ManagedSystem>, quiet)
        .unwrap_or_else(|err| panic!("test config should be valid: {err}"));
    let running = controller.start();
    tokio::time::sleep(Duration::from_millis(10)).await;

    // WHEN: Two distinct resources are submitted together
    let ids = [
        ResourceId::deployment("shop", "web"),
        ResourceId::deployment("shop", "api"),
    ];
    let started = tokio::time::Instant::now();
    for id in &ids {
        let spec = ResourceSpec::new(
            id.clone(),
            DesiredAttributes::with_image("registry.local/app:1"),
        );
        assert!(controller.submit(spec).await.is_ok());
    }

    // THEN: Each run is one poll plus two actions (three seconds), and both
    // finish inside the time a single run takes
    let controller_ref = &controller;
    let ids_ref = &ids;
    let converged = eventually(move || async move {
        for id in ids_ref {
            let done = controller_ref
                .status(id)
                .await
                .is_some_and(|s| s.is_converged_at(1));
            if !done {
                return false;
            }
        }
        true
    })
    .await;
    let elapsed = started.elapsed();

    assert!(converged);
    assert!(
        elapsed >= Duration::from_secs(3),
        "a run cannot beat its own latency, took {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_secs(4),
        "runs were serialized, took {elapsed:?}"
    );
    assert_eq!(controller.metrics().await.reconciles_converged, 2);

    assert!(running.shutdown().await.is_ok());
}
