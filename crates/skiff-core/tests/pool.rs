//! Sandbox pool behaviour against a recording fake runtime.

mod common;

use common::{config, pool, Call};
use futures::future::join_all;
use skiff_core::{CoreError, Event, ParallelismModel, SandboxPool, SandboxState};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::test]
async fn test_prewarm_then_acquire_uses_idle_sandbox() {
    let (pool, runtime) = pool(config());

    assert_eq!(pool.prewarm(1).await.unwrap(), 1);
    assert_eq!(
        runtime.calls(),
        vec![
            Call::Create {
                port: Some(50000),
                idle: false
            },
            Call::Start("c1".into()),
            Call::Health(50000),
        ]
    );

    let sandbox = pool.acquire("fetch").await.unwrap();
    assert_eq!(sandbox.id.as_str(), "c1");
    assert_eq!(sandbox.state, SandboxState::Running);
    assert_eq!(sandbox.block_id.as_deref(), Some("fetch"));
    assert_eq!(sandbox.address, "http://localhost:50000");
    assert_eq!(runtime.creates(), 1);
    assert_eq!(pool.stats().idle_hits(), 1);
}

#[tokio::test]
async fn test_release_pauses_and_next_acquire_wakes() {
    let (pool, runtime) = pool(config());

    let first = pool.acquire("a").await.unwrap();
    pool.release(&first.id).await.unwrap();

    let parked = pool.get(&first.id).await.unwrap();
    assert_eq!(parked.state, SandboxState::Dormant);
    assert_eq!(parked.block_id, None);
    assert!(parked.dormant_since.is_some());
    assert!(parked.dormancy_deadline.is_some());
    assert!(runtime.position(&Call::Pause("c1".into())).is_some());

    let second = pool.acquire("b").await.unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.state, SandboxState::Running);
    assert_eq!(second.block_id.as_deref(), Some("b"));
    assert_eq!(second.dormancy_deadline, None);
    assert!(runtime.position(&Call::Unpause("c1".into())).is_some());
    assert_eq!(runtime.creates(), 1);
    assert_eq!(pool.stats().wakes(), 1);
    assert_eq!(pool.stats().cold_starts(), 1);
}

#[tokio::test]
async fn test_idle_preferred_over_dormant() {
    let (pool, runtime) = pool(config());

    let a = pool.acquire("a").await.unwrap();
    pool.release(&a.id).await.unwrap();
    // second sandbox stays idle
    assert_eq!(pool.prewarm(1).await.unwrap(), 1);

    let picked = pool.acquire("b").await.unwrap();
    assert_eq!(picked.id.as_str(), "c2");
    assert_eq!(runtime.count(|c| matches!(c, Call::Unpause(_))), 0);
}

#[tokio::test]
async fn test_cap_reached_returns_no_sandbox_available() {
    let (pool, _runtime) = pool(config());

    pool.acquire("a").await.unwrap();
    pool.acquire("b").await.unwrap();

    let err = pool.acquire("c").await.unwrap_err();
    assert!(matches!(err, CoreError::NoSandboxAvailable { max: 2 }));
}

#[tokio::test]
async fn test_concurrent_acquires_never_exceed_cap() {
    let (pool, runtime) = pool(config());

    let results = join_all((0..5).map(|i| {
        let pool = pool.clone();
        async move { pool.acquire(&format!("block-{i}")).await }
    }))
    .await;

    let ok = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(ok, 2);
    assert_eq!(runtime.creates(), 2);
    assert_eq!(pool.live_count().await, 2);

    let ports: Vec<u16> = results.iter().flatten().map(|s| s.port).collect();
    assert_ne!(ports[0], ports[1]);
}

#[tokio::test]
async fn test_wake_failure_terminates_before_spawning_replacement() {
    let (pool, runtime) = pool(config().max_sandboxes(1));

    let a = pool.acquire("a").await.unwrap();
    pool.release(&a.id).await.unwrap();

    runtime.fail_unpause.store(true, Ordering::SeqCst);
    let b = pool.acquire("b").await.unwrap();
    assert_eq!(b.id.as_str(), "c2");
    assert_eq!(b.state, SandboxState::Running);

    let unpause = runtime.position(&Call::Unpause("c1".into())).unwrap();
    let stop = runtime.position(&Call::Stop("c1".into())).unwrap();
    let remove = runtime.position(&Call::Remove("c1".into())).unwrap();
    let create = runtime
        .calls()
        .iter()
        .rposition(|c| matches!(c, Call::Create { .. }))
        .unwrap();
    assert!(unpause < stop && stop < remove && remove < create);

    assert_eq!(
        pool.get(&a.id).await.unwrap().state,
        SandboxState::Terminated
    );
    assert_eq!(pool.stats().wake_failures(), 1);
    assert_eq!(b.port, 50001);
    // the failed sandbox's port went back to the allocator
    assert_eq!(pool.available_ports().await, 9);
}

#[tokio::test]
async fn test_spawn_health_failure_cleans_up() {
    let (pool, runtime) = pool(config());
    runtime.failing_health_checks.store(1, Ordering::SeqCst);

    let err = pool.acquire("a").await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::Runtime {
            operation: "health_check",
            ..
        }
    ));
    assert!(runtime.position(&Call::Remove("c1".into())).is_some());
    assert_eq!(pool.available_ports().await, 10);
    assert_eq!(pool.live_count().await, 0);
    assert_eq!(
        pool.get(&"c1".into()).await.unwrap().state,
        SandboxState::Terminated
    );

    // a later acquire starts fresh
    let sandbox = pool.acquire("a").await.unwrap();
    assert_eq!(sandbox.id.as_str(), "c2");
}

#[tokio::test]
async fn test_create_failure_releases_reservation() {
    let (pool, runtime) = pool(config());
    runtime.fail_create.store(true, Ordering::SeqCst);

    let err = pool.acquire("a").await.unwrap_err();
    assert!(matches!(err, CoreError::Runtime { operation: "create", .. }));
    assert_eq!(pool.available_ports().await, 10);

    runtime.fail_create.store(false, Ordering::SeqCst);
    pool.acquire("a").await.unwrap();
    pool.acquire("b").await.unwrap();
}

#[tokio::test]
async fn test_pause_failure_terminates_and_reports() {
    let (pool, runtime) = pool(config());
    let sandbox = pool.acquire("a").await.unwrap();

    runtime.fail_pause.store(true, Ordering::SeqCst);
    let err = pool.release(&sandbox.id).await.unwrap_err();
    assert!(matches!(err, CoreError::Runtime { operation: "pause", .. }));
    assert_eq!(
        pool.get(&sandbox.id).await.unwrap().state,
        SandboxState::Terminated
    );
    assert_eq!(pool.available_ports().await, 10);
}

#[tokio::test]
async fn test_release_of_idle_sandbox_is_invalid_transition() {
    let (pool, _runtime) = pool(config());
    pool.prewarm(1).await.unwrap();
    let idle = pool.snapshot().await.remove(0);

    let err = pool.release(&idle.id).await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::InvalidTransition {
            from: SandboxState::Idle,
            to: SandboxState::Dormant,
            ..
        }
    ));
}

#[tokio::test]
async fn test_unknown_sandbox_is_not_found() {
    let (pool, _runtime) = pool(config());
    let missing = skiff_core::SandboxId::from("nope");
    assert!(matches!(
        pool.release(&missing).await,
        Err(CoreError::NotFound(_))
    ));
    assert!(matches!(
        pool.terminate(&missing).await,
        Err(CoreError::NotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_dormancy_expiry_terminates_and_frees_port() {
    let (pool, runtime) = pool(config().dormancy_timeout(Duration::from_secs(10)));
    let sandbox = pool.acquire("a").await.unwrap();
    pool.release(&sandbox.id).await.unwrap();

    tokio::time::sleep(Duration::from_secs(9)).await;
    assert_eq!(
        pool.get(&sandbox.id).await.unwrap().state,
        SandboxState::Dormant
    );

    tokio::time::sleep(Duration::from_secs(2)).await;
    wait_for_state(&pool, &sandbox.id, SandboxState::Terminated).await;
    assert!(runtime.position(&Call::Remove("c1".into())).is_some());
    assert_eq!(pool.available_ports().await, 10);
    assert_eq!(pool.live_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_wake_cancels_dormancy_timer() {
    let (pool, runtime) = pool(config().dormancy_timeout(Duration::from_secs(10)));
    let sandbox = pool.acquire("a").await.unwrap();
    pool.release(&sandbox.id).await.unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    let woken = pool.acquire("b").await.unwrap();
    assert_eq!(woken.id, sandbox.id);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(
        pool.get(&sandbox.id).await.unwrap().state,
        SandboxState::Running
    );
    assert_eq!(runtime.count(|c| matches!(c, Call::Stop(_))), 0);
}

#[tokio::test(start_paused = true)]
async fn test_release_again_rearms_dormancy() {
    let (pool, _runtime) = pool(config().dormancy_timeout(Duration::from_secs(10)));
    let sandbox = pool.acquire("a").await.unwrap();
    pool.release(&sandbox.id).await.unwrap();

    tokio::time::sleep(Duration::from_secs(8)).await;
    pool.acquire("b").await.unwrap();
    pool.release(&sandbox.id).await.unwrap();

    // first deadline has passed, second has not
    tokio::time::sleep(Duration::from_secs(8)).await;
    assert_eq!(
        pool.get(&sandbox.id).await.unwrap().state,
        SandboxState::Dormant
    );

    tokio::time::sleep(Duration::from_secs(3)).await;
    wait_for_state(&pool, &sandbox.id, SandboxState::Terminated).await;
}

#[tokio::test]
async fn test_single_sandbox_mode_shares_one_container() {
    let (pool, runtime) = pool(config().parallelism(ParallelismModel::SingleSandbox));

    let acquired = join_all(["x", "y", "z"].map(|b| pool.acquire(b))).await;
    let acquired: Vec<_> = acquired.into_iter().map(Result::unwrap).collect();

    assert!(acquired.iter().all(|s| s.id == acquired[0].id));
    assert_eq!(runtime.creates(), 1);
    assert_eq!(
        runtime.calls()[0],
        Call::Create {
            port: Some(50000),
            idle: true
        }
    );
    // nothing listens in an idle container
    assert_eq!(runtime.count(|c| matches!(c, Call::Health(_))), 0);

    let shared = pool.get(&acquired[0].id).await.unwrap();
    assert_eq!(shared.acquire_count, 3);
    assert_eq!(shared.state, SandboxState::Running);

    // still bound while other callers hold it
    pool.release(&acquired[0].id).await.unwrap();
    let shared = pool.get(&acquired[0].id).await.unwrap();
    assert_eq!(shared.acquire_count, 2);
    assert!(shared.block_id.is_some());
    assert_eq!(shared.state, SandboxState::Running);
    assert_eq!(runtime.count(|c| matches!(c, Call::Pause(_))), 0);

    for sandbox in &acquired[1..] {
        pool.release(&sandbox.id).await.unwrap();
    }
    let shared = pool.get(&acquired[0].id).await.unwrap();
    assert_eq!(shared.acquire_count, 0);
    assert_eq!(shared.block_id, None);
    assert_eq!(runtime.count(|c| matches!(c, Call::Pause(_))), 0);
}

#[tokio::test]
async fn test_prewarm_respects_cap() {
    let (pool, runtime) = pool(config().max_sandboxes(3));

    assert_eq!(pool.prewarm(5).await.unwrap(), 3);
    assert_eq!(pool.live_count().await, 3);
    assert_eq!(pool.prewarm(2).await.unwrap(), 0);
    assert_eq!(runtime.creates(), 3);
    assert!(pool
        .snapshot()
        .await
        .iter()
        .all(|s| s.state == SandboxState::Idle));
}

#[tokio::test]
async fn test_prewarm_reports_first_failure_and_keeps_successes() {
    let (pool, runtime) = pool(config().max_sandboxes(3));
    runtime.failing_health_checks.store(1, Ordering::SeqCst);

    assert!(pool.prewarm(3).await.is_err());
    assert_eq!(pool.live_count().await, 2);
}

#[tokio::test]
async fn test_terminate_is_idempotent() {
    let (pool, runtime) = pool(config());
    let sandbox = pool.acquire("a").await.unwrap();

    pool.terminate(&sandbox.id).await.unwrap();
    pool.terminate(&sandbox.id).await.unwrap();

    assert_eq!(runtime.count(|c| matches!(c, Call::Remove(_))), 1);
    let record = pool.get(&sandbox.id).await.unwrap();
    assert_eq!(record.state, SandboxState::Terminated);
    assert_eq!(record.block_id, None);
    assert_eq!(pool.stats().terminated(), 1);
}

#[tokio::test]
async fn test_teardown_terminates_everything() {
    let (pool, runtime) = pool(config());
    let a = pool.acquire("a").await.unwrap();
    pool.acquire("b").await.unwrap();
    pool.release(&a.id).await.unwrap();

    pool.teardown().await;
    assert_eq!(pool.live_count().await, 0);
    assert_eq!(pool.available_ports().await, 10);
    assert_eq!(runtime.count(|c| matches!(c, Call::Remove(_))), 2);

    // second teardown has nothing to do
    pool.teardown().await;
    assert_eq!(runtime.count(|c| matches!(c, Call::Remove(_))), 2);
}

#[tokio::test]
async fn test_cleanup_orphans_removes_owned_containers() {
    let (pool, runtime) = pool(config());
    runtime.add_orphan("old-1");
    runtime.add_orphan("old-2");

    assert_eq!(pool.cleanup_orphans().await, 2);
    assert!(runtime.position(&Call::Remove("old-1".into())).is_some());
    assert!(runtime.position(&Call::Remove("old-2".into())).is_some());
}

#[tokio::test]
async fn test_cleanup_orphans_tolerates_listing_failure() {
    let (pool, runtime) = pool(config());
    runtime.fail_list.store(true, Ordering::SeqCst);

    assert_eq!(pool.cleanup_orphans().await, 0);
    assert_eq!(runtime.calls(), vec![Call::List]);
}

#[tokio::test]
async fn test_transitions_are_published() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let seen = seen.clone();
        move |event: &Event| {
            if let Event::SandboxTransition { from, to, .. } = event {
                seen.lock().unwrap().push((*from, *to));
            }
        }
    };
    let runtime = common::FakeRuntime::new();
    let pool =
        SandboxPool::with_events(config().build().unwrap(), runtime, Arc::new(sink)).unwrap();

    let sandbox = pool.acquire("a").await.unwrap();
    pool.release(&sandbox.id).await.unwrap();
    pool.terminate(&sandbox.id).await.unwrap();

    use SandboxState::*;
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            (Starting, Idle),
            (Idle, Running),
            (Running, Dormant),
            (Dormant, Terminated),
        ]
    );
}

async fn wait_for_state(pool: &SandboxPool, id: &skiff_core::SandboxId, state: SandboxState) {
    for _ in 0..50 {
        if pool.get(id).await.map(|s| s.state) == Some(state) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("sandbox {id} never reached {state}");
}
