use std::sync::atomic::Ordering;
use std::time::Duration;

use computed_service::replica::{Replica, ReplicaError};
use computed_service::transport::TransportError;
use computed_service::ComputeError;
use serde_json::json;
use tokio::time;

use crate::{doubled_key, replica_config, setup_service, value_key, wait_for, CountingTransport};

const WINDOW: Duration = Duration::from_millis(100);

#[tokio::test(start_paused = true)]
async fn test_cached_values_are_served_locally() {
    let (service, source) = setup_service();
    source.set(7);
    let transport = CountingTransport::new(service, WINDOW);
    let replica = Replica::new(transport.clone(), replica_config());
    replica.wait_connected().await;

    let first = replica.get(&value_key()).await.unwrap();
    assert_eq!(*first.value, json!(7));
    assert!(replica.is_consistent(&value_key()));

    let second = replica.get(&value_key()).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(transport.fetches(), 1);
    assert_eq!(replica.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_server_invalidation_reaches_replica() {
    let (service, source) = setup_service();
    source.set(1);
    let transport = CountingTransport::new(service.clone(), WINDOW);
    let replica = Replica::new(transport.clone(), replica_config());
    replica.wait_connected().await;

    let first = replica.get(&doubled_key()).await.unwrap();
    assert_eq!(*first.value, json!(2));

    source.set(21);
    // Invalidating the dependency invalidates the subscribed dependent on the server.
    service.invalidate(&value_key());
    wait_for(|| !replica.is_consistent(&doubled_key())).await;

    // The stale value is still around until the next access.
    assert_eq!(replica.peek(&doubled_key()), Some(first.clone()));

    let second = replica.get(&doubled_key()).await.unwrap();
    assert_eq!(*second.value, json!(42));
    assert!(second.version > first.version);
    assert_eq!(transport.fetches(), 2);
    assert!(replica.is_consistent(&doubled_key()));
}

#[tokio::test(start_paused = true)]
async fn test_failures_are_refetched() {
    let (service, source) = setup_service();
    source.set(3);
    source.failing.store(true, Ordering::SeqCst);
    let transport = CountingTransport::new(service, WINDOW);
    let replica = Replica::new(transport.clone(), replica_config());
    replica.wait_connected().await;

    let err = replica.get(&value_key()).await.unwrap_err();
    assert!(matches!(
        err,
        ReplicaError::Compute(ComputeError::Failed(ref detail)) if detail == "source is failing"
    ));
    assert!(!replica.is_consistent(&value_key()));

    source.failing.store(false, Ordering::SeqCst);
    let value: u64 = replica.get_as(&value_key()).await.unwrap();
    assert_eq!(value, 3);
    assert_eq!(transport.fetches(), 2);
    assert_eq!(source.computations(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_grace_period() {
    let (service, source) = setup_service();
    source.set(5);
    let transport = CountingTransport::new(service, WINDOW);
    let replica = Replica::new(transport.clone(), replica_config());
    replica.wait_connected().await;

    let cached = replica.get(&value_key()).await.unwrap();

    transport.local().set_available(false);
    wait_for(|| !replica.is_connected()).await;

    // Within the grace period, the cached value is still trusted.
    assert_eq!(replica.get(&value_key()).await.unwrap(), cached);
    assert_eq!(transport.fetches(), 1);

    // Afterwards every access goes to the service, which is unreachable.
    time::sleep(Duration::from_millis(1500)).await;
    assert!(!replica.is_consistent(&value_key()));
    let err = replica.get(&value_key()).await.unwrap_err();
    assert!(matches!(
        err,
        ReplicaError::Transport(TransportError::Unavailable)
    ));
    assert_eq!(transport.fetches(), 2);
    assert_eq!(replica.peek(&value_key()), Some(cached));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_resubscribes() {
    let (service, source) = setup_service();
    source.set(1);
    let transport = CountingTransport::new(service.clone(), WINDOW);
    let replica = Replica::new(transport.clone(), replica_config());
    replica.wait_connected().await;
    replica.get(&value_key()).await.unwrap();

    transport.local().disconnect_all();
    wait_for(|| !replica.is_connected()).await;
    replica.wait_connected().await;

    // Anything may have changed while disconnected.
    assert!(!replica.is_consistent(&value_key()));
    source.set(2);
    service.invalidate(&value_key());
    time::sleep(WINDOW * 2).await;
    let value: u64 = replica.get_as(&value_key()).await.unwrap();
    assert_eq!(value, 2);
    assert_eq!(transport.fetches(), 2);
    assert!(replica.is_consistent(&value_key()));

    // The key was subscribed on the new session.
    source.set(3);
    service.invalidate(&value_key());
    wait_for(|| !replica.is_consistent(&value_key())).await;
    let value: u64 = replica.get_as(&value_key()).await.unwrap();
    assert_eq!(value, 3);
}

#[tokio::test(start_paused = true)]
async fn test_local_invalidation_and_purge() {
    let (service, _source) = setup_service();
    let transport = CountingTransport::new(service, WINDOW);
    let replica = Replica::new(transport.clone(), replica_config());
    replica.wait_connected().await;

    replica.get(&value_key()).await.unwrap();
    replica.get(&doubled_key()).await.unwrap();
    assert_eq!(replica.len(), 2);

    replica.invalidate(&value_key());
    assert!(!replica.is_consistent(&value_key()));
    assert!(replica.is_consistent(&doubled_key()));

    assert_eq!(replica.purge(), 1);
    assert_eq!(replica.len(), 1);
    assert_eq!(replica.peek(&value_key()), None);
}

#[tokio::test(start_paused = true)]
async fn test_disposed_replica_always_fetches() {
    let (service, _source) = setup_service();
    let transport = CountingTransport::new(service, WINDOW);
    let replica = Replica::new(transport.clone(), replica_config());
    replica.wait_connected().await;
    replica.get(&value_key()).await.unwrap();

    replica.dispose();
    wait_for(|| transport.local().hub().session_count() == 0).await;

    replica.get(&value_key()).await.unwrap();
    replica.get(&value_key()).await.unwrap();
    assert_eq!(transport.fetches(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_invalidation_during_fetch() {
    let (service, source) = setup_service();
    source.set(1);
    let transport = CountingTransport::new(service.clone(), WINDOW);
    let replica = Replica::new(transport.clone(), replica_config());
    replica.wait_connected().await;

    let release = transport.hold_next_fetch();
    let fetching = tokio::spawn({
        let replica = replica.clone();
        async move { replica.get(&value_key()).await }
    });
    wait_for(|| transport.answered() == 1).await;

    // The value changes while the answer is still on its way to the replica.
    source.set(2);
    service.invalidate(&value_key());
    time::sleep(WINDOW * 2).await;
    release.send(()).unwrap();

    let fetched = fetching.await.unwrap().unwrap();
    assert_eq!(*fetched.value, json!(1));
    assert!(!replica.is_consistent(&value_key()));

    let value: u64 = replica.get_as(&value_key()).await.unwrap();
    assert_eq!(value, 2);
    assert_eq!(transport.fetches(), 2);
    assert!(replica.is_consistent(&value_key()));
}

#[tokio::test(start_paused = true)]
async fn test_outdated_response_is_discarded() {
    let (service, source) = setup_service();
    source.set(1);
    let transport = CountingTransport::new(service.clone(), WINDOW);
    let replica = Replica::new(transport.clone(), replica_config());
    replica.wait_connected().await;

    let release = transport.hold_next_fetch();
    let slow = tokio::spawn({
        let replica = replica.clone();
        async move { replica.get(&value_key()).await }
    });
    wait_for(|| transport.answered() == 1).await;

    source.set(2);
    service.invalidate(&value_key());
    let newer = replica.get(&value_key()).await.unwrap();
    assert_eq!(*newer.value, json!(2));

    // The older answer arrives last and must not replace the newer one.
    release.send(()).unwrap();
    let result = slow.await.unwrap().unwrap();
    assert_eq!(result, newer);
    assert_eq!(replica.peek(&value_key()), Some(newer));
    assert_eq!(transport.fetches(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_redelivered_batch_is_applied_once() {
    let (service, source) = setup_service();
    source.set(1);
    let transport = CountingTransport::new(service.clone(), WINDOW);
    transport.redeliver_batches();
    let replica = Replica::new(transport.clone(), replica_config());
    replica.wait_connected().await;
    replica.get(&value_key()).await.unwrap();

    source.set(2);
    service.invalidate(&value_key());
    wait_for(|| !replica.is_consistent(&value_key())).await;
    time::sleep(WINDOW).await;

    let value: u64 = replica.get_as(&value_key()).await.unwrap();
    assert_eq!(value, 2);
    assert!(replica.is_consistent(&value_key()));

    // The second copy of the batch did not invalidate the refetched value again.
    let value: u64 = replica.get_as(&value_key()).await.unwrap();
    assert_eq!(value, 2);
    assert_eq!(transport.fetches(), 2);
    assert_eq!(source.computations(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_server_restart() {
    let (old, old_source) = setup_service();
    old_source.set(1);
    let transport = CountingTransport::new(old.clone(), WINDOW);
    let replica = Replica::new(transport.clone(), replica_config());
    replica.wait_connected().await;

    // Move the old service's versions well ahead of what a fresh service hands out.
    for _ in 0..5 {
        old.call(value_key()).await.unwrap();
        old.invalidate(&value_key());
    }
    let before = replica.get(&value_key()).await.unwrap();
    assert_eq!(before.version, 6);

    let (new, new_source) = setup_service();
    new_source.set(2);
    transport.switch_to(new.clone()).disconnect_all();
    wait_for(|| !replica.is_connected()).await;
    replica.wait_connected().await;

    let after = replica.get(&value_key()).await.unwrap();
    assert_eq!(*after.value, json!(2));
    assert!(after.version < before.version);
    assert!(replica.is_consistent(&value_key()));

    // The new service's versions are compared among themselves again.
    new_source.set(3);
    new.invalidate(&value_key());
    wait_for(|| !replica.is_consistent(&value_key())).await;
    let value: u64 = replica.get_as(&value_key()).await.unwrap();
    assert_eq!(value, 3);
    assert_eq!(transport.fetches(), 3);
}
