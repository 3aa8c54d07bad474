use std::time::Duration;

use computed_service::hub::InvalidationHub;
use computed_service::transport::TransportError;
use tokio::time;
use uuid::Uuid;

use crate::{doubled_key, setup_service, value_key};

#[tokio::test(start_paused = true)]
async fn test_burst_is_pushed_as_one_batch() {
    let (service, _source) = setup_service();
    let hub = InvalidationHub::new(service.clone(), Duration::from_millis(100));
    service.call(doubled_key()).await.unwrap();

    let mut session = hub.open(None);
    hub.subscribe(session.id, [value_key(), doubled_key()])
        .unwrap();

    for _ in 0..3 {
        service.invalidate(&value_key());
        service.call(doubled_key()).await.unwrap();
        time::sleep(Duration::from_millis(20)).await;
    }

    let batch = session.batches.recv().await.unwrap();
    assert_eq!(batch.keys, vec![doubled_key(), value_key()]);
    let next = time::timeout(Duration::from_millis(500), session.batches.recv()).await;
    assert!(next.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_sessions_have_their_own_window() {
    let (service, _source) = setup_service();
    let hub = InvalidationHub::new(service.clone(), Duration::from_secs(10));
    service.call(value_key()).await.unwrap();

    let mut slow = hub.open(None);
    let mut fast = hub.open(Some(Duration::ZERO));
    hub.subscribe(slow.id, [value_key()]).unwrap();
    hub.subscribe(fast.id, [value_key()]).unwrap();

    let start = time::Instant::now();
    service.invalidate(&value_key());

    let batch = fast.batches.recv().await.unwrap();
    assert_eq!(batch.keys, vec![value_key()]);
    assert_eq!(start.elapsed(), Duration::ZERO);

    let batch = slow.batches.recv().await.unwrap();
    assert_eq!(batch.keys, vec![value_key()]);
    assert!(start.elapsed() >= Duration::from_secs(10));
}

#[tokio::test]
async fn test_unknown_session() {
    let (service, _source) = setup_service();
    let hub = InvalidationHub::new(service, Duration::ZERO);
    let session = Uuid::new_v4();
    let err = hub.subscribe(session, [value_key()]).unwrap_err();
    assert!(matches!(err, TransportError::UnknownSession(id) if id == session));
}

#[tokio::test(start_paused = true)]
async fn test_sessions_close_with_the_service() {
    let (service, _source) = setup_service();
    let hub = InvalidationHub::new(service.clone(), Duration::from_millis(100));
    let mut session = hub.open(None);

    service.dispose();
    assert!(session.batches.recv().await.is_none());
    assert_eq!(hub.session_count(), 0);
    assert_eq!(
        service.call(value_key()).await.unwrap_err(),
        computed_service::ComputeError::Disposed
    );
}
