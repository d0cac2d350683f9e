mod common;

use common::test_helpers::MockServer;
use fhirbatch::{CoordinatorEvent, FhirError, RequestOptions};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn clear_aborts_pending_and_active_requests() {
    let server = MockServer::echo().with_latency(Duration::from_secs(1));
    let c = server.coordinator().max_requests_per_batch(1).max_active_requests(1).build().unwrap();
    let mut events = c.subscribe();

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let c = c.clone();
            tokio::spawn(async move { c.get(&format!("Patient/{i}"), RequestOptions::default()).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!((c.active_requests(), c.pending_requests()), (1, 3));

    c.clear_pending_requests();

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap_err(), FhirError::Aborted);
    }
    assert_eq!((c.active_requests(), c.pending_requests()), (0, 0));
    assert_eq!(events.recv().await.unwrap(), CoordinatorEvent::Cleared { pending: 3, active: 1 });
    assert_eq!(server.exchanges(), 1);

    // Still usable afterwards.
    let response = c.get("Patient/after", RequestOptions::default()).await.unwrap();
    assert_eq!(response.data["id"], "after");
}

#[tokio::test(start_paused = true)]
async fn clear_cancels_the_debounce_window() {
    let server = MockServer::echo();
    let c = server.coordinator().batch_timeout(Duration::from_millis(100)).build().unwrap();

    let waiting = {
        let c = c.clone();
        tokio::spawn(async move { c.get("Patient/1", RequestOptions::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    c.clear_pending_requests();

    assert!(waiting.await.unwrap().unwrap_err().is_aborted());
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(server.exchanges(), 0);
}
