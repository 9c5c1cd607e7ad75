//! Rate limiter timing under a paused clock.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::time::Instant;

use relay_limits::{RateLimiter, ResourceLimiter, ResourceLimits};

#[tokio::test(start_paused = true)]
async fn fifty_tasks_at_ten_per_second_take_at_least_four_point_nine_seconds() {
    let limiter = Arc::new(RateLimiter::new(10.0, 1).unwrap());
    let stamps = Arc::new(Mutex::new(Vec::new()));
    let start = Instant::now();

    let tasks = (0..50).map(|_| {
        let limiter = Arc::clone(&limiter);
        let stamps = Arc::clone(&stamps);
        async move {
            limiter.acquire().await;
            stamps.lock().push(start.elapsed());
        }
    });
    join_all(tasks).await;

    assert!(start.elapsed() >= Duration::from_millis(4_900));

    let mut stamps = stamps.lock().clone();
    stamps.sort();
    assert_eq!(stamps.len(), 50);
    for (i, first) in stamps.iter().enumerate() {
        let in_window = stamps[i..]
            .iter()
            .take_while(|t| **t < *first + Duration::from_secs(1))
            .count();
        assert!(in_window <= 11, "{in_window} dispatches within one second");
    }
}

#[tokio::test(start_paused = true)]
async fn tokens_are_granted_in_arrival_order() {
    let limiter = Arc::new(RateLimiter::new(5.0, 1).unwrap());
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for i in 0..6 {
        let limiter = Arc::clone(&limiter);
        let order = Arc::clone(&order);
        handles.push(tokio::spawn(async move {
            limiter.acquire().await;
            order.lock().push(i);
        }));
        tokio::task::yield_now().await;
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4, 5]);
}

#[tokio::test(start_paused = true)]
async fn limiter_exposes_shared_bucket() {
    let limiter = ResourceLimiter::new(ResourceLimits::default().with_rate(2.0, 2)).unwrap();
    let bucket = limiter.rate_limiter().unwrap();
    assert!(bucket.try_acquire());
    assert!(bucket.try_acquire());
    assert!(!bucket.try_acquire());
    tokio::time::advance(Duration::from_millis(500)).await;
    assert!(bucket.try_acquire());
}
