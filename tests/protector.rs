//! End-to-end RateProtector scenarios: grant spacing, FIFO order,
//! auto-release, touches, availability oracles, and shutdown.
//!
//! Everything runs on the paused tokio clock, so the timing assertions are
//! exact rather than tolerant.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tollbooth::{RateProtector, Receipt};

const DELAY: Duration = Duration::from_millis(50);
const RELEASE_TIMEOUT: Duration = Duration::from_millis(250);
const SLACK: Duration = Duration::from_millis(25);

fn protector() -> RateProtector {
    RateProtector::new("irods", DELAY, 3, RELEASE_TIMEOUT)
}

fn within(elapsed: Duration, expected: Duration) -> bool {
    elapsed >= expected && elapsed < expected + SLACK
}

#[tokio::test(start_paused = true)]
async fn grants_are_spaced_and_auto_release_recovers_capacity() {
    let rp = protector();
    let start = Instant::now();

    let mut holders = Vec::new();
    for _ in 0..3 {
        let receipt = rp.request(1).unwrap();
        let rp = rp.clone();
        holders.push(tokio::spawn(async move {
            assert!(rp.wait_until_granted(&receipt).await);
            start.elapsed()
        }));
    }

    // the pool is spoken for; the fourth grant needs the inactivity
    // watchdog to reclaim the first holder's token
    let fourth = rp.request(1).unwrap();
    assert!(rp.wait_until_granted(&fourth).await);
    assert!(within(start.elapsed(), RELEASE_TIMEOUT), "fourth at {:?}", start.elapsed());
    rp.release(&fourth);

    let mut grant_times: Vec<Duration> = futures::future::join_all(holders)
        .await
        .into_iter()
        .map(|result| result.unwrap())
        .collect();
    grant_times.sort();
    for (i, at) in grant_times.iter().enumerate() {
        assert!(within(*at, DELAY * i as u32), "grant {} at {:?}", i, at);
    }
}

#[tokio::test(start_paused = true)]
async fn requesting_more_tokens_than_the_pool_fails_synchronously() {
    let rp = protector();
    let err = rp.request(4).unwrap_err();
    assert!(err.is_over_maximum_tokens());
    assert_eq!(err.to_string(), "requested 4 tokens but the pool holds at most 3");
}

#[tokio::test(start_paused = true)]
async fn the_whole_pool_can_go_to_a_single_request() {
    let rp = protector();
    let start = Instant::now();

    let big = rp.request(3).unwrap();
    assert!(rp.wait_until_granted(&big).await);
    assert!(start.elapsed() < SLACK);

    let next = rp.request(1).unwrap();
    {
        let rp = rp.clone();
        let big = big.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(75)).await;
            rp.release(&big);
        });
    }
    assert!(rp.wait_until_granted(&next).await);
    assert!(within(start.elapsed(), Duration::from_millis(75)), "{:?}", start.elapsed());
}

#[tokio::test(start_paused = true)]
async fn a_quiet_full_pool_holder_is_reclaimed() {
    let rp = protector();
    let start = Instant::now();

    let big = rp.request(3).unwrap();
    assert!(rp.wait_until_granted(&big).await);

    let next = rp.request(1).unwrap();
    assert!(rp.wait_until_granted(&next).await);
    assert!(within(start.elapsed(), RELEASE_TIMEOUT), "{:?}", start.elapsed());
    assert_eq!(rp.granted(&big), (false, false));
}

#[tokio::test(start_paused = true)]
async fn touch_defers_auto_release() {
    let rp = protector();
    let start = Instant::now();

    let big = rp.request(3).unwrap();
    assert!(rp.wait_until_granted(&big).await);
    {
        let rp = rp.clone();
        let big = big.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(75)).await;
            rp.touch(std::slice::from_ref(&big));
        });
    }

    let next = rp.request(1).unwrap();
    assert!(rp.wait_until_granted(&next).await);
    assert!(
        within(start.elapsed(), RELEASE_TIMEOUT + Duration::from_millis(75)),
        "{:?}",
        start.elapsed()
    );
}

#[tokio::test(start_paused = true)]
async fn touch_covers_multiple_receipts_at_once() {
    let rp = protector();
    let a = rp.request(1).unwrap();
    let b = rp.request(1).unwrap();
    assert!(rp.wait_until_granted(&a).await); // granted at 0ms
    assert!(rp.wait_until_granted(&b).await); // granted at 50ms

    // t=125ms: refresh both inactivity timers in one call
    tokio::time::sleep(Duration::from_millis(75)).await;
    rp.touch(&[a.clone(), b.clone()]);

    // t=350ms: without the touch both would have expired (at 250ms and
    // 300ms); with it they live until 375ms
    tokio::time::sleep(Duration::from_millis(225)).await;
    assert!(rp.wait_until_granted(&a).await);
    assert!(rp.wait_until_granted(&b).await);

    // t=400ms: past the refreshed deadline, both reclaimed
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(rp.granted(&a), (false, false));
    assert_eq!(rp.granted(&b), (false, false));
}

#[tokio::test(start_paused = true)]
async fn wait_timeout_cancels_the_pending_request() {
    let rp = protector();
    let start = Instant::now();

    let holder = rp.request(3).unwrap();
    assert!(rp.wait_until_granted(&holder).await);

    let pending = rp.request(1).unwrap();
    assert!(!rp.wait_until_granted_timeout(&pending, Duration::from_millis(75)).await);
    assert!(within(start.elapsed(), Duration::from_millis(75)));

    // the holder is untouched; the cancelled receipt is dead for good
    assert!(rp.wait_until_granted(&holder).await);
    rp.release(&holder);
    assert!(!rp.wait_until_granted(&holder).await);
    assert!(!rp.wait_until_granted(&pending).await);
}

#[tokio::test(start_paused = true)]
async fn release_after_frees_the_pool_later() {
    let rp = protector();
    let start = Instant::now();

    let big = rp.request(3).unwrap();
    assert!(rp.wait_until_granted(&big).await);
    rp.release_after(&big, Duration::from_millis(75));

    let next = rp.request(1).unwrap();
    assert!(rp.wait_until_granted(&next).await);
    assert!(within(start.elapsed(), Duration::from_millis(75)), "{:?}", start.elapsed());
    rp.release(&next);

    // the receipt released by the timer is stale everywhere now
    rp.release(&big);
    rp.touch(std::slice::from_ref(&big));
    assert!(!rp.wait_until_granted(&big).await);
}

#[tokio::test(start_paused = true)]
async fn polling_granted_is_an_alternative_to_waiting() {
    let rp = protector();

    let big = rp.request(3).unwrap();
    assert!(rp.wait_until_granted(&big).await);
    rp.release_after(&big, Duration::from_millis(75));

    let next = rp.request(1).unwrap();
    assert_eq!(rp.granted(&next), (false, true));
    tokio::time::sleep(Duration::from_millis(25)).await;
    assert_eq!(rp.granted(&next), (false, true));
    tokio::time::sleep(Duration::from_millis(75)).await;
    assert_eq!(rp.granted(&next), (true, false));
    rp.release(&next);
    assert_eq!(rp.granted(&next), (false, false));
}

#[tokio::test(start_paused = true)]
async fn polling_a_granted_receipt_counts_as_activity() {
    let rp = protector();
    let receipt = rp.request(1).unwrap();
    assert!(rp.wait_until_granted(&receipt).await);

    // each successful poll resets the inactivity timer
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(rp.granted(&receipt), (true, false));
    }

    // go quiet and the watchdog reclaims the token
    tokio::time::sleep(RELEASE_TIMEOUT + SLACK).await;
    assert_eq!(rp.granted(&receipt), (false, false));
}

#[tokio::test(start_paused = true)]
async fn quick_releases_still_respect_grant_spacing() {
    let rp = protector();
    let start = Instant::now();

    let mut handles = Vec::new();
    for _ in 0..9 {
        let receipt = rp.request(1).unwrap();
        let rp = rp.clone();
        handles.push(tokio::spawn(async move {
            assert!(rp.wait_until_granted(&receipt).await);
            let at = start.elapsed();
            tokio::time::sleep(Duration::from_millis(25)).await;
            rp.release(&receipt);
            at
        }));
    }

    let mut grant_times: Vec<Duration> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|result| result.unwrap())
        .collect();
    grant_times.sort();
    for (i, at) in grant_times.iter().enumerate() {
        assert!(within(*at, DELAY * i as u32), "grant {} at {:?}", i, at);
    }
}

#[tokio::test(start_paused = true)]
async fn zero_delay_grants_as_fast_as_capacity_allows() {
    let rp = RateProtector::new("fast", Duration::ZERO, 3, RELEASE_TIMEOUT);
    let start = Instant::now();

    let mut handles = Vec::new();
    for _ in 0..9 {
        let receipt = rp.request(1).unwrap();
        let rp = rp.clone();
        handles.push(tokio::spawn(async move {
            assert!(rp.wait_until_granted(&receipt).await);
            let at = start.elapsed();
            rp.release(&receipt);
            at
        }));
    }

    for result in futures::future::join_all(handles).await {
        assert!(result.unwrap() < SLACK);
    }
}

#[tokio::test(start_paused = true)]
async fn grants_issue_in_request_order() {
    let rp = RateProtector::new("fifo", Duration::from_millis(10), 1, Duration::from_secs(5));
    let receipts: Vec<Receipt> = (0..5).map(|_| rp.request(1).unwrap()).collect();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for (i, receipt) in receipts.iter().enumerate() {
        let rp = rp.clone();
        let order = order.clone();
        let receipt = receipt.clone();
        handles.push(tokio::spawn(async move {
            assert!(rp.wait_until_granted(&receipt).await);
            order.lock().unwrap().push(i);
            rp.release(&receipt);
        }));
    }
    futures::future::join_all(handles).await;

    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test(start_paused = true)]
async fn availability_callback_can_starve_the_queue() {
    let rp = protector();
    let calls = Arc::new(AtomicU32::new(0));
    {
        let calls = calls.clone();
        rp.set_availability_callback(move || {
            // too busy for the first two grant attempts
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                2
            } else {
                3
            }
        });
    }

    let start = Instant::now();
    let receipt = rp.request(3).unwrap();
    assert!(rp.wait_until_granted(&receipt).await);
    assert!(within(start.elapsed(), DELAY * 2), "{:?}", start.elapsed());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn shutdown_denies_pending_and_future_requests() {
    let rp = protector();

    let granted = rp.request(1).unwrap();
    assert!(rp.wait_until_granted(&granted).await);
    let pending = rp.request(1).unwrap();

    rp.shutdown();

    assert!(!rp.wait_until_granted(&pending).await);
    assert!(rp.request(1).unwrap_err().is_shut_down());
    // held state is dropped with everything else
    assert_eq!(rp.granted(&granted), (false, false));

    rp.shutdown(); // idempotent
    assert!(rp.request(1).unwrap_err().is_shut_down());
}

#[tokio::test(start_paused = true)]
async fn stale_receipt_operations_are_no_ops() {
    let rp = protector();

    let receipt = rp.request(1).unwrap();
    rp.touch(std::slice::from_ref(&receipt)); // pending: ignored
    rp.release(&receipt); // pending: ignored
    assert!(rp.wait_until_granted(&receipt).await);

    rp.release(&receipt);
    rp.release(&receipt);
    rp.touch(std::slice::from_ref(&receipt));
    assert_eq!(rp.granted(&receipt), (false, false));
    assert!(!rp.wait_until_granted(&receipt).await);
}
