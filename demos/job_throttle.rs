//! Runs a burst of jobs through both primitives: the limiter caps
//! concurrency per resource dimension, the protector paces access to a
//! delicate backend.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tollbooth::{GroupLimiter, GroupRule, RateProtector};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let limiter = GroupLimiter::new(|name| match name {
        "cluster" => GroupRule::Count(4),
        "db" => GroupRule::Count(2),
        other => GroupRule::from_group_name(other),
    });
    let protector =
        RateProtector::new("object-store", Duration::from_millis(20), 2, Duration::from_secs(2));

    let completed = Arc::new(AtomicUsize::new(0));
    let mut jobs = Vec::new();
    for job in 0..8 {
        let limiter = limiter.clone();
        let protector = protector.clone();
        let completed = completed.clone();
        jobs.push(tokio::spawn(async move {
            let groups = ["cluster", "db"];
            assert!(limiter.increment_within(&groups, Duration::from_secs(10)).await);

            let receipt = protector.request(1).expect("within pool size");
            assert!(protector.wait_until_granted(&receipt).await);
            println!("job {job}: admitted, token in hand");

            tokio::time::sleep(Duration::from_millis(50)).await;

            protector.release(&receipt);
            limiter.decrement(&groups);
            completed.fetch_add(1, Ordering::SeqCst);
        }));
    }

    for job in jobs {
        job.await?;
    }
    assert_eq!(completed.load(Ordering::SeqCst), 8);
    println!("all jobs completed");

    protector.shutdown();
    Ok(())
}
