#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Tollbooth 🚦
//!
//! Admission-control primitives for job execution: throttle concurrent work
//! against shared resources without a central scheduler lock.
//!
//! ## Components
//!
//! - **[`GroupLimiter`]** — atomically acquire one unit of concurrency
//!   across N named groups; each group carries a count, time-window, or
//!   date-window rule resolved through a caller-supplied callback
//! - **[`RateProtector`]** — a bounded token pool with minimum inter-grant
//!   spacing, FIFO granting, and auto-release of inactive holders
//! - **[`GroupRule`]** — the capacity rules and the group-name grammar that
//!   encodes time/date rules directly in group names
//!
//! Both primitives are purely in-memory and process-local, internally
//! synchronized, and safe for any number of concurrent callers.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use tollbooth::{GroupLimiter, GroupRule, RateProtector, TollboothError};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), TollboothError> {
//!     // Admit work across two named dimensions at once.
//!     let limiter = GroupLimiter::new(|name| match name {
//!         "cpu" => GroupRule::Count(8),
//!         "db" => GroupRule::Count(2),
//!         other => GroupRule::from_group_name(other),
//!     });
//!     assert!(limiter.increment(&["cpu", "db"]));
//!     limiter.decrement(&["cpu", "db"]);
//!
//!     // Dispense tokens for a delicate backend: at most 2 out at a time,
//!     // 10ms apart, clawed back after 1s of holder inactivity.
//!     let protector =
//!         RateProtector::new("backend", Duration::from_millis(10), 2, Duration::from_secs(1));
//!     let receipt = protector.request(1)?;
//!     assert!(protector.wait_until_granted(&receipt).await);
//!     protector.release(&receipt);
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod limiter;
pub mod protector;
pub mod rule;

// Re-exports
pub use error::TollboothError;
pub use limiter::{GroupLimiter, ResolutionCallback};
pub use protector::{AvailabilityCallback, RateProtector, Receipt};
pub use rule::GroupRule;
