//! Background jobs.
//!
//! The only recurring job is the retention sweep, driven by
//! [`RetentionScheduler`] on a tokio interval.

mod scheduler;

pub use scheduler::{RetentionScheduler, SchedulerHandle};
