//! Combining the historical and real-time feeds into one daily timeline.

pub mod daily;
pub mod reconcile;

pub use daily::daily_means;
pub use reconcile::{reconcile, DateRange, Reconciled};
