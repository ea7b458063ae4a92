//! Virtual-time testing toolkit.
//!
//! [`VirtualScheduler`] replaces real timers with a clock the test drives by
//! hand, and [`TestProbe`] records what a producer emitted so the test can
//! assert on it afterwards.
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use vtime::{TestProbe, VirtualScheduler, interval};
//!
//! let scheduler = VirtualScheduler::new();
//! let probe = Arc::new(TestProbe::new());
//! interval(&scheduler, Duration::from_secs(1))?
//!     .take(5)
//!     .subscribe(Arc::clone(&probe))?;
//!
//! scheduler.advance_time_by(Duration::from_secs(5))?;
//! probe.assert_values(&[0, 1, 2, 3, 4]).assert_complete();
//! # Ok::<(), vtime::Error>(())
//! ```

pub mod config;
pub mod error;
pub mod observer;
pub mod probe;
pub mod scheduler;
pub mod source;

pub use config::{ErrorPolicy, SchedulerConfig};
pub use error::{ActionFailure, ActionFailures, Error, Result};
pub use observer::{Observer, Subscription};
pub use probe::{DeliveryThread, TestProbe};
pub use scheduler::{
    Action, ActionHandle, ActionId, Clock, Seq, SweepReport, TimerScheduler, VirtualScheduler,
    WeakScheduler,
};
pub use source::{Interval, Timer, interval, timer};
