//! # TimeLoop Scheduler
//!
//! Unlocks time capsules when their date arrives and tells their owners.
//!
//! ## Design Principles
//! - SQLite persistence, one conditional `UPDATE` per state change
//! - Many sweepers may run at once; the claim decides who unlocks
//! - At most one unlock notification per capsule, failures go to a retry queue
//! - Injected clock, explicit timer, cancellable sweeps
//!
//! ## Architecture
//! ```text
//! SweepTimer (tokio interval, injected Clock)
//!   └── Sweeper.sweep(now)
//!         ├── recover stale claims (Unlocking older than the lease)
//!         ├── scan due capsules, page by page
//!         │     ├── malformed → flag needs_review
//!         │     └── claim (Locked→Unlocking) → commit (Unlocking→Unlocked)
//!         └── dispatch (bounded, with timeout) → FanoutDispatcher
//!                                                  ├── Inbox (SQLite)
//!                                                  ├── Push gateway (HTTP)
//!                                                  └── Webhook (HTTP)
//!               failed / timed out → RetryQueue ← RedeliveryTimer
//! ```

pub mod accounts;
pub mod capsule;
pub mod clock;
pub mod dispatch;
pub mod notify;
pub mod persistence;
pub mod report;
pub mod retry;
pub mod store;
pub mod sweeper;
pub mod timer;

pub use accounts::{DeviceDirectory, UserRecord};
pub use capsule::{
    Capsule, CapsuleId, CapsuleState, EventKind, NewCapsule, NotificationPayload, UserId,
    ValidationError, Visibility,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatch::{DeliveryResult, Dispatcher, FanoutDispatcher, dispatchers_from_config};
pub use notify::{Inbox, InboxEntry, Notification};
pub use persistence::TimeLoopDb;
pub use report::{SweepEvent, SweepObserver, SweepReport, TracingObserver};
pub use retry::{Redeliverer, RedeliveryReport, RetryPolicy, RetryQueue, RetryStatus};
pub use store::{CapsuleStore, MemoryCapsuleStore, StoreError};
pub use sweeper::{SweepError, SweepSettings, Sweeper};
pub use timer::{RedeliveryTimer, SweepTimer};
