//! Shared NAS runtime primitives.
//!
//! Currently hosts the NAS timer service used by the EMM procedures.

pub mod timer;

pub use timer::{NasTimerId, NasTimerMgr, NAS_TIMER_INACTIVE_ID};
