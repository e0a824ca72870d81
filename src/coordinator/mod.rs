//! Carry coordinator
//!
//! Owns the stream client, the position tracker and the venue handles, and runs
//! the periodic refresh that feeds the display.

pub mod coordinator;
pub mod display;

pub use coordinator::{resolve_base_price, Coordinator, CoordinatorParams, ReadySignal};
pub use display::{Dashboard, DisplaySink, LogDisplay};
