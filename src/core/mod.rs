/*!
 * Core Module
 * Fundamental trace store types, limits, clocks and error handling
 */

pub mod errors;
pub mod limits;
pub mod sync;
pub mod time;
pub mod types;

// Re-export for convenience
pub use errors::*;
pub use sync::{Event, ResetMode};
pub use time::SessionClock;
pub use types::*;
