// Core infrastructure shared by the store and the coordination engine

pub mod clock;
pub mod config;
pub mod errors;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CoordConfig, CoordConfigBuilder, StoreConfig};
pub use errors::{Result, ScoutError};
