//! Common infrastructure for mock devices.
//!
//! Provides reusable components for building mock hardware drivers:
//!
//! - **mode**: Operational modes (Instant, Realistic, Chaos)
//! - **errors**: Error injection framework
//! - **rng**: Seeded random number generator
//! - **journal**: Shared record of motion commands

pub mod errors;
pub mod journal;
pub mod mode;
pub mod rng;

// Re-export commonly used types
pub use errors::{ErrorConfig, ErrorScenario};
pub use journal::{JournalEntry, MotionJournal};
pub use mode::MockMode;
pub use rng::MockRng;
