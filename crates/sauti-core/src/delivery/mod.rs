//! Chunk scheduling and parallel lane delivery

pub mod lanes;
pub mod scheduler;

pub use lanes::{deliver, DeliveryOutcome};
pub use scheduler::{plan, DeliveryUnit};
