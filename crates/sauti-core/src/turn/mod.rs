//! Turn accumulation: fragments in, complete responses out

pub mod accumulator;
pub mod response;

pub use accumulator::Accumulator;
pub use response::{AudioFragment, CompleteResponse, PendingResponse};
