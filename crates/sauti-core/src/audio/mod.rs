//! Audio container handling and fallback synthesis

pub mod container;
pub mod tone;

pub use container::{is_container, reheader, unwrap, wrap, ContainerHeader, HEADER_LEN};
pub use tone::placeholder_tone;
