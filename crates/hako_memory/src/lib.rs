//! Hako Memory Access Layer
//!
//! The byte-oriented side of the foreign-call boundary: everything that is not
//! a plain integer crosses it as a buffer in linear guest memory.
//!
//! - Buffer allocation and release
//! - Scalar read/write at addresses (little-endian)
//! - Byte-range copy and slicing
//! - NUL-terminated UTF-8 string encode/decode

mod linear;

pub use linear::{Address, LinearMemory, MemoryError, DEFAULT_MEMORY_LIMIT};

pub type Result<T> = std::result::Result<T, MemoryError>;
