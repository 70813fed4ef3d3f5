//! Hako Metrics - Bridge bookkeeping counters
//!
//! Counts handle allocations, releases, callback dispatches and pending-job
//! executions. Everything compiles away in production builds via the
//! `metrics` feature flag.
//!
//! # Feature Flags
//!
//! - `metrics` - Enable counter collection (default: disabled)
//!
//! # Usage
//!
//! ```ignore
//! use hako_metrics::Counter;
//!
//! let mut counter = Counter::new();
//! counter.increment("handles.allocated", 1);
//! assert_eq!(counter.get("handles.allocated"), 1);
//! ```

#[cfg(feature = "metrics")]
mod counter;

#[cfg(feature = "metrics")]
pub use counter::Counter;

// ============================================================================
// Macros for conditional compilation
// ============================================================================

/// Execute code only when metrics are enabled
#[macro_export]
macro_rules! metrics {
    ($($tt:tt)*) => {
        #[cfg(feature = "metrics")]
        {
            $($tt)*
        }
    };
}

// ============================================================================
// No-op stubs when metrics disabled
// ============================================================================

#[cfg(not(feature = "metrics"))]
#[derive(Debug, Default)]
pub struct Counter;

#[cfg(not(feature = "metrics"))]
impl Counter {
    pub fn new() -> Self { Self }
    pub fn increment(&mut self, _name: &str, _value: usize) {}
    pub fn get(&self, _name: &str) -> usize { 0 }
    pub fn snapshot(&self) -> Vec<(String, usize)> { Vec::new() }
}
