//! Cache backend abstraction and the in-memory reference backend

pub mod memory;
pub mod traits;

pub use memory::{InMemoryCache, InMemorySession};
pub use traits::{is_cancellation, AtomicOps, CacheBackend, CacheError};
