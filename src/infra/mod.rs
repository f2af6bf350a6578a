//! Infrastructure adapters for the shared reservation state.

pub mod store;

pub use store::InMemoryStore;
#[cfg(feature = "redis-store")]
pub use store::RedisStore;
