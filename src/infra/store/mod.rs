//! Reservation store backends.

pub mod memory;
#[cfg(feature = "redis-store")]
pub mod redis;

pub use memory::InMemoryStore;
#[cfg(feature = "redis-store")]
pub use self::redis::RedisStore;
