pub mod register_cache;

pub use register_cache::{CacheEntry, CachedValue, RegisterCache, UpdateSource, ValueChange};
