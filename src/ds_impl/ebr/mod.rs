pub mod concurrent_map;

pub mod hash_map;

pub use self::concurrent_map::ConcurrentMap;

pub use self::hash_map::HashMap;
