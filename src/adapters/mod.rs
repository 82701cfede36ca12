pub mod memory;
pub mod redis_store;
pub mod store;

pub use memory::InMemoryStore;
pub use redis_store::RedisStore;
pub use store::{load_json, save_json, CoordinationStore, StoreKeys};
