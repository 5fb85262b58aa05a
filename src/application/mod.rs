pub mod cached_store;
pub mod error;
pub mod optimizer;
pub mod repos;
