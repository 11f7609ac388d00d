//! Model lifecycle management.
//!
//! Model instances are the scarcest resource warden governs: loading one
//! is slow and pins memory, so a [`ModelManager`] keeps a bounded pool of
//! them, loads each on first use and evicts the least recently used when
//! the pool is full. The inference engine itself is behind the
//! [`ModelBackend`] trait.

mod backend;
mod manager;

pub use backend::{GenerateRequest, ModelBackend};
pub use manager::{ModelHandle, ModelInfo, ModelManager, ModelManagerConfig};
pub(crate) use manager::validate_model_id;
