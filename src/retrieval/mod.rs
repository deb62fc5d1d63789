pub mod engine;
pub mod types;
pub mod walker;

pub use engine::{RetrievalEngine, Strategy};
pub use types::RetrievedContext;
