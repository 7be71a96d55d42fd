pub mod mock;
pub mod ndjson;
pub mod ollama;

pub use mock::{MockBackend, MockStream};
pub use ollama::{BackendConfig, OllamaBackend};
