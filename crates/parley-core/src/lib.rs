pub mod backend;
pub mod chat;
pub mod errors;
pub mod events;
pub mod ids;
pub mod stream;
