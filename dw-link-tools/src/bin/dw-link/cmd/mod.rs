pub mod discover;
pub mod list;
pub mod server;
pub mod upload;
