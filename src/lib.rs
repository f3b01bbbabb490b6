pub mod bindings;
pub mod config;
pub mod console;
pub mod devices;
pub mod engine;
pub mod error;
pub mod feedback;
pub mod platform;
