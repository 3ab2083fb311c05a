pub mod accumulator;
pub mod checkpoint;
pub mod codec;
pub mod download;
pub mod models;
pub mod scheduler;
pub mod session;
pub mod settings;
