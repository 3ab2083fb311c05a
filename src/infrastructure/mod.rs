pub mod bluetooth;
pub mod codec;
pub mod logging;
