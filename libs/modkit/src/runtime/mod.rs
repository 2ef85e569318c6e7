mod runner;
pub mod shutdown;

pub use runner::{Application, ShutdownOptions, DEFAULT_SHUTDOWN_TIMEOUT};
