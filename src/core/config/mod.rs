pub mod data;
pub mod io;
pub mod orchestrator;
pub mod printing;

pub use data::Config;
pub use io::ConfigError;
pub use orchestrator::ConfigOrchestrator;
