pub mod config;
pub mod errors;
pub mod kernel;
pub mod session;
pub mod traits;
pub mod types;
