pub mod address;
pub mod config;
pub mod controller;
pub mod errors;
pub mod forwarder;
pub mod lookup;
pub mod message;
pub mod orchestrator;
pub mod router;
pub mod rpc;
pub mod scheduler;
pub mod state;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;

