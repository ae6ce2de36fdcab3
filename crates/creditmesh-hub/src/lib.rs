pub mod orchestrator;

pub use orchestrator::{resolve_pid, HubConfig, Orchestrator, TickReport};
