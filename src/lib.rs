pub mod campaign;
pub mod config;
pub mod dag;
pub mod errors;
pub mod lock;
pub mod operator;
pub mod orchestrator;
pub mod store;
pub mod telemetry;

pub use orchestrator::{RunEngine, TickReport};
pub use store::StateStore;
