pub mod cache;
pub mod channel;
pub mod cli;
pub mod config;
pub mod engine;
pub mod ingress;
pub mod logging;
pub mod pipeline;
pub mod resources;
pub mod sinks;
pub mod statestore;
pub mod supervisor;
pub mod transition;
