pub mod events;
pub mod hub;
pub mod ingest;
pub mod media;
pub mod model;
pub mod orchestrator;
pub mod progress;
pub mod queue;
pub mod store;
pub mod webhook;
pub mod worker;

#[cfg(test)]
pub mod testing;
