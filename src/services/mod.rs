//! Stage services: discovery, profile extraction, and the workers that
//! drain the stage queues.

pub mod discovery;
pub mod profile;
pub mod worker;

pub use discovery::DiscoveryAgent;
pub use profile::ProfileExtractor;
pub use worker::{spawn_workers, DiscoveryHandler, ProfileHandler, StageHandler, StageWorker};
