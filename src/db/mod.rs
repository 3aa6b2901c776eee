//! SQLite persistence: the project catalog, version histories, the event
//! log, integrations and the job queue.

mod events;
mod integrations;
mod jobs;
mod models;
mod repository;
mod schema;
mod versions;

pub use models::{ConfigEntity, Environment, Project};
pub use repository::Repository;
pub use schema::{init_db, init_in_memory};
