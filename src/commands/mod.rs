//! Command handlers for the confidant CLI.
//!
//! Each handler builds the components it needs from the loaded [`Config`];
//! nothing is shared through globals.

mod config_cmd;
mod keygen;
mod log;
mod reconcile;
mod serve;

use std::sync::Arc;

use crate::config::Config;
use crate::db::{Repository, init_db};
use crate::error::Result;
use crate::integrations::MetadataCipher;

pub use config_cmd::{handle_config_generate, handle_config_get, handle_config_show};
pub use keygen::handle_keygen;
pub use log::handle_log;
pub use reconcile::handle_reconcile;
pub use serve::handle_serve;

fn open_repository(config: &Config) -> Result<Arc<Repository>> {
    let conn = init_db(&config.db_path())?;
    Ok(Arc::new(Repository::new(conn)))
}

fn server_cipher(config: &Config) -> Result<Arc<MetadataCipher>> {
    Ok(Arc::new(MetadataCipher::from_env(config.server_key_env())?))
}
