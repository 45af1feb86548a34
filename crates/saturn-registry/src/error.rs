use saturn_common::SaturnError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Registry backend disconnected")]
    Disconnected,

    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("No such node: {0}")]
    NoNode(String),

    #[error("Registry error: {0}")]
    Saturn(#[from] SaturnError),
}

pub type Result<T> = std::result::Result<T, RegistryError>;
