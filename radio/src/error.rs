//! Engine errors

use radio_discovery::SelectionError;
use radio_io::SocketError;
use std::io;
use thiserror::Error;

/// Errors that stop an engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid option: {0}")]
    InvalidOption(String),

    #[error("Socket error: {0}")]
    Socket(#[from] SocketError),

    #[error("Selection error: {0}")]
    Selection(#[from] SelectionError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to spawn {unit}: {source}")]
    Spawn {
        unit: &'static str,
        #[source]
        source: io::Error,
    },
}
