use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrumeError>;

/// Error kinds surfaced by the page infrastructure.
///
/// `Corruption` is fatal: it reports an invariant that only a bug or a
/// damaged store can break (a missing stripe tail, a looping meta-page
/// chain, a list pointer that does not point back). Callers must not
/// retry past it.
#[derive(Debug, Error)]
pub enum BrumeError {
    #[error("I/O: {0}")]
    Io(#[from] io::Error),
    #[error("corruption: {0}")]
    Corruption(&'static str),
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
}
