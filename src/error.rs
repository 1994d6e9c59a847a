//! Error types for relaymq.

use std::io;

use thiserror::Error;

/// Main error type for relaymq.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Framing errors.
///
/// An incomplete frame is never an error (the codec reports it as "need more
/// bytes"); these variants are fatal to the connection that produced them.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed remaining length encoding")]
    MalformedLength,

    #[error("Packet body ends short: need {needed} bytes, have {have}")]
    TruncatedBody { needed: usize, have: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
