// src/error.rs
use crate::principal::NodeId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("wire decode failed: {0}")]
    Decode(#[from] bincode::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no address known for node: {0}")]
    AddrUnknown(NodeId),
}
