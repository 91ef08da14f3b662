//! Crate-level error type.

use std::io;

use thiserror::Error;

use crate::codec::DecodeError;
use crate::config::ConfigError;
use crate::node::NodeError;
use crate::stratum::ServerError;
use crate::template::TemplateError;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
