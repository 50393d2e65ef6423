use thiserror::Error;

use crate::engine::declaration::DeclarationError;
use crate::engine::error::FormulaError;
use crate::event_bus::EventError;
use crate::refresher::RefresherError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Formula error: {0}")]
    Formula(#[from] FormulaError),
    #[error("Declaration error: {0}")]
    Declaration(#[from] DeclarationError),
    #[error("Event error: {0}")]
    Event(#[from] EventError),
    #[error("Refresher error: {0}")]
    Refresher(#[from] RefresherError),
    #[error("Config error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type InternalResult<T> = Result<T, Error>;

impl Error {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Error::Internal(message.into())
    }
}
