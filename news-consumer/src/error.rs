use news_common::message::MessageError;
use thiserror::Error;

use crate::store::StoreError;

/// Enumeration of errors that can fail one message's trip through the
/// pipeline. Transient errors are retried with backoff; everything else
/// dead-letters the message with its original payload.
///
/// Classifier errors are deliberately absent: they are recovered in place
/// with the fallback category and never fail a message.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid message: {0}")]
    Validation(#[from] MessageError),
    #[error("storage failed: {0}")]
    Store(#[from] StoreError),
}

impl PipelineError {
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Validation(_) => false,
            PipelineError::Store(error) => error.is_transient(),
        }
    }
}

/// Enumeration of errors related to consuming from the broker.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),
    #[error("storage initialization failed: {0}")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_permanent() {
        let error = PipelineError::Validation(MessageError::MissingField("link"));
        assert!(!error.is_transient());
    }

    #[test]
    fn store_conflicts_are_transient() {
        let error = PipelineError::Store(StoreError::Conflict);
        assert!(error.is_transient());
    }
}
