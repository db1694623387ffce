use std::error::Error as StdError;

use thiserror::Error;

/// A boxed source error attached to an extraction or application failure.
pub type Source = Box<dyn StdError + Send + Sync + 'static>;

/// The error taxonomy of the replication core.
///
/// Only four kinds exist. Filter failures are not one of them: a filter
/// returning `None` is suppression, and a filter that fails outright is
/// escalated as [`Error::Application`] by the stage loop.
#[derive(Debug, Error)]
pub enum Error {
    /// Upstream decoding or extraction failed. Whether this stops the
    /// stage or is logged and retried at the next poll is decided by the
    /// stage's extractor failure policy.
    #[error("extraction failed: {message}")]
    Extraction {
        /// Human-readable description of the failure.
        message: String,
        /// The underlying driver or decoder error, when one exists.
        #[source]
        source: Option<Source>,
    },

    /// Downstream apply failed. Carries the exact restart coordinates so
    /// a stop-policy notification can name the event that did not commit.
    #[error("apply failed at seqno {seqno} ({event_id}): {message}")]
    Application {
        /// Sequence number of the event that failed to apply.
        seqno: u64,
        /// Upstream position string of the failing event.
        event_id: String,
        /// Human-readable description of the failure.
        message: String,
        /// The underlying driver error, when one exists.
        #[source]
        source: Option<Source>,
    },

    /// Cooperative shutdown. Not a failure: blocked waits return this once
    /// their queue or watermark has been closed, and the stage loop unwinds
    /// any open transaction before exiting.
    #[error("task canceled")]
    Canceled,

    /// An impossible state: seqno regress, an out-of-range partition, a
    /// bounded queue exhausted past its bounded wait, a PK probe returning
    /// null under a non-empty count. Always fatal, never retried.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl Error {
    /// Build an extraction error without an underlying source.
    pub fn extraction(message: impl Into<String>) -> Error {
        Error::Extraction {
            message: message.into(),
            source: None,
        }
    }

    /// Build an application error for `event` coordinates without an
    /// underlying source.
    pub fn application(seqno: u64, event_id: impl Into<String>, message: impl Into<String>) -> Error {
        Error::Application {
            seqno,
            event_id: event_id.into(),
            message: message.into(),
            source: None,
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
