/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use std::fmt;

/// Boxed error type used for errors surfaced by collaborators
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors returned by transfer operations
#[derive(thiserror::Error, Debug)]
pub enum TransferError {
    /// Invalid concurrency, size, or cache capacity settings. Never retried.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("invalid meta request: {0}")]
    InvalidMetaRequest(String),

    /// A recoverable network or server condition. Eligible for retry.
    #[error("transient I/O failure: {0}")]
    TransientIo(#[source] BoxError),

    /// A non-recoverable failure that terminates the transfer.
    #[error("{context}")]
    Fatal {
        context: String,
        #[source]
        source: BoxError,
    },

    /// The transfer was cancelled by the caller or timed out.
    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    /// True if the failure is eligible for a retry of the same operation
    pub fn is_transient(&self) -> bool {
        matches!(self, TransferError::TransientIo(_))
    }

    /// True if the transfer ended because of cancellation rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }

    /// True for configuration errors raised before any I/O took place
    pub fn is_configuration(&self) -> bool {
        matches!(self, TransferError::Configuration(_))
    }

    /// True for terminal transfer failures
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransferError::Fatal { .. })
    }
}

pub(crate) fn invalid_config(message: impl Into<String>) -> TransferError {
    TransferError::Configuration(message.into())
}

pub(crate) fn invalid_meta_request(message: impl Into<String>) -> TransferError {
    TransferError::InvalidMetaRequest(message.into())
}

pub(crate) fn transient<E>(err: E) -> TransferError
where
    E: Into<BoxError>,
{
    TransferError::TransientIo(err.into())
}

pub(crate) fn fatal<E>(context: impl fmt::Display, err: E) -> TransferError
where
    E: Into<BoxError>,
{
    TransferError::Fatal {
        context: context.to_string(),
        source: err.into(),
    }
}

/// Error for local reads/writes of transfer data
pub(crate) fn local_io(context: impl fmt::Display, err: std::io::Error) -> TransferError {
    fatal(context, err)
}

/// Turn an exhausted transient failure into a terminal one
pub(crate) fn exhausted(context: impl fmt::Display, err: TransferError) -> TransferError {
    if err.is_transient() {
        fatal(context, err)
    } else {
        err
    }
}
