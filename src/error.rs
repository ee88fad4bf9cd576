//! Error types for the SOAP client.

use crate::response::Response;
use std::convert::Infallible;
use thiserror::Error;

/// Boxed error produced by a [`Transport`](crate::request::Transport).
pub type TransportError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// SOAP client errors.
#[derive(Error, Debug)]
pub enum Error {
    /// A SOAP version outside of 1.1 and 1.2 was requested.
    #[error("Invalid SOAP version: {0}")]
    InvalidVersion(String),

    /// The response body is not a SOAP envelope.
    #[error(transparent)]
    InvalidResponse(#[from] InvalidResponseError),

    /// The remote service answered with a SOAP fault.
    #[error("{}", .0.soap_fault())]
    SoapFault(Box<Response>),

    /// The remote service answered with a non-2xx status and no SOAP fault.
    #[error("{}", .0.http_error())]
    Http(Box<Response>),

    /// The multipart request body could not be built.
    #[error("Multipart error: {0}")]
    Multipart(#[from] MultipartError),

    /// The transport failed before a response was received.
    #[error("Transport error: {0}")]
    Transport(#[source] TransportError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The response that caused a [`Error::SoapFault`] or [`Error::Http`].
    pub fn response(&self) -> Option<&Response> {
        match self {
            Self::SoapFault(response) | Self::Http(response) => Some(response),
            _ => None,
        }
    }

    /// Take back ownership of the response carried by this error.
    pub fn into_response(self) -> Option<Response> {
        match self {
            Self::SoapFault(response) | Self::Http(response) => Some(*response),
            _ => None,
        }
    }
}

impl From<Infallible> for Error {
    fn from(never: Infallible) -> Self {
        match never {}
    }
}

/// The response body could not be read as a SOAP envelope.
///
/// Cached by [`Response`] so that every access reports the same failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid SOAP response: {message}")]
pub struct InvalidResponseError {
    message: String,
}

impl InvalidResponseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Failure to split a multipart body into parts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MultipartError {
    #[error("Content-Type has no boundary parameter")]
    MissingBoundary,

    #[error("no delimiter for boundary {0:?} found in body")]
    MissingDelimiter(String),

    #[error("body is truncated: closing delimiter for boundary {0:?} not found")]
    Truncated(String),

    #[error("invalid part: {0}")]
    InvalidPart(String),

    #[error("invalid header value {0:?}")]
    InvalidHeader(String),
}

/// Result alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
