use crate::config::WireProtocol;
use crate::error::{DapError, Error};

/// Failures of the J-Link library during session setup.
#[derive(Debug, thiserror::Error)]
pub enum JlinkError {
    /// The library refused to open a connection.
    #[error("Failed to open the J-Link: {0}")]
    Open(String),
    /// No probe matches the configured selector.
    #[error("No J-Link matches {0}")]
    NotFound(String),
    /// The probe cannot drive the requested protocol.
    #[error("The J-Link does not support {0}")]
    InterfaceNotSupported(WireProtocol),
    /// A library call returned an error code.
    #[error("J-Link call {call} failed with error code {code}")]
    Call {
        /// Name of the failed call.
        call: &'static str,
        /// The returned error code.
        code: i32,
    },
}

impl From<JlinkError> for DapError {
    fn from(e: JlinkError) -> DapError {
        DapError::ProbeSpecific(Box::new(e))
    }
}

impl From<JlinkError> for Error {
    fn from(e: JlinkError) -> Error {
        Error::Dap(e.into())
    }
}
