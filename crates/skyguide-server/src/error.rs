use std::io;

use skyguide_core::errors::GuideError;

use crate::rpc::{HANDLER_FAILED, INTERNAL_ERROR, INVALID_PARAMS};

/// Errors from starting the event server. Returned to the embedding
/// application; no client is involved yet.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("event server already started on {0}")]
    AlreadyStarted(std::net::SocketAddr),

    #[error("could not listen at port {port}: address already in use")]
    AddressInUse { port: u16 },

    #[error("could not listen at port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("invalid instance number {0}")]
    InvalidInstance(u32),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ServerError {
    pub(crate) fn from_bind(port: u16, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::AddrInUse {
            Self::AddressInUse { port }
        } else {
            Self::Bind { port, source }
        }
    }
}

/// Failure returned by an RPC method handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The request's `params` do not have the shape the method expects.
    #[error("{0}")]
    InvalidParams(String),

    /// The guiding engine refused or failed the operation.
    #[error(transparent)]
    Guide(#[from] GuideError),

    #[error("{0}")]
    Internal(String),
}

impl HandlerError {
    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::InvalidParams(msg.into())
    }

    /// JSON-RPC error code for this failure.
    pub fn code(&self) -> i64 {
        match self {
            Self::InvalidParams(_) => INVALID_PARAMS,
            Self::Guide(_) => HANDLER_FAILED,
            Self::Internal(_) => INTERNAL_ERROR,
        }
    }

    /// Classification used for the `rpc.errors_total` label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidParams(_) => "invalid_params",
            Self::Guide(e) => e.error_kind(),
            Self::Internal(_) => "internal",
        }
    }
}

/// Method table misconfiguration, detected at startup.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("method registered twice: {0}")]
    Duplicate(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_error_classification() {
        let in_use = io::Error::from(io::ErrorKind::AddrInUse);
        assert!(matches!(
            ServerError::from_bind(4400, in_use),
            ServerError::AddressInUse { port: 4400 }
        ));

        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert!(matches!(
            ServerError::from_bind(80, denied),
            ServerError::Bind { port: 80, .. }
        ));
    }

    #[test]
    fn handler_error_codes() {
        assert_eq!(HandlerError::invalid_params("x").code(), INVALID_PARAMS);
        assert_eq!(HandlerError::from(GuideError::NotCalibrated).code(), HANDLER_FAILED);
        assert_eq!(HandlerError::Internal("x".into()).code(), INTERNAL_ERROR);
    }

    #[test]
    fn handler_error_kinds() {
        assert_eq!(HandlerError::invalid_params("x").kind(), "invalid_params");
        assert_eq!(HandlerError::from(GuideError::Busy).kind(), "busy");
        assert_eq!(HandlerError::Internal("x".into()).kind(), "internal");
    }

    #[test]
    fn guide_errors_pass_through_verbatim() {
        let err = HandlerError::from(GuideError::NotCalibrated);
        assert_eq!(err.to_string(), "cannot guide: not calibrated");
    }
}
