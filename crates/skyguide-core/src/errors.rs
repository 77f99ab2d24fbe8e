/// Failures reported by the guiding engine when it is asked to do something.
///
/// The server never interprets these beyond turning them into an RPC error;
/// the `Display` text is what the client sees.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum GuideError {
    // Equipment
    #[error("camera not connected")]
    CameraNotConnected,
    #[error("mount not connected")]
    MountNotConnected,
    #[error("equipment not connected")]
    NotConnected,

    // Guider state
    #[error("cannot guide: not calibrated")]
    NotCalibrated,
    #[error("cannot perform operation while calibrating or guiding")]
    Busy,
    #[error("{0}")]
    InvalidState(String),

    // Lookups
    #[error("invalid profile id {0}")]
    UnknownProfile(i64),
    #[error("could not find star")]
    StarNotFound,

    #[error("{0}")]
    Failed(String),
}

impl GuideError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::CameraNotConnected => "camera_not_connected",
            Self::MountNotConnected => "mount_not_connected",
            Self::NotConnected => "not_connected",
            Self::NotCalibrated => "not_calibrated",
            Self::Busy => "busy",
            Self::InvalidState(_) => "invalid_state",
            Self::UnknownProfile(_) => "unknown_profile",
            Self::StarNotFound => "star_not_found",
            Self::Failed(_) => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_client_facing() {
        assert_eq!(GuideError::NotCalibrated.to_string(), "cannot guide: not calibrated");
        assert_eq!(GuideError::UnknownProfile(9).to_string(), "invalid profile id 9");
        assert_eq!(
            GuideError::Failed("could not start looping".into()).to_string(),
            "could not start looping"
        );
    }

    #[test]
    fn error_kinds() {
        assert_eq!(GuideError::Busy.error_kind(), "busy");
        assert_eq!(GuideError::StarNotFound.error_kind(), "star_not_found");
        assert_eq!(GuideError::Failed("x".into()).error_kind(), "failed");
    }
}
