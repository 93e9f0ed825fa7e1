//! Error types for iSCSI initiator operations

use crate::scsi::ScsiStatus;
use std::fmt;
use thiserror::Error;

/// iSCSI initiator errors
#[derive(Debug, Error)]
pub enum IscsiError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The target violated the wire protocol (or rejected one of our PDUs)
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Login failed: {message}")]
    Login {
        /// Status reported by the target, if the failure came from a Login Response
        status: Option<LoginStatus>,
        message: String,
    },

    /// The target completed a SCSI command with a non-Good status
    #[error("SCSI command failed: status {status}")]
    ScsiCommand {
        status: ScsiStatus,
        sense_data: Option<Vec<u8>>,
    },

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl IscsiError {
    pub(crate) fn login(message: impl Into<String>) -> Self {
        IscsiError::Login {
            status: None,
            message: message.into(),
        }
    }

    /// Sense data attached to a CHECK CONDITION failure
    pub fn sense_data(&self) -> Option<&[u8]> {
        match self {
            IscsiError::ScsiCommand { sense_data, .. } => sense_data.as_deref(),
            _ => None,
        }
    }
}

/// Result type for iSCSI operations
pub type ScsiResult<T> = Result<T, IscsiError>;

impl From<IscsiError> for std::io::Error {
    fn from(err: IscsiError) -> Self {
        match err {
            IscsiError::Io(e) => e,
            IscsiError::Config(msg) => std::io::Error::new(std::io::ErrorKind::InvalidInput, msg),
            other => std::io::Error::new(std::io::ErrorKind::Other, other),
        }
    }
}

/// Status-Class / Status-Detail pair from a Login Response (RFC 3720 Section 10.13.5)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginStatus {
    pub class: u8,
    pub detail: u8,
}

impl LoginStatus {
    pub fn new(class: u8, detail: u8) -> Self {
        Self { class, detail }
    }

    pub fn is_success(&self) -> bool {
        self.class == 0
    }
}

impl fmt::Display for LoginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:02x}{:02x} ({})",
            self.class,
            self.detail,
            decode_login_status(self.class, self.detail)
        )
    }
}

/// Explain a login status code in plain words, with hints on what to check
pub fn decode_login_status(class: u8, detail: u8) -> String {
    let msg = match (class, detail) {
        (0x00, 0x00) => "Login success",
        (0x01, 0x01) => {
            "Target moved temporarily: retry the login at the portal given in TargetAddress"
        }
        (0x01, 0x02) => {
            "Target moved permanently: update the initiator configuration with the new TargetAddress"
        }
        (0x02, 0x00) => "Initiator error: the target rejected the login request",
        (0x02, 0x01) => {
            "Authentication failed: check the CHAP username and password configured for this target"
        }
        (0x02, 0x02) => {
            "Authorization failure: the initiator is not allowed to access this target, check the target ACL (e.g. tgtadm --mode target --op show)"
        }
        (0x02, 0x03) => {
            "Target not found: the requested TargetName doesn't exist on this portal, run discovery to list targets"
        }
        (0x02, 0x04) => "Target removed: the target has been removed and is no longer available",
        (0x02, 0x05) => "Unsupported version: the target does not support the requested iSCSI version",
        (0x02, 0x06) => {
            "Too many connections: the session already has the maximum number of connections allowed by MaxConnections"
        }
        (0x02, 0x07) => {
            "Missing parameter: a required key was not sent (InitiatorName, and TargetName for normal sessions)"
        }
        (0x02, 0x08) => "Cannot include connection in session: the target refused to add this connection to the session",
        (0x02, 0x09) => {
            "Session type not supported: the target refused the SessionType, use discovery (SendTargets) or a TargetName"
        }
        (0x02, 0x0A) => "Session does not exist: the TSIH given does not match an existing session",
        (0x02, 0x0B) => "Invalid request during login: the target received a request not allowed in the login phase",
        (0x03, 0x00) => "Target error: the target hit an internal failure",
        (0x03, 0x01) => {
            "Service unavailable: the target is temporarily unable to serve, wait and retry later"
        }
        (0x03, 0x02) => "Out of resources: the target ran out of resources for this session",
        _ => {
            return format!(
                "Unknown login status class=0x{:02x} detail=0x{:02x} (see RFC 3720 Section 10.13.5)",
                class, detail
            )
        }
    };
    msg.to_string()
}
