use crate::dp::Ctrl;
use crate::probe::PortType;

/// The error type of a single raw DP or AP register access.
///
/// These are produced by the backends implementing [`RawDapAccess`](crate::RawDapAccess)
/// and are usually wrapped into an [`Error`] by the layers above.
#[derive(Debug, thiserror::Error)]
pub enum DapError {
    /// The target answered WAIT to every retry of the same request.
    #[error("Target kept answering WAIT, gave up after {waits} attempts")]
    WaitAckExhausted {
        /// Number of requests which were answered with WAIT.
        waits: usize,
    },
    /// The target answered WAIT and the backend does not retry by itself.
    #[error("Target answered with a WAIT response")]
    WaitResponse,
    /// The target answered FAULT, a sticky error flag is set in CTRL/STAT.
    #[error("Target answered with a FAULT response")]
    FaultResponse,
    /// No target drove the acknowledge phase.
    #[error("Target did not acknowledge the request")]
    NoAcknowledge,
    /// The acknowledge phase contained an undefined value.
    #[error("Unrecognised acknowledge value {ack:#05b}")]
    UnexpectedAck {
        /// The three acknowledge bits, LSB first on the wire.
        ack: u8,
    },
    /// The parity of a read response did not match its data.
    #[error("Incorrect parity on a read response")]
    IncorrectParity,
    /// The backend reported a failed transaction without further detail.
    #[error("Failed to access {port:?} register at address {address:#04x}")]
    AccessFailed {
        /// The port which was accessed.
        port: PortType,
        /// Register address, only the lowest 4 bits are meaningful.
        address: u8,
    },
    /// The backend does not implement the requested operation.
    #[error("The probe does not support {0}")]
    NotImplemented(&'static str),
    /// A backend specific error, for example from the USB stack.
    #[error("Probe specific error")]
    ProbeSpecific(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl DapError {
    /// Returns `true` if the backend reported a failed transaction without a sticky
    /// flag being latched, as opposed to a protocol level failure of the link.
    pub fn is_access_error(&self) -> bool {
        matches!(self, DapError::AccessFailed { .. } | DapError::NoAcknowledge)
    }
}

/// The main error type of the transport.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// DPIDR reported an architecture revision which is not implemented.
    #[error("Unknown or unsupported debug port version {version}")]
    VersionUnsupported {
        /// The decoded DPIDR.VERSION field.
        version: u8,
    },
    /// DPIDR read back as all ones, there is no debug port.
    #[error("No debug port responded")]
    DebugPortNotPresent,
    /// The IDR of the requested access port reads as zero.
    #[error("There appears to be no access port with index {ap}")]
    ApNotPresent {
        /// Index of the access port.
        ap: u8,
    },
    /// CSW.DeviceEn of the requested access port is clear.
    #[error("Access port {ap} is disabled")]
    ApDisabled {
        /// Index of the access port.
        ap: u8,
    },
    /// Sticky error flags are latched in CTRL/STAT.
    #[error("Sticky errors set in CTRL/STAT: {ctrl_stat:?}")]
    StickyError {
        /// The last CTRL/STAT value read.
        ctrl_stat: Ctrl,
    },
    /// An access through DRW failed and the access port turned out to be disabled.
    #[error("Error accessing {address:#010x} through access port {ap}: the access port is disabled")]
    ApAccessDisabled {
        /// Index of the access port.
        ap: u8,
        /// Last bus address written to TAR.
        address: u32,
    },
    /// An access through DRW failed on an enabled access port.
    #[error("Bus error accessing {address:#010x} through access port {ap}")]
    ApBusAccess {
        /// Index of the access port.
        ap: u8,
        /// Last bus address written to TAR.
        address: u32,
        /// The raw failure.
        #[source]
        source: DapError,
    },
    /// The SWD multi-drop target selection did not converge.
    #[error("Failed to select target {targetid:#x}:{instance:#x} after {attempts} attempts")]
    TargetSelectionFailed {
        /// The requested TARGETID.
        targetid: u32,
        /// The requested instance.
        instance: u8,
        /// Number of selection sequences issued.
        attempts: usize,
    },
    /// A busy check did not report ready within the poll limit.
    #[error("Busy check at {address:#010x} did not complete")]
    BusyTimeout {
        /// Address of the polled status register.
        address: u32,
    },
    /// The power-up request was not acknowledged in time.
    #[error("Timeout waiting for the debug port power-up acknowledge")]
    PowerUpTimeout,
    /// The debug reset request was not acknowledged in time.
    #[error("Timeout waiting for the debug reset acknowledge")]
    ResetTimeout,
    /// The connection named a peripheral which is not attached.
    #[error("Unknown peripheral '{0}'")]
    UnknownPeripheral(String),
    /// The requested operation is not available on this connection or backend.
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),
    /// The configuration could not be parsed.
    #[error("Failed to parse the transport configuration")]
    Config(#[from] serde_yaml::Error),
    /// A raw register access failed.
    #[error("Error during raw DAP access")]
    Dap(#[from] DapError),
    /// An error raised by a collaborator, for example a core register codec.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Returns `true` for errors the transport recovers from by clearing the
    /// sticky flags and retrying once.
    pub fn is_sticky(&self) -> bool {
        matches!(
            self,
            Error::StickyError { .. }
                | Error::Dap(DapError::WaitResponse)
                | Error::Dap(DapError::FaultResponse)
        )
    }
}
