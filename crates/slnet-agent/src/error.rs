use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatAction {
    Open,
    Close,
}

impl NatAction {
    pub fn as_str(self) -> &'static str {
        match self {
            NatAction::Open => "open",
            NatAction::Close => "close",
        }
    }
}

impl std::fmt::Display for NatAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed exchange with the gateway device.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("no UPnP gateway found: {0}")]
    Discovery(String),
    #[error("gateway rejected {action} of port {port}: {message}")]
    Rejected {
        action: NatAction,
        port: u16,
        message: String,
    },
    #[error("gateway did not answer within {0}ms")]
    Timeout(u64),
    #[error("cannot determine local address toward gateway: {0}")]
    LocalAddress(#[source] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(
        "Server executable not found: no server directory is configured. Please reinstall or reconfigure the server path."
    )]
    NotConfigured,
    #[error(
        "Server executable not found: {}. Please reinstall or reconfigure the server path.",
        .0.display()
    )]
    ExecutableMissing(PathBuf),
    #[error("failed to spawn {}: {source}", .path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("port {0} is still in use")]
    PortInUse(u16),
    #[error("Failed to {action} port {port} after {attempts} attempts: {last}")]
    GatewayExhausted {
        action: NatAction,
        port: u16,
        attempts: u32,
        last: GatewayError,
    },
    #[error("not a directory: {}", .0.display())]
    InvalidDirectory(PathBuf),
    #[error("failed to persist config: {0}")]
    Config(String),
}

impl SupervisorError {
    /// Only exhausted NAT retries take the whole application down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SupervisorError::GatewayExhausted { .. })
    }
}
