use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("An identity token (dapp id) is required")]
    MissingIdentity,

    #[error("A network name or a custom network is required")]
    MissingNetwork,

    #[error("Unknown network {0}")]
    UnknownNetwork(String),

    #[error("Invalid network: {0}")]
    InvalidNetwork(String),

    #[error("Invalid scope {0}, possible values: email")]
    InvalidScope(String),

    #[error("Method {0} is not supported synchronously, use the async request path")]
    UnsupportedSyncMethod(String),

    #[error("No async runtime available: {0}")]
    NoRuntime(String),

    #[error("Remote error: {0}")]
    Remote(Value),

    #[error("The widget does not expose {0}")]
    MissingRemoteMethod(String),

    #[error("Widget handshake failed: {0}")]
    Handshake(String),

    #[error("The widget channel is closed")]
    ChannelClosed,

    #[error("The connection is closed")]
    ConnectionClosed,

    #[error("The operation would block")]
    WouldBlock,

    #[error("Frame of {0} bytes exceeds the {1} byte limit")]
    FrameTooLarge(usize, usize),

    #[error("Bytes too short, expected {0}, got {1}")]
    BytesTooShort(usize, usize),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[cfg(feature = "ipc")]
    #[error(transparent)]
    IPCError(#[from] shmem_ipc::Error),

    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
}
