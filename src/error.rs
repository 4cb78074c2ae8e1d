use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("sip stack error: {0}")]
    SipStack(String),

    #[error("media relay error: {0}")]
    Media(String),

    #[error("{0} table is full")]
    TableFull(&'static str),

    #[error("no RTP port available in range {min}-{max}")]
    NoPortAvailable { min: u16, max: u16 },

    #[error("no matching media stream")]
    NoMatchingStream,

    #[error("unable to resolve host `{0}`")]
    UnresolvableHost(String),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("rtp relay worker is not running")]
    RelayUnavailable,
}

impl Error {
    pub fn sip_stack<E: std::fmt::Display>(err: E) -> Self {
        Self::SipStack(err.to_string())
    }

    pub fn configuration<E: std::fmt::Display>(err: E) -> Self {
        Self::Configuration(err.to_string())
    }

    pub fn malformed<E: std::fmt::Display>(err: E) -> Self {
        Self::Malformed(err.to_string())
    }

    /// Resource exhaustion is reported to the requesting UA as 503 rather
    /// than being treated as a processing fault.
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, Self::TableFull(_) | Self::NoPortAvailable { .. })
    }
}
