pub mod auth;
mod backend;
mod builder;
pub mod registrar;
pub mod router;
mod state;
pub(crate) mod utils;

pub use auth::{AllowAll, AuthDecision, Authenticator, DigestAuthenticator};
pub use backend::{SipBackend, UdpBackend};
pub use builder::{ProxyHandle, ProxyRuntime, ShutdownSignal, SipMasqProxy, SipMasqProxyBuilder};
pub use router::Routed;
pub use state::SipContext;
