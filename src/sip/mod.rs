pub mod compare;
pub mod message;
pub mod proxy;
pub mod registration;
pub mod response;
pub mod route;

pub use message::{Direction, Ticket};
pub use proxy::{
    ProxyHandle, ProxyRuntime, SipBackend, SipContext, SipMasqProxy, SipMasqProxyBuilder,
    UdpBackend,
};
pub use registration::{RegistrationEntry, RegistrationTable};
