pub mod dejitter;
pub mod relay;
pub mod sdp;
pub mod table;

pub use dejitter::{DelayQueue, JitterState, Leg};
pub use relay::{RtpRelay, RtpRelayBuilder};
pub use table::{ForwardRequest, MediaSelector, StreamHandle, StreamInfo};
