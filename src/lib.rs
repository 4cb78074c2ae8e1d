//! Masquerading SIP proxy for user agents behind NAT.
//! The crate exposes a builder that wires the UDP listener, the registration
//! table, the routing engine and an RTP relay with optional dejitter into a
//! runtime running on its own thread.

pub mod net;

pub mod config;
pub mod error;
pub mod media;
pub mod plugin;
pub mod sip;

pub use config::ProxyConfig;
pub use error::{Error, Result};
pub use plugin::{Plugin, PluginOutcome, PluginStages, ProcessingStage};
pub use sip::{
    ProxyHandle, ProxyRuntime, SipBackend, SipContext, SipMasqProxy, SipMasqProxyBuilder,
    UdpBackend,
};

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::config::{MediaConfig, PortRange, ProxyConfig};
    use super::sip::SipMasqProxyBuilder;
    use tokio::net::UdpSocket;

    #[tokio::test]
    async fn proxy_answers_local_register() {
        let mut config = ProxyConfig::default();
        config.sip.listen.address = "127.0.0.1".parse().unwrap();
        config.sip.listen.port = 45160;
        config.media = MediaConfig {
            port_range: PortRange {
                min: 45200,
                max: 45219,
            },
            dscp: 0,
            ..MediaConfig::default()
        };

        let proxy = SipMasqProxyBuilder::new(config)
            .build()
            .await
            .expect("build runtime");
        let handle = proxy.start().await.expect("start proxy");

        let ua = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let ua_addr = ua.local_addr().unwrap();
        let register = format!(
            "REGISTER sip:127.0.0.1:45160 SIP/2.0\r\n\
Via: SIP/2.0/UDP {ua_addr};branch=z9hG4bKlib1\r\n\
Max-Forwards: 70\r\n\
From: <sip:alice@127.0.0.1>;tag=l1\r\n\
To: <sip:alice@127.0.0.1>\r\n\
Call-ID: lib@127.0.0.1\r\n\
CSeq: 1 REGISTER\r\n\
Contact: <sip:alice@{ua_addr}>\r\n\
Expires: 60\r\n\
Content-Length: 0\r\n\r\n"
        );
        ua.send_to(register.as_bytes(), "127.0.0.1:45160").await.unwrap();

        let mut buffer = vec![0u8; 4096];
        let (len, _) = tokio::time::timeout(Duration::from_secs(3), ua.recv_from(&mut buffer))
            .await
            .expect("answer in time")
            .unwrap();
        let answer = String::from_utf8_lossy(&buffer[..len]);
        assert!(answer.starts_with("SIP/2.0 200"), "unexpected answer: {answer}");

        handle.shutdown().await.expect("shutdown proxy");
    }
}
