//! Line-oriented SDP inspection and address rewriting.
//!
//! Only connection (`c=`), media (`m=`) and `a=rtcp` lines are touched;
//! everything else passes through byte for byte, including the newline style.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{Error, Result};

/// One `m=` section with its effective connection address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpMedia {
    pub index: usize,
    pub kind: String,
    pub port: u16,
    pub connection: Option<IpAddr>,
}

impl SdpMedia {
    /// Port 0 disables a stream, an unspecified address puts it on hold.
    pub fn is_relayable(&self) -> bool {
        self.port != 0 && self.connection.is_some_and(|ip| !ip.is_unspecified())
    }
}

fn parse_connection(rest: &str) -> Result<IpAddr> {
    let mut tokens = rest.split_whitespace();
    let net = tokens.next().unwrap_or("");
    let family = tokens.next().unwrap_or("");
    let address = tokens
        .next()
        .ok_or_else(|| Error::Media(format!("invalid connection line: c={rest}")))?;
    if !net.eq_ignore_ascii_case("IN") {
        return Err(Error::Media(format!("unsupported network type {net}")));
    }
    let address = address.split('/').next().unwrap_or(address);
    if family.eq_ignore_ascii_case("IP6") {
        address
            .parse::<Ipv6Addr>()
            .map(IpAddr::V6)
            .map_err(|err| Error::Media(err.to_string()))
    } else {
        address
            .parse::<Ipv4Addr>()
            .map(IpAddr::V4)
            .map_err(|err| Error::Media(err.to_string()))
    }
}

fn parse_media_line(rest: &str) -> Result<(String, u16)> {
    let mut tokens = rest.split_whitespace();
    let kind = tokens
        .next()
        .ok_or_else(|| Error::Media("empty media line".into()))?;
    let port = tokens
        .next()
        .and_then(|port| port.split('/').next())
        .and_then(|port| port.parse().ok())
        .ok_or_else(|| Error::Media(format!("invalid media port: m={rest}")))?;
    Ok((kind.to_string(), port))
}

pub fn parse_media(body: &str) -> Result<Vec<SdpMedia>> {
    let mut session_connection = None;
    let mut media: Vec<SdpMedia> = Vec::new();
    for line in body.lines() {
        if let Some(rest) = line.strip_prefix("m=") {
            let (kind, port) = parse_media_line(rest)?;
            media.push(SdpMedia {
                index: media.len(),
                kind,
                port,
                connection: session_connection,
            });
        } else if let Some(rest) = line.strip_prefix("c=") {
            let ip = parse_connection(rest)?;
            match media.last_mut() {
                Some(current) => current.connection = Some(ip),
                None => session_connection = Some(ip),
            }
        }
    }
    Ok(media)
}

fn connection_line(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(addr) => format!("c=IN IP4 {addr}"),
        IpAddr::V6(addr) => format!("c=IN IP6 {addr}"),
    }
}

fn rtcp_line(port: u16, ip: IpAddr, rest: &str) -> String {
    let tokens: Vec<&str> = rest.split_whitespace().skip(1).collect();
    let mut line = format!("a=rtcp:{port}");
    if tokens.len() >= 3 && tokens[0].eq_ignore_ascii_case("IN") {
        match ip {
            IpAddr::V4(addr) => line.push_str(&format!(" IN IP4 {addr}")),
            IpAddr::V6(addr) => line.push_str(&format!(" IN IP6 {addr}")),
        }
        if tokens.len() > 3 {
            line.push(' ');
            line.push_str(&tokens[3..].join(" "));
        }
    } else if !tokens.is_empty() {
        line.push(' ');
        line.push_str(&tokens.join(" "));
    }
    line
}

/// Points relayed media sections at `relay_ip`.
///
/// `ports[n]` is the relay port for media section `n`; `None` leaves the
/// section untouched. Connection lines carrying an unspecified address are
/// never rewritten.
pub fn rewrite(body: &str, relay_ip: IpAddr, ports: &[Option<u16>]) -> Result<String> {
    let media = parse_media(body)?;
    let relayed = |index: usize| ports.get(index).copied().flatten();

    // the session-level c= is shared by every section without its own c=
    let mut section_has_connection = vec![false; media.len()];
    let mut session_connection: Option<&str> = None;
    {
        let mut current: Option<usize> = None;
        for line in body.lines() {
            let line = line.trim_end_matches('\r');
            if line.starts_with("m=") {
                current = Some(current.map_or(0, |idx| idx + 1));
            } else if let Some(rest) = line.strip_prefix("c=") {
                match current {
                    Some(idx) => section_has_connection[idx] = true,
                    None => {
                        if !parse_connection(rest)?.is_unspecified() {
                            session_connection = Some(line);
                        }
                    }
                }
            }
        }
    }
    let inherits = |index: usize| !section_has_connection[index];
    let session_connection_relayed = session_connection.is_some()
        && media
            .iter()
            .any(|m| inherits(m.index) && relayed(m.index).is_some());
    // unrelayed sections that inherited it keep the original address
    let keeps_original = |index: usize| {
        session_connection_relayed && inherits(index) && relayed(index).is_none()
    };

    let newline = if body.contains("\r\n") { "\r\n" } else { "\n" };
    let mut out = String::with_capacity(body.len() + 32);
    let mut current: Option<usize> = None;
    let mut pending_connection = false;
    for line in body.split_inclusive('\n') {
        let content = line.trim_end_matches(['\r', '\n']);
        let terminator = &line[content.len()..];
        if pending_connection && !content.starts_with("i=") {
            if let Some(original) = session_connection {
                out.push_str(original);
                out.push_str(newline);
            }
            pending_connection = false;
        }
        let rewritten = if let Some(rest) = content.strip_prefix("m=") {
            let index = current.map_or(0, |idx| idx + 1);
            current = Some(index);
            pending_connection = keeps_original(index);
            match relayed(index) {
                Some(port) => {
                    let mut tokens: Vec<&str> = rest.split_whitespace().collect();
                    let port_text = port.to_string();
                    if tokens.len() > 1 {
                        tokens[1] = &port_text;
                    }
                    Some(format!("m={}", tokens.join(" ")))
                }
                None => None,
            }
        } else if let Some(rest) = content.strip_prefix("c=") {
            let applies = match current {
                Some(index) => relayed(index).is_some(),
                None => session_connection_relayed,
            };
            let unspecified = parse_connection(rest)?.is_unspecified();
            (applies && !unspecified).then(|| connection_line(relay_ip))
        } else if let Some(rest) = content.strip_prefix("a=rtcp:") {
            current
                .and_then(relayed)
                .map(|port| rtcp_line(port.saturating_add(1), relay_ip, rest))
        } else {
            None
        };

        match rewritten {
            Some(text) => {
                out.push_str(&text);
                out.push_str(if terminator.is_empty() { "" } else { newline });
            }
            None => out.push_str(line),
        }
    }
    if pending_connection && let Some(original) = session_connection {
        if !out.ends_with('\n') {
            out.push_str(newline);
        }
        out.push_str(original);
        out.push_str(newline);
    }
    Ok(out)
}
