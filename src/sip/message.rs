//! Accessors and editors over `rsip` messages.
//!
//! Messages are normalised on receipt (compact header names expanded,
//! comma-joined Via/Route/Record-Route values split) so that every helper
//! here can treat one header as one value.

use std::fmt;
use std::mem;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use rsip::headers::{
    CallId, Contact, ContentEncoding, ContentLength, ContentType, From as HeaderFrom, RecordRoute,
    Route, Subject, Supported, To as HeaderTo, UntypedHeader, Via,
};
use rsip::{Header, Headers, Method, SipMessage, Uri};

use crate::error::{Error, Result};

/// Which side of the NAT boundary a message is travelling towards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// From the public network towards a registered UA.
    Incoming,
    /// From a registered UA towards the public network.
    Outgoing,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Incoming => Direction::Outgoing,
            Direction::Outgoing => Direction::Incoming,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Incoming => f.write_str("incoming"),
            Direction::Outgoing => f.write_str("outgoing"),
        }
    }
}

/// A message in flight through the proxy.
#[derive(Debug, Clone)]
pub struct Ticket {
    pub message: SipMessage,
    pub source: SocketAddr,
    pub received_at: Instant,
    pub direction: Option<Direction>,
    /// Destination chosen by a plugin at the target-determination stage.
    pub next_hop: Option<SocketAddr>,
}

impl Ticket {
    pub fn new(message: SipMessage, source: SocketAddr) -> Self {
        Self {
            message,
            source,
            received_at: Instant::now(),
            direction: None,
            next_hop: None,
        }
    }

    pub fn parse(payload: &[u8], source: SocketAddr) -> Result<Self> {
        let mut message = SipMessage::try_from(payload).map_err(Error::sip_stack)?;
        normalize_headers(headers_mut(&mut message));
        Ok(Self::new(message, source))
    }

    pub fn is_request(&self) -> bool {
        matches!(self.message, SipMessage::Request(_))
    }

    pub fn method(&self) -> Option<&Method> {
        match &self.message {
            SipMessage::Request(request) => Some(&request.method),
            SipMessage::Response(_) => None,
        }
    }

    pub fn headers(&self) -> &Headers {
        headers(&self.message)
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        headers_mut(&mut self.message)
    }

    pub fn source_ip(&self) -> IpAddr {
        self.source.ip()
    }
}

pub fn headers(message: &SipMessage) -> &Headers {
    match message {
        SipMessage::Request(request) => &request.headers,
        SipMessage::Response(response) => &response.headers,
    }
}

pub fn headers_mut(message: &mut SipMessage) -> &mut Headers {
    match message {
        SipMessage::Request(request) => &mut request.headers,
        SipMessage::Response(response) => &mut response.headers,
    }
}

pub fn body(message: &SipMessage) -> &[u8] {
    match message {
        SipMessage::Request(request) => &request.body,
        SipMessage::Response(response) => &response.body,
    }
}

/// Replaces the body and keeps Content-Length consistent.
pub fn set_body(message: &mut SipMessage, body: Vec<u8>) {
    let len = body.len() as u32;
    match message {
        SipMessage::Request(request) => request.body = body,
        SipMessage::Response(response) => response.body = body,
    }
    headers_mut(message).unique_push(Header::ContentLength(ContentLength::from(len)));
}

/// Runs `edit` over the headers as a plain vector.
pub fn edit_headers<R>(headers: &mut Headers, edit: impl FnOnce(&mut Vec<Header>) -> R) -> R {
    let mut collected: Vec<Header> = mem::take(headers).into();
    let result = edit(&mut collected);
    *headers = collected.into();
    result
}

pub fn normalize_headers(headers: &mut Headers) {
    edit_headers(headers, |collected| {
        let mut normalized = Vec::with_capacity(collected.len());
        for header in collected.drain(..) {
            let header = match header {
                Header::Other(name, value) => match expand_compact_header(&name, &value) {
                    Some(expanded) => expanded,
                    None => Header::Other(name, value),
                },
                other => other,
            };
            match header {
                Header::Via(via) => normalized.extend(
                    split_list(via.value())
                        .into_iter()
                        .map(|value| Header::Via(Via::from(value))),
                ),
                Header::Route(route) => normalized.extend(
                    split_list(route.value())
                        .into_iter()
                        .map(|value| Header::Route(Route::from(value))),
                ),
                Header::RecordRoute(route) => normalized.extend(
                    split_list(route.value())
                        .into_iter()
                        .map(|value| Header::RecordRoute(RecordRoute::from(value))),
                ),
                other => normalized.push(other),
            }
        }
        *collected = normalized;
    });
}

fn expand_compact_header(name: &str, value: &str) -> Option<Header> {
    match name.to_ascii_lowercase().as_str() {
        "f" => Some(Header::From(HeaderFrom::new(value.to_string()))),
        "t" => Some(Header::To(HeaderTo::new(value.to_string()))),
        "i" => Some(Header::CallId(CallId::new(value.to_string()))),
        "m" => Some(Header::Contact(Contact::new(value.to_string()))),
        "v" => Some(Header::Via(Via::new(value.to_string()))),
        "l" => Some(Header::ContentLength(ContentLength::new(value.to_string()))),
        "c" => Some(Header::ContentType(ContentType::new(value.to_string()))),
        "e" => Some(Header::ContentEncoding(ContentEncoding::new(value.to_string()))),
        "k" => Some(Header::Supported(Supported::new(value.to_string()))),
        "s" => Some(Header::Subject(Subject::new(value.to_string()))),
        _ => None,
    }
}

/// Splits a comma separated header list, ignoring commas inside quotes and
/// angle brackets.
pub fn split_list(value: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut in_brackets = false;
    for ch in value.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => in_brackets = true,
            '>' if !in_quotes => in_brackets = false,
            ',' if !in_quotes && !in_brackets => {
                let item = current.trim();
                if !item.is_empty() {
                    items.push(item.to_string());
                }
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(ch);
    }
    let item = current.trim();
    if !item.is_empty() {
        items.push(item.to_string());
    }
    items
}

/// Byte range of the URI inside a name-addr / addr-spec header value.
fn uri_span(value: &str) -> Option<(usize, usize)> {
    if let Some(open) = value.find('<') {
        let close = value[open..].find('>')? + open;
        return Some((open + 1, close));
    }
    let start = value.len() - value.trim_start().len();
    let end = value[start..]
        .find(';')
        .map(|idx| idx + start)
        .unwrap_or_else(|| value.trim_end().len());
    (end > start).then_some((start, end))
}

pub fn uri_text(value: &str) -> Option<&str> {
    uri_span(value).map(|(start, end)| value[start..end].trim())
}

pub fn parse_name_addr(value: &str) -> Option<Uri> {
    Uri::try_from(uri_text(value)?).ok()
}

/// Swaps the URI of a name-addr value, keeping display name and parameters.
pub fn replace_name_addr_uri(value: &str, uri: &Uri) -> String {
    match uri_span(value) {
        Some((start, end)) if value.contains('<') => {
            format!("{}{}{}", &value[..start], uri, &value[end..])
        }
        Some((start, end)) => format!("{}<{}>{}", &value[..start], uri, &value[end..]),
        None => format!("<{uri}>"),
    }
}

/// Value of a `;name=value` parameter in a header value (outside the URI
/// brackets), matched case-insensitively.
pub fn header_param<'a>(value: &'a str, name: &str) -> Option<&'a str> {
    let params_start = match value.rfind('>') {
        Some(idx) => idx + 1,
        None => 0,
    };
    value[params_start..]
        .split(';')
        .skip(usize::from(params_start == 0))
        .filter_map(|param| {
            let mut parts = param.splitn(2, '=');
            let key = parts.next()?.trim();
            key.eq_ignore_ascii_case(name)
                .then(|| parts.next().map(str::trim).unwrap_or(""))
        })
        .next()
}

pub fn top_via(headers: &Headers) -> Option<&Via> {
    headers.iter().find_map(|header| match header {
        Header::Via(via) => Some(via),
        _ => None,
    })
}

pub fn vias(headers: &Headers) -> Vec<&Via> {
    headers
        .iter()
        .filter_map(|header| match header {
            Header::Via(via) => Some(via),
            _ => None,
        })
        .collect()
}

pub fn remove_top_via(headers: &mut Headers) -> Option<Via> {
    edit_headers(headers, |collected| {
        let idx = collected
            .iter()
            .position(|header| matches!(header, Header::Via(_)))?;
        match collected.remove(idx) {
            Header::Via(via) => Some(via),
            _ => None,
        }
    })
}

/// Inserts a Via above every existing Via.
pub fn push_top_via(headers: &mut Headers, via: Via) {
    edit_headers(headers, |collected| {
        let idx = collected
            .iter()
            .position(|header| matches!(header, Header::Via(_)))
            .unwrap_or(0);
        collected.insert(idx, Header::Via(via));
    });
}

pub fn replace_top_via(headers: &mut Headers, via: Via) {
    edit_headers(headers, |collected| {
        if let Some(slot) = collected
            .iter_mut()
            .find(|header| matches!(header, Header::Via(_)))
        {
            *slot = Header::Via(via);
        }
    });
}

/// `;name=value` parameter of a Via value.
pub fn via_param<'a>(via: &'a str, name: &str) -> Option<&'a str> {
    via.split(';').skip(1).find_map(|param| {
        let mut parts = param.splitn(2, '=');
        let key = parts.next()?.trim();
        key.eq_ignore_ascii_case(name)
            .then(|| parts.next().map(str::trim).unwrap_or(""))
    })
}

/// Host and port of the sent-by part of a Via value.
pub fn via_sent_by(via: &str) -> Option<(String, Option<u16>)> {
    let mut parts = via.trim().splitn(2, char::is_whitespace);
    let _protocol = parts.next()?;
    let rest = parts.next()?.trim();
    let sent_by = rest.split(';').next()?.trim();
    if let Some(inner) = sent_by.strip_prefix('[') {
        let (host, tail) = inner.split_once(']')?;
        let port = tail.strip_prefix(':').and_then(|port| port.trim().parse().ok());
        return Some((host.to_string(), port));
    }
    match sent_by.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            Some((host.trim().to_string(), port.trim().parse().ok()))
        }
        _ => Some((sent_by.to_string(), None)),
    }
}

/// Where responses to a request carrying `via` go: `received`/`rport`
/// override the sent-by host and port (RFC 3261 §18.2.2, RFC 3581).
pub fn via_reply_target(via: &str) -> Option<(String, u16)> {
    let (sent_host, sent_port) = via_sent_by(via)?;
    let host = via_param(via, "received")
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or(sent_host);
    let port = via_param(via, "rport")
        .and_then(|value| value.parse().ok())
        .or(sent_port)
        .unwrap_or(crate::config::DEFAULT_SIP_PORT);
    Some((host, port))
}

/// Adds `received` when the sent-by host is not the source address and
/// fills an empty `rport` with the source port.
pub fn stamp_received(headers: &mut Headers, source: SocketAddr) -> bool {
    let Some(via) = top_via(headers) else {
        return false;
    };
    let value = via.value().to_string();
    let Some((sent_host, _)) = via_sent_by(&value) else {
        return false;
    };

    let mut parts: Vec<String> = value.split(';').map(|part| part.to_string()).collect();
    let mut changed = false;
    for part in parts.iter_mut().skip(1) {
        if part.trim().eq_ignore_ascii_case("rport") {
            *part = format!("rport={}", source.port());
            changed = true;
        }
    }
    let host_matches = crate::net::parse_ip_literal(&sent_host) == Some(source.ip());
    if !host_matches && via_param(&value, "received").is_none() {
        parts.push(format!("received={}", source.ip()));
        changed = true;
    }
    if changed {
        replace_top_via(headers, Via::from(parts.join(";")));
    }
    changed
}

pub fn call_id(headers: &Headers) -> Option<String> {
    headers.iter().find_map(|header| match header {
        Header::CallId(call_id) => Some(call_id.value().trim().to_string()),
        _ => None,
    })
}

pub fn to_value(headers: &Headers) -> Option<&str> {
    headers.iter().find_map(|header| match header {
        Header::To(to) => Some(to.value()),
        _ => None,
    })
}

pub fn from_value(headers: &Headers) -> Option<&str> {
    headers.iter().find_map(|header| match header {
        Header::From(from) => Some(from.value()),
        _ => None,
    })
}

pub fn contact_value(headers: &Headers) -> Option<&str> {
    headers.iter().find_map(|header| match header {
        Header::Contact(contact) => Some(contact.value()),
        _ => None,
    })
}

pub fn to_uri(headers: &Headers) -> Option<Uri> {
    to_value(headers).and_then(parse_name_addr)
}

pub fn from_uri(headers: &Headers) -> Option<Uri> {
    from_value(headers).and_then(parse_name_addr)
}

pub fn contact_uri(headers: &Headers) -> Option<Uri> {
    contact_value(headers).and_then(parse_name_addr)
}

pub fn set_contact_uri(headers: &mut Headers, uri: &Uri) -> bool {
    edit_headers(headers, |collected| {
        for header in collected.iter_mut() {
            if let Header::Contact(contact) = header {
                let rewritten = replace_name_addr_uri(contact.value(), uri);
                *contact = Contact::from(rewritten);
                return true;
            }
        }
        false
    })
}

pub fn cseq(headers: &Headers) -> Option<(u32, String)> {
    headers.iter().find_map(|header| match header {
        Header::CSeq(cseq) => {
            let mut parts = cseq.value().split_whitespace();
            let seq = parts.next()?.parse().ok()?;
            let method = parts.next()?.to_string();
            Some((seq, method))
        }
        _ => None,
    })
}

pub fn max_forwards(headers: &Headers) -> Option<u32> {
    headers.iter().find_map(|header| match header {
        Header::MaxForwards(value) => value.value().trim().parse().ok(),
        _ => None,
    })
}

pub fn set_max_forwards(headers: &mut Headers, value: u32) {
    headers.unique_push(Header::MaxForwards(rsip::headers::MaxForwards::from(value)));
}

pub fn expires(headers: &Headers) -> Option<u32> {
    headers.iter().find_map(|header| match header {
        Header::Expires(value) => value.value().trim().parse().ok(),
        _ => None,
    })
}

pub fn is_sdp(headers: &Headers) -> bool {
    headers.iter().any(|header| match header {
        Header::ContentType(value) => value
            .value()
            .trim()
            .to_ascii_lowercase()
            .starts_with("application/sdp"),
        _ => false,
    })
}

/// Value of an arbitrary header by name, looking at its wire form.
pub fn header_by_name(headers: &Headers, name: &str) -> Option<String> {
    headers.iter().find_map(|header| {
        let rendered = header.to_string();
        let (header_name, value) = rendered.split_once(':')?;
        header_name
            .trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim().to_string())
    })
}

pub fn route_values(headers: &Headers) -> Vec<String> {
    headers
        .iter()
        .filter_map(|header| match header {
            Header::Route(route) => Some(route.value().to_string()),
            _ => None,
        })
        .collect()
}

pub fn record_route_values(headers: &Headers) -> Vec<String> {
    headers
        .iter()
        .filter_map(|header| match header {
            Header::RecordRoute(route) => Some(route.value().to_string()),
            _ => None,
        })
        .collect()
}

/// Replaces all Route headers with `routes`, keeping the position of the
/// first one.
pub fn set_routes(headers: &mut Headers, routes: &[String]) {
    edit_headers(headers, |collected| {
        let idx = collected
            .iter()
            .position(|header| matches!(header, Header::Route(_)));
        collected.retain(|header| !matches!(header, Header::Route(_)));
        let idx = idx.unwrap_or(collected.len()).min(collected.len());
        for (offset, route) in routes.iter().enumerate() {
            collected.insert(idx + offset, Header::Route(Route::from(route.clone())));
        }
    });
}

pub fn set_record_routes(headers: &mut Headers, routes: &[String]) {
    edit_headers(headers, |collected| {
        let idx = collected
            .iter()
            .position(|header| matches!(header, Header::RecordRoute(_)));
        collected.retain(|header| !matches!(header, Header::RecordRoute(_)));
        let idx = idx.unwrap_or(0).min(collected.len());
        for (offset, route) in routes.iter().enumerate() {
            collected.insert(
                idx + offset,
                Header::RecordRoute(RecordRoute::from(route.clone())),
            );
        }
    });
}

/// Mandatory headers of RFC 3261 §8.1.1 that every relayed message needs.
pub fn check_mandatory(headers: &Headers) -> Result<()> {
    if top_via(headers).is_none() {
        return Err(Error::malformed("missing Via header"));
    }
    if from_value(headers).is_none() {
        return Err(Error::malformed("missing From header"));
    }
    if to_value(headers).is_none() {
        return Err(Error::malformed("missing To header"));
    }
    if call_id(headers).is_none() {
        return Err(Error::malformed("missing Call-ID header"));
    }
    if cseq(headers).is_none() {
        return Err(Error::malformed("missing or invalid CSeq header"));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn parse(text: &str) -> SipMessage {
        let mut message = SipMessage::try_from(text).expect("valid sip message");
        normalize_headers(headers_mut(&mut message));
        message
    }

    const INVITE: &str = "INVITE sip:bob@example.net SIP/2.0\r\n\
Via: SIP/2.0/UDP 192.168.1.5:5060;branch=z9hG4bKabc, SIP/2.0/UDP 10.0.0.1;branch=z9hG4bKdef\r\n\
Max-Forwards: 70\r\n\
From: \"Alice\" <sip:alice@example.com>;tag=1928\r\n\
To: <sip:bob@example.net>\r\n\
Call-ID: a84b4c76e66710@192.168.1.5\r\n\
CSeq: 314159 INVITE\r\n\
Contact: \"Alice\" <sip:alice@192.168.1.5:5060;transport=udp>;expires=60\r\n\
Content-Length: 0\r\n\r\n";

    #[test]
    fn splits_comma_joined_via_headers() {
        let message = parse(INVITE);
        let vias = vias(headers(&message));
        assert_eq!(vias.len(), 2);
        assert!(vias[1].value().contains("10.0.0.1"));
    }

    #[test]
    fn reads_core_headers() {
        let message = parse(INVITE);
        let headers = headers(&message);
        assert_eq!(call_id(headers).as_deref(), Some("a84b4c76e66710@192.168.1.5"));
        assert_eq!(cseq(headers), Some((314159, "INVITE".to_string())));
        assert_eq!(max_forwards(headers), Some(70));
        let contact = contact_uri(headers).expect("contact");
        assert_eq!(contact.host_with_port.to_string(), "192.168.1.5:5060");
        assert_eq!(header_param(contact_value(headers).unwrap(), "expires"), Some("60"));
        assert!(check_mandatory(headers).is_ok());
    }

    #[test]
    fn contact_rewrite_keeps_display_name_and_params() {
        let mut message = parse(INVITE);
        let uri = Uri::try_from("sip:alice@203.0.113.1:5060").unwrap();
        assert!(set_contact_uri(headers_mut(&mut message), &uri));
        let value = contact_value(headers(&message)).unwrap().to_string();
        assert!(value.starts_with("\"Alice\" <sip:alice@203.0.113.1:5060>"));
        assert!(value.ends_with(";expires=60"));
    }

    #[test]
    fn via_helpers() {
        let via = "SIP/2.0/UDP 192.168.1.5:5062;branch=z9hG4bKabc;rport";
        assert_eq!(via_param(via, "branch"), Some("z9hG4bKabc"));
        assert_eq!(via_param(via, "rport"), Some(""));
        assert_eq!(via_param(via, "received"), None);
        assert_eq!(via_sent_by(via), Some(("192.168.1.5".to_string(), Some(5062))));
        assert_eq!(
            via_sent_by("SIP/2.0/UDP [2001:db8::5];branch=z9hG4bK1"),
            Some(("2001:db8::5".to_string(), None))
        );
    }

    #[test]
    fn received_and_rport_are_stamped() {
        let mut message = parse(
            "OPTIONS sip:bob@example.net SIP/2.0\r\n\
Via: SIP/2.0/UDP 192.168.1.5:5060;branch=z9hG4bKabc;rport\r\n\
From: <sip:alice@example.com>;tag=1\r\n\
To: <sip:bob@example.net>\r\n\
Call-ID: s@h\r\n\
CSeq: 1 OPTIONS\r\n\
Content-Length: 0\r\n\r\n",
        );
        let headers = headers_mut(&mut message);
        assert!(stamp_received(headers, "198.51.100.4:61000".parse().unwrap()));
        let via = top_via(headers).unwrap().value().to_string();
        assert_eq!(via_param(&via, "rport"), Some("61000"));
        assert_eq!(via_param(&via, "received"), Some("198.51.100.4"));
        assert_eq!(
            via_reply_target(&via),
            Some(("198.51.100.4".to_string(), 61000))
        );
        assert_eq!(
            via_reply_target("SIP/2.0/UDP pbx.lan;branch=z9hG4bK1"),
            Some(("pbx.lan".to_string(), 5060))
        );
    }

    #[test]
    fn push_and_remove_top_via() {
        let mut message = parse(INVITE);
        let headers = headers_mut(&mut message);
        push_top_via(headers, Via::from("SIP/2.0/UDP 203.0.113.1:5060;branch=z9hG4bKown".to_string()));
        assert!(top_via(headers).unwrap().value().contains("z9hG4bKown"));
        let removed = remove_top_via(headers).unwrap();
        assert!(removed.value().contains("203.0.113.1"));
        assert!(top_via(headers).unwrap().value().contains("192.168.1.5"));
    }

    #[test]
    fn missing_call_id_is_malformed() {
        let message = parse(
            "OPTIONS sip:bob@example.net SIP/2.0\r\n\
Via: SIP/2.0/UDP 192.168.1.5:5060;branch=z9hG4bKabc\r\n\
From: <sip:alice@example.com>;tag=1\r\n\
To: <sip:bob@example.net>\r\n\
CSeq: 1 OPTIONS\r\n\
Content-Length: 0\r\n\r\n",
        );
        assert!(matches!(check_mandatory(headers(&message)), Err(Error::Malformed(_))));
    }

    #[test]
    fn list_splitting_respects_brackets() {
        let items = split_list("<sip:a@x;lr>, \"B, b\" <sip:b@y>,<sip:c@z>");
        assert_eq!(items.len(), 3);
        assert_eq!(items[1], "\"B, b\" <sip:b@y>");
    }
}
