//! Classification and rewriting of every SIP message passing the proxy.

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use rsip::headers::UntypedHeader;
use rsip::headers::Via;
use rsip::{Method, Request, Response, SipMessage, StatusCode, Uri};
use tracing::{debug, info, trace, warn};

use crate::config::DEFAULT_SIP_PORT;
use crate::error::{Error, Result};
use crate::media::sdp;
use crate::media::{ForwardRequest, MediaSelector};
use crate::net::{HostResolver, format_ip_for_sip, split_host_port};
use crate::plugin::{PluginOutcome, ProcessingStage};
use crate::sip::compare::{CallId, host_text, port_of, truncate};
use crate::sip::message::{
    self, Direction, Ticket, body, check_mandatory, contact_uri, cseq, from_uri, header_by_name,
    header_param, headers_mut, is_sdp, max_forwards, push_top_via, remove_top_via,
    set_contact_uri, set_max_forwards, stamp_received, to_uri, to_value, top_via, via_param,
    via_reply_target, via_sent_by, vias,
};
use crate::sip::registration::{RegistrationEntry, RegistrationTable};
use crate::sip::response::response_for;
use crate::sip::route;

use super::registrar::{RegisterOutcome, is_local_registrar, register_client, register_response};
use super::state::SipContext;
use super::utils::compute_branch;

const DEFAULT_MAX_FORWARDS: u32 = 70;

/// What to do with a processed message.
#[derive(Debug)]
pub enum Routed {
    Forward {
        message: SipMessage,
        destination: SocketAddr,
    },
    Respond {
        response: Response,
        destination: SocketAddr,
    },
    /// A plugin answered the message.
    Consumed,
    Drop {
        reason: String,
    },
}

impl Routed {
    fn dropped(reason: impl Into<String>) -> Self {
        Routed::Drop {
            reason: reason.into(),
        }
    }
}

pub async fn route(context: &SipContext, ticket: Ticket) -> Routed {
    if let Err(err) = check_mandatory(ticket.headers()) {
        return Routed::dropped(err.to_string());
    }
    if ticket.is_request() {
        route_request(context, ticket).await
    } else {
        route_response(context, ticket).await
    }
}

fn active_entries(table: &RegistrationTable) -> impl Iterator<Item = &RegistrationEntry> {
    let now = Instant::now();
    table
        .active()
        .map(|(_, entry)| entry)
        .filter(move |entry| entry.is_active(now))
}

fn classify_request(
    table: &RegistrationTable,
    resolver: &HostResolver,
    source: IpAddr,
    request: &Request,
) -> Option<(Direction, RegistrationEntry)> {
    if let Some(entry) = active_entries(table).find(|entry| entry.true_ip == Some(source)) {
        return Some((Direction::Outgoing, entry.clone()));
    }
    let to = to_uri(&request.headers);
    let candidates: Vec<&Uri> = std::iter::once(&request.uri).chain(to.as_ref()).collect();
    let is_register = request.method == Method::Register;
    active_entries(table)
        .find(|entry| {
            candidates.iter().any(|uri| {
                entry.matches_masqueraded(uri, resolver)
                    || (!is_register && entry.matches_registered(uri, resolver))
            })
        })
        .map(|entry| (Direction::Incoming, entry.clone()))
}

fn classify_response(
    table: &RegistrationTable,
    resolver: &HostResolver,
    source: IpAddr,
    response: &Response,
) -> Option<(Direction, RegistrationEntry)> {
    if let Some(entry) = active_entries(table).find(|entry| entry.true_ip == Some(source)) {
        return Some((Direction::Outgoing, entry.clone()));
    }
    let from = from_uri(&response.headers)?;
    active_entries(table)
        .find(|entry| {
            entry.matches_registered(&from, resolver) || entry.matches_masqueraded(&from, resolver)
        })
        .map(|entry| (Direction::Incoming, entry.clone()))
}

/// Fingerprint of the UA that sent a message.
fn client_id(message: &SipMessage, source: SocketAddr) -> String {
    let headers = message::headers(message);
    if let Some(contact) = contact_uri(headers) {
        return truncate(&contact.host_with_port.to_string());
    }
    if let Some((host, port)) = top_via(headers).and_then(|via| via_sent_by(via.value())) {
        return truncate(&format!("{}:{}", host, port.unwrap_or(DEFAULT_SIP_PORT)));
    }
    truncate(&source.to_string())
}

fn message_call_id(message: &SipMessage) -> Option<CallId> {
    message::call_id(message::headers(message)).map(|value| CallId::parse(&value))
}

fn is_own_via(context: &SipContext, via: &str) -> bool {
    via_sent_by(via).is_some_and(|(host, port)| {
        port.unwrap_or(DEFAULT_SIP_PORT) == context.listen_port()
            && context.local.is_local_host(&host, &context.resolver)
    })
}

fn branch_for(request: &Request) -> String {
    let headers = &request.headers;
    let origin_branch = vias(headers)
        .last()
        .and_then(|via| via_param(via.value(), "branch").map(str::to_string));
    let from_tag = message::from_value(headers)
        .and_then(|value| header_param(value, "tag").map(str::to_string));
    let to_tag = to_value(headers).and_then(|value| header_param(value, "tag").map(str::to_string));
    let call_id = message::call_id(headers).unwrap_or_default();
    let seq = cseq(headers).map(|(seq, _)| seq).unwrap_or(0);
    compute_branch(
        &request.uri.to_string(),
        origin_branch.as_deref(),
        &call_id,
        seq,
        from_tag.as_deref(),
        to_tag.as_deref(),
    )
}

async fn reply_destination(context: &SipContext, request: &Request, fallback: SocketAddr) -> SocketAddr {
    let Some((host, port)) = top_via(&request.headers).and_then(|via| via_reply_target(via.value()))
    else {
        return fallback;
    };
    match context.resolver.resolve_socket(&host, port).await {
        Ok(addr) => addr,
        Err(err) => {
            debug!(host, error = %err, "via host unresolvable, answering source");
            fallback
        }
    }
}

async fn respond(
    context: &SipContext,
    request: &Request,
    source: SocketAddr,
    status: StatusCode,
) -> Routed {
    let response = response_for(request, status, Vec::new(), &context.user_agent);
    Routed::Respond {
        destination: reply_destination(context, request, source).await,
        response,
    }
}

async fn rewrite_contact(context: &SipContext, message: &mut SipMessage, direction: Direction) {
    let headers = headers_mut(message);
    let Some(contact) = contact_uri(headers) else {
        return;
    };
    let target = {
        let table = context.registrations.lock().await;
        let resolver = &context.resolver;
        match direction {
            Direction::Outgoing => active_entries(&table)
                .find(|entry| entry.matches_contact(&contact, resolver))
                .map(|entry| entry.masqueraded_uri.clone()),
            Direction::Incoming => active_entries(&table)
                .find(|entry| entry.matches_masqueraded(&contact, resolver))
                .map(|entry| entry.true_uri.clone()),
        }
    };
    let Some(target) = target else {
        return;
    };
    let mut rewritten = contact.clone();
    rewritten.host_with_port = target.host_with_port;
    if rewritten != contact {
        trace!(from = %contact, to = %rewritten, %direction, "contact rewritten");
        set_contact_uri(headers, &rewritten);
    }
}

/// Opens relay streams for every active media line and points the SDP at
/// them. Returns the number of relayed streams.
async fn rewrite_sdp(
    context: &SipContext,
    message: &mut SipMessage,
    direction: Direction,
    client: String,
) -> usize {
    let Some(relay) = context.relay.as_ref() else {
        return 0;
    };
    if !is_sdp(message::headers(message)) {
        return 0;
    }
    let Some(call_id) = message_call_id(message) else {
        return 0;
    };
    let text = match std::str::from_utf8(body(message)) {
        Ok(text) => text.to_string(),
        Err(err) => {
            warn!(%call_id, error = %err, "SDP body is not UTF-8, left untouched");
            return 0;
        }
    };
    let media = match sdp::parse_media(&text) {
        Ok(media) => media,
        Err(err) => {
            warn!(%call_id, error = %err, "unparsable SDP, left untouched");
            return 0;
        }
    };

    let local_addr = context.interface_towards(direction);
    let mut ports = vec![None; media.len()];
    for section in media.iter().filter(|section| section.is_relayable()) {
        let Some(address) = section.connection else {
            continue;
        };
        let request = ForwardRequest {
            call_id: call_id.clone(),
            client_id: client.clone(),
            direction,
            media_index: section.index,
            local_addr,
            remote: SocketAddr::new(address, section.port),
            dejitter: relay.dejitter(),
        };
        match relay.start_forward(request).await {
            Ok(port) => ports[section.index] = Some(port),
            Err(err) if err.is_exhaustion() => {
                warn!(%call_id, media = section.index, error = %err, "relay exhausted, stream not relayed")
            }
            Err(err) => warn!(%call_id, media = section.index, error = %err, "relay start failed"),
        }
    }

    let relayed = ports.iter().flatten().count();
    if relayed == 0 {
        return 0;
    }
    match sdp::rewrite(&text, local_addr, &ports) {
        Ok(rewritten) => {
            message::set_body(message, rewritten.into_bytes());
            debug!(%call_id, %direction, relayed, "SDP rewritten");
            relayed
        }
        Err(err) => {
            warn!(%call_id, error = %err, "SDP rewrite failed");
            0
        }
    }
}

async fn stop_relay(context: &SipContext, call_id: &CallId) {
    let Some(relay) = context.relay.as_ref() else {
        return;
    };
    for direction in [Direction::Incoming, Direction::Outgoing] {
        match relay.stop_forward(call_id, direction, MediaSelector::All).await {
            Ok(closed) => debug!(%call_id, %direction, closed, "relay stopped"),
            Err(Error::NoMatchingStream) => trace!(%call_id, %direction, "no relay to stop"),
            Err(err) => warn!(%call_id, %direction, error = %err, "relay stop failed"),
        }
    }
}

async fn resolve_uri(resolver: &HostResolver, uri: &Uri) -> Result<SocketAddr> {
    resolver
        .resolve_socket(&host_text(&uri.host_with_port.host), port_of(uri))
        .await
}

async fn request_destination(
    context: &SipContext,
    request: &Request,
    direction: Direction,
    next_hop: Option<SocketAddr>,
    strict_routed: bool,
) -> Result<SocketAddr> {
    if let Some(hop) = next_hop {
        return Ok(hop);
    }
    let resolver = &context.resolver;
    if direction == Direction::Outgoing {
        let host = host_text(&request.uri.host_with_port.host);
        if let Some(domain) = context
            .outbound_domains
            .iter()
            .find(|domain| domain.domain.eq_ignore_ascii_case(&host))
        {
            return resolver.resolve_socket(&domain.host, domain.port).await;
        }
        if let Some(proxy) = context.config.sip.outbound_proxy.as_deref() {
            let (host, port) = split_host_port(proxy, DEFAULT_SIP_PORT)?;
            return resolver.resolve_socket(&host, port).await;
        }
    }
    if !strict_routed
        && let Some(first) = route::first_route(&request.headers)
    {
        return resolve_uri(resolver, &first).await;
    }
    resolve_uri(resolver, &request.uri).await
}

async fn route_request(context: &SipContext, mut ticket: Ticket) -> Routed {
    let source = ticket.source;
    stamp_received(ticket.headers_mut(), source);

    if context.plugins.run(ProcessingStage::PreProxy, &mut ticket).await == PluginOutcome::Responded {
        return Routed::Consumed;
    }

    let SipMessage::Request(request) = &mut ticket.message else {
        return Routed::dropped("not a request");
    };
    let method = request.method.clone();
    route::preprocess(&mut request.headers, &context.local, &context.resolver);

    if max_forwards(&request.headers) == Some(0) {
        if method == Method::Ack {
            return Routed::dropped("ACK with Max-Forwards 0");
        }
        info!(%method, uri = %request.uri, "too many hops");
        return respond(context, request, source, StatusCode::TooManyHops).await;
    }

    let branch = branch_for(request);
    let looped = vias(&request.headers).iter().any(|via| {
        is_own_via(context, via.value()) && via_param(via.value(), "branch") == Some(branch.as_str())
    });
    if looped {
        warn!(%method, uri = %request.uri, "request loop detected");
        if method == Method::Ack {
            return Routed::dropped("looped ACK");
        }
        return respond(context, request, source, StatusCode::LoopDetected).await;
    }

    let mut forced_direction = None;
    if method == Method::Register {
        let outcome = register_client(context, request, source).await;
        match &outcome {
            RegisterOutcome::Success { .. } if is_local_registrar(context, request) => {
                let response = register_response(context, request, &outcome);
                return Routed::Respond {
                    destination: reply_destination(context, request, source).await,
                    response,
                };
            }
            RegisterOutcome::Success { .. } => forced_direction = Some(Direction::Outgoing),
            RegisterOutcome::Failure(_) | RegisterOutcome::NeedAuth(_) => {
                let response = register_response(context, request, &outcome);
                return Routed::Respond {
                    destination: reply_destination(context, request, source).await,
                    response,
                };
            }
        }
    }

    let classified = {
        let table = context.registrations.lock().await;
        classify_request(&table, &context.resolver, source.ip(), request)
    };
    let (direction, entry) = match (forced_direction, classified) {
        (Some(direction), classified) => (direction, classified.map(|(_, entry)| entry)),
        (None, Some((direction, entry))) => (direction, Some(entry)),
        (None, None) => {
            if method == Method::Ack {
                return Routed::dropped("unmatched ACK");
            }
            info!(%method, uri = %request.uri, %source, "request matches no registration");
            return respond(context, request, source, StatusCode::RequestTimeout).await;
        }
    };
    ticket.direction = Some(direction);
    debug!(%method, %direction, %source, "request classified");

    match context.plugins.run(ProcessingStage::DetermineTarget, &mut ticket).await {
        PluginOutcome::Responded => return Routed::Consumed,
        PluginOutcome::Handled | PluginOutcome::Continue => {}
    }

    let client = client_id(&ticket.message, source);
    if direction == Direction::Incoming
        && let Some(entry) = entry.as_ref()
        && let SipMessage::Request(request) = &mut ticket.message
    {
        request.uri.host_with_port = entry.true_uri.host_with_port.clone();
    }
    rewrite_contact(context, &mut ticket.message, direction).await;

    let iface = context.interface_towards(direction);
    let port = context.listen_port();
    {
        let SipMessage::Request(request) = &mut ticket.message else {
            return Routed::dropped("not a request");
        };
        let hops = max_forwards(&request.headers)
            .map(|value| value.saturating_sub(1))
            .unwrap_or(DEFAULT_MAX_FORWARDS);
        set_max_forwards(&mut request.headers, hops);
        if method != Method::Register {
            route::add_record_route(&mut request.headers, iface, port);
        }
        let via = format!(
            "SIP/2.0/UDP {}:{};branch={}",
            format_ip_for_sip(&iface),
            port,
            branch
        );
        push_top_via(&mut request.headers, Via::new(via));
    }

    if matches!(method, Method::Invite | Method::Ack | Method::Update) {
        rewrite_sdp(context, &mut ticket.message, direction, client).await;
    }
    if matches!(method, Method::Bye | Method::Cancel)
        && let Some(call_id) = message_call_id(&ticket.message)
    {
        stop_relay(context, &call_id).await;
    }

    let strict_routed = match &mut ticket.message {
        SipMessage::Request(request) => route::postprocess(request),
        SipMessage::Response(_) => false,
    };

    if context.plugins.run(ProcessingStage::PostProxy, &mut ticket).await == PluginOutcome::Responded {
        return Routed::Consumed;
    }

    let SipMessage::Request(request) = &ticket.message else {
        return Routed::dropped("not a request");
    };
    match request_destination(context, request, direction, ticket.next_hop, strict_routed).await {
        Ok(destination) => {
            debug!(%method, %direction, %destination, "forwarding request");
            Routed::Forward {
                message: ticket.message,
                destination,
            }
        }
        Err(err) => {
            warn!(%method, uri = %request.uri, error = %err, "next hop unresolvable");
            Routed::dropped(err.to_string())
        }
    }
}

/// Next Via of a response; the registration's last Via when the next one is
/// missing or unresolvable.
async fn response_destination(
    context: &SipContext,
    message: &SipMessage,
    entry: &RegistrationEntry,
) -> Result<SocketAddr> {
    let next = top_via(message::headers(message)).and_then(|via| via_reply_target(via.value()));
    let next = match next {
        Some((host, port)) => context.resolver.resolve_socket(&host, port).await,
        None => Err(Error::malformed("response without further Via")),
    };
    match (next, entry.last_via.as_deref().and_then(via_reply_target)) {
        (Ok(destination), _) => Ok(destination),
        (Err(err), Some((host, port))) => {
            debug!(error = %err, host, port, "response follows the registration's last Via");
            context.resolver.resolve_socket(&host, port).await
        }
        (Err(err), None) => Err(err),
    }
}

async fn route_response(context: &SipContext, mut ticket: Ticket) -> Routed {
    let source = ticket.source;
    if context.plugins.run(ProcessingStage::PreProxy, &mut ticket).await == PluginOutcome::Responded {
        return Routed::Consumed;
    }

    let SipMessage::Response(response) = &mut ticket.message else {
        return Routed::dropped("not a response");
    };
    let own_via = top_via(&response.headers).is_some_and(|via| is_own_via(context, via.value()));
    if !own_via {
        return Routed::dropped("topmost Via is not ours");
    }
    remove_top_via(&mut response.headers);

    let classified = {
        let table = context.registrations.lock().await;
        classify_response(&table, &context.resolver, source.ip(), response)
    };
    let Some((direction, entry)) = classified else {
        return Routed::dropped("response matches no registration");
    };
    ticket.direction = Some(direction);

    match context.plugins.run(ProcessingStage::DetermineTarget, &mut ticket).await {
        PluginOutcome::Responded => return Routed::Consumed,
        PluginOutcome::Handled | PluginOutcome::Continue => {}
    }

    let client = client_id(&ticket.message, source);
    let SipMessage::Response(response) = &mut ticket.message else {
        return Routed::dropped("not a response");
    };
    let code = response.status_code.code();
    let cseq_method = cseq(&response.headers).map(|(_, method)| method.to_ascii_uppercase());
    debug!(code, %direction, %source, "response classified");

    if code == 202
        && cseq_method.as_deref() == Some("SUBSCRIBE")
        && !context.config.sip.subscribe_202_workaround.is_empty()
    {
        let agent = header_by_name(&response.headers, "User-Agent")
            .or_else(|| header_by_name(&response.headers, "Server"))
            .unwrap_or_default();
        if context
            .config
            .sip
            .subscribe_202_workaround
            .iter()
            .any(|pattern| agent.contains(pattern.as_str()))
        {
            info!(%agent, "rewriting 202 to SUBSCRIBE as 404");
            response.status_code = StatusCode::NotFound;
        }
    }

    let iface = context.interface_towards(direction);
    route::fix_record_route(&mut response.headers, &context.local, iface, &context.resolver);
    rewrite_contact(context, &mut ticket.message, direction).await;
    rewrite_sdp(context, &mut ticket.message, direction, client).await;

    if cseq_method.as_deref() == Some("INVITE") && code >= 400 && code != 401 && code != 407
        && let Some(call_id) = message_call_id(&ticket.message)
    {
        stop_relay(context, &call_id).await;
    }

    if context.plugins.run(ProcessingStage::PostProxy, &mut ticket).await == PluginOutcome::Responded {
        return Routed::Consumed;
    }

    let destination = match ticket.next_hop {
        Some(hop) => Ok(hop),
        None => response_destination(context, &ticket.message, &entry).await,
    };
    match destination {
        Ok(destination) => {
            debug!(code, %direction, %destination, "forwarding response");
            Routed::Forward {
                message: ticket.message,
                destination,
            }
        }
        Err(err) => {
            warn!(code, error = %err, "response destination unresolvable");
            Routed::dropped(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use crate::media::RtpRelayBuilder;
    use crate::plugin::PluginChain;
    use crate::sip::message::{contact_value, record_route_values, tests::parse};
    use crate::sip::proxy::auth::AllowAll;
    use std::sync::Arc;

    const UA: &str = "127.0.0.1:45060";

    fn config() -> ProxyConfig {
        let mut config = ProxyConfig::default();
        config.sip.listen.address = "127.0.0.1".parse().unwrap();
        config.sip.outbound_proxy = Some("127.0.0.1:45070".into());
        config.media.port_range.min = 44000;
        config.media.port_range.max = 44039;
        config.media.dscp = 0;
        config
    }

    fn context(config: ProxyConfig, with_relay: bool) -> SipContext {
        let relay = with_relay.then(|| {
            Arc::new(
                RtpRelayBuilder::from_config(&config.media)
                    .unwrap()
                    .build()
                    .unwrap(),
            )
        });
        SipContext::new(Arc::new(config), relay, PluginChain::default(), Arc::new(AllowAll))
    }

    fn ticket(text: &str, source: &str) -> Ticket {
        Ticket::new(parse(text), source.parse().unwrap())
    }

    fn expect_forward(routed: Routed) -> (SipMessage, SocketAddr) {
        match routed {
            Routed::Forward { message, destination } => (message, destination),
            other => panic!("expected forward, got {other:?}"),
        }
    }

    fn expect_respond(routed: Routed) -> (Response, SocketAddr) {
        match routed {
            Routed::Respond { response, destination } => (response, destination),
            other => panic!("expected local answer, got {other:?}"),
        }
    }

    fn register() -> String {
        format!(
            "REGISTER sip:127.0.0.1 SIP/2.0\r\n\
Via: SIP/2.0/UDP {UA};branch=z9hG4bKreg1\r\n\
Max-Forwards: 70\r\n\
From: <sip:alice@127.0.0.1>;tag=r1\r\n\
To: <sip:alice@127.0.0.1>\r\n\
Call-ID: reg-e2e@127.0.0.1\r\n\
CSeq: 1 REGISTER\r\n\
Contact: <sip:alice@{UA}>\r\n\
Expires: 600\r\n\
Content-Length: 0\r\n\r\n"
        )
    }

    fn invite() -> String {
        let sdp = "v=0\r\n\
o=alice 1 1 IN IP4 127.0.0.1\r\n\
s=-\r\n\
c=IN IP4 127.0.0.1\r\n\
t=0 0\r\n\
m=audio 49170 RTP/AVP 0\r\n\
m=video 49180 RTP/AVP 31\r\n";
        format!(
            "INVITE sip:bob@example.net SIP/2.0\r\n\
Via: SIP/2.0/UDP {UA};branch=z9hG4bKinv1\r\n\
Max-Forwards: 70\r\n\
From: <sip:alice@127.0.0.1>;tag=i1\r\n\
To: <sip:bob@example.net>\r\n\
Call-ID: call-e2e@127.0.0.1\r\n\
CSeq: 1 INVITE\r\n\
Contact: <sip:alice@{UA}>\r\n\
Content-Type: application/sdp\r\n\
Content-Length: {}\r\n\r\n{sdp}",
            sdp.len()
        )
    }

    #[tokio::test]
    async fn register_then_invite_is_masqueraded_and_relayed() {
        let context = context(config(), true);

        let routed = route(&context, ticket(&register(), UA)).await;
        let (response, destination) = expect_respond(routed);
        assert_eq!(response.status_code.code(), 200);
        assert_eq!(destination, UA.parse().unwrap());

        let routed = route(&context, ticket(&invite(), UA)).await;
        let (message, destination) = expect_forward(routed);
        assert_eq!(destination, "127.0.0.1:45070".parse().unwrap());
        let headers = message::headers(&message);
        assert_eq!(contact_value(headers), Some("<sip:alice@127.0.0.1>"));
        assert_eq!(max_forwards(headers), Some(69));
        let via = top_via(headers).unwrap().value().to_string();
        assert!(via.starts_with("SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bK"));
        assert_eq!(record_route_values(headers)[0], "<sip:127.0.0.1:5060;lr>");

        let body = std::str::from_utf8(message::body(&message)).unwrap();
        assert!(!body.contains("m=audio 49170"));
        assert!(!body.contains("m=video 49180"));

        let streams = context.relay.as_ref().unwrap().streams().await.unwrap();
        assert_eq!(streams.len(), 2);
        assert!(streams.iter().all(|stream| stream.direction == Direction::Outgoing));
        for stream in &streams {
            assert!(body.contains(&format!(" {} RTP/AVP", stream.local_port)));
        }

        // a retransmission opens no further streams
        route(&context, ticket(&invite(), UA)).await;
        assert_eq!(context.relay.as_ref().unwrap().streams().await.unwrap().len(), 2);

        let bye = format!(
            "BYE sip:bob@example.net SIP/2.0\r\n\
Via: SIP/2.0/UDP {UA};branch=z9hG4bKbye1\r\n\
From: <sip:alice@127.0.0.1>;tag=i1\r\n\
To: <sip:bob@example.net>;tag=b1\r\n\
Call-ID: call-e2e@127.0.0.1\r\n\
CSeq: 2 BYE\r\n\
Content-Length: 0\r\n\r\n"
        );
        assert!(matches!(route(&context, ticket(&bye, UA)).await, Routed::Forward { .. }));
        assert!(context.relay.as_ref().unwrap().streams().await.unwrap().is_empty());

        context.relay.as_ref().unwrap().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_request_gets_408_and_ack_is_dropped() {
        let context = context(config(), false);
        let options = "OPTIONS sip:carol@198.51.100.1 SIP/2.0\r\n\
Via: SIP/2.0/UDP 198.51.100.9:5060;branch=z9hG4bKo1\r\n\
From: <sip:dave@198.51.100.9>;tag=1\r\n\
To: <sip:carol@198.51.100.1>\r\n\
Call-ID: o1@198.51.100.9\r\n\
CSeq: 1 OPTIONS\r\n\
Content-Length: 0\r\n\r\n";
        let routed = route(&context, ticket(options, "198.51.100.9:5060")).await;
        let (response, _) = expect_respond(routed);
        assert_eq!(response.status_code.code(), 408);

        let ack = options.replace("OPTIONS sip", "ACK sip").replace("1 OPTIONS", "1 ACK");
        assert!(matches!(
            route(&context, ticket(&ack, "198.51.100.9:5060")).await,
            Routed::Drop { .. }
        ));
    }

    #[tokio::test]
    async fn max_forwards_zero_gets_483() {
        let context = context(config(), false);
        let text = "OPTIONS sip:carol@198.51.100.1 SIP/2.0\r\n\
Via: SIP/2.0/UDP 198.51.100.9:5060;branch=z9hG4bKo2\r\n\
Max-Forwards: 0\r\n\
From: <sip:dave@198.51.100.9>;tag=1\r\n\
To: <sip:carol@198.51.100.1>\r\n\
Call-ID: o2@198.51.100.9\r\n\
CSeq: 1 OPTIONS\r\n\
Content-Length: 0\r\n\r\n";
        let (response, _) = expect_respond(route(&context, ticket(text, "198.51.100.9:5060")).await);
        assert_eq!(response.status_code.code(), 483);
    }

    #[tokio::test]
    async fn incoming_request_reaches_true_contact() {
        let context = context(config(), false);
        route(&context, ticket(&register(), UA)).await;

        let text = "MESSAGE sip:alice@127.0.0.1 SIP/2.0\r\n\
Via: SIP/2.0/UDP 198.51.100.9:5060;branch=z9hG4bKm1\r\n\
Max-Forwards: 70\r\n\
From: <sip:dave@198.51.100.9>;tag=1\r\n\
To: <sip:alice@127.0.0.1>\r\n\
Call-ID: m1@198.51.100.9\r\n\
CSeq: 1 MESSAGE\r\n\
Content-Length: 0\r\n\r\n";
        let routed = route(&context, ticket(text, "198.51.100.9:5060")).await;
        let (message, destination) = expect_forward(routed);
        assert_eq!(destination, UA.parse().unwrap());
        let SipMessage::Request(request) = message else {
            unreachable!()
        };
        assert_eq!(request.uri.to_string(), format!("sip:alice@{UA}"));
    }

    #[tokio::test]
    async fn response_needs_our_via_and_follows_next_one() {
        let context = context(config(), false);
        route(&context, ticket(&register(), UA)).await;

        let foreign = format!(
            "SIP/2.0 200 OK\r\n\
Via: SIP/2.0/UDP 198.51.100.3:5060;branch=z9hG4bKx\r\n\
Via: SIP/2.0/UDP {UA};branch=z9hG4bKinv1\r\n\
From: <sip:alice@127.0.0.1>;tag=i1\r\n\
To: <sip:bob@example.net>;tag=b1\r\n\
Call-ID: call-r@127.0.0.1\r\n\
CSeq: 1 INVITE\r\n\
Content-Length: 0\r\n\r\n"
        );
        assert!(matches!(
            route(&context, ticket(&foreign, "198.51.100.3:5060")).await,
            Routed::Drop { .. }
        ));

        let ours = foreign.replace("198.51.100.3:5060;branch=z9hG4bKx", "127.0.0.1:5060;branch=z9hG4bKx");
        let routed = route(&context, ticket(&ours, "198.51.100.3:5060")).await;
        let (message, destination) = expect_forward(routed);
        assert_eq!(destination, UA.parse().unwrap());
        assert_eq!(vias(message::headers(&message)).len(), 1);
    }

    #[tokio::test]
    async fn request_uri_may_use_resolved_address_of_registered_host() {
        let mut context = context(config(), false);
        context.resolver.insert("pbx.test", "192.0.2.10".parse().unwrap());
        let register = register().replace("<sip:alice@127.0.0.1>", "<sip:alice@pbx.test>");
        let (response, _) = expect_respond(route(&context, ticket(&register, UA)).await);
        assert_eq!(response.status_code.code(), 200);

        // the lookup has since dropped out of the cache
        context.resolver = Arc::new(HostResolver::new(
            std::time::Duration::from_millis(100),
            std::time::Duration::from_secs(300),
        ));

        let text = "MESSAGE sip:alice@192.0.2.10 SIP/2.0\r\n\
Via: SIP/2.0/UDP 198.51.100.9:5060;branch=z9hG4bKm2\r\n\
Max-Forwards: 70\r\n\
From: <sip:dave@198.51.100.9>;tag=1\r\n\
To: <sip:alice@192.0.2.10>\r\n\
Call-ID: m2@198.51.100.9\r\n\
CSeq: 1 MESSAGE\r\n\
Content-Length: 0\r\n\r\n";
        let (message, destination) =
            expect_forward(route(&context, ticket(text, "198.51.100.9:5060")).await);
        assert_eq!(destination, UA.parse().unwrap());
        let SipMessage::Request(request) = message else {
            unreachable!()
        };
        assert_eq!(request.uri.to_string(), format!("sip:alice@{UA}"));
    }

    #[test]
    fn register_is_never_matched_by_registered_uri() {
        let resolver = HostResolver::new(
            std::time::Duration::from_millis(100),
            std::time::Duration::from_secs(60),
        );
        let uri = |value: &str| Uri::try_from(value).unwrap();
        let mut table = RegistrationTable::with_capacity(2);
        table
            .upsert(
                RegistrationEntry {
                    true_uri: uri("sip:alice@192.168.1.5"),
                    registered_uri: uri("sip:alice@pbx.lan"),
                    masqueraded_uri: uri("sip:alice@voip.example.com"),
                    true_ip: Some("192.168.1.5".parse().unwrap()),
                    registered_ip: None,
                    masqueraded_ip: None,
                    last_via: None,
                    expires_at: Instant::now() + std::time::Duration::from_secs(60),
                },
                &resolver,
            )
            .unwrap();

        let request = |method: &str| {
            let text = format!(
                "{method} sip:alice@pbx.lan SIP/2.0\r\n\
Via: SIP/2.0/UDP 198.51.100.9:5060;branch=z9hG4bKr{method}\r\n\
From: <sip:alice@pbx.lan>;tag=1\r\n\
To: <sip:alice@pbx.lan>\r\n\
Call-ID: x@198.51.100.9\r\n\
CSeq: 1 {method}\r\n\
Content-Length: 0\r\n\r\n"
            );
            match parse(&text) {
                SipMessage::Request(request) => request,
                SipMessage::Response(_) => unreachable!(),
            }
        };
        let source: IpAddr = "198.51.100.9".parse().unwrap();
        assert!(classify_request(&table, &resolver, source, &request("REGISTER")).is_none());
        let (direction, _) = classify_request(&table, &resolver, source, &request("MESSAGE")).unwrap();
        assert_eq!(direction, Direction::Incoming);
    }

    #[tokio::test]
    async fn response_without_next_via_follows_registration() {
        let context = context(config(), false);
        route(&context, ticket(&register(), UA)).await;

        let text = "SIP/2.0 200 OK\r\n\
Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKlast\r\n\
From: <sip:alice@127.0.0.1>;tag=n1\r\n\
To: <sip:bob@example.net>;tag=n2\r\n\
Call-ID: notify@127.0.0.1\r\n\
CSeq: 1 NOTIFY\r\n\
Content-Length: 0\r\n\r\n";
        let (message, destination) =
            expect_forward(route(&context, ticket(text, "198.51.100.3:5060")).await);
        assert_eq!(destination, UA.parse().unwrap());
        assert!(vias(message::headers(&message)).is_empty());
    }

    #[tokio::test]
    async fn subscribe_202_workaround() {
        let mut config = config();
        config.sip.subscribe_202_workaround = vec!["BrokenPBX".into()];
        let context = context(config, false);
        route(&context, ticket(&register(), UA)).await;

        let text = format!(
            "SIP/2.0 202 Accepted\r\n\
Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKs\r\n\
Via: SIP/2.0/UDP {UA};branch=z9hG4bKsub\r\n\
From: <sip:alice@127.0.0.1>;tag=s1\r\n\
To: <sip:bob@example.net>;tag=s2\r\n\
Call-ID: sub@127.0.0.1\r\n\
CSeq: 1 SUBSCRIBE\r\n\
User-Agent: BrokenPBX 1.0\r\n\
Content-Length: 0\r\n\r\n"
        );
        let (message, _) = expect_forward(route(&context, ticket(&text, "198.51.100.3:5060")).await);
        let SipMessage::Response(response) = message else {
            unreachable!()
        };
        assert_eq!(response.status_code.code(), 404);
    }
}
