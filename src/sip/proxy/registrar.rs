use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use rsip::headers::UntypedHeader;
use rsip::host_with_port::HostWithPort;
use rsip::{Header, Request, Response, StatusCode, Uri};
use tracing::{debug, info, warn};

use crate::sip::compare::host_text;
use crate::sip::message::{contact_value, expires, header_param, parse_name_addr, to_uri, top_via};
use crate::sip::registration::RegistrationEntry;
use crate::sip::response::response_for;

use super::auth::AuthDecision;
use super::state::SipContext;

#[derive(Debug, Clone)]
pub enum RegisterOutcome {
    Success {
        expires: u32,
        /// False once the binding was removed.
        bound: bool,
    },
    Failure(String),
    NeedAuth(Header),
}

enum ContactBinding {
    Wildcard,
    Uri(Uri),
}

fn requested_expiry(request: &Request, default_secs: u32) -> u32 {
    expires(&request.headers)
        .or_else(|| {
            contact_value(&request.headers)
                .and_then(|value| header_param(value, "expires"))
                .and_then(|value| value.parse().ok())
        })
        .unwrap_or(default_secs)
}

/// Public URI a UA registered as `registered` is presented under.
pub fn masquerade_uri(context: &SipContext, registered: &Uri) -> Uri {
    let mut uri = registered.clone();
    let host = host_text(&registered.host_with_port.host);
    if let Some(masked) = context.masked_host(&host) {
        match HostWithPort::try_from(masked) {
            Ok(replacement) => {
                uri.host_with_port.host = replacement.host;
                if replacement.port.is_some() {
                    uri.host_with_port.port = replacement.port;
                }
            }
            Err(err) => warn!(masked, error = %err, "invalid masked host"),
        }
    } else if context.config.sip.transparent_proxy {
        uri.host_with_port = HostWithPort::from(SocketAddr::new(
            context.config.sip.outbound.address,
            context.listen_port(),
        ));
    }
    uri
}

/// Address of `uri`'s host, refreshed on every REGISTER so matching does not
/// depend on the resolver cache outliving the registration.
async fn resolve_quietly(context: &SipContext, uri: &Uri) -> Option<IpAddr> {
    let host = host_text(&uri.host_with_port.host);
    match context.resolver.resolve(&host).await {
        Ok(ip) => Some(ip),
        Err(err) => {
            debug!(%host, error = %err, "registration host unresolvable");
            None
        }
    }
}

/// Authenticates a REGISTER and updates the registration table.
pub async fn register_client(
    context: &SipContext,
    request: &Request,
    source: SocketAddr,
) -> RegisterOutcome {
    if let AuthDecision::Challenge(challenge) = context.authenticator.authenticate(request).await {
        return RegisterOutcome::NeedAuth(challenge);
    }

    let Some(registered) = to_uri(&request.headers) else {
        return RegisterOutcome::Failure("REGISTER without usable To URI".into());
    };
    let binding = match contact_value(&request.headers) {
        Some(value) if value.trim() == "*" => ContactBinding::Wildcard,
        Some(value) => match parse_name_addr(value) {
            Some(uri) => ContactBinding::Uri(uri),
            None => return RegisterOutcome::Failure("unparsable Contact".into()),
        },
        None => return RegisterOutcome::Failure("REGISTER without Contact".into()),
    };
    let expiry = requested_expiry(request, context.config.registration.default_expires_secs);

    let contact = match binding {
        ContactBinding::Wildcard => {
            let removed = context
                .registrations
                .lock()
                .await
                .unregister(&registered, None, &context.resolver);
            info!(aor = %registered, removed, "all bindings removed");
            return RegisterOutcome::Success {
                expires: 0,
                bound: false,
            };
        }
        ContactBinding::Uri(uri) if expiry == 0 => {
            let removed = context
                .registrations
                .lock()
                .await
                .unregister(&registered, Some(&uri), &context.resolver);
            info!(aor = %registered, contact = %uri, removed, "binding removed");
            return RegisterOutcome::Success {
                expires: 0,
                bound: false,
            };
        }
        ContactBinding::Uri(uri) => uri,
    };

    let contact_host = host_text(&contact.host_with_port.host);
    let true_ip = match context.resolver.resolve(&contact_host).await {
        Ok(ip) => Some(ip),
        Err(err) => {
            warn!(host = %contact_host, error = %err, "contact host unresolvable, falling back to source");
            Some(source.ip())
        }
    };

    let masqueraded_uri = masquerade_uri(context, &registered);
    let registered_ip = resolve_quietly(context, &registered).await;
    let masqueraded_ip = resolve_quietly(context, &masqueraded_uri).await;

    let entry = RegistrationEntry {
        masqueraded_uri,
        true_uri: contact.clone(),
        registered_uri: registered.clone(),
        true_ip,
        registered_ip,
        masqueraded_ip,
        last_via: top_via(&request.headers).map(|via| via.value().to_string()),
        expires_at: Instant::now()
            + Duration::from_secs(
                u64::from(expiry) + u64::from(context.config.registration.expiry_margin_secs),
            ),
    };
    let masqueraded = entry.masqueraded_uri.clone();

    let (result, capacity) = {
        let mut table = context.registrations.lock().await;
        (table.upsert(entry, &context.resolver), table.capacity())
    };
    match result {
        Ok(handle) => {
            info!(
                aor = %registered,
                contact = %contact,
                masquerade = %masqueraded,
                expires = expiry,
                slot = handle.index(),
                "registered"
            );
            RegisterOutcome::Success {
                expires: expiry,
                bound: true,
            }
        }
        Err(err) => {
            warn!(aor = %registered, capacity, error = %err, "registration rejected");
            RegisterOutcome::Failure(err.to_string())
        }
    }
}

/// True when a REGISTER is addressed to this proxy rather than to an
/// upstream registrar.
pub fn is_local_registrar(context: &SipContext, request: &Request) -> bool {
    context.local.is_self(&request.uri, &context.resolver)
}

pub fn register_response(context: &SipContext, request: &Request, outcome: &RegisterOutcome) -> Response {
    match outcome {
        RegisterOutcome::Success { expires, bound } => {
            let mut extra = Vec::new();
            if *bound
                && let Some(contact) = request.headers.iter().find(|header| matches!(header, Header::Contact(_)))
            {
                extra.push(contact.clone());
            }
            extra.push(Header::Expires(rsip::headers::Expires::new(expires.to_string())));
            response_for(request, StatusCode::OK, extra, &context.user_agent)
        }
        RegisterOutcome::Failure(reason) => {
            debug!(%reason, "answering REGISTER with 503");
            response_for(request, StatusCode::ServiceUnavailable, Vec::new(), &context.user_agent)
        }
        RegisterOutcome::NeedAuth(challenge) => response_for(
            request,
            StatusCode::ProxyAuthenticationRequired,
            vec![challenge.clone()],
            &context.user_agent,
        ),
    }
}
