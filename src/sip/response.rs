use rsip::headers::UntypedHeader;
use rsip::{Header, Headers, Request, Response, StatusCode};

use crate::sip::message::header_param;
use crate::sip::proxy::utils::{md5_hex, unix_nanos};

/// Builds a locally generated response to `request`.
///
/// Via, From, Call-ID and CSeq are copied; To receives a tag when the
/// request had none and the status is not provisional.
pub fn response_for(
    request: &Request,
    status: StatusCode,
    extra: Vec<Header>,
    user_agent: &str,
) -> Response {
    let mut headers = Headers::default();
    for header in request.headers.iter() {
        match header {
            Header::Via(_) | Header::From(_) | Header::CallId(_) | Header::CSeq(_) => {
                headers.push(header.clone())
            }
            Header::To(to) => {
                let needs_tag =
                    status.code() > 100 && header_param(to.value(), "tag").is_none();
                if needs_tag {
                    let tagged = format!("{};tag={}", to.value(), local_tag());
                    headers.push(Header::To(rsip::headers::To::from(tagged)));
                } else {
                    headers.push(header.clone());
                }
            }
            _ => {}
        }
    }
    for header in extra {
        headers.push(header);
    }
    headers.push(Header::UserAgent(rsip::headers::UserAgent::from(
        user_agent.to_string(),
    )));
    headers.push(Header::ContentLength(rsip::headers::ContentLength::from(0u32)));

    Response {
        status_code: status,
        version: rsip::Version::default(),
        headers,
        body: Vec::new(),
    }
}

fn local_tag() -> String {
    md5_hex(unix_nanos().to_string().as_bytes())[..10].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sip::message::{call_id, cseq, tests::parse, to_value, vias};
    use rsip::SipMessage;

    #[test]
    fn copies_dialog_headers_and_tags_to() {
        let SipMessage::Request(request) = parse(
            "OPTIONS sip:bob@example.net SIP/2.0\r\n\
Via: SIP/2.0/UDP 192.168.1.5:5060;branch=z9hG4bKa\r\n\
Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKb\r\n\
From: <sip:alice@example.com>;tag=1\r\n\
To: <sip:bob@example.net>\r\n\
Call-ID: opt@192.168.1.5\r\n\
CSeq: 7 OPTIONS\r\n\
Content-Length: 0\r\n\r\n",
        ) else {
            unreachable!()
        };
        let response = response_for(&request, StatusCode::RequestTimeout, vec![], "sipmasq/test");
        assert_eq!(response.status_code.code(), 408);
        assert_eq!(vias(&response.headers).len(), 2);
        assert_eq!(call_id(&response.headers).as_deref(), Some("opt@192.168.1.5"));
        assert_eq!(cseq(&response.headers), Some((7, "OPTIONS".to_string())));
        assert!(to_value(&response.headers).unwrap().contains(";tag="));
    }
}
