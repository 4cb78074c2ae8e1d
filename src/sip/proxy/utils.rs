use std::time::{Duration, SystemTime};

pub(crate) const BRANCH_MAGIC: &str = "z9hG4bK";

pub(crate) fn md5_hex(bytes: &[u8]) -> String {
    format!("{:032x}", md5::compute(bytes))
}

pub(crate) fn constant_time_eq(lhs: &[u8], rhs: &[u8]) -> bool {
    if lhs.len() != rhs.len() {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in lhs.iter().zip(rhs.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}

pub(crate) fn unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_nanos()
}

/// Stateless branch for a forwarded request.
///
/// The method is left out of the digest so that the CANCEL (and the ACK of
/// a failed INVITE) get the branch of the INVITE they refer to.
pub(crate) fn compute_branch(
    request_uri: &str,
    incoming_branch: Option<&str>,
    call_id: &str,
    cseq: u32,
    from_tag: Option<&str>,
    to_tag: Option<&str>,
) -> String {
    let material = format!(
        "{}|{}|{}|{}|{}|{}",
        request_uri,
        incoming_branch.unwrap_or(""),
        call_id,
        cseq,
        from_tag.unwrap_or(""),
        to_tag.unwrap_or("")
    );
    format!("{BRANCH_MAGIC}{}", md5_hex(material.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_is_stable_per_transaction() {
        let a = compute_branch("sip:bob@x", Some("z9hG4bK1"), "c1@h", 1, Some("t1"), None);
        let b = compute_branch("sip:bob@x", Some("z9hG4bK1"), "c1@h", 1, Some("t1"), None);
        let c = compute_branch("sip:bob@x", Some("z9hG4bK2"), "c1@h", 1, Some("t1"), None);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with(BRANCH_MAGIC));
    }

    #[test]
    fn constant_time_comparison() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
