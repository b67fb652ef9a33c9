//! Extractors for EHLO/HELO domain, MAIL FROM reverse-path, and RCPT TO
//! forward-path out of the current input line, using anchored regular
//! expressions with capture groups as required by the wire grammar.
//!
//! Each extractor is anchored at the start of the slice and requires a
//! trailing CRLF; non-match is a syntactic failure for that command
//! and callers reply `555`.

use once_cell::sync::Lazy;
use regex::bytes::Regex;

static EHLO_HELO_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)^(?:ehlo|helo)(?:[ \t]*([^/\r\n]+))?[ \t]*\r\n").unwrap());

static MAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)^mail[ \t]+from:[ \t]*<(?:[^:>]*:)?([^>]+)>.*\r\n").unwrap());

static RCPT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)^rcpt[ \t]+to:[ \t]*<(?:[^:>]*:)?([^>]+)>.*\r\n").unwrap());

/// Extracted EHLO/HELO domain, if present, plus the number of bytes
/// consumed by the whole command line (including CRLF).
pub struct EhloMatch {
    pub domain: Option<String>,
    pub consumed: usize,
}

pub fn parse_ehlo_helo(line: &[u8]) -> Option<EhloMatch> {
    let caps = EHLO_HELO_RE.captures(line)?;
    let domain = caps
        .get(1)
        .map(|m| String::from_utf8_lossy(m.as_bytes()).trim().to_string())
        .filter(|s| !s.is_empty());
    Some(EhloMatch {
        domain,
        consumed: caps.get(0).unwrap().end(),
    })
}

pub struct PathMatch {
    pub address: String,
    pub consumed: usize,
}

pub fn parse_mail(line: &[u8]) -> Option<PathMatch> {
    let caps = MAIL_RE.captures(line)?;
    let addr = caps.get(1)?;
    if addr.as_bytes().is_empty() {
        return None;
    }
    Some(PathMatch {
        address: String::from_utf8_lossy(addr.as_bytes()).to_string(),
        consumed: caps.get(0).unwrap().end(),
    })
}

pub fn parse_rcpt(line: &[u8]) -> Option<PathMatch> {
    let caps = RCPT_RE.captures(line)?;
    let addr = caps.get(1)?;
    if addr.as_bytes().is_empty() {
        return None;
    }
    Some(PathMatch {
        address: String::from_utf8_lossy(addr.as_bytes()).to_string(),
        consumed: caps.get(0).unwrap().end(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ehlo_with_domain() {
        let m = parse_ehlo_helo(b"EHLO example.net\r\n").unwrap();
        assert_eq!(m.domain.as_deref(), Some("example.net"));
    }

    #[test]
    fn ehlo_without_domain_still_matches() {
        let m = parse_ehlo_helo(b"EHLO\r\n").unwrap();
        assert_eq!(m.domain, None);
    }

    #[test]
    fn helo_is_case_insensitive() {
        let m = parse_ehlo_helo(b"HeLo foo.bar\r\n").unwrap();
        assert_eq!(m.domain.as_deref(), Some("foo.bar"));
    }

    #[test]
    fn mail_from_captures_reverse_path() {
        let m = parse_mail(b"MAIL FROM:<a@example.net>\r\n").unwrap();
        assert_eq!(m.address, "a@example.net");
    }

    #[test]
    fn mail_from_strips_source_route() {
        let m = parse_mail(b"MAIL FROM:<@relay.example:a@example.net>\r\n").unwrap();
        assert_eq!(m.address, "a@example.net");
    }

    #[test]
    fn mail_from_empty_brackets_fails() {
        assert!(parse_mail(b"MAIL FROM:<>\r\n").is_none());
    }

    #[test]
    fn rcpt_to_captures_forward_path() {
        let m = parse_rcpt(b"RCPT TO:<b@example.org>\r\n").unwrap();
        assert_eq!(m.address, "b@example.org");
    }

    #[test]
    fn rcpt_to_empty_brackets_fails() {
        assert!(parse_rcpt(b"RCPT TO:<>\r\n").is_none());
    }

    #[test]
    fn malformed_mail_line_does_not_match() {
        assert!(parse_mail(b"MAIL FROM a@example.net\r\n").is_none());
    }

    proptest::proptest! {
        #[test]
        fn ehlo_domain_roundtrips(domain in "[ -.0-~&&[^/\r\n]]{1,200}") {
            let line = format!("EHLO {}\r\n", domain);
            let m = parse_ehlo_helo(line.as_bytes()).unwrap();
            proptest::prop_assert_eq!(m.domain.unwrap(), domain.trim());
        }

        #[test]
        fn rcpt_address_roundtrips(addr in "[ -=?-~&&[^>\r\n]]{1,200}") {
            let line = format!("RCPT TO:<{}>\r\n", addr);
            let m = parse_rcpt(line.as_bytes()).unwrap();
            proptest::prop_assert_eq!(m.address, addr);
        }
    }
}
