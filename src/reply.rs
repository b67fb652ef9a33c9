//! SMTP reply construction. Every reply is built as one complete,
//! already-terminated (`\r\n`-suffixed) buffer before it is ever handed
//! to the outbound queue, so a partial SMTP reply is never observable
//! on the wire (§7).

use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    code: u16,
    text: &'static str,
}

impl Reply {
    const fn new(code: u16, text: &'static str) -> Self {
        Reply { code, text }
    }

    pub fn service_ready() -> Self {
        Self::new(220, "Service ready")
    }

    pub fn closing() -> Self {
        Self::new(221, "Service closing transmission channel")
    }

    pub fn ok() -> Self {
        Self::new(250, "Ok")
    }

    pub fn start_mail_input() -> Self {
        Self::new(354, "Start mail input; end with <CRLF>.<CRLF>")
    }

    pub fn internal_error() -> Self {
        Self::new(451, "Requested action aborted: internal error")
    }

    pub fn syntax_error() -> Self {
        Self::new(500, "Syntax error, command unrecognized")
    }

    pub fn not_implemented() -> Self {
        Self::new(502, "Command not implemented")
    }

    pub fn bad_sequence() -> Self {
        Self::new(503, "Bad sequence of commands")
    }

    pub fn bad_reverse_path() -> Self {
        Self::new(555, "Syntax error in reverse-path or not present")
    }

    pub fn bad_forward_path() -> Self {
        Self::new(555, "Syntax error in forward-path or not present")
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    /// Render as the exact bytes to send on the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}\r\n", self.code, self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replies_render_bit_exact_text() {
        assert_eq!(Reply::ok().to_string(), "250 Ok\r\n");
        assert_eq!(
            Reply::start_mail_input().to_string(),
            "354 Start mail input; end with <CRLF>.<CRLF>\r\n"
        );
        assert_eq!(
            Reply::closing().to_string(),
            "221 Service closing transmission channel\r\n"
        );
        assert_eq!(
            Reply::bad_reverse_path().to_string(),
            "555 Syntax error in reverse-path or not present\r\n"
        );
    }

    #[test]
    fn every_reply_terminates_with_crlf() {
        for r in [
            Reply::service_ready(),
            Reply::closing(),
            Reply::ok(),
            Reply::start_mail_input(),
            Reply::internal_error(),
            Reply::syntax_error(),
            Reply::not_implemented(),
            Reply::bad_sequence(),
            Reply::bad_reverse_path(),
            Reply::bad_forward_path(),
        ] {
            assert!(r.to_string().ends_with("\r\n"));
        }
    }
}
