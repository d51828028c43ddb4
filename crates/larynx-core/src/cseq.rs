use std::fmt;

use crate::method::Method;
use crate::uri::UriError;

/// CSeq header value (RFC 3261 §20.16): a 32-bit sequence number and a method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl CSeq {
    pub fn new(seq: u32, method: Method) -> Self {
        Self { seq, method }
    }

    /// Parses `"314159 INVITE"`.
    pub fn parse(input: &str) -> Result<Self, UriError> {
        let mut parts = input.split_whitespace();
        let seq = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or(UriError::Malformed("CSeq missing sequence number"))?;
        let method = parts
            .next()
            .map(Method::from_token)
            .ok_or(UriError::Malformed("CSeq missing method"))?;
        if parts.next().is_some() {
            return Err(UriError::Malformed("trailing tokens in CSeq"));
        }
        Ok(Self { seq, method })
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_serializes() {
        let cseq = CSeq::parse("314159 INVITE").unwrap();
        assert_eq!(cseq.seq, 314159);
        assert_eq!(cseq.method, Method::Invite);
        assert_eq!(cseq.to_string(), "314159 INVITE");
    }

    #[test]
    fn rejects_garbage() {
        assert!(CSeq::parse("INVITE").is_err());
        assert!(CSeq::parse("abc INVITE").is_err());
        assert!(CSeq::parse("1 INVITE extra").is_err());
        assert!(CSeq::parse("").is_err());
    }

    #[test]
    fn rejects_negative_or_overflow() {
        assert!(CSeq::parse("-1 BYE").is_err());
        assert!(CSeq::parse("4294967296 BYE").is_err());
    }
}
