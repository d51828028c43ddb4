// larynx - SIP signaling for voice-AI agents
// Copyright (C) 2025 The larynx developers
// SPDX-License-Identifier: Apache-2.0 OR MIT

use bytes::Bytes;
use smol_str::SmolStr;

use crate::headers::Headers;
use crate::method::Method;
use crate::uri::SipUri;

/// First line of a SIP request: `Method SP Request-URI SP SIP/2.0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    pub uri: SipUri,
}

impl RequestLine {
    pub fn new(method: Method, uri: SipUri) -> Self {
        Self { method, uri }
    }
}

/// First line of a SIP response: `SIP/2.0 SP code SP reason`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub code: u16,
    pub reason: SmolStr,
}

impl StatusLine {
    /// Builds a status line; an empty reason is filled from the default
    /// reason-phrase table.
    pub fn new(code: u16, reason: &str) -> Self {
        let reason = if reason.is_empty() {
            SmolStr::new(default_reason(code))
        } else {
            SmolStr::new(reason)
        };
        Self { code, reason }
    }
}

/// An in-memory SIP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub start: RequestLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    pub fn new(start: RequestLine, headers: Headers, body: Bytes) -> Self {
        Self {
            start,
            headers,
            body,
        }
    }

    pub fn method(&self) -> &Method {
        &self.start.method
    }

    pub fn uri(&self) -> &SipUri {
        &self.start.uri
    }
}

/// An in-memory SIP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub start: StatusLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    pub fn new(start: StatusLine, headers: Headers, body: Bytes) -> Self {
        Self {
            start,
            headers,
            body,
        }
    }

    pub fn code(&self) -> u16 {
        self.start.code
    }

    pub fn reason(&self) -> &str {
        &self.start.reason
    }

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.start.code)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.start.code)
    }

    pub fn is_final(&self) -> bool {
        self.start.code >= 200
    }
}

/// Either a request or a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(Request),
    Response(Response),
}

impl SipMessage {
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request(_))
    }

    pub fn as_request(&self) -> Option<&Request> {
        match self {
            Self::Request(req) => Some(req),
            Self::Response(_) => None,
        }
    }

    pub fn as_response(&self) -> Option<&Response> {
        match self {
            Self::Response(res) => Some(res),
            Self::Request(_) => None,
        }
    }

    pub fn headers(&self) -> &Headers {
        match self {
            Self::Request(req) => &req.headers,
            Self::Response(res) => &res.headers,
        }
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        match self {
            Self::Request(req) => &mut req.headers,
            Self::Response(res) => &mut res.headers,
        }
    }

    pub fn body(&self) -> &Bytes {
        match self {
            Self::Request(req) => &req.body,
            Self::Response(res) => &res.body,
        }
    }
}

impl From<Request> for SipMessage {
    fn from(req: Request) -> Self {
        SipMessage::Request(req)
    }
}

impl From<Response> for SipMessage {
    fn from(res: Response) -> Self {
        SipMessage::Response(res)
    }
}

/// Default reason phrase for common status codes.
pub fn default_reason(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        183 => "Session Progress",
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        500 => "Server Internal Error",
        503 => "Service Unavailable",
        603 => "Decline",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_line_fills_default_reason() {
        let line = StatusLine::new(486, "");
        assert_eq!(line.reason.as_str(), "Busy Here");
        let line = StatusLine::new(200, "All Good");
        assert_eq!(line.reason.as_str(), "All Good");
    }

    #[test]
    fn response_predicates() {
        let provisional = Response::new(StatusLine::new(180, ""), Headers::new(), Bytes::new());
        assert!(provisional.is_provisional());
        assert!(!provisional.is_final());

        let ok = Response::new(StatusLine::new(200, ""), Headers::new(), Bytes::new());
        assert!(ok.is_success());
        assert!(ok.is_final());

        let busy = Response::new(StatusLine::new(486, ""), Headers::new(), Bytes::new());
        assert!(busy.is_final());
        assert!(!busy.is_success());
    }

    #[test]
    fn message_variants() {
        let req = Request::new(
            RequestLine::new(Method::Options, SipUri::new("example.com")),
            Headers::new(),
            Bytes::new(),
        );
        let msg = SipMessage::from(req);
        assert!(msg.is_request());
        assert!(msg.as_request().is_some());
        assert!(msg.as_response().is_none());
    }
}
