//! Structured SIP requests and responses

use uuid::Uuid;

use crate::dialog::SubscriptionState;

use super::{Method, SipUri};

/// Magic cookie every RFC 3261 branch starts with
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// Max-Forwards value inserted when a request carries none
pub const DEFAULT_MAX_FORWARDS: u32 = 70;

/// A From or To header value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<String>,
    pub uri: SipUri,
    pub tag: Option<String>,
}

impl NameAddr {
    pub fn new(uri: SipUri, tag: Option<String>) -> Self {
        Self { display_name: None, uri, tag }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

/// One Via hop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    pub host: String,
    pub port: u16,
    pub branch: String,
}

impl Via {
    /// Create a Via for `host:port` with a fresh branch
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            branch: format!("{}{}", BRANCH_MAGIC_COOKIE, Uuid::new_v4().simple()),
        }
    }

    /// `host:port` the response for this hop is sent to
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// True when the hop names the given endpoint
    pub fn is_for(&self, uri: &SipUri) -> bool {
        self.host.eq_ignore_ascii_case(&uri.host) && self.port == uri.effective_port()
    }
}

/// A SIP request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipRequest {
    pub method: Method,
    pub uri: SipUri,
    pub call_id: String,
    pub from: NameAddr,
    pub to: NameAddr,
    pub cseq: u32,
    /// Via hops, topmost first
    pub via: Vec<Via>,
    /// Route entries, topmost first
    pub route: Vec<SipUri>,
    /// Record-Route entries, topmost first
    pub record_route: Vec<SipUri>,
    pub max_forwards: Option<u32>,
    pub contact: Option<SipUri>,
    pub event: Option<String>,
    pub subscription_state: Option<SubscriptionState>,
    pub expires: Option<u32>,
    /// Extension headers, kept verbatim
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl SipRequest {
    /// Create a request with the mandatory header set
    pub fn new(
        method: Method,
        uri: SipUri,
        call_id: impl Into<String>,
        from: NameAddr,
        to: NameAddr,
        cseq: u32,
    ) -> Self {
        Self {
            method,
            uri,
            call_id: call_id.into(),
            from,
            to,
            cseq,
            via: Vec::new(),
            route: Vec::new(),
            record_route: Vec::new(),
            max_forwards: Some(DEFAULT_MAX_FORWARDS),
            contact: None,
            event: None,
            subscription_state: None,
            expires: None,
            headers: Vec::new(),
            body: None,
        }
    }

    /// True for requests sent inside an established dialog
    pub fn is_in_dialog(&self) -> bool {
        self.to.tag.is_some()
    }

    /// True for the initial request of a dialog (INVITE/SUBSCRIBE without To tag)
    pub fn is_dialog_establishing(&self) -> bool {
        self.method.creates_dialog() && !self.is_in_dialog()
    }

    /// Where the request goes next: the top Route, else the Request-URI
    pub fn next_hop(&self) -> &SipUri {
        self.route.first().unwrap_or(&self.uri)
    }

    /// Push a Via on top of the stack
    pub fn push_via(&mut self, via: Via) {
        self.via.insert(0, via);
    }

    /// Value of an extension header
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A SIP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipResponse {
    pub status: u16,
    pub reason: String,
    pub call_id: String,
    pub from: NameAddr,
    pub to: NameAddr,
    pub cseq: u32,
    /// Method of the request this answers
    pub cseq_method: Method,
    pub via: Vec<Via>,
    pub record_route: Vec<SipUri>,
    pub contact: Option<SipUri>,
    pub expires: Option<u32>,
}

impl SipResponse {
    /// Build a response to `request`, copying the headers RFC 3261 8.2.6.2 requires
    pub fn for_request(request: &SipRequest, status: u16) -> Self {
        Self {
            status,
            reason: reason_phrase(status).to_string(),
            call_id: request.call_id.clone(),
            from: request.from.clone(),
            to: request.to.clone(),
            cseq: request.cseq,
            cseq_method: request.method.clone(),
            via: request.via.clone(),
            record_route: request.record_route.clone(),
            contact: None,
            expires: None,
        }
    }

    /// Set the To tag (UAS side of a dialog)
    pub fn with_to_tag(mut self, tag: impl Into<String>) -> Self {
        self.to.tag = Some(tag.into());
        self
    }

    pub fn with_contact(mut self, contact: SipUri) -> Self {
        self.contact = Some(contact);
        self
    }

    pub fn with_expires(mut self, expires: u32) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn is_provisional(&self) -> bool {
        self.status < 200
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Reason phrase for the status codes this crate produces
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Trying",
        180 => "Ringing",
        200 => "OK",
        202 => "Accepted",
        400 => "Bad Request",
        481 => "Call/Transaction Does Not Exist",
        483 => "Too Many Hops",
        487 => "Request Terminated",
        500 => "Server Internal Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invite() -> SipRequest {
        let from = NameAddr::new("sip:BigGuy@here.com".parse().unwrap(), Some("12345".to_string()));
        let to = NameAddr::new("sip:LittleGuy@there.com".parse().unwrap(), None);
        SipRequest::new(
            Method::Invite,
            "sip:LittleGuy@127.0.0.1:5050".parse().unwrap(),
            "call-1",
            from,
            to,
            1,
        )
    }

    #[test]
    fn test_initial_invite_establishes_dialog() {
        let request = invite();
        assert!(request.is_dialog_establishing());
        assert!(!request.is_in_dialog());
        assert_eq!(request.max_forwards, Some(DEFAULT_MAX_FORWARDS));
    }

    #[test]
    fn test_next_hop_prefers_route() {
        let mut request = invite();
        assert_eq!(request.next_hop().host_port(), "127.0.0.1:5050");
        request.route.push("sip:127.0.0.1:5070;lr".parse().unwrap());
        assert_eq!(request.next_hop().host_port(), "127.0.0.1:5070");
    }

    #[test]
    fn test_response_copies_dialog_headers() {
        let mut request = invite();
        request.push_via(Via::new("127.0.0.1", 5060));
        request.push_via(Via::new("127.0.0.1", 5050));
        let response = SipResponse::for_request(&request, 180).with_to_tag("4321");

        assert_eq!(response.reason, "Ringing");
        assert_eq!(response.via.len(), 2);
        assert_eq!(response.via[0].port, 5050);
        assert_eq!(response.to.tag.as_deref(), Some("4321"));
        assert_eq!(response.cseq_method, Method::Invite);
        assert!(response.is_provisional());
    }

    #[test]
    fn test_branch_has_magic_cookie() {
        let via = Via::new("10.0.0.1", 5060);
        assert!(via.branch.starts_with(BRANCH_MAGIC_COOKIE));
        assert_ne!(via.branch, Via::new("10.0.0.1", 5060).branch);
    }
}
