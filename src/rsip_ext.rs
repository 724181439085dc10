use crate::{Error, Result};
use rsip::{
    message::HasHeaders,
    prelude::{HeadersExt, UntypedHeader},
};

pub trait RsipResponseExt {
    /// Capture the route set a client dialog learns from the 2xx that
    /// establishes it: Record-Route headers in reverse order (RFC 3261 12.1.2).
    fn record_route_set(&self) -> Vec<rsip::headers::Route>;
    fn contact_uri(&self) -> Result<rsip::Uri>;
}

impl RsipResponseExt for rsip::Response {
    fn record_route_set(&self) -> Vec<rsip::headers::Route> {
        let mut route_set = Vec::new();
        for header in self.headers().iter() {
            if let rsip::Header::RecordRoute(rr) = header {
                route_set.push(rsip::headers::Route::from(rr.value()));
            }
        }
        route_set.reverse();
        route_set
    }

    fn contact_uri(&self) -> Result<rsip::Uri> {
        let contact = self.contact_header()?;
        extract_uri_from_contact(contact.value())
    }
}

pub trait RsipRequestExt {
    /// Capture the route set a server dialog learns from the INVITE that
    /// establishes it: Record-Route headers in message order.
    fn record_route_set(&self) -> Vec<rsip::headers::Route>;
    fn contact_uri(&self) -> Result<rsip::Uri>;
}

impl RsipRequestExt for rsip::Request {
    fn record_route_set(&self) -> Vec<rsip::headers::Route> {
        let mut route_set = Vec::new();
        for header in self.headers().iter() {
            if let rsip::Header::RecordRoute(rr) = header {
                route_set.push(rsip::headers::Route::from(rr.value()));
            }
        }
        route_set
    }

    fn contact_uri(&self) -> Result<rsip::Uri> {
        let contact = self.contact_header()?;
        extract_uri_from_contact(contact.value())
    }
}

/// Extract the URI from a Contact header value, tolerating both the
/// angle-bracket form and a bare URI with trailing header parameters.
pub fn extract_uri_from_contact(line: &str) -> Result<rsip::Uri> {
    if let Ok(uri) = rsip::headers::Contact::from(line).uri() {
        return Ok(uri);
    }

    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(Error::Error("empty contact header".into()));
    }

    let inner = match (trimmed.find('<'), trimmed.find('>')) {
        (Some(start), Some(end)) if start < end => &trimmed[start + 1..end],
        _ => trimmed.split(';').next().unwrap_or(trimmed),
    };
    rsip::Uri::try_from(inner.trim()).map_err(Error::from)
}

/// Whether a route-set entry is a loose router, i.e. its URI carries the
/// `lr` parameter. Requests toward a strict first hop must be rewritten
/// (request-URI replaced, entry popped) for RFC 2543 compatibility.
pub fn is_loose_router(uri: &rsip::Uri) -> bool {
    uri.params.iter().any(|param| match param {
        rsip::Param::Lr => true,
        // lenient fallback for peers that send lr with a value
        rsip::Param::Other(name, _) => name.value().eq_ignore_ascii_case("lr"),
        _ => false,
    })
}
