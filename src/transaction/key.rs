use crate::{Error, Result};
use rsip::{
    prelude::{HeadersExt, ToTypedHeader, UntypedHeader},
    HostWithPort, Method,
};
use std::hash::{Hash, Hasher};

/// Client-transaction matching key, used while a locally generated request is
/// still in flight and before the dialog's tags are fully known. A response
/// maps back to the request that created it through this key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rfc3261Key {
    pub branch: String,
    pub method: Method,
    pub cseq: u32,
    pub call_id: String,
}

impl Hash for Rfc3261Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.branch.hash(state);
        self.method.to_string().hash(state);
        self.cseq.hash(state);
        self.call_id.hash(state);
    }
}

/// Fallback key for peers that omit the Via branch (RFC 2543 era).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rfc2543Key {
    pub method: Method,
    pub cseq: u32,
    pub call_id: String,
    pub via_host_port: HostWithPort,
}

impl Hash for Rfc2543Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.method.to_string().hash(state);
        self.cseq.hash(state);
        self.call_id.hash(state);
        self.via_host_port.to_string().hash(state);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransactionKey {
    Rfc3261(Rfc3261Key),
    Rfc2543(Rfc2543Key),
    Invalid,
}

impl std::fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionKey::Rfc3261(k) => {
                write!(f, "{} {}/{} ({})", k.call_id, k.method, k.cseq, k.branch)
            }
            TransactionKey::Rfc2543(k) => {
                write!(
                    f,
                    "{} {}/{} [{}]",
                    k.call_id, k.method, k.cseq, k.via_host_port
                )
            }
            TransactionKey::Invalid => write!(f, "INVALID"),
        }
    }
}

fn build_key(
    via: rsip::typed::Via,
    mut method: Method,
    cseq: u32,
    call_id: String,
) -> TransactionKey {
    // ACK completes the INVITE transaction rather than opening its own
    if method == Method::Ack {
        method = Method::Invite;
    }
    match via.branch() {
        Some(branch) => TransactionKey::Rfc3261(Rfc3261Key {
            branch: branch.to_string(),
            method,
            cseq,
            call_id,
        }),
        None => TransactionKey::Rfc2543(Rfc2543Key {
            method,
            cseq,
            call_id,
            via_host_port: via.uri.host_with_port,
        }),
    }
}

impl TryFrom<&rsip::Request> for TransactionKey {
    type Error = Error;

    fn try_from(req: &rsip::Request) -> Result<Self> {
        let via = req.via_header()?.typed()?;
        let cseq = req.cseq_header()?;
        Ok(build_key(
            via,
            req.method.clone(),
            cseq.seq()?,
            req.call_id_header()?.value().to_string(),
        ))
    }
}

impl TryFrom<&rsip::Response> for TransactionKey {
    type Error = Error;

    fn try_from(resp: &rsip::Response) -> Result<Self> {
        let via = resp.via_header()?.typed()?;
        let cseq = resp.cseq_header()?;
        Ok(build_key(
            via,
            cseq.method()?,
            cseq.seq()?,
            resp.call_id_header()?.value().to_string(),
        ))
    }
}
