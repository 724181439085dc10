use crate::Result;
use async_trait::async_trait;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

pub mod key;
pub use key::TransactionKey;

/// 8 hex characters is sufficient entropy for per-process tag uniqueness;
/// callers with a larger collision domain pass a longer length explicitly.
pub const TAG_LEN: usize = 8;
pub const BRANCH_LEN: usize = 12;

pub fn random_text(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let n: u8 = rng.gen_range(0..16);
            char::from_digit(n as u32, 16).unwrap_or('0')
        })
        .collect()
}

pub fn make_tag() -> rsip::param::Tag {
    random_text(TAG_LEN).into()
}

pub fn make_call_id(domain: &str) -> String {
    format!("{}@{}", random_text(TAG_LEN * 2), domain)
}

pub fn make_via_branch() -> rsip::Param {
    rsip::Param::Branch(format!("z9hG4bK{}", random_text(BRANCH_LEN)).into())
}

/// Random seed for a dialog's local CSeq counter. Kept well under 2^31 so
/// the counter has room to grow (RFC 3261 8.1.1.5).
pub fn random_cseq() -> u32 {
    rand::thread_rng().gen_range(1..0x4000_0000)
}

/// Wire side of the transaction layer, an external collaborator. The real
/// implementation performs request retransmission and response de-duplication;
/// this core only hands it messages to put on the wire.
#[async_trait]
pub trait SipSender: Send + Sync {
    async fn send_request(&self, request: rsip::Request) -> Result<()>;
    async fn send_response(&self, response: rsip::Response) -> Result<()>;
}

/// Callback hooks the transaction layer drives into this core.
#[async_trait]
pub trait TransactionUser: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn request_received(&self, request: rsip::Request, source: SocketAddr) -> Result<()>;
    async fn response_received(&self, response: rsip::Response) -> Result<()>;
    async fn client_transaction_terminated(&self, key: TransactionKey) -> Result<()>;
    /// `hard` tears dialogs down locally; otherwise each dialog is sent a BYE.
    /// Resolves once all dialogs and pending transactions have drained.
    async fn stop_transaction_user(&self, hard: bool) -> Result<()>;
}

/// Build a response for a request that matched no dialog (481, 604 and the
/// like): Via, From, To, CSeq, Call-ID mirrored per RFC 3261 8.2.6.
pub fn make_reply(request: &rsip::Request, status: rsip::StatusCode) -> rsip::Response {
    let mut headers = rsip::Headers::default();
    for header in request.headers.iter() {
        match header {
            rsip::Header::Via(v) => headers.push(rsip::Header::Via(v.clone())),
            rsip::Header::From(f) => headers.push(rsip::Header::From(f.clone())),
            rsip::Header::To(t) => headers.push(rsip::Header::To(t.clone())),
            rsip::Header::CSeq(c) => headers.push(rsip::Header::CSeq(c.clone())),
            rsip::Header::CallId(c) => headers.push(rsip::Header::CallId(c.clone())),
            _ => {}
        }
    }
    headers.push(rsip::Header::ContentLength(0u32.into()));
    rsip::Response {
        status_code: status,
        headers,
        body: vec![],
        version: request.version.clone(),
    }
}

/// Server transaction wrapper for non-INVITE requests: carries the original
/// request and the sender used to answer it.
#[derive(Clone)]
pub struct ServerTransaction {
    pub original: rsip::Request,
    pub source: SocketAddr,
    sender: Arc<dyn SipSender>,
}

impl ServerTransaction {
    pub fn new(original: rsip::Request, source: SocketAddr, sender: Arc<dyn SipSender>) -> Self {
        Self {
            original,
            source,
            sender,
        }
    }

    pub async fn respond(&self, response: rsip::Response) -> Result<()> {
        self.sender.send_response(response).await
    }

    pub async fn reply(&self, status: rsip::StatusCode) -> Result<()> {
        self.respond(make_reply(&self.original, status)).await
    }
}

/// INVITE-specific server transaction wrapper. Remembers the last final
/// response so the ACK retransmission timer can resend the 200 verbatim.
#[derive(Clone)]
pub struct ServerInviteTransaction {
    pub original: rsip::Request,
    pub source: SocketAddr,
    sender: Arc<dyn SipSender>,
    last_response: Arc<Mutex<Option<rsip::Response>>>,
}

impl ServerInviteTransaction {
    pub fn new(original: rsip::Request, source: SocketAddr, sender: Arc<dyn SipSender>) -> Self {
        Self {
            original,
            source,
            sender,
            last_response: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn respond(&self, response: rsip::Response) -> Result<()> {
        self.last_response
            .lock()
            .unwrap()
            .replace(response.clone());
        self.sender.send_response(response).await
    }

    pub async fn reply(&self, status: rsip::StatusCode) -> Result<()> {
        self.respond(make_reply(&self.original, status)).await
    }

    /// 100 Trying is not stored: it is never retransmitted.
    pub async fn send_trying(&self) -> Result<()> {
        self.sender
            .send_response(make_reply(&self.original, rsip::StatusCode::Trying))
            .await
    }

    pub async fn retransmit_last(&self) -> Result<()> {
        let last = self.last_response.lock().unwrap().clone();
        match last {
            Some(response) => self.sender.send_response(response).await,
            None => Ok(()),
        }
    }
}
