use crate::controller::{CallController, Hangup};
use crate::dialog::{Dialog, DialogConfig, DialogId, DialogState};
use crate::media::sdp::{Connection, MediaDescription, Origin};
use crate::media::{attach_local, MediaCookie, MediaEngine, SessionDescription};
use crate::transaction::SipSender;
use crate::Result;
use async_trait::async_trait;
use rsip::headers::*;
use rsip::{Method, StatusCode};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

mod test_dialog;

pub(crate) fn test_sdp(address: &str, port: u16) -> SessionDescription {
    SessionDescription {
        origin: Origin {
            username: "-".to_string(),
            session_id: "314159".to_string(),
            version: 1,
            network_type: "IN".to_string(),
            address_type: "IP4".to_string(),
            address: address.to_string(),
        },
        session_name: "call".to_string(),
        connection: Some(Connection {
            network_type: "IN".to_string(),
            address_type: "IP4".to_string(),
            address: address.to_string(),
        }),
        attributes: vec![],
        media: vec![MediaDescription {
            media: "audio".to_string(),
            port,
            protocol: "RTP/AVP".to_string(),
            formats: vec!["0".to_string()],
            attributes: vec![],
        }],
    }
}

pub(crate) struct TestEngine {
    pub next_cookie: AtomicU32,
    pub rtp_stops: AtomicU32,
    pub rtp_starts: Mutex<Vec<(String, u16)>>,
}

impl TestEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_cookie: AtomicU32::new(1),
            rtp_stops: AtomicU32::new(0),
            rtp_starts: Mutex::new(vec![]),
        })
    }
}

#[async_trait]
impl MediaEngine for TestEngine {
    async fn create_rtp_socket(&self, _host: &str) -> Result<MediaCookie> {
        Ok(MediaCookie(self.next_cookie.fetch_add(1, Ordering::SeqCst)))
    }

    async fn get_sdp(
        &self,
        _cookie: MediaCookie,
        offer: Option<&SessionDescription>,
    ) -> Result<SessionDescription> {
        Ok(test_sdp("127.0.0.1", if offer.is_some() { 9002 } else { 9000 }))
    }

    async fn rtp_start(&self, _cookie: MediaCookie, host: &str, port: u16) -> Result<()> {
        self.rtp_starts.lock().unwrap().push((host.to_string(), port));
        Ok(())
    }

    async fn rtp_stop(&self, _cookie: MediaCookie) -> Result<()> {
        self.rtp_stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn play_file(&self, _cookie: MediaCookie, _filename: &str, _format: &str) -> Result<bool> {
        Ok(true)
    }

    async fn stop_playing(&self, _cookie: MediaCookie) -> Result<()> {
        Ok(())
    }

    async fn start_recording(
        &self,
        _cookie: MediaCookie,
        _filename: &str,
        _format: &str,
    ) -> Result<()> {
        Ok(())
    }

    async fn stop_recording(&self, _cookie: MediaCookie) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct TestSender {
    pub requests: Mutex<Vec<rsip::Request>>,
    pub responses: Mutex<Vec<rsip::Response>>,
}

impl TestSender {
    pub fn requests_of(&self, method: Method) -> Vec<rsip::Request> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.method == method)
            .cloned()
            .collect()
    }

    pub fn response_count(&self) -> usize {
        self.responses.lock().unwrap().len()
    }
}

#[async_trait]
impl SipSender for TestSender {
    async fn send_request(&self, request: rsip::Request) -> Result<()> {
        self.requests.lock().unwrap().push(request);
        Ok(())
    }

    async fn send_response(&self, response: rsip::Response) -> Result<()> {
        self.responses.lock().unwrap().push(response);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct TestCallController {
    pub began: AtomicU32,
    pub ended: AtomicU32,
    pub failed: Mutex<Vec<StatusCode>>,
}

#[async_trait]
impl CallController for TestCallController {
    async fn accept_call(&self, _to: &rsip::Uri) -> bool {
        true
    }

    async fn call_began(&self, _id: &DialogId) {
        self.began.fetch_add(1, Ordering::SeqCst);
    }

    async fn call_failed(&self, _id: &DialogId, status: StatusCode) {
        self.failed.lock().unwrap().push(status);
    }

    async fn call_ended(&self, _id: &DialogId) {
        self.ended.fetch_add(1, Ordering::SeqCst);
    }

    async fn received_dtmf(&self, _id: &DialogId, _key: char) -> std::result::Result<(), Hangup> {
        Ok(())
    }

    async fn received_audio(
        &self,
        _id: &DialogId,
        _payload: &[u8],
    ) -> std::result::Result<(), Hangup> {
        Ok(())
    }
}

pub(crate) fn invite_request(
    call_id: &str,
    from_tag: &str,
    to_tag: Option<&str>,
    record_routes: &[&str],
    body: Vec<u8>,
) -> rsip::Request {
    let to = match to_tag {
        Some(tag) => To::new(format!("Bob <sip:bob@local.example.com>;tag={}", tag)),
        None => To::new("Bob <sip:bob@local.example.com>"),
    };
    let mut headers: Vec<rsip::Header> = vec![
        Via::new("SIP/2.0/UDP peer.example.com:5060;branch=z9hG4bK74bf9").into(),
        From::new(format!("Alice <sip:alice@peer.example.com>;tag={}", from_tag)).into(),
        to.into(),
        CallId::new(call_id).into(),
        CSeq::new("314159 INVITE").into(),
        Contact::new("<sip:alice@peer.example.com:5060>").into(),
        MaxForwards::new("70").into(),
    ];
    for route in record_routes {
        headers.push(RecordRoute::new(*route).into());
    }
    if !body.is_empty() {
        headers.push(ContentType::new("application/sdp").into());
    }
    headers.push(rsip::Header::ContentLength((body.len() as u32).into()));
    rsip::Request {
        method: Method::Invite,
        uri: rsip::Uri::try_from("sip:bob@local.example.com").unwrap(),
        headers: headers.into(),
        body,
        version: rsip::Version::V2,
    }
}

pub(crate) fn ack_request(
    call_id: &str,
    from_tag: &str,
    to_tag: &str,
    body: Vec<u8>,
) -> rsip::Request {
    let mut headers: Vec<rsip::Header> = vec![
        Via::new("SIP/2.0/UDP peer.example.com:5060;branch=z9hG4bKack01").into(),
        From::new(format!("Alice <sip:alice@peer.example.com>;tag={}", from_tag)).into(),
        To::new(format!("Bob <sip:bob@local.example.com>;tag={}", to_tag)).into(),
        CallId::new(call_id).into(),
        CSeq::new("314159 ACK").into(),
        MaxForwards::new("70").into(),
    ];
    if !body.is_empty() {
        headers.push(ContentType::new("application/sdp").into());
    }
    headers.push(rsip::Header::ContentLength((body.len() as u32).into()));
    rsip::Request {
        method: Method::Ack,
        uri: rsip::Uri::try_from("sip:bob@local.example.com").unwrap(),
        headers: headers.into(),
        body,
        version: rsip::Version::V2,
    }
}

pub(crate) struct DialogHarness {
    pub dialog: Dialog,
    pub engine: Arc<TestEngine>,
    pub sender: Arc<TestSender>,
    pub controller: Arc<TestCallController>,
    #[allow(dead_code)]
    pub states: UnboundedReceiver<(DialogId, DialogState)>,
}

pub(crate) async fn server_dialog(
    config: DialogConfig,
    request: &rsip::Request,
) -> DialogHarness {
    let engine = TestEngine::new();
    let (media, _event_tx, _event_rx) = attach_local(engine.clone());
    let sender = Arc::new(TestSender::default());
    let controller = Arc::new(TestCallController::default());
    let (state_tx, states) = tokio::sync::mpsc::unbounded_channel();
    let dialog = Dialog::for_server(
        request,
        rsip::Uri::try_from("sip:bob@local.example.com:5060").unwrap(),
        media,
        controller.clone(),
        sender.clone(),
        state_tx,
        CancellationToken::new(),
        config,
    )
    .await
    .expect("for_server failed");
    DialogHarness {
        dialog,
        engine,
        sender,
        controller,
        states,
    }
}
