use super::DialogId;
use crate::controller::CallController;
use crate::media::{MediaController, MediaCookie, SessionDescription};
use crate::rsip_ext::{is_loose_router, RsipRequestExt, RsipResponseExt};
use crate::transaction::{
    make_call_id, make_tag, make_via_branch, random_cseq, ServerInviteTransaction, SipSender,
};
use crate::{Error, Result};
use rand::Rng;
use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use rsip::{Header, Method, StatusCode};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Client,
    Server,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Client => write!(f, "client"),
            Direction::Server => write!(f, "server"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Early,
    Confirmed,
    ReinviteWaiting,
    ReinviteSent,
    ByeSent,
    Terminated,
}

impl std::fmt::Display for DialogState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialogState::Early => write!(f, "early"),
            DialogState::Confirmed => write!(f, "confirmed"),
            DialogState::ReinviteWaiting => write!(f, "reinvite-waiting"),
            DialogState::ReinviteSent => write!(f, "reinvite-sent"),
            DialogState::ByeSent => write!(f, "bye-sent"),
            DialogState::Terminated => write!(f, "terminated"),
        }
    }
}

pub type DialogStateSender = UnboundedSender<(DialogId, DialogState)>;

/// Timer and retry knobs. The glare windows follow RFC 3261 14.1: the side
/// that owns the Call-ID retries a collided re-INVITE in the higher window,
/// the other side in the lower one.
#[derive(Debug, Clone)]
pub struct DialogConfig {
    pub ack_retry_initial: Duration,
    pub ack_retry_ceiling: Duration,
    pub ack_max_retries: u32,
    pub glare_retry_owner: (Duration, Duration),
    pub glare_retry_other: (Duration, Duration),
}

impl Default for DialogConfig {
    fn default() -> Self {
        Self {
            ack_retry_initial: Duration::from_millis(500),
            ack_retry_ceiling: Duration::from_secs(4),
            ack_max_retries: 10,
            glare_retry_owner: (Duration::from_millis(2100), Duration::from_millis(4000)),
            glare_retry_other: (Duration::from_millis(0), Duration::from_millis(2000)),
        }
    }
}

struct PendingReinvite {
    contact: Option<rsip::Uri>,
    session: SessionDescription,
}

pub(crate) struct DialogInner {
    pub(crate) direction: Direction,
    pub(crate) cancel_token: CancellationToken,
    pub(crate) id: Mutex<DialogId>,
    state: Mutex<DialogState>,
    /// Our address including tag; always the From of locally built requests.
    local: Mutex<rsip::typed::From>,
    /// Peer address; gains its tag when the dialog is established.
    remote: Mutex<rsip::typed::To>,
    local_contact: Mutex<rsip::Uri>,
    remote_uri: Mutex<rsip::Uri>,
    route_set: Mutex<Vec<rsip::headers::Route>>,
    local_seq: AtomicU32,
    /// Highest CSeq seen from the peer; requests below it are stale
    /// retransmissions of something already handled.
    remote_seq: AtomicU32,
    /// CSeq number of the INVITE an ACK must echo (ACK shares the INVITE's
    /// number rather than incrementing).
    invite_cseq: AtomicU32,
    invite_outstanding: AtomicBool,
    pending_reinvite: Mutex<Option<PendingReinvite>>,
    pub(crate) initial_invite_tx: Mutex<Option<ServerInviteTransaction>>,
    ack_timer: Mutex<Option<CancellationToken>>,
    session: Mutex<Option<SessionDescription>>,
    no_sdp: bool,
    pub(crate) cookie: MediaCookie,
    began: AtomicBool,
    ended: AtomicBool,
    pub(crate) media: MediaController,
    pub(crate) controller: Arc<dyn CallController>,
    sender: Arc<dyn SipSender>,
    state_sender: DialogStateSender,
    config: DialogConfig,
}

/// One call leg. Cheap to clone; all state lives behind the shared inner.
#[derive(Clone)]
pub struct Dialog {
    pub(crate) inner: Arc<DialogInner>,
}

fn build_via(contact: &rsip::Uri) -> rsip::typed::Via {
    rsip::typed::Via {
        version: rsip::Version::V2,
        transport: rsip::Transport::Udp,
        uri: rsip::Uri {
            host_with_port: contact.host_with_port.clone(),
            ..Default::default()
        },
        params: vec![make_via_branch()],
    }
}

fn to_from(addr: rsip::typed::To) -> rsip::typed::From {
    rsip::typed::From {
        display_name: addr.display_name,
        uri: addr.uri,
        params: addr.params,
    }
}

fn from_to(addr: rsip::typed::From) -> rsip::typed::To {
    rsip::typed::To {
        display_name: addr.display_name,
        uri: addr.uri,
        params: addr.params,
    }
}

impl Dialog {
    /// Construct a dialog from an inbound initial INVITE. Allocates the local
    /// tag and the media session; the dialog is only handed back once the RTP
    /// socket exists, so every returned dialog owns a live cookie.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn for_server(
        request: &rsip::Request,
        contact: rsip::Uri,
        media: MediaController,
        controller: Arc<dyn CallController>,
        sender: Arc<dyn SipSender>,
        state_sender: DialogStateSender,
        cancel_token: CancellationToken,
        config: DialogConfig,
    ) -> Result<Dialog> {
        let local_tag = make_tag();
        let mut id = DialogId::from_request(request)?;
        id.local_tag = local_tag.to_string();

        let remote = from_to(request.from_header()?.typed()?);
        let local = to_from(request.to_header()?.typed()?.with_tag(local_tag));

        let route_set = request.record_route_set();
        let remote_uri = request.contact_uri().unwrap_or_else(|_| remote.uri.clone());
        let invite_cseq = request.cseq_header()?.seq()?;

        let cookie = media
            .create_rtp_socket(&contact.host_with_port.host.to_string())
            .await?;
        info!(id = %id, %cookie, "inbound dialog created");

        Ok(Dialog {
            inner: Arc::new(DialogInner {
                direction: Direction::Server,
                cancel_token,
                id: Mutex::new(id),
                state: Mutex::new(DialogState::Early),
                local: Mutex::new(local),
                remote: Mutex::new(remote),
                local_contact: Mutex::new(contact),
                remote_uri: Mutex::new(remote_uri),
                route_set: Mutex::new(route_set),
                local_seq: AtomicU32::new(random_cseq()),
                remote_seq: AtomicU32::new(invite_cseq),
                invite_cseq: AtomicU32::new(invite_cseq),
                invite_outstanding: AtomicBool::new(true),
                pending_reinvite: Mutex::new(None),
                initial_invite_tx: Mutex::new(None),
                ack_timer: Mutex::new(None),
                session: Mutex::new(None),
                no_sdp: false,
                cookie,
                began: AtomicBool::new(false),
                ended: AtomicBool::new(false),
                media,
                controller,
                sender,
                state_sender,
                config,
            }),
        })
    }

    /// Construct an outbound dialog and its initial INVITE. Unless `no_sdp`
    /// is set, the local offer is obtained first and embedded as the request
    /// body; with `no_sdp` the body stays empty and offer/answer happens in
    /// the ACK.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn for_client(
        host: &str,
        contact: rsip::Uri,
        target: rsip::Uri,
        display_name: Option<String>,
        no_sdp: bool,
        media: MediaController,
        controller: Arc<dyn CallController>,
        sender: Arc<dyn SipSender>,
        state_sender: DialogStateSender,
        cancel_token: CancellationToken,
        config: DialogConfig,
    ) -> Result<(Dialog, rsip::Request)> {
        let local_tag = make_tag();
        let call_id = make_call_id(host);

        let cookie = media
            .create_rtp_socket(&contact.host_with_port.host.to_string())
            .await?;
        let offer = if no_sdp {
            None
        } else {
            Some(media.get_sdp(cookie, None).await?)
        };

        let local = rsip::typed::From {
            display_name: display_name.clone(),
            uri: contact.clone(),
            params: vec![rsip::Param::Tag(local_tag.clone())],
        };
        let remote = rsip::typed::To {
            display_name: None,
            uri: target.clone(),
            params: vec![],
        };

        let seq = random_cseq();
        let body = offer
            .as_ref()
            .map(|s| s.to_string().into_bytes())
            .unwrap_or_default();
        let mut headers = vec![
            Header::Via(build_via(&contact).into()),
            Header::CallId(call_id.clone().into()),
            Header::From(local.clone().into()),
            Header::To(remote.clone().into()),
            Header::CSeq(
                rsip::typed::CSeq {
                    seq,
                    method: Method::Invite,
                }
                .into(),
            ),
            rsip::headers::Contact::new(format!("<{}>", contact)).into(),
            Header::MaxForwards(70.into()),
        ];
        if !body.is_empty() {
            headers.push(Header::ContentType("application/sdp".into()));
        }
        headers.push(Header::ContentLength((body.len() as u32).into()));

        let request = rsip::Request {
            method: Method::Invite,
            uri: target.clone(),
            headers: headers.into(),
            body,
            version: rsip::Version::V2,
        };

        let id = DialogId {
            call_id,
            local_tag: local_tag.to_string(),
            remote_tag: String::new(),
        };
        info!(id = %id, %cookie, "outbound dialog created");

        let dialog = Dialog {
            inner: Arc::new(DialogInner {
                direction: Direction::Client,
                cancel_token,
                id: Mutex::new(id),
                state: Mutex::new(DialogState::Early),
                local: Mutex::new(local),
                remote: Mutex::new(remote),
                local_contact: Mutex::new(contact),
                remote_uri: Mutex::new(target),
                route_set: Mutex::new(vec![]),
                local_seq: AtomicU32::new(seq),
                remote_seq: AtomicU32::new(0),
                invite_cseq: AtomicU32::new(seq),
                invite_outstanding: AtomicBool::new(true),
                pending_reinvite: Mutex::new(None),
                initial_invite_tx: Mutex::new(None),
                ack_timer: Mutex::new(None),
                session: Mutex::new(offer),
                no_sdp,
                cookie,
                began: AtomicBool::new(false),
                ended: AtomicBool::new(false),
                media,
                controller,
                sender,
                state_sender,
                config,
            }),
        };
        Ok((dialog, request))
    }

    pub fn id(&self) -> DialogId {
        self.inner.id.lock().unwrap().clone()
    }

    pub fn state(&self) -> DialogState {
        *self.inner.state.lock().unwrap()
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    pub fn cookie(&self) -> MediaCookie {
        self.inner.cookie
    }

    pub fn session(&self) -> Option<SessionDescription> {
        self.inner.session.lock().unwrap().clone()
    }

    pub(crate) fn set_session(&self, session: SessionDescription) {
        *self.inner.session.lock().unwrap() = Some(session);
    }

    pub(crate) fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::SeqCst)
    }

    pub(crate) fn invite_outstanding(&self) -> bool {
        self.inner.invite_outstanding.load(Ordering::SeqCst)
    }

    pub(crate) fn has_begun(&self) -> bool {
        self.inner.began.load(Ordering::SeqCst)
    }

    /// Advance the remote CSeq high-water mark. Returns false for a request
    /// whose CSeq is below it, i.e. an out-of-order retransmission of
    /// something already handled; the caller answers 500 and goes no further.
    pub(crate) fn check_remote_seq(&self, request: &rsip::Request) -> Result<bool> {
        let cseq = request.cseq_header()?.seq()?;
        let remote_seq = self.inner.remote_seq.load(Ordering::SeqCst);
        if remote_seq > 0 && cseq < remote_seq {
            info!(id = %self.id(), remote_seq, cseq, "dropping stale in-dialog request");
            return Ok(false);
        }
        self.inner.remote_seq.store(cseq, Ordering::SeqCst);
        Ok(true)
    }

    fn transition(&self, state: DialogState) {
        {
            let mut guard = self.inner.state.lock().unwrap();
            if *guard == DialogState::Terminated || *guard == state {
                return;
            }
            debug!(id = %self.id(), from = %*guard, to = %state, "dialog state");
            *guard = state;
        }
        let _ = self.inner.state_sender.send((self.id(), state));
    }

    /// Build an in-dialog request. Every call draws the next CSeq unless a
    /// specific one is supplied (ACK echoes its INVITE's). A strict first
    /// route entry takes over the request-URI and is popped from the set.
    pub(crate) fn generate_request(
        &self,
        method: Method,
        cseq: Option<u32>,
        body: Vec<u8>,
    ) -> Result<rsip::Request> {
        let seq = cseq.unwrap_or_else(|| self.inner.local_seq.fetch_add(1, Ordering::SeqCst) + 1);

        let mut uri = self.inner.remote_uri.lock().unwrap().clone();
        let mut route_set = self.inner.route_set.lock().unwrap().clone();
        if let Some(first) = route_set.first() {
            if let Some(first_hop) = first.typed()?.uris().first() {
                if !is_loose_router(&first_hop.uri) {
                    uri = first_hop.uri.clone();
                    route_set.remove(0);
                }
            }
        }

        let local = self.inner.local.lock().unwrap().clone();
        let remote = self.inner.remote.lock().unwrap().clone();
        let contact = self.inner.local_contact.lock().unwrap().clone();
        let call_id = self.inner.id.lock().unwrap().call_id.clone();

        let mut headers = vec![
            Header::Via(build_via(&contact).into()),
            Header::CallId(call_id.into()),
            Header::From(local.into()),
            Header::To(remote.into()),
            Header::CSeq(rsip::typed::CSeq { seq, method }.into()),
            rsip::headers::Contact::new(format!("<{}>", contact)).into(),
            Header::MaxForwards(70.into()),
        ];
        for route in route_set {
            headers.push(Header::Route(route));
        }
        if !body.is_empty() {
            headers.push(Header::ContentType("application/sdp".into()));
        }
        headers.push(Header::ContentLength((body.len() as u32).into()));

        Ok(rsip::Request {
            method,
            uri,
            headers: headers.into(),
            body,
            version: rsip::Version::V2,
        })
    }

    /// Build a response to an in-dialog request, mirroring the usual headers
    /// and stamping our tag onto To (except on 100).
    pub(crate) fn make_response(
        &self,
        request: &rsip::Request,
        status: StatusCode,
        body: Vec<u8>,
    ) -> rsip::Response {
        let mut headers = rsip::Headers::default();
        for header in request.headers.iter() {
            match header {
                Header::Via(v) => headers.push(Header::Via(v.clone())),
                Header::From(f) => headers.push(Header::From(f.clone())),
                Header::To(t) => {
                    let mut to = match t.clone().typed() {
                        Ok(to) => to,
                        Err(e) => {
                            warn!(id = %self.id(), error = %e, "unparseable To header");
                            continue;
                        }
                    };
                    if status != StatusCode::Trying
                        && !to.params.iter().any(|p| matches!(p, rsip::Param::Tag(_)))
                    {
                        to.params.push(rsip::Param::Tag(
                            self.inner.id.lock().unwrap().local_tag.clone().into(),
                        ));
                    }
                    headers.push(Header::To(to.into()));
                }
                Header::CSeq(c) => headers.push(Header::CSeq(c.clone())),
                Header::CallId(c) => headers.push(Header::CallId(c.clone())),
                Header::RecordRoute(rr) => headers.push(Header::RecordRoute(rr.clone())),
                _ => {}
            }
        }
        let contact = self.inner.local_contact.lock().unwrap().clone();
        headers.push(rsip::headers::Contact::new(format!("<{}>", contact)).into());
        if !body.is_empty() {
            headers.push(Header::ContentType("application/sdp".into()));
        }
        headers.push(Header::ContentLength((body.len() as u32).into()));

        rsip::Response {
            status_code: status,
            headers,
            body,
            version: request.version.clone(),
        }
    }

    pub(crate) async fn send_ack(&self, body: Option<&SessionDescription>) -> Result<()> {
        let cseq = self.inner.invite_cseq.load(Ordering::SeqCst);
        let body = body.map(|s| s.to_string().into_bytes()).unwrap_or_default();
        let request = self.generate_request(Method::Ack, Some(cseq), body)?;
        self.inner.sender.send_request(request).await
    }

    pub async fn send_bye(&self) -> Result<()> {
        if self.is_ended() {
            return Ok(());
        }
        let request = self.generate_request(Method::Bye, None, vec![])?;
        self.transition(DialogState::ByeSent);
        self.inner.sender.send_request(request).await?;
        self.end().await;
        Ok(())
    }

    /// Idempotent teardown: exactly one RTPStop and exactly one `call_ended`
    /// regardless of how many paths reach it.
    pub(crate) async fn end(&self) {
        if self.inner.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        self.teardown().await;
        let id = self.id();
        info!(id = %id, "dialog ended");
        self.inner.controller.call_ended(&id).await;
    }

    /// Failure twin of [`Dialog::end`]: same single-teardown guard, but the
    /// application hears `call_failed` instead of `call_ended`.
    pub(crate) async fn fail(&self, status: StatusCode) {
        if self.inner.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        self.teardown().await;
        let id = self.id();
        info!(id = %id, %status, "dialog failed");
        self.inner.controller.call_failed(&id, status).await;
    }

    async fn teardown(&self) {
        self.cancel_ack_timer();
        self.inner.cancel_token.cancel();
        if let Err(e) = self.inner.media.rtp_stop(self.inner.cookie).await {
            warn!(id = %self.id(), error = %e, "rtp stop failed");
        }
        self.transition(DialogState::Terminated);
    }

    /// Retransmit the stored 2xx until the ACK arrives, doubling the delay
    /// from the initial interval up to the ceiling. Past the retry bound the
    /// peer is treated as unreachable: one BYE, then teardown.
    pub(crate) fn arm_ack_timer(&self, tx: ServerInviteTransaction) {
        let token = self.inner.cancel_token.child_token();
        if let Some(prev) = self.inner.ack_timer.lock().unwrap().replace(token.clone()) {
            prev.cancel();
        }
        let dialog = self.clone();
        tokio::spawn(async move {
            let mut delay = dialog.inner.config.ack_retry_initial;
            for attempt in 1..=dialog.inner.config.ack_max_retries {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                debug!(id = %dialog.id(), attempt, "no ACK yet, retransmitting 2xx");
                if tx.retransmit_last().await.is_err() {
                    break;
                }
                delay = std::cmp::min(delay * 2, dialog.inner.config.ack_retry_ceiling);
            }
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            warn!(id = %dialog.id(), "ACK never arrived, hanging up");
            dialog.send_bye().await.ok();
        });
    }

    pub(crate) fn cancel_ack_timer(&self) {
        if let Some(token) = self.inner.ack_timer.lock().unwrap().take() {
            token.cancel();
        }
    }

    /// Peer acknowledged our 2xx. First ACK confirms the dialog and fires
    /// `call_began`; a body here is the peer's answer to an offer we made in
    /// the 2xx (deferred-offer flow) and starts audio.
    pub(crate) async fn handle_ack(&self, request: &rsip::Request) -> Result<()> {
        self.cancel_ack_timer();
        self.inner.invite_outstanding.store(false, Ordering::SeqCst);
        self.inner.initial_invite_tx.lock().unwrap().take();
        self.transition(DialogState::Confirmed);
        if !self.inner.began.swap(true, Ordering::SeqCst) {
            self.inner.controller.call_began(&self.id()).await;
        }
        if !request.body.is_empty() {
            let answer = SessionDescription::parse(&request.body)?;
            if let Some((host, port)) = answer.media_target() {
                self.inner
                    .media
                    .rtp_start(self.inner.cookie, &host, port)
                    .await?;
            }
        }
        self.pump_pending_reinvite().await;
        Ok(())
    }

    /// 2xx arrived for our initial INVITE: capture the remote tag, the
    /// reversed Record-Route set and the peer contact, start audio, and ACK.
    pub(crate) async fn confirm_client(&self, response: &rsip::Response) -> Result<()> {
        let remote_tag = response
            .to_header()?
            .tag()?
            .map(|t| t.to_string())
            .unwrap_or_default();
        self.inner.id.lock().unwrap().remote_tag = remote_tag.clone();
        if !remote_tag.is_empty() {
            let mut remote = self.inner.remote.lock().unwrap();
            if !remote.params.iter().any(|p| matches!(p, rsip::Param::Tag(_))) {
                *remote = remote.clone().with_tag(remote_tag.into());
            }
        }
        *self.inner.route_set.lock().unwrap() = response.record_route_set();
        if let Ok(contact) = response.contact_uri() {
            *self.inner.remote_uri.lock().unwrap() = contact;
        }
        self.transition(DialogState::Confirmed);
        self.inner.invite_outstanding.store(false, Ordering::SeqCst);

        let ack_body = if self.inner.no_sdp {
            // we sent no offer, so the 2xx body is the peer's offer and our
            // answer rides in the ACK
            let offer = SessionDescription::parse(&response.body)?;
            let answer = self
                .inner
                .media
                .get_sdp(self.inner.cookie, Some(offer.clone()))
                .await?;
            if let Some((host, port)) = offer.media_target() {
                self.inner
                    .media
                    .rtp_start(self.inner.cookie, &host, port)
                    .await?;
            }
            *self.inner.session.lock().unwrap() = Some(answer.clone());
            Some(answer)
        } else {
            if response.body.is_empty() {
                warn!(id = %self.id(), "2xx carried no answer, audio not started");
            } else {
                let answer = SessionDescription::parse(&response.body)?;
                if let Some((host, port)) = answer.media_target() {
                    self.inner
                        .media
                        .rtp_start(self.inner.cookie, &host, port)
                        .await?;
                }
            }
            None
        };
        self.send_ack(ack_body.as_ref()).await?;

        if !self.inner.began.swap(true, Ordering::SeqCst) {
            self.inner.controller.call_began(&self.id()).await;
        }
        self.pump_pending_reinvite().await;
        Ok(())
    }

    /// Renegotiate the session. If an INVITE transaction is already in flight
    /// on this dialog the re-INVITE is deferred, not dropped, and goes out
    /// once the outstanding transaction settles.
    pub async fn reinvite(
        &self,
        new_contact: Option<rsip::Uri>,
        new_session: SessionDescription,
    ) -> Result<()> {
        if self.is_ended() {
            return Err(Error::Dialog("dialog is terminated".into(), self.id()));
        }
        if self.invite_outstanding() {
            self.inner
                .pending_reinvite
                .lock()
                .unwrap()
                .replace(PendingReinvite {
                    contact: new_contact,
                    session: new_session,
                });
            self.transition(DialogState::ReinviteWaiting);
            return Ok(());
        }
        self.send_reinvite(new_contact, new_session).await
    }

    async fn send_reinvite(
        &self,
        new_contact: Option<rsip::Uri>,
        new_session: SessionDescription,
    ) -> Result<()> {
        if let Some(contact) = new_contact {
            *self.inner.local_contact.lock().unwrap() = contact;
        }
        let merged = {
            let mut guard = self.inner.session.lock().unwrap();
            match guard.as_mut() {
                Some(session) => {
                    session.merge(&new_session);
                    session.clone()
                }
                None => {
                    *guard = Some(new_session.clone());
                    new_session
                }
            }
        };
        self.transmit_reinvite(merged).await
    }

    async fn transmit_reinvite(&self, session: SessionDescription) -> Result<()> {
        let request =
            self.generate_request(Method::Invite, None, session.to_string().into_bytes())?;
        let seq = request.cseq_header()?.seq()?;
        self.inner.invite_cseq.store(seq, Ordering::SeqCst);
        self.inner.invite_outstanding.store(true, Ordering::SeqCst);
        self.transition(DialogState::ReinviteSent);
        self.inner.sender.send_request(request).await
    }

    /// Final response to a re-INVITE we sent. 491 means we collided with the
    /// peer's own re-INVITE: back off for a randomized, direction-asymmetric
    /// delay and resend; anything else settles the transaction.
    pub(crate) async fn handle_reinvite_response(&self, response: &rsip::Response) -> Result<()> {
        if response.status_code.kind() == rsip::StatusCodeKind::Provisional {
            return Ok(());
        }
        self.inner.invite_outstanding.store(false, Ordering::SeqCst);

        if response.status_code == StatusCode::RequestPending {
            self.transition(DialogState::Confirmed);
            self.schedule_glare_retry();
            return Ok(());
        }

        if response.status_code.kind() == rsip::StatusCodeKind::Successful {
            if !response.body.is_empty() {
                let answer = SessionDescription::parse(&response.body)?;
                if let Some((host, port)) = answer.media_target() {
                    self.inner
                        .media
                        .rtp_start(self.inner.cookie, &host, port)
                        .await?;
                }
            }
            self.send_ack(None).await?;
        } else {
            // non-2xx ACK is the transaction layer's business
            warn!(id = %self.id(), status = %response.status_code, "re-INVITE rejected");
        }
        self.transition(DialogState::Confirmed);
        self.pump_pending_reinvite().await;
        Ok(())
    }

    fn schedule_glare_retry(&self) {
        let (low, high) = match self.inner.direction {
            Direction::Client => self.inner.config.glare_retry_owner,
            Direction::Server => self.inner.config.glare_retry_other,
        };
        let delay = low + high.saturating_sub(low).mul_f64(rand::thread_rng().gen::<f64>());
        debug!(id = %self.id(), ?delay, "re-INVITE collision, backing off");
        let token = self.inner.cancel_token.child_token();
        let dialog = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if dialog.is_ended() || dialog.invite_outstanding() {
                return;
            }
            let session = dialog.session();
            if let Some(session) = session {
                dialog.transmit_reinvite(session).await.ok();
            }
        });
    }

    /// In-dialog INVITE from the peer. Our own INVITE in flight means glare:
    /// answer 491 and leave the session untouched. Otherwise negotiate an
    /// answer, merge it in, repoint audio, and 200 with the ACK timer armed.
    pub(crate) async fn handle_server_reinvite(&self, tx: &ServerInviteTransaction) -> Result<()> {
        if self.invite_outstanding() {
            return tx.reply(StatusCode::RequestPending).await;
        }

        let offer = match SessionDescription::parse(&tx.original.body) {
            Ok(offer) if offer.has_usable_media() => offer,
            _ => return tx.reply(StatusCode::NotAcceptableHere).await,
        };
        let answer = match self
            .inner
            .media
            .get_sdp(self.inner.cookie, Some(offer.clone()))
            .await
        {
            Ok(answer) if answer.has_usable_media() => answer,
            _ => return tx.reply(StatusCode::NotAcceptableHere).await,
        };

        {
            let mut guard = self.inner.session.lock().unwrap();
            match guard.as_mut() {
                Some(session) => session.merge(&answer),
                None => *guard = Some(answer.clone()),
            }
        }
        if let Some((host, port)) = offer.media_target() {
            self.inner
                .media
                .rtp_start(self.inner.cookie, &host, port)
                .await?;
        }

        let response =
            self.make_response(&tx.original, StatusCode::OK, answer.to_string().into_bytes());
        self.inner.invite_outstanding.store(true, Ordering::SeqCst);
        tx.respond(response).await?;
        self.arm_ack_timer(tx.clone());
        Ok(())
    }

    pub(crate) async fn pump_pending_reinvite(&self) {
        if self.is_ended() {
            return;
        }
        let pending = self.inner.pending_reinvite.lock().unwrap().take();
        if let Some(PendingReinvite { contact, session }) = pending {
            debug!(id = %self.id(), "sending deferred re-INVITE");
            if let Err(e) = self.send_reinvite(contact, session).await {
                warn!(id = %self.id(), error = %e, "deferred re-INVITE failed");
            }
        }
    }

    pub async fn play_file(&self, filename: &str, format: &str) -> Result<bool> {
        self.inner
            .media
            .play_file(self.inner.cookie, filename, format)
            .await
    }

    pub async fn stop_playing(&self) -> Result<()> {
        self.inner.media.stop_playing(self.inner.cookie).await
    }

    pub async fn start_recording(&self, filename: &str, format: &str) -> Result<()> {
        self.inner
            .media
            .start_recording(self.inner.cookie, filename, format)
            .await
    }

    pub async fn stop_recording(&self) -> Result<()> {
        self.inner.media.stop_recording(self.inner.cookie).await
    }
}
