//! Demultiplexes inbound SIP traffic onto dialogs, creates dialogs for
//! inbound and outbound calls, tracks in-flight client transactions, and
//! drives graceful shutdown.

use crate::controller::CallController;
use crate::dialog::{Dialog, DialogConfig, DialogId, DialogState, DialogStateSender};
use crate::media::{MediaController, MediaCookie, MediaEvent, SessionDescription};
use crate::transaction::{
    ServerInviteTransaction, ServerTransaction, SipSender, TransactionKey, TransactionUser,
};
use crate::{Error, Result};
use async_trait::async_trait;
use rsip::prelude::{HeadersExt, ToTypedHeader};
use rsip::{Method, StatusCode};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};


pub struct UserAgentBuilder {
    host: String,
    contact: Option<rsip::Uri>,
    media: Option<MediaController>,
    controller: Option<Arc<dyn CallController>>,
    sender: Option<Arc<dyn SipSender>>,
    config: DialogConfig,
    cancel_token: Option<CancellationToken>,
}

impl Default for UserAgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl UserAgentBuilder {
    pub fn new() -> Self {
        Self {
            host: "127.0.0.1:5060".to_string(),
            contact: None,
            media: None,
            controller: None,
            sender: None,
            config: DialogConfig::default(),
            cancel_token: None,
        }
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    pub fn with_contact(mut self, contact: rsip::Uri) -> Self {
        self.contact = Some(contact);
        self
    }

    pub fn with_media(mut self, media: MediaController) -> Self {
        self.media = Some(media);
        self
    }

    pub fn with_controller(mut self, controller: Arc<dyn CallController>) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn with_sender(mut self, sender: Arc<dyn SipSender>) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn with_dialog_config(mut self, config: DialogConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn build(self) -> Result<UserAgent> {
        let media = self
            .media
            .ok_or_else(|| Error::Error("media controller required".into()))?;
        let controller = self
            .controller
            .ok_or_else(|| Error::Error("call controller required".into()))?;
        let sender = self
            .sender
            .ok_or_else(|| Error::Error("sip sender required".into()))?;
        let contact = match self.contact {
            Some(contact) => contact,
            None => rsip::Uri::try_from(format!("sip:{}", self.host).as_str())?,
        };
        let (state_tx, state_rx) = unbounded_channel();
        Ok(UserAgent {
            inner: Arc::new(UserAgentInner {
                host: self.host,
                contact,
                dialogs: Mutex::new(HashMap::new()),
                cts: Mutex::new(HashMap::new()),
                media,
                controller,
                sender,
                state_tx,
                state_rx: Mutex::new(Some(state_rx)),
                cancel_token: self.cancel_token.unwrap_or_default(),
                config: self.config,
                shutdown_pending: AtomicBool::new(false),
                drained: Notify::new(),
            }),
        })
    }
}

pub(crate) struct UserAgentInner {
    pub host: String,
    pub contact: rsip::Uri,
    pub dialogs: Mutex<HashMap<DialogId, Dialog>>,
    /// In-flight client transactions, keyed before the dialog's remote tag
    /// is known.
    pub cts: Mutex<HashMap<TransactionKey, DialogId>>,
    media: MediaController,
    controller: Arc<dyn CallController>,
    sender: Arc<dyn SipSender>,
    state_tx: DialogStateSender,
    state_rx: Mutex<Option<UnboundedReceiver<(DialogId, DialogState)>>>,
    cancel_token: CancellationToken,
    config: DialogConfig,
    shutdown_pending: AtomicBool,
    drained: Notify,
}

/// One signaling endpoint. Cheap to clone.
#[derive(Clone)]
pub struct UserAgent {
    pub(crate) inner: Arc<UserAgentInner>,
}

impl UserAgent {
    /// Place an outbound call. The returned dialog is early until the peer
    /// answers; progress surfaces through the call controller.
    pub async fn invite(
        &self,
        target: rsip::Uri,
        display_name: Option<String>,
        no_sdp: bool,
    ) -> Result<Dialog> {
        if self.inner.shutdown_pending.load(Ordering::SeqCst) {
            return Err(Error::Error("user agent is shutting down".into()));
        }
        let (dialog, request) = Dialog::for_client(
            &self.inner.host,
            self.inner.contact.clone(),
            target,
            display_name,
            no_sdp,
            self.inner.media.clone(),
            self.inner.controller.clone(),
            self.inner.sender.clone(),
            self.inner.state_tx.clone(),
            self.inner.cancel_token.child_token(),
            self.inner.config.clone(),
        )
        .await?;

        let key = TransactionKey::try_from(&request)?;
        self.inner
            .cts
            .lock()
            .unwrap()
            .insert(key, dialog.id());
        self.inner
            .dialogs
            .lock()
            .unwrap()
            .insert(dialog.id(), dialog.clone());
        self.inner.sender.send_request(request).await?;
        Ok(dialog)
    }

    /// Route DTMF and audio notifications from the media engine to the
    /// application; an `Err(Hangup)` from either callback sends BYE.
    pub fn serve_media_events(&self, mut events: UnboundedReceiver<MediaEvent>) {
        let agent = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    MediaEvent::Dtmf { cookie, key } => {
                        let Some(dialog) = agent.find_dialog_by_cookie(cookie) else {
                            continue;
                        };
                        if agent
                            .inner
                            .controller
                            .received_dtmf(&dialog.id(), key)
                            .await
                            .is_err()
                        {
                            dialog.send_bye().await.ok();
                        }
                    }
                    MediaEvent::Audio { cookie, payload } => {
                        let Some(dialog) = agent.find_dialog_by_cookie(cookie) else {
                            continue;
                        };
                        if agent
                            .inner
                            .controller
                            .received_audio(&dialog.id(), &payload)
                            .await
                            .is_err()
                        {
                            dialog.send_bye().await.ok();
                        }
                    }
                }
            }
        });
    }

    pub fn dialog_count(&self) -> usize {
        self.inner.dialogs.lock().unwrap().len()
    }

    fn find_dialog(&self, id: &DialogId) -> Option<Dialog> {
        self.inner.dialogs.lock().unwrap().get(id).cloned()
    }

    fn find_dialog_by_cookie(&self, cookie: MediaCookie) -> Option<Dialog> {
        self.inner
            .dialogs
            .lock()
            .unwrap()
            .values()
            .find(|d| d.cookie() == cookie)
            .cloned()
    }

    /// CANCEL carries no To-tag, so it cannot hit the dialogs map directly;
    /// fall back to Call-ID plus remote tag.
    fn find_dialog_for_cancel(&self, id: &DialogId) -> Option<Dialog> {
        if let Some(dialog) = self.find_dialog(id) {
            return Some(dialog);
        }
        self.inner
            .dialogs
            .lock()
            .unwrap()
            .values()
            .find(|d| {
                let did = d.id();
                did.call_id == id.call_id && did.remote_tag == id.remote_tag
            })
            .cloned()
    }

    fn remove_dialog(&self, id: &DialogId) {
        self.inner.dialogs.lock().unwrap().remove(id);
        self.check_drained();
    }

    fn check_drained(&self) {
        if self.inner.shutdown_pending.load(Ordering::SeqCst)
            && self.inner.dialogs.lock().unwrap().is_empty()
            && self.inner.cts.lock().unwrap().is_empty()
        {
            self.inner.drained.notify_waiters();
        }
    }

    async fn process_invite(&self, tx: ServerInviteTransaction) -> Result<()> {
        let id = DialogId::from_request(&tx.original)?;
        if let Some(dialog) = self.find_dialog(&id) {
            if !dialog.check_remote_seq(&tx.original)? {
                return tx.reply(StatusCode::ServerInternalError).await;
            }
            return dialog.handle_server_reinvite(&tx).await;
        }
        if !id.local_tag.is_empty() {
            // in-dialog INVITE for a dialog we do not have
            return tx.reply(StatusCode::CallTransactionDoesNotExist).await;
        }

        tx.send_trying().await?;

        let to = tx.original.to_header()?.typed()?.uri.clone();
        if !self.inner.controller.accept_call(&to).await {
            info!(%to, "no destination for call");
            return tx.reply(StatusCode::DoesNotExistAnywhere).await;
        }

        let dialog = match Dialog::for_server(
            &tx.original,
            self.inner.contact.clone(),
            self.inner.media.clone(),
            self.inner.controller.clone(),
            self.inner.sender.clone(),
            self.inner.state_tx.clone(),
            self.inner.cancel_token.child_token(),
            self.inner.config.clone(),
        )
        .await
        {
            Ok(dialog) => dialog,
            Err(e) => {
                warn!(error = %e, "media session allocation failed");
                return tx.reply(StatusCode::ServerInternalError).await;
            }
        };

        // an empty INVITE body defers the offer to us; otherwise answer it
        let offer = if tx.original.body.is_empty() {
            None
        } else {
            match SessionDescription::parse(&tx.original.body) {
                Ok(offer) if offer.has_usable_media() => Some(offer),
                _ => {
                    tx.reply(StatusCode::NotAcceptableHere).await?;
                    dialog.fail(StatusCode::NotAcceptableHere).await;
                    return Ok(());
                }
            }
        };
        let local_sdp = match self
            .inner
            .media
            .get_sdp(dialog.cookie(), offer.clone())
            .await
        {
            Ok(sdp) if sdp.has_usable_media() => sdp,
            _ => {
                tx.reply(StatusCode::NotAcceptableHere).await?;
                dialog.fail(StatusCode::NotAcceptableHere).await;
                return Ok(());
            }
        };
        if let Some((host, port)) = offer.as_ref().and_then(|o| o.media_target()) {
            if let Err(e) = self.inner.media.rtp_start(dialog.cookie(), &host, port).await {
                warn!(id = %dialog.id(), error = %e, "rtp start failed");
                tx.reply(StatusCode::ServerInternalError).await?;
                dialog.fail(StatusCode::ServerInternalError).await;
                return Ok(());
            }
        }
        dialog.set_session(local_sdp.clone());

        self.inner
            .dialogs
            .lock()
            .unwrap()
            .insert(dialog.id(), dialog.clone());
        *dialog.inner.initial_invite_tx.lock().unwrap() = Some(tx.clone());

        let response =
            dialog.make_response(&tx.original, StatusCode::OK, local_sdp.to_string().into_bytes());
        tx.respond(response).await?;
        dialog.arm_ack_timer(tx);
        Ok(())
    }

    async fn process_ack(&self, request: rsip::Request) -> Result<()> {
        let id = DialogId::from_request(&request)?;
        match self.find_dialog(&id) {
            Some(dialog) => dialog.handle_ack(&request).await,
            None => {
                debug!(%id, "ACK for unknown dialog, dropping");
                Ok(())
            }
        }
    }

    async fn process_bye(&self, tx: ServerTransaction) -> Result<()> {
        let id = DialogId::from_request(&tx.original)?;
        match self.find_dialog(&id) {
            Some(dialog) => {
                if !dialog.check_remote_seq(&tx.original)? {
                    return tx.reply(StatusCode::ServerInternalError).await;
                }
                tx.reply(StatusCode::OK).await?;
                dialog.end().await;
                self.remove_dialog(&dialog.id());
                Ok(())
            }
            None => tx.reply(StatusCode::CallTransactionDoesNotExist).await,
        }
    }

    async fn process_cancel(&self, tx: ServerTransaction) -> Result<()> {
        let id = DialogId::from_request(&tx.original)?;
        let Some(dialog) = self.find_dialog_for_cancel(&id) else {
            return tx.reply(StatusCode::CallTransactionDoesNotExist).await;
        };
        tx.reply(StatusCode::OK).await?;
        if dialog.state() == DialogState::Early {
            let invite_tx = dialog.inner.initial_invite_tx.lock().unwrap().take();
            if let Some(invite_tx) = invite_tx {
                invite_tx.reply(StatusCode::RequestTerminated).await?;
            }
            dialog.fail(StatusCode::RequestTerminated).await;
            self.remove_dialog(&dialog.id());
        }
        Ok(())
    }

    async fn process_invite_response(
        &self,
        dialog: Dialog,
        key: TransactionKey,
        response: rsip::Response,
    ) -> Result<()> {
        if response.status_code.kind() == rsip::StatusCodeKind::Provisional {
            debug!(id = %dialog.id(), status = %response.status_code, "call progress");
            return Ok(());
        }

        if dialog.state() == DialogState::ReinviteSent {
            return dialog.handle_reinvite_response(&response).await;
        }

        self.inner.cts.lock().unwrap().remove(&key);
        if response.status_code.kind() == rsip::StatusCodeKind::Successful {
            let old_id = dialog.id();
            if let Err(e) = dialog.confirm_client(&response).await {
                warn!(id = %dialog.id(), error = %e, "failed to confirm dialog");
                dialog.send_bye().await.ok();
                self.remove_dialog(&old_id);
                self.remove_dialog(&dialog.id());
                return Ok(());
            }
            // the id gained its remote tag, re-key the map
            let mut dialogs = self.inner.dialogs.lock().unwrap();
            dialogs.remove(&old_id);
            dialogs.insert(dialog.id(), dialog.clone());
        } else {
            dialog.fail(response.status_code.clone()).await;
            self.remove_dialog(&dialog.id());
        }
        self.check_drained();
        Ok(())
    }
}

#[async_trait]
impl TransactionUser for UserAgent {
    async fn start(&self) -> Result<()> {
        let Some(mut state_rx) = self.inner.state_rx.lock().unwrap().take() else {
            return Ok(());
        };
        let agent = self.clone();
        tokio::spawn(async move {
            while let Some((id, state)) = state_rx.recv().await {
                if state == DialogState::Terminated {
                    agent.remove_dialog(&id);
                }
            }
        });
        Ok(())
    }

    async fn request_received(&self, request: rsip::Request, source: SocketAddr) -> Result<()> {
        match request.method {
            Method::Invite => {
                self.process_invite(ServerInviteTransaction::new(
                    request,
                    source,
                    self.inner.sender.clone(),
                ))
                .await
            }
            Method::Ack => self.process_ack(request).await,
            Method::Bye => {
                self.process_bye(ServerTransaction::new(
                    request,
                    source,
                    self.inner.sender.clone(),
                ))
                .await
            }
            Method::Cancel => {
                self.process_cancel(ServerTransaction::new(
                    request,
                    source,
                    self.inner.sender.clone(),
                ))
                .await
            }
            _ => {
                ServerTransaction::new(request, source, self.inner.sender.clone())
                    .reply(StatusCode::MethodNotAllowed)
                    .await
            }
        }
    }

    async fn response_received(&self, response: rsip::Response) -> Result<()> {
        let key = TransactionKey::try_from(&response)?;
        let mut dialog = {
            let cts = self.inner.cts.lock().unwrap();
            cts.get(&key).cloned()
        }
        .and_then(|id| self.find_dialog(&id));
        if dialog.is_none() {
            dialog = DialogId::from_response(&response)
                .ok()
                .and_then(|id| self.find_dialog(&id));
        }
        let Some(dialog) = dialog else {
            info!(status = %response.status_code, "dropping response matching no dialog");
            return Ok(());
        };

        match response.cseq_header()?.method()? {
            Method::Invite => self.process_invite_response(dialog, key, response).await,
            Method::Bye => {
                // the dialog already ended when the BYE went out
                debug!(id = %dialog.id(), status = %response.status_code, "BYE answered");
                Ok(())
            }
            method => {
                debug!(id = %dialog.id(), %method, "ignoring response");
                Ok(())
            }
        }
    }

    async fn client_transaction_terminated(&self, key: TransactionKey) -> Result<()> {
        let id = self.inner.cts.lock().unwrap().remove(&key);
        if let Some(id) = id {
            if let Some(dialog) = self.find_dialog(&id) {
                if !dialog.has_begun() {
                    // no final response ever arrived; synthesize the failure
                    dialog.fail(StatusCode::RequestTimeout).await;
                    self.remove_dialog(&id);
                }
            }
        }
        self.check_drained();
        Ok(())
    }

    async fn stop_transaction_user(&self, hard: bool) -> Result<()> {
        self.inner.shutdown_pending.store(true, Ordering::SeqCst);
        let dialogs: Vec<Dialog> = self
            .inner
            .dialogs
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        info!(count = dialogs.len(), hard, "stopping user agent");
        for dialog in dialogs {
            if hard {
                dialog.end().await;
            } else {
                dialog.send_bye().await.ok();
            }
            self.remove_dialog(&dialog.id());
        }
        loop {
            // register the waiter before re-checking, or a notification
            // landing between the check and the await is lost
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let dialogs_empty = self.inner.dialogs.lock().unwrap().is_empty();
                let cts_empty = self.inner.cts.lock().unwrap().is_empty();
                if dialogs_empty && cts_empty {
                    break;
                }
            }
            notified.await;
        }
        self.inner.cancel_token.cancel();
        Ok(())
    }
}
