use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

pub mod channel;
pub mod sdp;

pub use sdp::SessionDescription;

/// Opaque handle the media engine hands out per RTP socket. A dialog holds
/// exactly one cookie for its lifetime; the cookie is released by the single
/// `rtp_stop` issued when the dialog ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaCookie(pub u32);

impl std::fmt::Display for MediaCookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Commands the signaling side issues to the media engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MediaCommand {
    CreateRtpSocket {
        host: String,
    },
    GetSdp {
        cookie: MediaCookie,
        offer: Option<SessionDescription>,
    },
    RtpStart {
        cookie: MediaCookie,
        host: String,
        port: u16,
    },
    RtpStop {
        cookie: MediaCookie,
    },
    PlayFile {
        cookie: MediaCookie,
        filename: String,
        format: String,
    },
    StopPlaying {
        cookie: MediaCookie,
    },
    StartRecording {
        cookie: MediaCookie,
        filename: String,
        format: String,
    },
    StopRecording {
        cookie: MediaCookie,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MediaReply {
    Cookie { cookie: MediaCookie },
    Sdp { sdp: SessionDescription },
    /// `done` is false when playback was interrupted by `StopPlaying`.
    Played { done: bool },
    Done,
    Failed { message: String },
}

/// Unsolicited notifications flowing engine-to-signaling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MediaEvent {
    Dtmf { cookie: MediaCookie, key: char },
    Audio { cookie: MediaCookie, payload: Vec<u8> },
}

/// The media engine proper. Implemented in-process for tests and behind the
/// control channel ([`channel::serve_engine`]) in production.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_rtp_socket(&self, host: &str) -> Result<MediaCookie>;
    async fn get_sdp(
        &self,
        cookie: MediaCookie,
        offer: Option<&SessionDescription>,
    ) -> Result<SessionDescription>;
    async fn rtp_start(&self, cookie: MediaCookie, host: &str, port: u16) -> Result<()>;
    async fn rtp_stop(&self, cookie: MediaCookie) -> Result<()>;
    /// Plays to completion, returning true, or returns false if interrupted
    /// by [`MediaEngine::stop_playing`].
    async fn play_file(&self, cookie: MediaCookie, filename: &str, format: &str) -> Result<bool>;
    async fn stop_playing(&self, cookie: MediaCookie) -> Result<()>;
    async fn start_recording(&self, cookie: MediaCookie, filename: &str, format: &str)
        -> Result<()>;
    async fn stop_recording(&self, cookie: MediaCookie) -> Result<()>;
}

type CommandSender = mpsc::UnboundedSender<(MediaCommand, oneshot::Sender<MediaReply>)>;

/// Typed client handle to the media engine. Cheap to clone; every dialog and
/// the user agent share one controller per engine connection.
#[derive(Clone)]
pub struct MediaController {
    commands: CommandSender,
}

impl MediaController {
    pub fn new(commands: CommandSender) -> Self {
        Self { commands }
    }

    async fn call(&self, command: MediaCommand) -> Result<MediaReply> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send((command, tx))
            .map_err(|_| Error::Channel("media channel closed".into()))?;
        let reply = rx
            .await
            .map_err(|_| Error::Channel("media channel closed".into()))?;
        match reply {
            MediaReply::Failed { message } => Err(Error::Media(message)),
            other => Ok(other),
        }
    }

    pub async fn create_rtp_socket(&self, host: &str) -> Result<MediaCookie> {
        match self
            .call(MediaCommand::CreateRtpSocket {
                host: host.to_string(),
            })
            .await?
        {
            MediaReply::Cookie { cookie } => Ok(cookie),
            other => Err(Error::Media(format!("unexpected reply: {:?}", other))),
        }
    }

    pub async fn get_sdp(
        &self,
        cookie: MediaCookie,
        offer: Option<SessionDescription>,
    ) -> Result<SessionDescription> {
        match self.call(MediaCommand::GetSdp { cookie, offer }).await? {
            MediaReply::Sdp { sdp } => Ok(sdp),
            other => Err(Error::Media(format!("unexpected reply: {:?}", other))),
        }
    }

    pub async fn rtp_start(&self, cookie: MediaCookie, host: &str, port: u16) -> Result<()> {
        self.call(MediaCommand::RtpStart {
            cookie,
            host: host.to_string(),
            port,
        })
        .await
        .map(|_| ())
    }

    pub async fn rtp_stop(&self, cookie: MediaCookie) -> Result<()> {
        self.call(MediaCommand::RtpStop { cookie }).await.map(|_| ())
    }

    pub async fn play_file(
        &self,
        cookie: MediaCookie,
        filename: &str,
        format: &str,
    ) -> Result<bool> {
        match self
            .call(MediaCommand::PlayFile {
                cookie,
                filename: filename.to_string(),
                format: format.to_string(),
            })
            .await?
        {
            MediaReply::Played { done } => Ok(done),
            other => Err(Error::Media(format!("unexpected reply: {:?}", other))),
        }
    }

    pub async fn stop_playing(&self, cookie: MediaCookie) -> Result<()> {
        self.call(MediaCommand::StopPlaying { cookie })
            .await
            .map(|_| ())
    }

    pub async fn start_recording(
        &self,
        cookie: MediaCookie,
        filename: &str,
        format: &str,
    ) -> Result<()> {
        self.call(MediaCommand::StartRecording {
            cookie,
            filename: filename.to_string(),
            format: format.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn stop_recording(&self, cookie: MediaCookie) -> Result<()> {
        self.call(MediaCommand::StopRecording { cookie })
            .await
            .map(|_| ())
    }
}

/// Wire a controller directly to an in-process engine, bypassing the control
/// channel. Events pushed into the returned sender surface on the receiver
/// handed to the user agent.
pub fn attach_local(
    engine: std::sync::Arc<dyn MediaEngine>,
) -> (
    MediaController,
    mpsc::UnboundedSender<MediaEvent>,
    mpsc::UnboundedReceiver<MediaEvent>,
) {
    let (cmd_tx, mut cmd_rx) =
        mpsc::unbounded_channel::<(MediaCommand, oneshot::Sender<MediaReply>)>();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some((command, reply_tx)) = cmd_rx.recv().await {
            let engine = engine.clone();
            tokio::spawn(async move {
                let reply = channel::dispatch(engine.as_ref(), command).await;
                let _ = reply_tx.send(reply);
            });
        }
    });
    (MediaController::new(cmd_tx), event_tx, event_rx)
}
