//! Newline-delimited JSON control channel between the signaling process and
//! the media engine. Each command frame carries a sequence number; the engine
//! answers with a reply frame bearing the same number, and may interleave
//! unsolicited event frames at any time.

use super::{MediaCommand, MediaController, MediaEngine, MediaEvent, MediaReply};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum Frame {
    Command { seq: u64, cmd: MediaCommand },
    Reply { seq: u64, reply: MediaReply },
    Event { event: MediaEvent },
}

async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    Ok(())
}

/// Drive the near (signaling) side of the channel over `io`. Returns the
/// controller used to issue commands and the stream of engine events.
///
/// The channel task runs until `io` closes or `token` fires; commands still
/// in flight at that point resolve with a channel error.
pub fn attach<S>(
    io: S,
    token: CancellationToken,
) -> (MediaController, mpsc::UnboundedReceiver<MediaEvent>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (cmd_tx, mut cmd_rx) =
        mpsc::unbounded_channel::<(MediaCommand, oneshot::Sender<MediaReply>)>();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (reader, mut writer) = tokio::io::split(io);
        let mut lines = BufReader::new(reader).lines();
        let mut pending: HashMap<u64, oneshot::Sender<MediaReply>> = HashMap::new();
        let mut next_seq: u64 = 1;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                cmd = cmd_rx.recv() => {
                    let Some((command, reply_tx)) = cmd else { break };
                    let seq = next_seq;
                    next_seq += 1;
                    pending.insert(seq, reply_tx);
                    if write_frame(&mut writer, &Frame::Command { seq, cmd: command })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                line = lines.next_line() => {
                    let Ok(Some(line)) = line else { break };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Frame>(&line) {
                        Ok(Frame::Reply { seq, reply }) => {
                            match pending.remove(&seq) {
                                Some(tx) => {
                                    let _ = tx.send(reply);
                                }
                                None => warn!(seq, "media reply for unknown sequence"),
                            }
                        }
                        Ok(Frame::Event { event }) => {
                            let _ = event_tx.send(event);
                        }
                        Ok(Frame::Command { seq, .. }) => {
                            warn!(seq, "unexpected command frame from media engine");
                        }
                        Err(err) => warn!(%err, "dropping malformed media frame"),
                    }
                }
            }
        }
    });

    (MediaController::new(cmd_tx), event_rx)
}

/// Drive the far (engine) side of the channel over `io`, dispatching commands
/// to `engine` and forwarding `events` to the signaling process.
///
/// Every command is handled on its own task so long-running ones, PlayFile in
/// particular, never stall the command stream. Returns once the peer has
/// closed the channel, in-flight commands have replied, and the caller has
/// dropped its `events` sender.
pub async fn serve_engine<S>(
    io: S,
    engine: Arc<dyn MediaEngine>,
    mut events: mpsc::UnboundedReceiver<MediaEvent>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, mut writer) = tokio::io::split(io);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();

    let event_out = out_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if event_out.send(Frame::Event { event }).is_err() {
                break;
            }
        }
    });

    let engine_out = out_tx.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            let frame = match serde_json::from_str::<Frame>(&line) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(%err, "dropping malformed media frame");
                    continue;
                }
            };
            let Frame::Command { seq, cmd } = frame else {
                warn!("unexpected non-command frame from signaling side");
                continue;
            };
            let engine = engine.clone();
            let out = engine_out.clone();
            tokio::spawn(async move {
                let reply = dispatch(engine.as_ref(), cmd).await;
                let _ = out.send(Frame::Reply { seq, reply });
            });
        }
    });
    drop(out_tx);

    while let Some(frame) = out_rx.recv().await {
        write_frame(&mut writer, &frame).await?;
    }
    Ok(())
}

pub(crate) async fn dispatch(engine: &dyn MediaEngine, command: MediaCommand) -> MediaReply {
    let result = match command {
        MediaCommand::CreateRtpSocket { host } => engine
            .create_rtp_socket(&host)
            .await
            .map(|cookie| MediaReply::Cookie { cookie }),
        MediaCommand::GetSdp { cookie, offer } => engine
            .get_sdp(cookie, offer.as_ref())
            .await
            .map(|sdp| MediaReply::Sdp { sdp }),
        MediaCommand::RtpStart { cookie, host, port } => engine
            .rtp_start(cookie, &host, port)
            .await
            .map(|_| MediaReply::Done),
        MediaCommand::RtpStop { cookie } => {
            engine.rtp_stop(cookie).await.map(|_| MediaReply::Done)
        }
        MediaCommand::PlayFile {
            cookie,
            filename,
            format,
        } => engine
            .play_file(cookie, &filename, &format)
            .await
            .map(|done| MediaReply::Played { done }),
        MediaCommand::StopPlaying { cookie } => {
            engine.stop_playing(cookie).await.map(|_| MediaReply::Done)
        }
        MediaCommand::StartRecording {
            cookie,
            filename,
            format,
        } => engine
            .start_recording(cookie, &filename, &format)
            .await
            .map(|_| MediaReply::Done),
        MediaCommand::StopRecording { cookie } => engine
            .stop_recording(cookie)
            .await
            .map(|_| MediaReply::Done),
    };
    match result {
        Ok(reply) => reply,
        Err(err) => MediaReply::Failed {
            message: err.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::sdp::{Connection, MediaDescription, Origin, SessionDescription};
    use crate::media::MediaCookie;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    fn test_session(address: &str, port: u16) -> SessionDescription {
        SessionDescription {
            origin: Origin {
                username: "-".to_string(),
                session_id: "1".to_string(),
                version: 1,
                network_type: "IN".to_string(),
                address_type: "IP4".to_string(),
                address: address.to_string(),
            },
            session_name: "test".to_string(),
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

    struct MockEngine {
        next_cookie: AtomicU32,
        rtp_stops: AtomicU32,
        playing: Mutex<HashMap<MediaCookie, Arc<Notify>>>,
    }

    impl MockEngine {
        fn new() -> Self {
            Self {
                next_cookie: AtomicU32::new(1),
                rtp_stops: AtomicU32::new(0),
                playing: Mutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl MediaEngine for MockEngine {
        async fn create_rtp_socket(&self, _host: &str) -> crate::Result<MediaCookie> {
            Ok(MediaCookie(self.next_cookie.fetch_add(1, Ordering::SeqCst)))
        }

        async fn get_sdp(
            &self,
            _cookie: MediaCookie,
            offer: Option<&SessionDescription>,
        ) -> crate::Result<SessionDescription> {
            let port = offer.map(|_| 9002).unwrap_or(9000);
            Ok(test_session("127.0.0.1", port))
        }

        async fn rtp_start(
            &self,
            _cookie: MediaCookie,
            _host: &str,
            _port: u16,
        ) -> crate::Result<()> {
            Ok(())
        }

        async fn rtp_stop(&self, _cookie: MediaCookie) -> crate::Result<()> {
            self.rtp_stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn play_file(
            &self,
            cookie: MediaCookie,
            _filename: &str,
            _format: &str,
        ) -> crate::Result<bool> {
            let stop = Arc::new(Notify::new());
            self.playing.lock().unwrap().insert(cookie, stop.clone());
            tokio::select! {
                _ = stop.notified() => Ok(false),
                _ = tokio::time::sleep(std::time::Duration::from_secs(30)) => Ok(true),
            }
        }

        async fn stop_playing(&self, cookie: MediaCookie) -> crate::Result<()> {
            if let Some(stop) = self.playing.lock().unwrap().remove(&cookie) {
                stop.notify_one();
            }
            Ok(())
        }

        async fn start_recording(
            &self,
            _cookie: MediaCookie,
            _filename: &str,
            _format: &str,
        ) -> crate::Result<()> {
            Ok(())
        }

        async fn stop_recording(&self, _cookie: MediaCookie) -> crate::Result<()> {
            Ok(())
        }
    }

    fn start_pair() -> (
        MediaController,
        mpsc::UnboundedReceiver<MediaEvent>,
        mpsc::UnboundedSender<MediaEvent>,
        Arc<MockEngine>,
        CancellationToken,
    ) {
        let (near, far) = tokio::io::duplex(16 * 1024);
        let engine = Arc::new(MockEngine::new());
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let serve_engine_handle = engine.clone();
        tokio::spawn(async move {
            serve_engine(far, serve_engine_handle as Arc<dyn MediaEngine>, event_rx)
                .await
                .ok();
        });
        let token = CancellationToken::new();
        let (controller, events) = attach(near, token.clone());
        (controller, events, event_tx, engine, token)
    }

    #[tokio::test]
    async fn test_command_reply_round_trip() {
        let (controller, _events, _event_tx, engine, _token) = start_pair();

        let cookie = controller.create_rtp_socket("127.0.0.1").await.unwrap();
        assert_eq!(cookie, MediaCookie(1));

        let sdp = controller.get_sdp(cookie, None).await.unwrap();
        assert_eq!(sdp.media_target(), Some(("127.0.0.1".to_string(), 9000)));

        let answer = controller
            .get_sdp(cookie, Some(test_session("10.0.0.9", 4000)))
            .await
            .unwrap();
        assert_eq!(answer.media[0].port, 9002);

        controller.rtp_start(cookie, "10.0.0.9", 4000).await.unwrap();
        controller.rtp_stop(cookie).await.unwrap();
        assert_eq!(engine.rtp_stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_playing_interrupts_play_file() {
        let (controller, _events, _event_tx, _engine, _token) = start_pair();

        let cookie = controller.create_rtp_socket("127.0.0.1").await.unwrap();
        let player = controller.clone();
        let play = tokio::spawn(async move { player.play_file(cookie, "greeting", "ulaw").await });

        // the channel keeps serving other commands while playback is pending
        controller.get_sdp(cookie, None).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        controller.stop_playing(cookie).await.unwrap();
        let done = play.await.unwrap().unwrap();
        assert!(!done);
    }

    #[tokio::test]
    async fn test_events_flow_to_controller_side() {
        let (controller, mut events, event_tx, _engine, _token) = start_pair();

        let cookie = controller.create_rtp_socket("127.0.0.1").await.unwrap();
        event_tx
            .send(MediaEvent::Dtmf { cookie, key: '5' })
            .unwrap();

        match events.recv().await {
            Some(MediaEvent::Dtmf { cookie: c, key }) => {
                assert_eq!(c, cookie);
                assert_eq!(key, '5');
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancellation_fails_pending_commands() {
        let (controller, _events, _event_tx, _engine, token) = start_pair();

        let cookie = controller.create_rtp_socket("127.0.0.1").await.unwrap();
        let player = controller.clone();
        let play = tokio::spawn(async move { player.play_file(cookie, "hold", "ulaw").await });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        token.cancel();
        assert!(play.await.unwrap().is_err());
    }
}
