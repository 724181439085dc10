use crate::dialog::DialogId;
use async_trait::async_trait;

/// Early-termination condition raised from within audio/DTMF callbacks.
///
/// Returning `Err(Hangup)` from [`CallController::received_dtmf`] or
/// [`CallController::received_audio`] makes the user agent send BYE and tear
/// the dialog down through the normal `end()` path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hangup;

impl std::fmt::Display for Hangup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "call hung up by application")
    }
}

impl std::error::Error for Hangup {}

/// Application-supplied call-event handler.
///
/// The user agent invokes these callbacks in the order implied by the dialog
/// state machine: `accept_call` before any dialog exists, then exactly one of
/// `call_failed` or `call_ended` per dialog, with `call_began` fired once for
/// calls that reach the confirmed state.
#[async_trait]
pub trait CallController: Send + Sync {
    /// Decide whether an inbound INVITE addressed to `to` has a usable local
    /// destination. Refusal is answered 604 on the wire.
    async fn accept_call(&self, to: &rsip::Uri) -> bool;

    async fn call_began(&self, id: &DialogId);

    async fn call_failed(&self, id: &DialogId, status: rsip::StatusCode);

    async fn call_ended(&self, id: &DialogId);

    async fn received_dtmf(&self, id: &DialogId, key: char) -> std::result::Result<(), Hangup>;

    async fn received_audio(
        &self,
        id: &DialogId,
        payload: &[u8],
    ) -> std::result::Result<(), Hangup>;
}
