use crate::Result;
use rsip::prelude::{HeadersExt, UntypedHeader};

pub mod dialog;
#[cfg(test)]
mod tests;

pub use dialog::{Dialog, DialogConfig, DialogState, DialogStateSender, Direction};

/// Dialog identity triple. Assigned once and immutable after the first
/// request/response that establishes both tags; an empty tag means that side
/// is not yet known.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl DialogId {
    /// Identity as seen from an inbound request: the peer built the message,
    /// so its From-tag is our remote tag and the To-tag is ours.
    pub fn from_request(request: &rsip::Request) -> Result<Self> {
        Ok(DialogId {
            call_id: request.call_id_header()?.value().to_string(),
            local_tag: tag_text(request.to_header()?.tag()?),
            remote_tag: tag_text(request.from_header()?.tag()?),
        })
    }

    /// Identity as seen from an inbound response: tag roles are the reverse
    /// of [`DialogId::from_request`].
    pub fn from_response(response: &rsip::Response) -> Result<Self> {
        Ok(DialogId {
            call_id: response.call_id_header()?.value().to_string(),
            local_tag: tag_text(response.from_header()?.tag()?),
            remote_tag: tag_text(response.to_header()?.tag()?),
        })
    }

    pub fn is_established(&self) -> bool {
        !self.call_id.is_empty() && !self.local_tag.is_empty() && !self.remote_tag.is_empty()
    }
}

fn tag_text(tag: Option<rsip::param::Tag>) -> String {
    tag.map(|t| t.to_string()).unwrap_or_default()
}

impl std::fmt::Display for DialogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.call_id, self.local_tag, self.remote_tag)
    }
}
