use crate::dialog::DialogId;
use crate::transaction::TransactionKey;

#[derive(Debug)]
pub enum Error {
    SipMessage(rsip::Error),
    Dialog(String, DialogId),
    Transaction(String, TransactionKey),
    Media(String),
    Channel(String),
    Error(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::SipMessage(e) => write!(f, "sip message error: {}", e),
            Error::Dialog(e, id) => write!(f, "dialog error: {} {}", e, id),
            Error::Transaction(e, key) => write!(f, "transaction error: {} {}", e, key),
            Error::Media(e) => write!(f, "media error: {}", e),
            Error::Channel(e) => write!(f, "channel error: {}", e),
            Error::Error(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<rsip::Error> for Error {
    fn from(e: rsip::Error) -> Self {
        Error::SipMessage(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Channel(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Channel(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Error(e.to_string())
    }
}
