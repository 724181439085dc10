// A SIP call-control core: dialogs, user agent dispatch and the
// media control channel between the signaling and audio processes.

pub mod controller;
pub mod dialog;
pub mod error;
pub mod media;
pub mod rsip_ext;
pub mod transaction;
pub mod useragent;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;
