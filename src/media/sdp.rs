use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Negotiated session description owned by a dialog.
///
/// The media engine computes offers and answers; the signaling side only
/// carries the blob between SIP bodies and the engine, and applies the
/// re-INVITE merge rules. Codec-level detail stays opaque in the media
/// sections' format and attribute lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub origin: Origin,
    pub session_name: String,
    pub connection: Option<Connection>,
    pub attributes: Vec<String>,
    pub media: Vec<MediaDescription>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Origin {
    pub username: String,
    pub session_id: String,
    pub version: u64,
    pub network_type: String,
    pub address_type: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub network_type: String,
    pub address_type: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaDescription {
    pub media: String,
    pub port: u16,
    pub protocol: String,
    pub formats: Vec<String>,
    pub attributes: Vec<String>,
}

impl SessionDescription {
    pub fn parse(body: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(body)
            .map_err(|_| Error::Media("session description is not utf-8".into()))?;

        let mut origin = None;
        let mut session_name = String::new();
        let mut connection = None;
        let mut attributes = Vec::new();
        let mut media: Vec<MediaDescription> = Vec::new();

        for line in text.lines() {
            let line = line.trim_end();
            let Some((kind, value)) = line.split_once('=') else {
                continue;
            };
            match kind {
                "o" => {
                    let fields: Vec<&str> = value.split_whitespace().collect();
                    if fields.len() != 6 {
                        return Err(Error::Media(format!("malformed o-line: {}", value)));
                    }
                    origin = Some(Origin {
                        username: fields[0].to_string(),
                        session_id: fields[1].to_string(),
                        version: fields[2]
                            .parse()
                            .map_err(|_| Error::Media(format!("bad o-line version: {}", value)))?,
                        network_type: fields[3].to_string(),
                        address_type: fields[4].to_string(),
                        address: fields[5].to_string(),
                    });
                }
                "s" => session_name = value.to_string(),
                "c" => {
                    let fields: Vec<&str> = value.split_whitespace().collect();
                    if fields.len() != 3 {
                        return Err(Error::Media(format!("malformed c-line: {}", value)));
                    }
                    connection = Some(Connection {
                        network_type: fields[0].to_string(),
                        address_type: fields[1].to_string(),
                        address: fields[2].to_string(),
                    });
                }
                "m" => {
                    let fields: Vec<&str> = value.split_whitespace().collect();
                    if fields.len() < 3 {
                        return Err(Error::Media(format!("malformed m-line: {}", value)));
                    }
                    media.push(MediaDescription {
                        media: fields[0].to_string(),
                        port: fields[1]
                            .parse()
                            .map_err(|_| Error::Media(format!("bad media port: {}", value)))?,
                        protocol: fields[2].to_string(),
                        formats: fields[3..].iter().map(|f| f.to_string()).collect(),
                        attributes: Vec::new(),
                    });
                }
                "a" => match media.last_mut() {
                    Some(m) => m.attributes.push(value.to_string()),
                    None => attributes.push(value.to_string()),
                },
                _ => {}
            }
        }

        Ok(SessionDescription {
            origin: origin.ok_or_else(|| Error::Media("missing o-line".into()))?,
            session_name,
            connection,
            attributes,
            media,
        })
    }

    /// Merge a renegotiated description onto this one, per the re-INVITE
    /// rules: media descriptions replace wholesale, origin/connection network
    /// fields are only overwritten when the new description carries them, and
    /// the o-line version is bumped.
    pub fn merge(&mut self, new: &SessionDescription) {
        if !new.media.is_empty() {
            self.media = new.media.clone();
        }
        if let Some(conn) = &new.connection {
            match self.connection.as_mut() {
                Some(existing) => {
                    if !conn.network_type.is_empty() {
                        existing.network_type = conn.network_type.clone();
                    }
                    if !conn.address_type.is_empty() {
                        existing.address_type = conn.address_type.clone();
                    }
                    if !conn.address.is_empty() {
                        existing.address = conn.address.clone();
                    }
                }
                None => self.connection = Some(conn.clone()),
            }
        }
        if !new.origin.network_type.is_empty() {
            self.origin.network_type = new.origin.network_type.clone();
        }
        if !new.origin.address_type.is_empty() {
            self.origin.address_type = new.origin.address_type.clone();
        }
        if !new.origin.address.is_empty() {
            self.origin.address = new.origin.address.clone();
        }
        self.origin.version += 1;
    }

    pub fn has_usable_media(&self) -> bool {
        self.media.iter().any(|m| m.port != 0 && !m.formats.is_empty())
    }

    /// Remote endpoint to point RTP at: the session connection address with
    /// the first active media section's port.
    pub fn media_target(&self) -> Option<(String, u16)> {
        let address = self.connection.as_ref()?.address.clone();
        let port = self.media.iter().find(|m| m.port != 0)?.port;
        Some((address, port))
    }
}

impl std::fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v=0\r\n")?;
        let o = &self.origin;
        write!(
            f,
            "o={} {} {} {} {} {}\r\n",
            o.username, o.session_id, o.version, o.network_type, o.address_type, o.address
        )?;
        write!(f, "s={}\r\n", self.session_name)?;
        if let Some(c) = &self.connection {
            write!(
                f,
                "c={} {} {}\r\n",
                c.network_type, c.address_type, c.address
            )?;
        }
        write!(f, "t=0 0\r\n")?;
        for a in &self.attributes {
            write!(f, "a={}\r\n", a)?;
        }
        for m in &self.media {
            write!(
                f,
                "m={} {} {} {}\r\n",
                m.media,
                m.port,
                m.protocol,
                m.formats.join(" ")
            )?;
            for a in &m.attributes {
                write!(f, "a={}\r\n", a)?;
            }
        }
        Ok(())
    }
}
