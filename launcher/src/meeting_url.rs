//! `jitsi-meet://` URL validation and normalization.
//!
//! Accepted payloads, checked in this order:
//! - `http://...` / `https://...`: taken verbatim as the meeting URL.
//! - `host/room[/more]`: becomes `https://host/room[/more]`.
//! - `room`: joined onto the configured default server.
//!
//! Only the absolute form skips the character check; the other two forms must
//! consist of ASCII alphanumerics and `-_./:`.

use thiserror::Error;
use url::Url;

use crate::consts::{DEFAULT_SERVER_URL, PROTOCOL_SCHEME};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeetingTarget {
    /// Full meeting URL handed to the window layer.
    pub url: String,
    /// Scheme and authority of `url`, e.g. `https://meet.jit.si`.
    pub server_url: String,
    /// Everything after the authority, without the leading `/`.
    pub room_name: String,
}

impl MeetingTarget {
    fn from_url(url: String) -> Self {
        let (server_url, room_name) = split_server_and_room(&url);
        Self {
            url,
            server_url,
            room_name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectionReason {
    #[error("url does not start with jitsi-meet://")]
    WrongScheme,
    #[error("nothing follows jitsi-meet://")]
    EmptyPayload,
    #[error("invalid character {ch:?} at offset {offset}")]
    InvalidCharacter { ch: char, offset: usize },
}

pub fn is_room_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':')
}

/// Cheap shape check used when scanning argv; does not validate.
pub fn looks_like_protocol_url(s: &str) -> bool {
    s.starts_with(PROTOCOL_SCHEME)
}

fn is_absolute_http(payload: &str) -> bool {
    payload.starts_with("http://") || payload.starts_with("https://")
}

fn split_server_and_room(url: &str) -> (String, String) {
    let authority_start = url.find("://").map(|i| i + 3).unwrap_or(0);
    match url[authority_start..].find('/') {
        Some(i) => {
            let cut = authority_start + i;
            (url[..cut].to_string(), url[cut + 1..].to_string())
        }
        None => (url.to_string(), String::new()),
    }
}

#[derive(Debug, Clone)]
pub struct UrlParser {
    default_server: String,
}

impl Default for UrlParser {
    fn default() -> Self {
        Self::new(DEFAULT_SERVER_URL)
    }
}

impl UrlParser {
    pub fn new(default_server: &str) -> Self {
        Self {
            default_server: default_server.trim().trim_end_matches('/').to_string(),
        }
    }

    pub fn default_server(&self) -> &str {
        &self.default_server
    }

    pub fn parse(&self, raw: &str) -> Result<MeetingTarget, RejectionReason> {
        let payload = raw
            .strip_prefix(PROTOCOL_SCHEME)
            .ok_or(RejectionReason::WrongScheme)?;
        if payload.is_empty() {
            return Err(RejectionReason::EmptyPayload);
        }

        // Embedded absolute URLs are passed through untouched; the network
        // layer that loads them does its own validation.
        if is_absolute_http(payload) {
            return Ok(MeetingTarget::from_url(payload.to_string()));
        }

        if let Some((i, ch)) = payload.char_indices().find(|&(_, c)| !is_room_char(c)) {
            return Err(RejectionReason::InvalidCharacter {
                ch,
                offset: PROTOCOL_SCHEME.len() + i,
            });
        }

        let url = if payload.contains('/') {
            format!("https://{payload}")
        } else {
            format!("{}/{}", self.default_server, payload)
        };
        Ok(MeetingTarget::from_url(url))
    }

    /// Render a `jitsi-meet://` URL for `room` on `server_url`.
    ///
    /// The short `jitsi-meet://room` form is only used for the default server
    /// and a single-segment room, since anything with a `/` would be read back
    /// as `host/room`.
    pub fn build_protocol_url(&self, room: &str, server_url: Option<&str>) -> Option<String> {
        if room.is_empty() || !room.chars().all(is_room_char) {
            return None;
        }
        let server = server_url
            .map(|s| s.trim().trim_end_matches('/'))
            .filter(|s| !s.is_empty());

        let on_default = server.map_or(true, |s| s == self.default_server);
        if on_default && !room.contains('/') {
            return Some(format!("{PROTOCOL_SCHEME}{room}"));
        }

        let server = Url::parse(server.unwrap_or(&self.default_server)).ok()?;
        let host = server.host_str()?;
        let authority = match server.port() {
            Some(p) => format!("{host}:{p}"),
            None => host.to_string(),
        };
        Some(format!("{PROTOCOL_SCHEME}{authority}/{room}"))
    }

    /// Convert an `http(s)://host/room` meeting link into a `jitsi-meet://` URL
    /// that parses back to the same link.
    pub fn protocol_url_from_http(&self, link: &str) -> Option<String> {
        let url = Url::parse(link.trim()).ok()?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return None;
        }
        let host = url.host_str()?;
        let room = url.path().trim_start_matches('/');
        if room.is_empty() {
            return None;
        }

        let short_form_ok = url.scheme() == "https"
            && url.query().is_none()
            && url.fragment().is_none()
            && room.chars().all(is_room_char);
        if !short_form_ok {
            return Some(format!("{PROTOCOL_SCHEME}{}", url.as_str()));
        }

        let server = match url.port() {
            Some(p) => format!("https://{host}:{p}"),
            None => format!("https://{host}"),
        };
        self.build_protocol_url(room, Some(&server))
    }
}

/// One-shot form of [`UrlParser::parse`].
pub fn validate_and_parse(
    raw: &str,
    default_server: &str,
) -> Result<MeetingTarget, RejectionReason> {
    UrlParser::new(default_server).parse(raw)
}
