//! NTRIP v1 request encoding and response scanning.

use base64::Engine as _;
use bytes::{BufMut, BytesMut};

use super::{CasterConfig, Credentials, HandshakeError};


/// Marker signalling that the caster accepted the request.
pub const ACCEPTED: &str = "ICY 200 OK";

/// First line of a source table response.
pub const SOURCE_TABLE: &str = "SOURCETABLE 200 OK";


/// Value of the `Authorization` header.
pub fn basic_auth(credentials: &Credentials) -> String {
    let auth = format!("{}:{}", credentials.username, credentials.password);
    format!("Basic {}", base64::engine::general_purpose::STANDARD.encode(auth))
}

/// Write the request for the configured mountpoint to `dst`.
pub fn encode_request(config: &CasterConfig, dst: &mut BytesMut) {
    let request = format!(
        "GET /{} HTTP/1.0\r\nUser-Agent: {}\r\nHost: {}\r\nAuthorization: {}\r\n\r\n",
        config.mountpoint,
        config.user_agent,
        config.host,
        basic_auth(&config.credentials),
    );

    dst.reserve(request.len());
    dst.put_slice(request.as_bytes());
}


/// Classification of a single response line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Accepted,
    Rejected(HandshakeError),
    Other,
}

/// Classify a response line received while waiting for the acknowledgement.
pub fn classify_line(line: &[u8]) -> Line {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end_matches(['\r', '\n']);

    if line.contains(ACCEPTED) {
        return Line::Accepted;
    }

    if line.starts_with(SOURCE_TABLE) {
        return Line::Rejected(HandshakeError::SourceTable);
    }

    // status line of a plain HTTP response, e.g. "HTTP/1.1 401 Unauthorized"
    if line.starts_with("HTTP/") {
        let status = line.split_whitespace().nth(1);

        if status != Some("200") {
            return Line::Rejected(HandshakeError::Status(line.to_string()));
        }
    }

    Line::Other
}
