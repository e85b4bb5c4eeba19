//! NMEA 0183 sentence framing and classification.

pub mod codec;
pub use codec::Codec;

pub mod framer;
pub use framer::Framer;

use bytes::Bytes;


/// Line terminator of NMEA sentences.
pub const TERMINATOR: &[u8] = b"\r\n";

/// Prefixes of sentences reporting a position fix (GGA).
pub const FIX_PREFIXES: [&[u8]; 2] = [b"$GNGGA", b"$GPGGA"];


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentenceKind {
    /// Global positioning fix data, forwarded to the caster.
    PositionFix,

    /// Anything else, only used for display.
    Other,
}

impl SentenceKind {
    pub fn classify(data: &[u8]) -> Self {
        if FIX_PREFIXES.iter().any(|p| data.starts_with(p)) {
            SentenceKind::PositionFix
        } else {
            SentenceKind::Other
        }
    }
}


/// A single NMEA sentence with its terminator stripped.
///
/// The raw bytes are kept as received. No checksum or syntax validation is
/// performed, malformed lines are simply classified as
/// [`SentenceKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    data: Bytes,
    kind: SentenceKind,
}

impl Sentence {
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let kind = SentenceKind::classify(&data);

        Self { data, kind }
    }

    pub fn kind(&self) -> SentenceKind {
        self.kind
    }

    pub fn is_position_fix(&self) -> bool {
        self.kind == SentenceKind::PositionFix
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

impl std::fmt::Display for Sentence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.data))
    }
}
