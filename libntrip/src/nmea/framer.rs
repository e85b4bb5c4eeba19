use bytes::BytesMut;

use super::{Sentence, TERMINATOR};


/// Accumulates raw receiver bytes and splits them into NMEA sentences.
///
/// Bytes not followed by a terminator are kept until the terminator arrives.
/// There is no upper bound: a receiver that never terminates its lines makes
/// the buffer grow indefinitely. Loss of data is considered worse here, since
/// dropping a partial GGA sentence means the caster never learns about the
/// position.
#[derive(Debug, Default)]
pub struct Framer {
    buf: BytesMut,
    scanned: usize,
}

impl Framer {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self { buf: BytesMut::with_capacity(cap), scanned: 0 }
    }

    /// Append `chunk` and return all sentences completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Sentences<'_> {
        self.buf.extend_from_slice(chunk);
        Sentences { framer: self }
    }

    /// Extract the next complete sentence already held in the buffer.
    pub fn next_sentence(&mut self) -> Option<Sentence> {
        split_sentence(&mut self.buf, &mut self.scanned)
    }

    /// Bytes received but not yet part of a complete sentence.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }
}


/// Iterator over the sentences completed by a [`Framer::feed`] call.
///
/// Sentences not taken from the iterator stay in the buffer and are returned
/// by subsequent calls.
pub struct Sentences<'a> {
    framer: &'a mut Framer,
}

impl Iterator for Sentences<'_> {
    type Item = Sentence;

    fn next(&mut self) -> Option<Sentence> {
        self.framer.next_sentence()
    }
}


/// Split off the first terminated line of `buf`, without its terminator.
///
/// `scanned` is the number of leading bytes already searched without success
/// and is updated accordingly, so repeated calls on a growing buffer only look
/// at new data.
pub(crate) fn split_sentence(buf: &mut BytesMut, scanned: &mut usize) -> Option<Sentence> {
    // back off by one, the last scan may have stopped between '\r' and '\n'
    let start = scanned.saturating_sub(TERMINATOR.len() - 1).min(buf.len());

    let Some(pos) = find_terminator(&buf[start..]) else {
        *scanned = buf.len();
        return None;
    };
    let pos = start + pos;
    *scanned = 0;

    let mut line = buf.split_to(pos + TERMINATOR.len());
    line.truncate(pos);

    Some(Sentence::new(line.freeze()))
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(TERMINATOR.len())
        .position(|w| w == TERMINATOR)
}
