use super::{framer, Sentence, TERMINATOR};

use bytes::{BufMut, BytesMut};

use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, Encoder, FramedRead};


/// Line codec for NMEA sentences terminated by `\r\n`.
///
/// The read buffer of the framed stream acts as the sentence accumulator, see
/// [`framer::Framer`] for the buffering policy.
#[derive(Debug, Default)]
pub struct Codec {
    scanned: usize,
}

impl Codec {
    pub fn new() -> Self {
        Self { scanned: 0 }
    }

    pub fn wrap_read<T>(self, io: T) -> FramedRead<T, Codec>
    where
        T: AsyncRead,
    {
        FramedRead::with_capacity(io, self, 1024)
    }
}

impl Decoder for Codec {
    type Item = Sentence;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(framer::split_sentence(src, &mut self.scanned))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(sentence) = self.decode(src)? {
            return Ok(Some(sentence));
        }

        if !src.is_empty() {
            tracing::debug!(len = src.len(), "discarding unterminated data at end of stream");
            src.clear();
        }

        self.scanned = 0;

        Ok(None)
    }
}

impl Encoder<&Sentence> for Codec {
    type Error = std::io::Error;

    fn encode(&mut self, sentence: &Sentence, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(sentence.as_bytes().len() + TERMINATOR.len());
        dst.put_slice(sentence.as_bytes());
        dst.put_slice(TERMINATOR);
        Ok(())
    }
}
