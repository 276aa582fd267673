use std::io;

use bytes::BytesMut;
use proto::{format, parse, Message};
use tokio_util::codec::{Decoder, Encoder};

pub type ParseResult<T = Message, E = parse::Error> = std::result::Result<T, E>;

/// Splits the inbound byte stream on CR, LF or CRLF and parses each line.
///
/// A line that grows past [`proto::LINE_BYTE_LIMIT`] without a terminator
/// is dropped and the decoder resynchronizes at the next terminator.
#[derive(Default)]
pub struct Codec {
    skipping: bool,
}

impl Codec {
    pub fn new() -> Self {
        Self::default()
    }
}

fn find_terminator(src: &BytesMut) -> Option<(usize, usize)> {
    for (i, &b) in src.iter().enumerate() {
        if b == b'\n' {
            return Some((i, i + 1));
        }
        if b == b'\r' {
            return match src.get(i + 1) {
                Some(b'\n') => Some((i, i + 2)),
                // Lone CR terminates, but a CR at the buffer edge may
                // still be the first half of a CRLF
                Some(_) => Some((i, i + 1)),
                None => None,
            };
        }
    }
    None
}

impl Decoder for Codec {
    type Item = ParseResult;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some((start, end)) = find_terminator(src) else {
                if src.len() > proto::LINE_BYTE_LIMIT {
                    if !self.skipping {
                        log::warn!(
                            "dropping oversize line ({} bytes buffered without terminator)",
                            src.len()
                        );
                    }
                    src.clear();
                    self.skipping = true;
                }
                return Ok(None);
            };

            let bytes = Vec::from(src.split_to(end));

            if self.skipping {
                // Everything up to this terminator belongs to the
                // dropped line
                self.skipping = false;
                continue;
            }

            if start > proto::LINE_BYTE_LIMIT {
                log::warn!("dropping oversize line ({start} bytes)");
                continue;
            }

            return Ok(Some(parse::message_bytes(bytes)));
        }
    }
}

impl Encoder<Message> for Codec {
    type Error = Error;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let encoded = format::message(message);

        dst.extend(encoded.into_bytes());

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;
    use proto::Command;
    use tokio_util::codec::Decoder;

    use super::Codec;

    fn decode_all(codec: &mut Codec, src: &mut BytesMut) -> Vec<proto::Message> {
        let mut out = vec![];
        while let Ok(Some(result)) = codec.decode(src) {
            if let Ok(message) = result {
                out.push(message);
            }
        }
        out
    }

    #[test]
    fn splits_on_any_terminator() {
        let mut codec = Codec::new();
        let mut src = BytesMut::from(&b"PING :a\r\nPING :b\nPING :c\r\n"[..]);

        let messages = decode_all(&mut codec, &mut src);
        let tokens = messages
            .iter()
            .map(|m| match &m.command {
                Command::PING(token) => token.as_str(),
                _ => panic!("expected PING"),
            })
            .collect::<Vec<_>>();

        assert_eq!(tokens, vec!["a", "b", "c"]);
        assert!(src.is_empty());
    }

    #[test]
    fn partial_line_waits_for_more() {
        let mut codec = Codec::new();
        let mut src = BytesMut::from(&b"PING :to"[..]);

        assert!(codec.decode(&mut src).unwrap().is_none());

        src.extend_from_slice(b"ken\r\n");
        let message = codec.decode(&mut src).unwrap().unwrap().unwrap();
        assert_eq!(message.command, Command::PING("token".to_string()));
    }

    #[test]
    fn oversize_line_dropped_and_resynchronized() {
        let mut codec = Codec::new();

        let mut src = BytesMut::new();
        src.extend_from_slice(&vec![b'x'; proto::LINE_BYTE_LIMIT + 1]);
        assert!(codec.decode(&mut src).unwrap().is_none());
        assert!(src.is_empty());

        // Tail of the oversize line plus a healthy one
        src.extend_from_slice(b"xxxx\r\nPING :ok\r\n");
        let message = codec.decode(&mut src).unwrap().unwrap().unwrap();
        assert_eq!(message.command, Command::PING("ok".to_string()));
    }
}
