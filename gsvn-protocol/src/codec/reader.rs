//! Incremental item decoder
//!
//! Items are parsed straight off a buffered stream, one byte at a time, so
//! a frame may arrive split across any number of reads. Nothing beyond the
//! current item is consumed.

use super::item::Item;
use crate::error::ProtocolError;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

/// Bytes of the current frame kept for error reports
const CONTEXT_LIMIT: usize = 128;
const MAX_DEPTH: usize = 64;
const MAX_WORD_LEN: usize = 1024;

fn is_whitespace(b: u8) -> bool {
    matches!(b, b' ' | b'\n' | b'\t' | b'\r')
}

/// Reads [`Item`]s from an ordered byte stream
pub struct SvnReader<R> {
    inner: BufReader<R>,
    max_string_len: usize,
    context: Vec<u8>,
}

impl<R: AsyncRead + Unpin> SvnReader<R> {
    pub fn new(inner: R, max_string_len: usize) -> Self {
        Self {
            inner: BufReader::new(inner),
            max_string_len,
            context: Vec::with_capacity(CONTEXT_LIMIT),
        }
    }

    fn malformed(&self, message: impl Into<String>) -> ProtocolError {
        ProtocolError::Malformed {
            message: message.into(),
            context: String::from_utf8_lossy(&self.context).into_owned(),
        }
    }

    fn remember(&mut self, bytes: &[u8]) {
        let room = CONTEXT_LIMIT.saturating_sub(self.context.len());
        self.context.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    async fn byte(&mut self) -> Result<u8, ProtocolError> {
        match self.inner.read_u8().await {
            Ok(b) => {
                self.remember(&[b]);
                Ok(b)
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(self.malformed("unexpected end of stream"))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn skip_whitespace(&mut self) -> Result<u8, ProtocolError> {
        loop {
            let b = self.byte().await?;
            if !is_whitespace(b) {
                return Ok(b);
            }
        }
    }

    async fn expect_whitespace(&mut self) -> Result<(), ProtocolError> {
        let b = self.byte().await?;
        if is_whitespace(b) {
            Ok(())
        } else {
            Err(self.malformed(format!("expected whitespace, found 0x{:02x}", b)))
        }
    }

    /// Read the next complete item.
    ///
    /// A clean end of stream before the first byte of an item is reported
    /// as [`ProtocolError::Closed`]; anywhere else it is malformed data.
    pub async fn read_item(&mut self) -> Result<Item, ProtocolError> {
        self.context.clear();
        let mut b = loop {
            match self.inner.read_u8().await {
                Ok(b) if is_whitespace(b) => continue,
                Ok(b) => break b,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(ProtocolError::Closed),
                Err(e) => return Err(e.into()),
            }
        };
        self.remember(&[b]);

        let mut stack: Vec<Vec<Item>> = Vec::new();
        loop {
            let nested = !stack.is_empty();
            let item = match b {
                b'(' => {
                    self.expect_whitespace().await?;
                    if stack.len() >= MAX_DEPTH {
                        return Err(self.malformed("lists nested too deeply"));
                    }
                    stack.push(Vec::new());
                    None
                }
                b')' => {
                    let Some(items) = stack.pop() else {
                        return Err(self.malformed("unexpected ')'"));
                    };
                    if !stack.is_empty() {
                        self.expect_whitespace().await?;
                    }
                    Some(Item::List(items))
                }
                b'0'..=b'9' => Some(self.number_or_string(b, nested).await?),
                b if b.is_ascii_alphabetic() => Some(self.word(b).await?),
                other => return Err(self.malformed(format!("unexpected byte 0x{:02x}", other))),
            };

            if let Some(item) = item {
                match stack.last_mut() {
                    Some(list) => list.push(item),
                    None => return Ok(item),
                }
            }
            b = self.skip_whitespace().await?;
        }
    }

    async fn number_or_string(&mut self, first: u8, nested: bool) -> Result<Item, ProtocolError> {
        let mut value = u64::from(first - b'0');
        loop {
            let b = self.byte().await?;
            match b {
                b'0'..=b'9' => {
                    value = value
                        .checked_mul(10)
                        .and_then(|v| v.checked_add(u64::from(b - b'0')))
                        .ok_or_else(|| self.malformed("number too large"))?;
                }
                b':' => return self.string_body(value, nested).await,
                b if is_whitespace(b) => return Ok(Item::Number(value)),
                other => return Err(self.malformed(format!("unexpected byte 0x{:02x} in number", other))),
            }
        }
    }

    async fn string_body(&mut self, len: u64, nested: bool) -> Result<Item, ProtocolError> {
        if len > self.max_string_len as u64 {
            return Err(ProtocolError::StringTooLong {
                len,
                max: self.max_string_len,
            });
        }
        let mut buf = vec![0u8; len as usize];
        match self.inner.read_exact(&mut buf).await {
            Ok(_) => self.remember(&buf),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(self.malformed(format!("string of {} bytes longer than remaining stream", len)));
            }
            Err(e) => return Err(e.into()),
        }
        if nested {
            self.expect_whitespace().await?;
        }
        Ok(Item::String(Bytes::from(buf)))
    }

    async fn word(&mut self, first: u8) -> Result<Item, ProtocolError> {
        let mut word = String::from(first as char);
        loop {
            let b = self.byte().await?;
            if b.is_ascii_alphanumeric() || b == b'-' {
                if word.len() >= MAX_WORD_LEN {
                    return Err(self.malformed("word too long"));
                }
                word.push(b as char);
            } else if is_whitespace(b) {
                return Ok(Item::Word(word));
            } else {
                return Err(self.malformed(format!("unexpected byte 0x{:02x} in word", b)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn reader(data: &'static [u8]) -> SvnReader<&'static [u8]> {
        SvnReader::new(data, 1024)
    }

    #[tokio::test]
    async fn test_decode_command_frame() {
        let mut r = reader(b"( get-locks ( 5:trunk ( infinity ) ) ) ");
        let item = r.read_item().await.unwrap();
        assert_eq!(
            item,
            Item::List(vec![
                Item::word("get-locks"),
                Item::List(vec![Item::string("trunk"), Item::List(vec![Item::word("infinity")])]),
            ])
        );
        assert!(matches!(r.read_item().await, Err(ProtocolError::Closed)));
    }

    #[tokio::test]
    async fn test_decode_primitives() {
        let mut r = reader(b"42 done 0: ( ) \n3:a b ");
        assert_eq!(r.read_item().await.unwrap(), Item::Number(42));
        assert_eq!(r.read_item().await.unwrap(), Item::word("done"));
        assert_eq!(r.read_item().await.unwrap(), Item::string(""));
        assert_eq!(r.read_item().await.unwrap(), Item::List(vec![]));
        assert_eq!(r.read_item().await.unwrap(), Item::string("a b"));
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let (client, server) = tokio::io::duplex(8);
        let writer = tokio::spawn(async move {
            let mut client = client;
            for chunk in [&b"( lo"[..], b"ck ( 1", b"1:trunk/a.", b"txt ( ) fa", b"lse ( ) ) ) "] {
                client.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
            client
        });

        let mut r = SvnReader::new(server, 1024);
        let item = r.read_item().await.unwrap();
        let list = item.as_list().unwrap();
        assert_eq!(list[0], Item::word("lock"));
        let params = list[1].as_list().unwrap();
        assert_eq!(params[0], Item::string("trunk/a.txt"));
        assert_eq!(params[2], Item::word("false"));
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_malformed_frames() {
        for data in [
            &b") "[..],
            b"( foo!bar ) ",
            b"( 12x ) ",
            b"(foo ) ",
            b"( #junk ) ",
            b"( 99999999999999999999999 ) ",
        ] {
            let mut r = SvnReader::new(data, 1024);
            let err = r.read_item().await.unwrap_err();
            assert!(matches!(err, ProtocolError::Malformed { .. }), "{:?} gave {:?}", data, err);
        }
    }

    #[tokio::test]
    async fn test_truncated_frames() {
        let mut r = reader(b"( get-latest-rev ( ");
        let err = r.read_item().await.unwrap_err();
        match err {
            ProtocolError::Malformed { context, .. } => assert!(context.starts_with("( get-latest-rev")),
            other => panic!("unexpected {:?}", other),
        }

        let mut r = reader(b"( 10:abc");
        assert!(matches!(r.read_item().await, Err(ProtocolError::Malformed { .. })));
    }

    #[tokio::test]
    async fn test_string_limit() {
        let mut r = SvnReader::new(&b"( 100:"[..], 10);
        assert!(matches!(
            r.read_item().await,
            Err(ProtocolError::StringTooLong { len: 100, max: 10 })
        ));
    }
}
