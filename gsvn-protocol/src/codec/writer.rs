//! Builder-style item encoder

use super::item::Item;
use crate::error::{ProtocolError, SvnServerError};
use bytes::{BufMut, Bytes, BytesMut};

/// Accumulates encoded items in memory
///
/// Calls chain; list nesting is tracked and checked by [`SvnWriter::finish`],
/// so an unbalanced `open`/`close` sequence surfaces as
/// [`ProtocolError::Unbalanced`] instead of reaching the peer.
#[derive(Debug, Default)]
pub struct SvnWriter {
    buf: BytesMut,
    depth: usize,
    unbalanced: bool,
}

impl SvnWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn open(&mut self) -> &mut Self {
        self.depth += 1;
        self.buf.put_slice(b"( ");
        self
    }

    pub fn close(&mut self) -> &mut Self {
        match self.depth.checked_sub(1) {
            Some(depth) => self.depth = depth,
            None => self.unbalanced = true,
        }
        self.buf.put_slice(b") ");
        self
    }

    pub fn word(&mut self, word: &str) -> &mut Self {
        self.buf.put_slice(word.as_bytes());
        self.buf.put_u8(b' ');
        self
    }

    pub fn number(&mut self, n: u64) -> &mut Self {
        self.buf.put_slice(n.to_string().as_bytes());
        self.buf.put_u8(b' ');
        self
    }

    pub fn string(&mut self, value: impl AsRef<[u8]>) -> &mut Self {
        let value = value.as_ref();
        self.buf.put_slice(value.len().to_string().as_bytes());
        self.buf.put_u8(b':');
        self.buf.put_slice(value);
        self.buf.put_u8(b' ');
        self
    }

    pub fn bool(&mut self, value: bool) -> &mut Self {
        self.word(if value { "true" } else { "false" })
    }

    /// `[ value ]`
    pub fn opt_string(&mut self, value: Option<impl AsRef<[u8]>>) -> &mut Self {
        self.open();
        if let Some(value) = value {
            self.string(value);
        }
        self.close()
    }

    /// `[ n ]`
    pub fn opt_number(&mut self, value: Option<u64>) -> &mut Self {
        self.open();
        if let Some(n) = value {
            self.number(n);
        }
        self.close()
    }

    pub fn item(&mut self, item: &Item) -> &mut Self {
        match item {
            Item::Word(w) => self.word(w),
            Item::Number(n) => self.number(*n),
            Item::String(s) => self.string(s),
            Item::List(items) => {
                self.open();
                for item in items {
                    self.item(item);
                }
                self.close()
            }
        }
    }

    /// Append another writer's finished output
    pub fn append(&mut self, other: SvnWriter) -> Result<&mut Self, ProtocolError> {
        let bytes = other.finish()?;
        self.buf.put_slice(&bytes);
        Ok(self)
    }

    /// `( success ( ... ) )` around a finished payload
    pub fn success(&mut self, payload: SvnWriter) -> Result<&mut Self, ProtocolError> {
        self.open().word("success").open();
        self.append(payload)?;
        Ok(self.close().close())
    }

    /// `( failure ( ( code message file line ) ... ) )`, outermost error first
    pub fn failure(&mut self, error: &SvnServerError) -> &mut Self {
        self.open().word("failure").open();
        for entry in error.chain() {
            self.open()
                .number(entry.code.code())
                .string(&entry.message)
                .string("")
                .number(0)
                .close();
        }
        self.close().close()
    }

    /// The encoded bytes; fails if lists were left open or closed twice
    pub fn finish(self) -> Result<Bytes, ProtocolError> {
        if self.unbalanced || self.depth != 0 {
            return Err(ProtocolError::Unbalanced);
        }
        Ok(self.buf.freeze())
    }
}
