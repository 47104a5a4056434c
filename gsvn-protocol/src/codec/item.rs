//! Decoded wire items and typed parameter access

use crate::error::ProtocolError;
use bytes::Bytes;

/// One element of the tuple format
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    Word(String),
    Number(u64),
    String(Bytes),
    List(Vec<Item>),
}

impl Item {
    pub fn word(word: impl Into<String>) -> Self {
        Self::Word(word.into())
    }

    pub fn string(value: impl AsRef<[u8]>) -> Self {
        Self::String(Bytes::copy_from_slice(value.as_ref()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Word(_) => "word",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::List(_) => "list",
        }
    }

    pub fn as_word(&self) -> Option<&str> {
        match self {
            Self::Word(w) => Some(w),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Item]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.as_word()? {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }
}

/// Sequential reader over a parameter list
///
/// Required fields fail when missing or mistyped. `opt_*` fields read a
/// `[ x ]` tuple and also accept the tuple being absent at the end of the
/// list. Extra trailing items are ignored.
#[derive(Debug)]
pub struct Params<'a> {
    command: &'a str,
    items: &'a [Item],
    pos: usize,
}

impl<'a> Params<'a> {
    pub fn new(command: &'a str, items: &'a [Item]) -> Self {
        Self { command, items, pos: 0 }
    }

    fn error(&self, message: impl Into<String>) -> ProtocolError {
        ProtocolError::BadArguments {
            command: self.command.to_string(),
            message: message.into(),
        }
    }

    fn next(&mut self, expected: &str) -> Result<&'a Item, ProtocolError> {
        let item = self
            .items
            .get(self.pos)
            .ok_or_else(|| self.error(format!("missing {} at position {}", expected, self.pos)))?;
        self.pos += 1;
        Ok(item)
    }

    fn mismatch(&self, expected: &str, found: &Item) -> ProtocolError {
        self.error(format!("expected {} at position {}, found {}", expected, self.pos - 1, found.kind()))
    }

    /// Whether all items have been consumed
    pub fn is_at_end(&self) -> bool {
        self.pos >= self.items.len()
    }

    pub fn word(&mut self) -> Result<&'a str, ProtocolError> {
        let item = self.next("word")?;
        item.as_word().ok_or_else(|| self.mismatch("word", item))
    }

    pub fn number(&mut self) -> Result<u64, ProtocolError> {
        let item = self.next("number")?;
        item.as_number().ok_or_else(|| self.mismatch("number", item))
    }

    pub fn bytes(&mut self) -> Result<&'a Bytes, ProtocolError> {
        let item = self.next("string")?;
        item.as_bytes().ok_or_else(|| self.mismatch("string", item))
    }

    /// A string that must be valid UTF-8
    pub fn string(&mut self) -> Result<String, ProtocolError> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| self.error("string is not valid UTF-8"))
    }

    pub fn bool(&mut self) -> Result<bool, ProtocolError> {
        let item = self.next("boolean")?;
        item.as_bool().ok_or_else(|| self.mismatch("boolean", item))
    }

    pub fn list(&mut self) -> Result<&'a [Item], ProtocolError> {
        let item = self.next("list")?;
        item.as_list().ok_or_else(|| self.mismatch("list", item))
    }

    /// Parameters of a nested list, for tuples such as `( path [ rev ] )`
    pub fn nested(&mut self) -> Result<Params<'a>, ProtocolError> {
        let items = self.list()?;
        Ok(Params::new(self.command, items))
    }

    fn opt_tuple(&mut self) -> Result<Option<&'a Item>, ProtocolError> {
        if self.is_at_end() {
            return Ok(None);
        }
        let tuple = self.list()?;
        match tuple {
            [] => Ok(None),
            [item] => Ok(Some(item)),
            _ => Err(self.error(format!("optional value at position {} has {} items", self.pos - 1, tuple.len()))),
        }
    }

    pub fn opt_number(&mut self) -> Result<Option<u64>, ProtocolError> {
        match self.opt_tuple()? {
            None => Ok(None),
            Some(item) => item.as_number().map(Some).ok_or_else(|| self.mismatch("number", item)),
        }
    }

    pub fn opt_word(&mut self) -> Result<Option<&'a str>, ProtocolError> {
        match self.opt_tuple()? {
            None => Ok(None),
            Some(item) => item.as_word().map(Some).ok_or_else(|| self.mismatch("word", item)),
        }
    }

    pub fn opt_bool(&mut self) -> Result<Option<bool>, ProtocolError> {
        match self.opt_tuple()? {
            None => Ok(None),
            Some(item) => item.as_bool().map(Some).ok_or_else(|| self.mismatch("boolean", item)),
        }
    }

    pub fn opt_string(&mut self) -> Result<Option<String>, ProtocolError> {
        match self.opt_tuple()? {
            None => Ok(None),
            Some(Item::String(bytes)) => String::from_utf8(bytes.to_vec())
                .map(Some)
                .map_err(|_| self.error("string is not valid UTF-8")),
            Some(item) => Err(self.mismatch("string", item)),
        }
    }

    /// A trailing list that may be absent entirely
    pub fn opt_list(&mut self) -> Result<Option<&'a [Item]>, ProtocolError> {
        if self.is_at_end() {
            return Ok(None);
        }
        self.list().map(Some)
    }
}
