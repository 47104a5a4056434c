//! ra_svn wire codec
//!
//! The format is a sequence of whitespace-separated items: words, numbers,
//! length-prefixed strings (`5:hello`) and parenthesized lists.

mod item;
mod reader;
mod writer;

pub use item::{Item, Params};
pub use reader::SvnReader;
pub use writer::SvnWriter;

use crate::error::ProtocolError;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};

/// Both directions of one connection
pub struct SvnStream<R, W> {
    reader: SvnReader<R>,
    writer: BufWriter<W>,
}

impl<R, W> SvnStream<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, max_string_len: usize) -> Self {
        Self {
            reader: SvnReader::new(reader, max_string_len),
            writer: BufWriter::new(writer),
        }
    }

    pub async fn read_item(&mut self) -> Result<Item, ProtocolError> {
        self.reader.read_item().await
    }

    /// Encode and flush everything `out` holds
    pub async fn send(&mut self, out: SvnWriter) -> Result<(), ProtocolError> {
        let bytes = out.finish()?;
        self.send_bytes(&bytes).await
    }

    /// Write already encoded items and flush
    pub async fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
