//! Row framing for dataset streams: a u32 little-endian length prefix
//! followed by the payload bytes.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Reads one framed row. Returns `None` on end of input.
pub async fn read_row<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut row = vec![0u8; len];
    reader.read_exact(&mut row).await?;
    Ok(Some(row))
}

/// Writes one framed row.
pub async fn write_row<W: AsyncWrite + Unpin>(writer: &mut W, row: &[u8]) -> io::Result<()> {
    writer.write_all(&(row.len() as u32).to_le_bytes()).await?;
    writer.write_all(row).await
}
