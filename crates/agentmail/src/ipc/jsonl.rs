use std::io;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames larger than this are refused; message bodies are capped far below it.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

pub async fn write_jsonl<W, T>(writer: &mut W, value: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut buf = serde_json::to_vec(value).map_err(invalid_data)?;
    buf.push(b'\n');
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the next non-empty line as JSON. `Ok(None)` on clean EOF.
///
/// At most `MAX_FRAME_BYTES` are buffered per line; a longer line is
/// `InvalidData` and the rest of it is left unread.
pub async fn read_jsonl<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let limit = MAX_FRAME_BYTES as u64 + 1;
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = (&mut *reader).take(limit).read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        if n > MAX_FRAME_BYTES && line.last() != Some(&b'\n') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame exceeds {MAX_FRAME_BYTES} bytes"),
            ));
        }

        let text =
            std::str::from_utf8(&line).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }

        let value = serde_json::from_str(trimmed).map_err(invalid_data)?;
        return Ok(Some(value));
    }
}

fn invalid_data(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
