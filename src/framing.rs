//! Length-prefixed frames: a little-endian `u32` length followed by the payload.

use anyhow::{bail, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub async fn write_frame<W>(stream: &mut W, data: &[u8], max_len: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if data.len() > max_len {
        bail!("frame of {} bytes exceeds limit of {max_len}", data.len());
    }
    let len = u32::try_from(data.len())?;
    stream.write_u32_le(len).await?;
    stream.write_all(data).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed the stream between frames.
pub async fn read_frame<R>(stream: &mut R, max_len: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let len = match stream.read_u32_le().await {
        Ok(v) => v as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    if len > max_len {
        bail!("incoming frame of {len} bytes exceeds limit of {max_len}");
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Some(buf))
}
