use std::future::poll_fn;
use std::io;
use std::path::Path;
use std::pin::Pin;

use futures_io::AsyncRead;
use futures_io::AsyncWrite;
use rand::CryptoRng;
use rand::RngCore;

use crate::error::WriteError;
use crate::writer::SafeWriter;
use crate::writer::Staged;
use crate::writer::Written;

const CHUNK: usize = 64 * 1024;

/// [`SafeWriter::write`] for an asynchronous payload.
///
/// Staging happens inline (a few metadata calls). The payload is streamed into the staging
/// file through `async-fs`, and the commit (`fsync`, backup copy, rename) runs on the
/// executor's blocking pool.
pub async fn write_async<R, P, A>(
    writer: &mut SafeWriter<R>,
    target: P,
    payload: A,
) -> Result<Written, WriteError>
where
    R: RngCore + CryptoRng,
    P: AsRef<Path>,
    A: AsyncRead + Unpin,
{
    let mut staged = writer.stage(target)?;
    fill_async(&mut staged, payload).await?;
    async_global_executor::spawn_blocking(move || staged.commit()).await
}

/// Stream `payload` into a staged write, returning the bytes copied.
pub async fn fill_async<A: AsyncRead + Unpin>(
    staged: &mut Staged,
    mut payload: A,
) -> Result<u64, WriteError> {
    let file = staged
        .staging_file()
        .try_clone()
        .map_err(|e| WriteError::io(staged.target(), e))?;
    let mut out = async_fs::File::from(file);

    let mut copied = 0u64;
    let mut buf = vec![0u8; CHUNK];
    loop {
        let n = poll_fn(|cx| Pin::new(&mut payload).poll_read(cx, &mut buf))
            .await
            .map_err(|e| WriteError::io(staged.target(), e))?;
        if n == 0 {
            break;
        }

        write_all(&mut out, &buf[..n])
            .await
            .map_err(|e| WriteError::io(staged.target(), e))?;
        staged.add_written(n as u64);
        copied += n as u64;
    }

    poll_fn(|cx| Pin::new(&mut out).poll_flush(cx))
        .await
        .map_err(|e| WriteError::io(staged.target(), e))?;

    Ok(copied)
}

async fn write_all(out: &mut async_fs::File, mut chunk: &[u8]) -> io::Result<()> {
    while !chunk.is_empty() {
        let n = poll_fn(|cx| Pin::new(&mut *out).poll_write(cx, chunk)).await?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        chunk = &chunk[n..];
    }
    Ok(())
}
