//! Copy with a side write to the session transcript, the Rust stand-in
//! for the source's `io.Copy(io.MultiWriter(w, logger), stream)`.

use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::log::SessionLog;

pub async fn copy_tee<R, W>(mut reader: R, mut writer: W, log: &SessionLog) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 8192];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        log.write_bytes(&buf[..n]).await;
        total += n as u64;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copies_all_bytes_and_tees_to_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = SessionLog::open(dir.path(), "host").await.unwrap();

        let reader: &[u8] = b"some output";
        let mut writer = Vec::new();
        let n = copy_tee(reader, &mut writer, &log).await.unwrap();

        assert_eq!(n, 11);
        assert_eq!(writer, b"some output");

        let logged = tokio::fs::read(log.path()).await.unwrap();
        assert_eq!(logged, b"some output");
    }

    #[tokio::test]
    async fn empty_reader_copies_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let log = SessionLog::open(dir.path(), "host").await.unwrap();

        let reader: &[u8] = b"";
        let mut writer = Vec::new();
        let n = copy_tee(reader, &mut writer, &log).await.unwrap();

        assert_eq!(n, 0);
        assert!(writer.is_empty());
    }
}
