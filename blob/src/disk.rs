use std::{
    fs::File,
    io,
    ops::Range,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;

use super::{check_range, Blob};

/// File-backed payload. The length is captured when the file is opened; the
/// file must not change size while an upload reads from it.
///
/// Reads are positioned and share no cursor, so concurrent chunk uploads
/// read in parallel.
pub struct FileBlob {
    path: PathBuf,
    file: Arc<File>,
    size: u64,
}

impl FileBlob {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("failed to open blob file {:?}", path))?;
        let size = file
            .metadata()
            .await
            .with_context(|| format!("failed to stat blob file {:?}", path))?
            .len();
        Ok(Self {
            path,
            file: Arc::new(file.into_std().await),
            size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Blob for FileBlob {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_range(&self, range: Range<u64>) -> Result<Bytes> {
        check_range(&range, self.size)?;
        let file = self.file.clone();
        let (start, len) = (range.start, (range.end - range.start) as usize);
        let read = tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; len];
            read_exact_at(&file, &mut buf, start).map(|()| buf)
        })
        .await
        .context("blob read task failed")?;
        let buf = read.with_context(|| {
            format!(
                "short read of {:?} at {}..{}",
                self.path, range.start, range.end
            )
        })?;
        Ok(Bytes::from(buf))
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                buf = &mut std::mem::take(&mut buf)[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
