//! Atomic binary replacement.
//!
//! Every write lands in a temp file inside the destination's own directory and
//! becomes visible through a single `rename`, so a concurrent `exec` of the
//! destination sees either the old or the new executable, never a torn one.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::{Builder, NamedTempFile, TempPath};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::error::{PhoenixError, Result};
use crate::log_component;

const TEMP_PREFIX: &str = ".phoenix-";
const CHUNK: usize = 64 * 1024;

/// Directory that holds `path`, `.` for bare file names.
pub(crate) fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

fn temp_in(dir: &Path) -> Result<NamedTempFile> {
    Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(dir)
        .map_err(|e| {
            PhoenixError::Install(format!(
                "failed to create temp file in {}: {}",
                dir.display(),
                e
            ))
        })
}

/// Move `src` over `dst` so that `dst` holds exactly `src`'s bytes.
///
/// A plain rename is used when both live on the same filesystem. Otherwise
/// the bytes are copied into a temp file next to `dst` (permissions kept,
/// synced to disk), that file is renamed over `dst`, and `src` is removed.
pub fn overwrite(dst: &Path, src: &Path) -> Result<()> {
    if dst == src {
        return Ok(());
    }
    match fs::rename(src, dst) {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(PhoenixError::Install(format!(
                "cannot install {}: {}",
                src.display(),
                e
            )))
        }
        Err(e) => log_component!(
            debug,
            "install",
            "rename failed, falling back to copy",
            error = e.to_string().as_str()
        ),
    }

    let mut source = File::open(src)
        .map_err(|e| PhoenixError::Install(format!("cannot open {}: {}", src.display(), e)))?;
    let permissions = source.metadata()?.permissions();

    let mut temp = temp_in(parent_dir(dst))?;
    io::copy(&mut source, temp.as_file_mut())?;
    temp.as_file().set_permissions(permissions)?;
    temp.as_file().sync_all()?;
    temp.persist(dst).map_err(|e| {
        PhoenixError::Install(format!("failed to replace {}: {}", dst.display(), e.error))
    })?;

    fs::remove_file(src)?;
    Ok(())
}

/// Hex SHA-256 of a file's contents.
pub fn file_sha256(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// A fully written candidate executable waiting next to its destination.
///
/// No handle to the file stays open, so it can be executed before it is
/// committed.
#[derive(Debug)]
pub struct StagedArtifact {
    path: TempPath,
    sha256: String,
    bytes: u64,
}

impl StagedArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Mark the staged file executable.
    pub fn make_executable(&self) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o755))?;
        }
        Ok(())
    }

    /// Atomically rename the staged file over `dst`.
    pub fn commit(self, dst: &Path) -> Result<PathBuf> {
        self.path.persist(dst).map_err(|e| {
            PhoenixError::Install(format!("failed to replace {}: {}", dst.display(), e.error))
        })?;
        Ok(dst.to_path_buf())
    }
}

/// Drain `stream` into a temp file in `dir`, hashing as it goes.
///
/// The temp file is removed if anything fails or the result is dropped
/// without [`StagedArtifact::commit`].
pub async fn stage<R>(mut stream: R, dir: &Path) -> Result<StagedArtifact>
where
    R: AsyncRead + Unpin,
{
    let (file, path) = temp_in(dir)?.into_parts();
    let mut out = tokio::fs::File::from_std(file);
    let mut hasher = Sha256::new();
    let mut bytes = 0u64;
    let mut buf = vec![0u8; CHUNK];

    loop {
        let n = stream
            .read(&mut buf)
            .await
            .map_err(|e| PhoenixError::retrieval(format!("artifact stream failed ({})", e)))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        out.write_all(&buf[..n]).await?;
        bytes += n as u64;
    }
    out.flush().await?;
    out.sync_all().await?;
    drop(out);

    Ok(StagedArtifact {
        path,
        sha256: hex::encode(hasher.finalize()),
        bytes,
    })
}
