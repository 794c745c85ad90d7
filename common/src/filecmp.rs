//! Content equality for regular files
//!
//! Two files are considered identical when the SHA-256 digests of their full contents match.
//! Content is streamed through a fixed-size buffer so memory use does not depend on file size.

use sha2::Digest as _;
use tokio::io::AsyncReadExt;
use tracing::instrument;

const READ_BUFFER_SIZE: usize = 128 * 1024;

/// Failure to open or fully read a file while computing its digest.
#[derive(Debug, thiserror::Error)]
#[error("cannot read content of {path:?}: {source}")]
pub struct Error {
    pub path: std::path::PathBuf,
    #[source]
    pub source: std::io::Error,
}

impl Error {
    fn new(path: &std::path::Path, source: std::io::Error) -> Self {
        Self {
            path: path.to_owned(),
            source,
        }
    }
}

/// SHA-256 digest of a file's content.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Computes the digest of the file at `path`, reading it incrementally.
#[instrument]
pub async fn digest(path: &std::path::Path) -> Result<Digest, Error> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|err| Error::new(path, err))?;
    let mut hasher = sha2::Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let read = file
            .read(&mut buffer)
            .await
            .map_err(|err| Error::new(path, err))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(Digest(hasher.finalize().into()))
}

/// Returns true iff both files have byte-identical content.
///
/// Files of different length are reported as different without reading them. Otherwise each
/// file is hashed independently and the digests are compared.
#[instrument]
pub async fn content_equal(a: &std::path::Path, b: &std::path::Path) -> Result<bool, Error> {
    let a_metadata = tokio::fs::metadata(a)
        .await
        .map_err(|err| Error::new(a, err))?;
    let b_metadata = tokio::fs::metadata(b)
        .await
        .map_err(|err| Error::new(b, err))?;
    if a_metadata.len() != b_metadata.len() {
        tracing::debug!("sizes differ: {} vs {}", a_metadata.len(), b_metadata.len());
        return Ok(false);
    }
    let a_digest = digest(a).await?;
    let b_digest = digest(b).await?;
    tracing::debug!("digests: {} vs {}", a_digest, b_digest);
    Ok(a_digest == b_digest)
}
