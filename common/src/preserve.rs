use anyhow::{Context, Result};
use tracing::instrument;

/// Copies access and modification timestamps from `metadata` onto the file at `path`.
///
/// The copy primitive keeps permission bits; timestamps are the only extra metadata a replica
/// carries over.
#[instrument(skip(metadata))]
pub async fn set_file_times(metadata: &std::fs::Metadata, path: &std::path::Path) -> Result<()> {
    let atime = filetime::FileTime::from_last_access_time(metadata);
    let mtime = filetime::FileTime::from_last_modification_time(metadata);
    let dst = path.to_owned();
    tokio::task::spawn_blocking(move || -> Result<()> {
        tracing::debug!("setting timestamps");
        filetime::set_file_times(&dst, atime, mtime)
            .with_context(|| format!("failed setting timestamps for {:?}", &dst))
    })
    .await?
}

#[cfg(test)]
mod tests {
    use crate::testutils;
    use tracing_test::traced_test;

    use super::*;

    #[tokio::test]
    #[traced_test]
    async fn mtime_is_carried_over() -> Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let src = tmp_dir.join("src.txt");
        let dst = tmp_dir.join("dst.txt");
        tokio::fs::write(&src, "src").await?;
        tokio::fs::write(&dst, "dst").await?;
        let past = filetime::FileTime::from_unix_time(1_000_000_000, 0);
        filetime::set_file_mtime(&src, past)?;
        set_file_times(&tokio::fs::metadata(&src).await?, &dst).await?;
        let dst_metadata = tokio::fs::metadata(&dst).await?;
        assert_eq!(
            filetime::FileTime::from_last_modification_time(&dst_metadata),
            past
        );
        Ok(())
    }
}
