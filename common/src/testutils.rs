use anyhow::Context;
use async_recursion::async_recursion;

pub async fn create_temp_dir() -> anyhow::Result<std::path::PathBuf> {
    let mut idx = 0;
    loop {
        let tmp_dir = std::env::temp_dir().join(format!("rmirror_test{}", &idx));
        if let Err(error) = tokio::fs::create_dir(&tmp_dir).await {
            match error.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    idx += 1;
                }
                _ => return Err(error.into()),
            }
        } else {
            return Ok(tmp_dir);
        }
    }
}

pub async fn setup_test_dir() -> anyhow::Result<std::path::PathBuf> {
    // create a temporary directory
    let tmp_dir = create_temp_dir().await?;
    // foo
    // |- 0.txt
    // |- bar
    //    |- 1.txt
    //    |- 2.txt
    //    |- 3.txt
    // |- baz
    //    |- 4.txt
    //    |- qux
    //       |- 5.txt
    // |- empty
    let foo_path = tmp_dir.join("foo");
    tokio::fs::create_dir(&foo_path).await.unwrap();
    tokio::fs::write(foo_path.join("0.txt"), "0").await.unwrap();
    let bar_path = foo_path.join("bar");
    tokio::fs::create_dir(&bar_path).await.unwrap();
    tokio::fs::write(bar_path.join("1.txt"), "1").await.unwrap();
    tokio::fs::write(bar_path.join("2.txt"), "2").await.unwrap();
    tokio::fs::write(bar_path.join("3.txt"), "3").await.unwrap();
    let baz_path = foo_path.join("baz");
    tokio::fs::create_dir(&baz_path).await.unwrap();
    tokio::fs::write(baz_path.join("4.txt"), "4").await.unwrap();
    let qux_path = baz_path.join("qux");
    tokio::fs::create_dir(&qux_path).await.unwrap();
    tokio::fs::write(qux_path.join("5.txt"), "5").await.unwrap();
    tokio::fs::create_dir(foo_path.join("empty")).await.unwrap();
    Ok(tmp_dir)
}

/// Content of a tree keyed by relative path, `None` marks a directory.
pub type TreeSnapshot = std::collections::BTreeMap<std::path::PathBuf, Option<Vec<u8>>>;

#[async_recursion]
async fn snapshot_into(
    root: &std::path::Path,
    path: &std::path::Path,
    snapshot: &mut TreeSnapshot,
) -> anyhow::Result<()> {
    let mut entries = tokio::fs::read_dir(path)
        .await
        .with_context(|| format!("cannot open directory {path:?} for reading"))?;
    while let Some(entry) = entries.next_entry().await? {
        let entry_path = entry.path();
        let relative = entry_path.strip_prefix(root)?.to_owned();
        if entry.file_type().await?.is_dir() {
            snapshot.insert(relative, None);
            snapshot_into(root, &entry_path, snapshot).await?;
        } else {
            let content = tokio::fs::read(&entry_path)
                .await
                .with_context(|| format!("cannot read {entry_path:?}"))?;
            snapshot.insert(relative, Some(content));
        }
    }
    Ok(())
}

/// Captures structure and content of the tree rooted at `root`.
pub async fn snapshot(root: &std::path::Path) -> anyhow::Result<TreeSnapshot> {
    let mut snapshot = TreeSnapshot::new();
    snapshot_into(root, root, &mut snapshot).await?;
    Ok(snapshot)
}

/// Checks that `dst` holds exactly the entries of `src` with identical content.
pub async fn check_dirs_identical(
    src: &std::path::Path,
    dst: &std::path::Path,
) -> anyhow::Result<()> {
    let src_snapshot = snapshot(src).await?;
    let dst_snapshot = snapshot(dst).await?;
    for (path, content) in &src_snapshot {
        match dst_snapshot.get(path) {
            Some(dst_content) if dst_content == content => {}
            Some(_) => anyhow::bail!("{:?} differs between {:?} and {:?}", path, src, dst),
            None => anyhow::bail!("{:?} is missing from {:?}", path, dst),
        }
    }
    for path in dst_snapshot.keys() {
        if !src_snapshot.contains_key(path) {
            anyhow::bail!("{:?} is present in {:?} but not in {:?}", path, dst, src);
        }
    }
    Ok(())
}
