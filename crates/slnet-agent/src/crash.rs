use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::io::AsyncWriteExt;

use crate::support::unix_ms;

/// Writes `crash_<unix_ms>.txt` under `dir`, creating the directory if needed.
pub async fn write_crash_report(dir: &Path, message: &str) -> anyhow::Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("create {}", dir.display()))?;

    let path = dir.join(format!("crash_{}.txt", unix_ms()));
    let mut f = tokio::fs::File::create(&path)
        .await
        .with_context(|| format!("create {}", path.display()))?;
    f.write_all(message.as_bytes())
        .await
        .with_context(|| format!("write {}", path.display()))?;
    f.flush().await.ok();

    tracing::error!(path = %path.display(), "crash report written");
    Ok(path)
}
