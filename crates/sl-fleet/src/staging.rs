//! Staging helpers for the shared artifacts workers pull at startup.

use sl_store::BufferedPublisher;
use sl_types::{validation_error, Category, SlResult};
use std::path::Path;
use tracing::info;

const ARCHIVE_EXTENSION: &str = ".tar.gz";

/// Upload a compressed dataset archive into `data/`. Returns the object name.
pub async fn stage_dataset(publisher: &BufferedPublisher, archive: &Path) -> SlResult<String> {
    let name = file_name(archive)?;
    if !name.ends_with(ARCHIVE_EXTENSION) || name.len() == ARCHIVE_EXTENSION.len() {
        return Err(validation_error!(
            "dataset '{}' is not a {} archive",
            archive.display(),
            ARCHIVE_EXTENSION
        ));
    }

    let bytes = tokio::fs::read(archive).await?;
    publisher
        .publish(&name, &bytes, &Category::Data.prefix())
        .await?;
    info!(dataset = %name, bytes = bytes.len(), "staged dataset");
    Ok(name)
}

/// Upload an access token into `secrets/`. Surrounding whitespace is stripped.
pub async fn stage_access_token(publisher: &BufferedPublisher, token_file: &Path) -> SlResult<String> {
    let name = file_name(token_file)?;
    let token = tokio::fs::read_to_string(token_file).await?;
    let token = token.trim();
    if token.is_empty() {
        return Err(validation_error!("token file '{}' is empty", token_file.display()));
    }

    publisher
        .publish(&name, token.as_bytes(), &Category::Secrets.prefix())
        .await?;
    info!(secret = %name, "staged access token");
    Ok(name)
}

/// Drop every worker's working slot.
pub async fn clear_worker_progress(publisher: &BufferedPublisher) -> SlResult<()> {
    publisher
        .delete_prefix(&Category::VmProgress.prefix())
        .await?;
    info!("cleared worker progress");
    Ok(())
}

fn file_name(path: &Path) -> SlResult<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| validation_error!("'{}' has no file name", path.display()))
}
