use std::path::Path;

use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::cache::{hex_encode, ArtifactCache};
use crate::error::{DistError, Result};
use crate::version::K3sVersion;

/// Callback receiving `(bytes so far, expected total)` during a download.
/// The total is zero when the server did not announce a length.
pub type ProgressFn<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

/// Stream `url` into `dest`, returning the SHA-256 hex digest of the body.
pub async fn download_file(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
    progress: ProgressFn<'_>,
) -> Result<String> {
    debug!(url, dest = %dest.display(), "downloading");
    let resp = client.get(url).send().await?;
    if !resp.status().is_success() {
        return Err(DistError::Download(format!(
            "GET {} returned {}",
            url,
            resp.status()
        )));
    }

    let total = resp.content_length().unwrap_or(0);
    let mut file = fs::File::create(dest).await?;
    let mut hasher = Sha256::new();
    let mut received = 0u64;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
        received += chunk.len() as u64;
        progress(received, total);
    }
    file.flush().await?;

    Ok(hex_encode(&hasher.finalize()))
}

/// Make sure the artifacts for `version` are in the cache, downloading them
/// from `<download_url>/<raw version>/<file>` when missing or corrupt.
///
/// Files land in a scratch directory under the cache root first and are only
/// renamed into place once every checksum matches.
pub async fn ensure_artifacts(
    client: &reqwest::Client,
    download_url: &str,
    cache: &ArtifactCache,
    version: &K3sVersion,
    progress: ProgressFn<'_>,
) -> Result<()> {
    if cache.is_valid(version).await {
        debug!(version = %version, "k3s artifacts already cached");
        return Ok(());
    }

    let root = cache.root();
    fs::create_dir_all(&root).await?;
    let scratch = tempfile::Builder::new()
        .prefix(&format!("tmp-{}-", version.raw()))
        .tempdir_in(&root)?;

    let names = cache.names();
    let base = format!("{}/{}", download_url.trim_end_matches('/'), version.raw());
    info!(version = %version, "downloading k3s");

    download_file(
        client,
        &format!("{}/{}", base, names.checksum),
        &scratch.path().join(names.checksum),
        &|_: u64, _: u64| {},
    )
    .await?;
    download_file(
        client,
        &format!("{}/{}", base, names.exe),
        &scratch.path().join(names.exe),
        progress,
    )
    .await?;

    let mut last_err = None;
    let mut got_image = false;
    for image in names.images {
        match download_file(
            client,
            &format!("{}/{}", base, image),
            &scratch.path().join(image),
            progress,
        )
        .await
        {
            Ok(_) => {
                got_image = true;
                break;
            }
            Err(e) => {
                debug!(image, error = %e, "image archive unavailable, trying next");
                let _ = fs::remove_file(scratch.path().join(image)).await;
                last_err = Some(e);
            }
        }
    }
    if !got_image {
        return Err(last_err.unwrap_or_else(|| {
            DistError::NotFound(format!("no image archive for {}", version))
        }));
    }

    cache.verify_dir(scratch.path()).await?;

    let dest = cache.version_dir(version);
    if fs::metadata(&dest).await.is_ok() {
        fs::remove_dir_all(&dest).await?;
    }
    let staged = scratch.into_path();
    fs::rename(&staged, &dest).await?;
    info!(version = %version, path = %dest.display(), "k3s artifacts cached");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
