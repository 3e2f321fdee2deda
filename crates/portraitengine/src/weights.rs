use portraitcore::AssetError;
use portraitruntime::WeightManifest;
use std::path::Path;
use tokio::io::AsyncWriteExt;

/// Make sure every weight in `manifest` is present in `weights_dir`.
///
/// Missing files are fetched from `<base_url>/<name>` when a base URL is
/// given; without one they are reported as missing. Returns the names that
/// were downloaded.
pub async fn ensure_weights(
    manifest: &WeightManifest,
    weights_dir: &Path,
    base_url: Option<&str>,
) -> Result<Vec<String>, AssetError> {
    let missing = manifest.missing(weights_dir);
    if missing.is_empty() {
        tracing::debug!(dir = %weights_dir.display(), "All weights present");
        return Ok(missing);
    }

    let Some(base_url) = base_url else {
        return Err(AssetError::MissingWeights(missing));
    };

    tokio::fs::create_dir_all(weights_dir)
        .await
        .map_err(|e| download_failed(weights_dir.display(), e))?;

    let client = reqwest::Client::new();
    for name in &missing {
        download_weight(&client, base_url, name, weights_dir).await?;
    }
    Ok(missing)
}

async fn download_weight(
    client: &reqwest::Client,
    base_url: &str,
    name: &str,
    weights_dir: &Path,
) -> Result<(), AssetError> {
    let url = format!("{}/{}", base_url.trim_end_matches('/'), name);
    tracing::info!("Downloading weights: {}", url);

    let mut response = client
        .get(&url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| download_failed(name, e))?;

    // Write under a temporary name so an interrupted download never looks complete
    let partial = weights_dir.join(format!("{}.part", name));
    let mut file = tokio::fs::File::create(&partial)
        .await
        .map_err(|e| download_failed(name, e))?;

    let mut written: u64 = 0;
    while let Some(chunk) = response.chunk().await.map_err(|e| download_failed(name, e))? {
        file.write_all(&chunk).await.map_err(|e| download_failed(name, e))?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(|e| download_failed(name, e))?;
    drop(file);

    tokio::fs::rename(&partial, weights_dir.join(name))
        .await
        .map_err(|e| download_failed(name, e))?;

    tracing::info!("Downloaded {} ({} bytes)", name, written);
    Ok(())
}

fn download_failed(name: impl std::fmt::Display, reason: impl std::fmt::Display) -> AssetError {
    AssetError::DownloadFailed {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}
