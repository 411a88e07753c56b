// HTTP client for the model catalog — metadata lookups and streamed
// downloads with redirect-aware auth handling.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Result};
use futures_util::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_DISPOSITION, CONTENT_TYPE, LOCATION};
use reqwest::{Response, Url};
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{DOWNLOAD_TIMEOUT, ERROR_SNIPPET_BYTES, MAX_REDIRECTS, UpstreamConfig};
use crate::util::file_exists_non_empty;

use super::paths::{filename_from_content_disposition, sanitize_filename};
use super::types::ModelVersionInfo;

/// Expand a URL template with an id. Accepts `{id}` or `%s` placeholders,
/// otherwise appends the id as a path segment.
pub fn url_with_id(template: &str, id: &str) -> String {
    let template = template.trim();
    if template.is_empty() {
        return String::new();
    }
    if template.contains("{id}") {
        return template.replace("{id}", id);
    }
    if template.contains("%s") {
        return template.replace("%s", id);
    }
    if template.ends_with('/') {
        return format!("{template}{id}");
    }
    format!("{template}/{id}")
}

pub struct CatalogClient {
    http: reqwest::Client,
    api_key: String,
    model_info_url: String,
    shutdown: CancellationToken,
}

impl CatalogClient {
    pub fn new(config: &UpstreamConfig, shutdown: CancellationToken) -> Result<Self> {
        // Redirects are followed by hand so the bearer token is only ever
        // forwarded to the host the request started on.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(DOWNLOAD_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            model_info_url: config.model_info_url.clone(),
            shutdown,
        })
    }

    /// Fetch version metadata from the catalog.
    pub async fn get_model_version(&self, id: i64) -> Result<ModelVersionInfo> {
        let endpoint = url_with_id(&self.model_info_url, &id.to_string());
        if endpoint.is_empty() {
            bail!("missing model info url template");
        }
        debug!("get model version id={} url={}", id, endpoint);

        let resp = self.get_following_redirects(&endpoint, true).await?;
        let status = resp.status();
        if !status.is_success() {
            bail!(
                "model version request failed: {}: {}",
                status,
                body_snippet(resp).await
            );
        }

        let info = resp.json::<ModelVersionInfo>().await?;
        Ok(info)
    }

    /// Download `url` into `dest_folder`, naming the file from the response's
    /// Content-Disposition and the version id. The body is streamed to a
    /// `.part` file and renamed into place once complete; any failure removes
    /// the partial file. An existing non-empty file short-circuits to success.
    pub async fn download(&self, url: &str, version_id: i64, dest_folder: &Path) -> Result<()> {
        let url = url.trim();
        if url.is_empty() {
            bail!("missing download url");
        }

        info!("download start url={} dest={}", url, dest_folder.display());

        let resp = self.get_following_redirects(url, false).await?;
        let status = resp.status();
        if !status.is_success() {
            bail!("download failed: {}: {}", status, body_snippet(resp).await);
        }

        let candidate = resp
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(filename_from_content_disposition)
            .unwrap_or_else(|| "model.safetensors".to_string());
        let filename = sanitize_filename(&candidate, &version_id.to_string());

        let final_path = dest_folder.join(&filename);
        let part_path = dest_folder.join(format!("{filename}.part"));

        if file_exists_non_empty(&final_path) {
            info!("download skipped; file exists: {}", final_path.display());
            return Ok(());
        }

        self.stream_to_file(resp, &part_path).await?;

        if let Err(err) = fs::rename(&part_path, &final_path).await {
            let _ = fs::remove_file(&part_path).await;
            error!("download rename failed: {}", err);
            return Err(err.into());
        }

        info!("download complete: {}", final_path.display());
        Ok(())
    }

    async fn stream_to_file(&self, resp: Response, part_path: &Path) -> Result<()> {
        let file = fs::File::create(part_path).await?;
        let mut out = BufWriter::new(file);
        let mut stream = resp.bytes_stream();

        let written: Result<()> = loop {
            let chunk = tokio::select! {
                _ = self.shutdown.cancelled() => break Err(anyhow!("download cancelled")),
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    if let Err(err) = out.write_all(&bytes).await {
                        break Err(err.into());
                    }
                }
                Some(Err(err)) => break Err(err.into()),
                None => break out.flush().await.map_err(Into::into),
            }
        };

        if let Err(err) = written {
            drop(out);
            let _ = fs::remove_file(part_path).await;
            error!("download write failed: {}", err);
            return Err(err);
        }
        Ok(())
    }

    /// GET with manual redirect handling. The Authorization header is only
    /// attached when the target host matches the original request's host, so
    /// presigned object-store URLs never see the token.
    async fn get_following_redirects(&self, url: &str, json: bool) -> Result<Response> {
        let origin = Url::parse(url)?;
        let mut current = origin.clone();

        for _ in 0..=MAX_REDIRECTS {
            let mut req = self.http.get(current.clone());
            if same_host(&current, &origin) && !self.api_key.is_empty() {
                req = req.header(AUTHORIZATION, format!("Bearer {}", self.api_key));
            }
            if json {
                req = req.header(CONTENT_TYPE, "application/json");
            }

            let resp = tokio::select! {
                _ = self.shutdown.cancelled() => bail!("request cancelled"),
                resp = req.send() => resp?,
            };

            if !resp.status().is_redirection() {
                return Ok(resp);
            }

            let location = resp
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| anyhow!("redirect without location from {current}"))?;
            let next = current.join(location)?;
            debug!("following redirect {} -> {}", current, next);
            current = next;
        }

        bail!("too many redirects (limit {MAX_REDIRECTS})")
    }
}

fn same_host(a: &Url, b: &Url) -> bool {
    let host_eq = match (a.host_str(), b.host_str()) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        _ => false,
    };
    host_eq && a.port_or_known_default() == b.port_or_known_default()
}

/// Read at most 8 KiB of an error body for diagnostics.
async fn body_snippet(resp: Response) -> String {
    let bytes = match resp.bytes().await {
        Ok(bytes) => bytes,
        Err(_) => return String::new(),
    };
    let cut = bytes.len().min(ERROR_SNIPPET_BYTES);
    String::from_utf8_lossy(&bytes[..cut]).trim().to_string()
}

/// Compute the final on-disk path a download for `version_id` would use,
/// given the catalog's preferred filename. Used for pre-download existence
/// checks.
pub fn planned_file_path(dest_folder: &Path, preferred: Option<&str>, version_id: i64) -> PathBuf {
    let candidate = preferred.unwrap_or("");
    dest_folder.join(sanitize_filename(candidate, &version_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_with_id() {
        assert_eq!(
            url_with_id("https://c/api/v1/model-versions/{id}", "9"),
            "https://c/api/v1/model-versions/9"
        );
        assert_eq!(url_with_id("https://c/dl/%s", "9"), "https://c/dl/9");
        assert_eq!(url_with_id("https://c/dl/", "9"), "https://c/dl/9");
        assert_eq!(url_with_id("https://c/dl", "9"), "https://c/dl/9");
        assert_eq!(url_with_id("  ", "9"), "");
    }

    #[test]
    fn test_same_host() {
        let a = Url::parse("https://host.example/a").unwrap();
        let b = Url::parse("https://HOST.example/b?x=1").unwrap();
        let c = Url::parse("https://cdn.example/a").unwrap();
        let d = Url::parse("https://host.example:8443/a").unwrap();
        assert!(same_host(&a, &b));
        assert!(!same_host(&a, &c));
        assert!(!same_host(&a, &d));
    }

    #[test]
    fn test_planned_file_path() {
        let path = planned_file_path(Path::new("/w/models/SDXL-1.0"), Some("Foo.safetensors"), 123);
        assert_eq!(
            path,
            Path::new("/w/models/SDXL-1.0/123-Foo.safetensors")
        );
        let fallback = planned_file_path(Path::new("/w"), None, 7);
        assert_eq!(fallback, Path::new("/w/7-model.safetensors"));
    }
}
