//! Cancellable HTTP downloader with grib index support.
//!
//! Transfers stream into `<target>.tmp` and only reach the target path via
//! an atomic rename (or a wgrib2 repack, for gribs). A non-empty variable
//! list switches the transfer to partial ranges driven by the `.idx`
//! sidecar. Cancellation is checked between body chunks and leaves no
//! partial output behind.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flate2::write::MultiGzDecoder;
use futures::StreamExt;
use grib_index::{plan_chunks, parse_index, Chunk, VarGroup};
use reqwest::{header, Client, Response};
use std::io::Write as _;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use wx_common::{WxError, WxResult};

/// Transfers smaller than this are NOAA error pages, not data.
pub const MIN_DOWNLOAD_SIZE: u64 = 500;

/// Everything a single download needs besides its URL and target.
#[derive(Clone)]
pub struct DownloadOptions {
    /// Non-empty: fetch `<url>.idx` and transfer only matching records.
    pub variable_list: Vec<VarGroup>,
    /// Checked at chunk boundaries; set by the owner to abort.
    pub cancel: Arc<AtomicBool>,
    /// Repack the finished file with this wgrib2 binary instead of renaming.
    pub repack_with: Option<PathBuf>,
    pub user_agent: String,
    pub min_size: u64,
}

impl DownloadOptions {
    pub fn new(user_agent: String) -> Self {
        Self {
            variable_list: Vec::new(),
            cancel: Arc::new(AtomicBool::new(false)),
            repack_with: None,
            user_agent,
            min_size: MIN_DOWNLOAD_SIZE,
        }
    }
}

/// Build the shared HTTP client used by all downloads.
pub fn build_client() -> WxResult<Client> {
    Client::builder()
        .timeout(Duration::from_secs(600))
        .connect_timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| WxError::Downloader(format!("client init: {}", e)))
}

fn is_cancelled(opts: &DownloadOptions) -> bool {
    opts.cancel.load(Ordering::Relaxed)
}

async fn cleanup(tmp: &Path) {
    if fs::try_exists(tmp).await.unwrap_or(false) {
        fs::remove_file(tmp).await.ok();
    }
}

/// Download `url` into `out_path`.
#[instrument(skip(client, opts), fields(url = %url))]
pub async fn download(
    client: &Client,
    url: &str,
    out_path: &Path,
    opts: &DownloadOptions,
) -> WxResult<()> {
    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let tmp = tmp_path(out_path);
    cleanup(&tmp).await;
    if fs::try_exists(out_path).await.unwrap_or(false) {
        fs::remove_file(out_path).await.ok();
    }

    info!(target = %out_path.display(), "Downloading");

    match transfer(client, url, &tmp, opts).await {
        Ok(total) if total >= opts.min_size => {}
        Ok(total) => {
            cleanup(&tmp).await;
            return Err(WxError::Downloader(format!("transfer too small: {} bytes", total)));
        }
        Err(e) => {
            cleanup(&tmp).await;
            return Err(e);
        }
    }

    if let Some(wgrib2) = &opts.repack_with {
        let result = crate::wgrib2::repack(wgrib2, &tmp, out_path).await;
        cleanup(&tmp).await;
        if result.is_err() {
            // A failed repack can leave a partial target behind
            cleanup(out_path).await;
        }
        result?;
    } else {
        fs::rename(&tmp, out_path).await?;
    }

    info!(target = %out_path.display(), "Downloaded");
    Ok(())
}

fn tmp_path(out_path: &Path) -> PathBuf {
    let mut name = out_path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Run the transfer and return the byte count written to `tmp`.
async fn transfer(
    client: &Client,
    url: &str,
    tmp: &Path,
    opts: &DownloadOptions,
) -> WxResult<u64> {
    let chunks = if opts.variable_list.is_empty() {
        None
    } else {
        Some(fetch_chunk_plan(client, url, opts).await?)
    };

    let mut file = fs::File::create(tmp).await?;
    let mut total = 0u64;

    match chunks {
        None => {
            let response = get(client, url, opts, None).await?;
            total += stream_body(response, url, &mut file, opts).await?;
        }
        Some(chunks) => {
            for chunk in chunks {
                if is_cancelled(opts) {
                    return Err(WxError::Cancelled);
                }
                let response = get(client, url, opts, Some(&chunk)).await?;
                total += stream_body(response, url, &mut file, opts).await?;
            }
        }
    }

    file.flush().await?;
    file.sync_all().await?;
    Ok(total)
}

/// Fetch and parse the `.idx` sidecar, then plan the byte ranges.
async fn fetch_chunk_plan(
    client: &Client,
    url: &str,
    opts: &DownloadOptions,
) -> WxResult<Vec<Chunk>> {
    let idx_url = format!("{}.idx", url);
    let response = get(client, &idx_url, opts, None).await?;
    let text = response
        .text()
        .await
        .map_err(|e| WxError::Downloader(format!("index read: {}", e)))?;

    let index = parse_index(&text)?;
    let chunks = plan_chunks(&index, &opts.variable_list);
    if chunks.is_empty() {
        return Err(WxError::Downloader("no index records match the variable list".into()));
    }

    debug!(records = index.len(), chunks = chunks.len(), "Planned partial download");
    Ok(chunks)
}

async fn get(
    client: &Client,
    url: &str,
    opts: &DownloadOptions,
    range: Option<&Chunk>,
) -> WxResult<Response> {
    let mut request = client
        .get(url)
        .header(header::ACCEPT_ENCODING, "gzip, deflate")
        .header(header::USER_AGENT, &opts.user_agent);

    if let Some(chunk) = range {
        request = request.header(header::RANGE, chunk.range_header());
    }

    let response = request
        .send()
        .await
        .map_err(|e| WxError::Downloader(format!("request: {}", e)))?;

    if !response.status().is_success() {
        return Err(WxError::Downloader(format!("HTTP {} for {}", response.status(), url)));
    }
    Ok(response)
}

/// Stream one response body into the file, decompressing gzip payloads.
async fn stream_body(
    response: Response,
    url: &str,
    file: &mut fs::File,
    opts: &DownloadOptions,
) -> WxResult<u64> {
    let is_gzip = url.split('?').next().unwrap_or(url).ends_with(".gz")
        || response
            .headers()
            .get(header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("gzip"))
            .unwrap_or(false);

    let mut decoder = is_gzip.then(|| MultiGzDecoder::new(Vec::new()));
    let mut stream = response.bytes_stream();
    let mut written = 0u64;

    while let Some(chunk) = stream.next().await {
        if is_cancelled(opts) {
            return Err(WxError::Cancelled);
        }
        let chunk = chunk.map_err(|e| WxError::Downloader(format!("body read: {}", e)))?;

        match decoder.as_mut() {
            Some(decoder) => {
                decoder
                    .write_all(&chunk)
                    .map_err(|e| WxError::Downloader(format!("gunzip: {}", e)))?;
                decoder.flush().ok();
                let buf = decoder.get_mut();
                if !buf.is_empty() {
                    file.write_all(buf).await?;
                    written += buf.len() as u64;
                    buf.clear();
                }
            }
            None => {
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
        }
    }

    if let Some(decoder) = decoder {
        let rest = decoder
            .finish()
            .map_err(|e| WxError::Downloader(format!("gunzip: {}", e)))?;
        if !rest.is_empty() {
            file.write_all(&rest).await?;
            written += rest.len() as u64;
        }
    }

    Ok(written)
}

/// A spawned download with its cancellation flag.
pub struct DownloadJob {
    pub handle: tokio::task::JoinHandle<WxResult<()>>,
    pub cancel: Arc<AtomicBool>,
}

impl DownloadJob {
    /// Spawn a background download.
    pub fn spawn(client: Client, url: String, out_path: PathBuf, opts: DownloadOptions) -> Self {
        let cancel = opts.cancel.clone();
        let handle =
            tokio::spawn(async move { download(&client, &url, &out_path, &opts).await });
        Self { handle, cancel }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel and wait for the task, bounded by `timeout`.
    pub async fn abort(self, timeout: Duration) {
        self.cancel.store(true, Ordering::Relaxed);
        if tokio::time::timeout(timeout, self.handle).await.is_err() {
            warn!("Download task did not stop within the shutdown deadline");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tmp_path_appends_suffix() {
        assert_eq!(
            tmp_path(Path::new("/cache/gfs/file.grib2")),
            PathBuf::from("/cache/gfs/file.grib2.tmp")
        );
    }

    #[tokio::test]
    async fn cancelled_flag_aborts_before_any_request() {
        let client = build_client().unwrap();
        let mut opts = DownloadOptions::new("test-agent/1.0".into());
        opts.variable_list = vec![VarGroup { levels: vec!["850 mb".into()], vars: vec!["TMP".into()] }];
        opts.cancel.store(true, Ordering::Relaxed);

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.grib2");
        // The index fetch fails against a closed port before the cancel
        // check is even reached; either way no partial output remains.
        let result = download(&client, "http://127.0.0.1:9/file", &target, &opts).await;
        assert!(result.is_err());
        assert!(!target.exists());
        assert!(!dir.path().join("out.grib2.tmp").exists());
    }
}
