//! Published-dataset download
//!
//! Resolves a landing page to downloadable resources, picks the best JSON
//! candidate, streams it to disk and hands the file to the bulk loader.

use async_trait::async_trait;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{info, instrument, warn};
use url::Url;

use crate::error::{FetchError, LocateError, PipelineError, StageError};
use crate::loader::{BulkLoader, LoadOutcome, LoadTarget};
use crate::pipeline::Stage;

pub const DEFAULT_CKAN_BASE_URL: &str = "https://catalog.data.gov";
const FALLBACK_FILE_NAME: &str = "downloaded_data.json";

/// A downloadable file offered by a landing page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateResource {
    pub url: String,
    /// Lower-cased format label, e.g. `json` or `csv`
    pub format: String,
}

impl CandidateResource {
    fn is_rows_json(&self) -> bool {
        url_path(&self.url).is_some_and(|p| p.to_lowercase().ends_with("rows.json"))
    }

    fn is_json(&self) -> bool {
        self.format.contains("json")
            || url_path(&self.url).is_some_and(|p| p.to_lowercase().ends_with(".json"))
    }
}

fn url_path(raw: &str) -> Option<String> {
    Url::parse(raw).ok().map(|u| u.path().to_string())
}

/// Turns a landing URL into candidate resources
#[async_trait]
pub trait ResourceLocator: Send + Sync {
    async fn locate(&self, landing_url: &str) -> Result<Vec<CandidateResource>, LocateError>;
}

/// Treats the landing URL itself as the only resource
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectLocator;

#[async_trait]
impl ResourceLocator for DirectLocator {
    async fn locate(&self, landing_url: &str) -> Result<Vec<CandidateResource>, LocateError> {
        let url = parse_url(landing_url)?;
        let format = url
            .path_segments()
            .and_then(|mut s| s.next_back())
            .and_then(|last| last.rsplit_once('.'))
            .map(|(_, ext)| ext.to_lowercase())
            .unwrap_or_else(|| "unknown".to_string());

        Ok(vec![CandidateResource {
            url: url.to_string(),
            format,
        }])
    }
}

#[derive(Debug, Deserialize)]
struct PackageShow {
    #[serde(default)]
    result: Option<Package>,
}

#[derive(Debug, Deserialize)]
struct Package {
    #[serde(default)]
    resources: Vec<PackageResource>,
}

#[derive(Debug, Deserialize)]
struct PackageResource {
    url: Option<String>,
    #[serde(default)]
    format: Option<String>,
}

/// Lists a dataset's resources through a CKAN catalog's `package_show` action
#[derive(Debug, Clone)]
pub struct CkanLocator {
    client: reqwest::Client,
    base_url: String,
}

impl CkanLocator {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn package_url(&self, dataset_id: &str) -> Result<Url, FetchError> {
        let raw = format!("{}/api/3/action/package_show", self.base_url);
        let mut url = parse_url(&raw)?;
        url.query_pairs_mut().append_pair("id", dataset_id);
        Ok(url)
    }
}

#[async_trait]
impl ResourceLocator for CkanLocator {
    async fn locate(&self, landing_url: &str) -> Result<Vec<CandidateResource>, LocateError> {
        let landing = parse_url(landing_url)?;
        let catalog = parse_url(&self.base_url)?;
        if landing.host_str() != catalog.host_str() {
            return Ok(Vec::new());
        }

        let Some(dataset_id) = landing
            .path_segments()
            .and_then(|s| s.filter(|seg| !seg.is_empty()).last())
        else {
            return Ok(Vec::new());
        };

        let url = self.package_url(dataset_id)?;
        let url_str = url.to_string();
        let response = self.client.get(url).send().await.map_err(|e| FetchError::Http {
            url: url_str.clone(),
            source: e,
        })?;
        if !response.status().is_success() {
            return Err(FetchError::Status {
                url: url_str,
                status: response.status().as_u16(),
            }
            .into());
        }

        let package: PackageShow = response.json().await.map_err(|e| FetchError::Decode {
            url: url_str,
            reason: e.to_string(),
        })?;

        Ok(package
            .result
            .map(|p| p.resources)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|r| {
                Some(CandidateResource {
                    url: r.url?,
                    format: r.format.unwrap_or_default().to_lowercase(),
                })
            })
            .collect())
    }
}

fn parse_url(raw: &str) -> Result<Url, FetchError> {
    Url::parse(raw).map_err(|e| FetchError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })
}

/// First locator with a non-empty answer wins; failing locators are skipped
pub async fn locate_candidates(
    locators: &[&dyn ResourceLocator],
    landing_url: &str,
) -> Result<Vec<CandidateResource>, LocateError> {
    for locator in locators {
        match locator.locate(landing_url).await {
            Ok(found) if !found.is_empty() => return Ok(found),
            Ok(_) => {},
            Err(e) => warn!(url = landing_url, error = %e, "Resource lookup failed, trying next locator"),
        }
    }
    Err(LocateError::NoCandidates(landing_url.to_string()))
}

/// Prefer a `rows.json` export, then any JSON resource
pub fn choose_resource(candidates: &[CandidateResource]) -> Option<&CandidateResource> {
    candidates
        .iter()
        .find(|c| c.is_rows_json())
        .or_else(|| candidates.iter().find(|c| c.is_json()))
}

/// Every JSON candidate, or every candidate when `all_formats` is set
pub fn matching_resources(candidates: &[CandidateResource], all_formats: bool) -> Vec<&CandidateResource> {
    candidates
        .iter()
        .filter(|c| all_formats || c.is_json())
        .collect()
}

/// Replace characters that are unsafe in file names
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect()
}

/// File name from a `Content-Disposition` header value
fn disposition_file_name(header: &str) -> Option<String> {
    let (_, rest) = header.split_once("filename")?;
    let value = rest.trim_start_matches('*').trim_start().strip_prefix('=')?;
    let value = value.split(';').next()?.trim().trim_matches('"').trim_matches('\'');
    let value = match value.split_once("UTF-8''") {
        Some((_, encoded)) => urlencoding::decode(encoded)
            .map(|decoded| decoded.into_owned())
            .unwrap_or_else(|_| encoded.to_string()),
        None => value.to_string(),
    };
    (!value.is_empty()).then_some(value)
}

fn response_file_name(response: &reqwest::Response) -> String {
    response
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(disposition_file_name)
        .or_else(|| {
            response
                .url()
                .path_segments()
                .and_then(|mut s| s.next_back())
                .filter(|last| !last.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string())
}

fn byte_bar(total: u64, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb
}

/// Stream `url` into `out_dir`. Returns the written path.
#[instrument(skip(client, out_dir, show_progress))]
pub async fn download_resource(
    client: &reqwest::Client,
    url: &str,
    out_dir: &Path,
    file_name: Option<&str>,
    show_progress: bool,
) -> Result<PathBuf, LocateError> {
    let response = client.get(url).send().await.map_err(|e| FetchError::Http {
        url: url.to_string(),
        source: e,
    })?;
    if !response.status().is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status: response.status().as_u16(),
        }
        .into());
    }

    let name = sanitize_file_name(
        &file_name
            .map(str::to_string)
            .unwrap_or_else(|| response_file_name(&response)),
    );
    tokio::fs::create_dir_all(out_dir).await?;
    let dest = out_dir.join(&name);

    let pb = byte_bar(response.content_length().unwrap_or(0), show_progress);
    pb.set_message(format!("Downloading {}", name));

    let mut file = tokio::fs::File::create(&dest).await?;
    let mut downloaded = 0u64;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| FetchError::Http {
            url: url.to_string(),
            source: e,
        })?;
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;
        pb.set_position(downloaded);
    }
    file.flush().await?;

    pb.finish_with_message(format!("Downloaded {}", name));
    info!(path = %dest.display(), bytes = downloaded, "Download complete");

    Ok(dest)
}

/// Inputs for [`run_download`]
#[derive(Debug, Clone)]
pub struct DownloadJob<'a> {
    pub landing_url: &'a str,
    pub out_dir: &'a Path,
    /// Save under this name instead of the server's
    pub file_name: Option<&'a str>,
    pub target: &'a LoadTarget,
    pub show_progress: bool,
}

#[derive(Debug, Clone)]
pub struct DownloadReport {
    pub resource: CandidateResource,
    pub path: PathBuf,
    pub outcome: LoadOutcome,
}

/// Locate, choose, download and load one published dataset
#[instrument(skip_all, fields(url = job.landing_url, table = %job.target.table))]
pub async fn run_download(
    client: &reqwest::Client,
    locators: &[&dyn ResourceLocator],
    loader: &BulkLoader,
    job: &DownloadJob<'_>,
) -> Result<DownloadReport, PipelineError> {
    let fail = |stage: Stage, last_completed: Option<Stage>, source: StageError| PipelineError {
        stage,
        last_completed,
        source,
    };

    loader
        .check_connection()
        .await
        .map_err(|e| fail(Stage::Connecting, None, e.into()))?;

    let candidates = locate_candidates(locators, job.landing_url)
        .await
        .map_err(|e| fail(Stage::Locating, None, e.into()))?;
    info!(count = candidates.len(), "Found candidate resources");

    let resource = choose_resource(&candidates)
        .cloned()
        .ok_or_else(|| LocateError::NoCandidates(format!("{} (no JSON resource)", job.landing_url)))
        .map_err(|e| fail(Stage::Locating, None, e.into()))?;
    info!(resource = %resource.url, format = %resource.format, "Chose resource");

    let path = download_resource(client, &resource.url, job.out_dir, job.file_name, job.show_progress)
        .await
        .map_err(|e| fail(Stage::Downloading, Some(Stage::Locating), e.into()))?;

    let outcome = loader
        .load_file(&path, job.target)
        .await
        .map_err(|e| fail(Stage::Loading, Some(Stage::Downloading), e.into()))?;

    Ok(DownloadReport {
        resource,
        path,
        outcome,
    })
}

/// A resource that could not be saved by [`fetch_resources`]
#[derive(Debug, Clone)]
pub struct FailedResource {
    pub resource: CandidateResource,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct FetchReport {
    pub saved: Vec<(CandidateResource, PathBuf)>,
    pub failed: Vec<FailedResource>,
}

/// Save every matching resource of a landing page without loading it.
///
/// Downloads run one after another. A failed download is logged and recorded;
/// the run fails only when nothing matched or nothing could be saved.
#[instrument(skip(client, locators, out_dir, show_progress))]
pub async fn fetch_resources(
    client: &reqwest::Client,
    locators: &[&dyn ResourceLocator],
    landing_url: &str,
    out_dir: &Path,
    all_formats: bool,
    show_progress: bool,
) -> Result<FetchReport, PipelineError> {
    let candidates = locate_candidates(locators, landing_url)
        .await
        .map_err(|e| PipelineError {
            stage: Stage::Locating,
            last_completed: None,
            source: e.into(),
        })?;

    let matching = matching_resources(&candidates, all_formats);
    if matching.is_empty() {
        return Err(PipelineError {
            stage: Stage::Locating,
            last_completed: None,
            source: LocateError::NoCandidates(format!("{landing_url} (no matching resource)")).into(),
        });
    }
    info!(count = matching.len(), all_formats, "Downloading matching resources");

    let mut report = FetchReport::default();
    for resource in matching {
        match download_resource(client, &resource.url, out_dir, None, show_progress).await {
            Ok(path) => report.saved.push((resource.clone(), path)),
            Err(e) => {
                warn!(url = %resource.url, error = %e, "Download failed");
                report.failed.push(FailedResource {
                    resource: resource.clone(),
                    reason: e.to_string(),
                });
            },
        }
    }

    if report.saved.is_empty() {
        let reason = format!("all {} downloads failed", report.failed.len());
        return Err(PipelineError {
            stage: Stage::Downloading,
            last_completed: Some(Stage::Locating),
            source: StageError::Aborted(reason),
        });
    }

    Ok(report)
}
