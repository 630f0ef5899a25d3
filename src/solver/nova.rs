//! Solving through the nova.astrometry.net web API.
//!
//! Only the source positions leave the machine: they are posted as a source
//! list, the job is polled until it settles, and the WCS file of a successful
//! job is downloaded and parsed.

use super::{SolveError, SolveRequest, Solver};
use crate::header::{parse_header_bytes, Header};
use crate::wcs::wcs_cards;
use anyhow::{bail, Context, Result};
use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::thread::sleep;
use std::time::{Duration, Instant};

pub const NOVA_BASE_URL: &str = "https://nova.astrometry.net";
pub const API_KEY_ENV: &str = "astrometry_net_api_key";

#[derive(Debug, Clone)]
pub struct NovaConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Search radius around the pointing hint, degrees.
    pub radius_deg: f64,
    pub poll_interval: Duration,
    /// Upper bound on the whole submit-and-wait cycle.
    pub timeout: Duration,
    /// Timeout of each individual HTTP request.
    pub request_timeout: Duration,
}

impl Default for NovaConfig {
    fn default() -> Self {
        Self {
            base_url: NOVA_BASE_URL.to_string(),
            api_key: None,
            radius_deg: 2.0,
            poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(600),
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl NovaConfig {
    /// Defaults, with the API key taken from the environment.
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var(API_KEY_ENV).ok(),
            ..Self::default()
        }
    }
}

/// Job status from astrometry.net.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Processing,
    Success,
    Failure,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    status: String,
    session: Option<String>,
    #[serde(default)]
    errormessage: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    status: String,
    subid: Option<u64>,
    #[serde(default)]
    errormessage: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubmissionStatusResponse {
    #[serde(default)]
    jobs: Vec<Option<u64>>,
}

#[derive(Debug, Deserialize)]
struct JobStatusResponse {
    status: Option<String>,
}

#[derive(Debug)]
pub struct NovaSolver {
    config: NovaConfig,
    client: Client,
}

impl NovaSolver {
    pub fn new(config: NovaConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn api_key(&self) -> Result<&str> {
        match self.config.api_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => Ok(key),
            _ => bail!(SolveError::ApiKeyNotFound),
        }
    }

    fn post_json<T: DeserializeOwned>(&self, path: &str, body: &serde_json::Value) -> Result<T> {
        let response = self
            .client
            .post(self.url(path))
            .form(&[("request-json", body.to_string())])
            .send()
            .with_context(|| format!("Failed to send request to {path}"))?;
        if !response.status().is_success() {
            bail!(SolveError::Api(format!("{path}: HTTP {}", response.status())));
        }
        response
            .json()
            .with_context(|| format!("Failed to parse response of {path}"))
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .with_context(|| format!("Failed to send request to {path}"))?;
        if !response.status().is_success() {
            bail!(SolveError::Api(format!("{path}: HTTP {}", response.status())));
        }
        response
            .json()
            .with_context(|| format!("Failed to parse response of {path}"))
    }

    /// Open a session.
    pub fn login(&self, api_key: &str) -> Result<String> {
        let resp: LoginResponse =
            self.post_json("api/login", &serde_json::json!({ "apikey": api_key }))?;
        if resp.status != "success" {
            bail!(SolveError::Api(format!(
                "login failed: {}",
                resp.errormessage.unwrap_or_else(|| "unknown error".into())
            )));
        }
        let session = resp
            .session
            .ok_or_else(|| SolveError::Api("login returned no session".into()))?;
        tracing::debug!("Logged in to {}", self.config.base_url);
        Ok(session)
    }

    /// Submit the source list, returning the submission id.
    pub fn submit(&self, session: &str, request: &SolveRequest<'_>) -> Result<u64> {
        let body = upload_request_json(session, request, self.config.radius_deg);
        let resp: UploadResponse = self.post_json("api/url_upload", &body)?;
        if resp.status != "success" {
            bail!(SolveError::Api(format!(
                "upload failed: {}",
                resp.errormessage.unwrap_or_else(|| "unknown error".into())
            )));
        }
        let subid = resp
            .subid
            .ok_or_else(|| SolveError::Api("upload returned no submission id".into()))?;
        tracing::info!("Submitted {} sources, submission {subid}", request.sources.len());
        Ok(subid)
    }

    pub fn submission_jobs(&self, subid: u64) -> Result<Vec<u64>> {
        let resp: SubmissionStatusResponse = self.get_json(&format!("api/submissions/{subid}"))?;
        Ok(resp.jobs.into_iter().flatten().collect())
    }

    pub fn job_status(&self, job_id: u64) -> Result<JobStatus> {
        let resp: JobStatusResponse = self.get_json(&format!("api/jobs/{job_id}"))?;
        Ok(match resp.status.as_deref() {
            Some("success") => JobStatus::Success,
            Some("failure") => JobStatus::Failure,
            _ => JobStatus::Processing,
        })
    }

    /// Poll until a job of the submission succeeds. A failed job ends the
    /// wait with `CouldNotSolve`.
    pub fn wait_for_job(&self, subid: u64) -> Result<u64> {
        let start = Instant::now();
        tracing::info!(
            "Waiting for submission {subid} (timeout: {:?})",
            self.config.timeout
        );

        loop {
            for job_id in self.submission_jobs(subid)? {
                match self.job_status(job_id)? {
                    JobStatus::Success => {
                        tracing::info!("Job {job_id} solved");
                        return Ok(job_id);
                    }
                    JobStatus::Failure => {
                        tracing::info!("Job {job_id} failed");
                        bail!(SolveError::CouldNotSolve(
                            "Astrometry.net failed! WCS empty. Try with different stars or a different image?"
                                .into()
                        ));
                    }
                    JobStatus::Processing => tracing::debug!("Job {job_id} still processing"),
                }
            }

            if start.elapsed() + self.config.poll_interval > self.config.timeout {
                bail!(SolveError::Timeout(self.config.timeout));
            }
            sleep(self.config.poll_interval);
        }
    }

    /// WCS cards of a solved job.
    pub fn download_wcs(&self, job_id: u64) -> Result<Header> {
        let response = self
            .client
            .get(self.url(&format!("wcs_file/{job_id}")))
            .header("Referer", self.url("api/login"))
            .send()
            .context("Failed to download WCS file")?;
        if !response.status().is_success() {
            bail!(SolveError::Api(format!(
                "WCS download: HTTP {}",
                response.status()
            )));
        }
        let bytes = response.bytes().context("Failed to read WCS file bytes")?;
        let cards = wcs_cards(&parse_header_bytes(&bytes)?);
        if cards.is_empty() {
            bail!(SolveError::CouldNotSolve(
                "Astrometry.net failed! WCS empty. Try with different stars or a different image?"
                    .into()
            ));
        }
        Ok(cards)
    }
}

impl Solver for NovaSolver {
    fn solve(&self, request: &SolveRequest<'_>) -> Result<Header> {
        let api_key = self.api_key()?;
        if request.sources.is_empty() {
            bail!(SolveError::NoSources);
        }
        tracing::info!("Solving {} through {}", request.image_path.display(), self.config.base_url);

        let session = self.login(api_key)?;
        let subid = self.submit(&session, request)?;
        let job_id = self.wait_for_job(subid)?;
        self.download_wcs(job_id)
    }
}

/// The `request-json` payload of a source-list submission.
pub fn upload_request_json(
    session: &str,
    request: &SolveRequest<'_>,
    radius_deg: f64,
) -> serde_json::Value {
    let (x, y) = request.fits_positions();
    let mut body = serde_json::json!({
        "session": session,
        "x": x,
        "y": y,
        "image_width": request.width,
        "image_height": request.height,
        "publicly_visible": "n",
        "allow_commercial_use": "d",
        "allow_modifications": "d",
    });

    if let Some((low, high)) = request.hints.scale_bounds() {
        let est = 0.5 * (low + high);
        body["scale_units"] = "arcsecperpix".into();
        body["scale_type"] = "ev".into();
        body["scale_est"] = est.into();
        body["scale_err"] = (100.0 * (high - low).abs() / est).into();
    }
    if let Some((ra, dec)) = request.hints.pointing() {
        body["center_ra"] = ra.into();
        body["center_dec"] = dec.into();
        body["radius"] = radius_deg.into();
    }
    body
}
