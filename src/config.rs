//! Configuration types for contract-harvest
//!
//! Every field has a default so an empty JSON object is a valid configuration.
//! Date ranges are half-open: `start_date` is included, `end_date` is not.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::Phase;

/// Retry behavior of one fetch phase
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, inclusive (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry (default: 10 seconds)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier applied to the delay after each retry (default: 1.0, fixed delay)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: false)
    #[serde(default)]
    pub jitter: bool,

    /// Timeout applied to each attempt, not to the whole target (default: 120 seconds)
    #[serde(default = "default_attempt_timeout", with = "duration_serde")]
    pub attempt_timeout: Duration,

    /// Statuses the upstream uses to say "no more data"; accepted as empty, never retried
    #[serde(default)]
    pub accept_statuses: Vec<u16>,

    /// Attempts allowed to obtain a proxy/identity before one fetch attempt (default: 5)
    #[serde(default = "default_identity_attempts")]
    pub identity_attempts: u32,

    /// Fixed delay between identity attempts (default: 1 second)
    #[serde(default = "default_identity_delay", with = "duration_serde")]
    pub identity_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: false,
            attempt_timeout: default_attempt_timeout(),
            accept_statuses: Vec::new(),
            identity_attempts: default_identity_attempts(),
            identity_delay: default_identity_delay(),
        }
    }
}

/// Date range, concurrency and retry settings of one phase
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PhaseConfig {
    /// Inclusive start date (`YYYY-MM-DD`)
    pub start_date: String,

    /// Exclusive end date (`YYYY-MM-DD`)
    pub end_date: String,

    /// Concurrent fetch workers for this phase (default: 8)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Retry policy for this phase
    #[serde(default)]
    pub retry: RetryConfig,
}

impl PhaseConfig {
    /// A phase covering `[start, end)` with default workers and retries
    pub fn new(start_date: impl Into<String>, end_date: impl Into<String>) -> Self {
        Self {
            start_date: start_date.into(),
            end_date: end_date.into(),
            concurrency: default_concurrency(),
            retry: RetryConfig::default(),
        }
    }

    /// Parse and check the configured range
    pub fn date_range(&self, phase: Phase) -> Result<DateRange> {
        let start = parse_date(&self.start_date, &format!("{phase}.start_date"))?;
        let end = parse_date(&self.end_date, &format!("{phase}.end_date"))?;
        DateRange::new(start, end).ok_or_else(|| {
            Error::config(
                format!("{phase}.end_date"),
                format!(
                    "end date {} must be after start date {}",
                    self.end_date, self.start_date
                ),
            )
        })
    }
}

/// Half-open calendar range `[start, end)`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateRange {
    /// `None` unless `start < end`
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    /// Inclusive start
    pub fn start(&self) -> NaiveDate {
        self.start
    }

    /// Exclusive end
    pub fn end(&self) -> NaiveDate {
        self.end
    }

    /// Whether `date` lies in `[start, end)`
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date < self.end
    }
}

/// Where phase output and failure ledgers are written
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Listing workbooks (default: "downloads")
    #[serde(default = "default_listing_dir")]
    pub listing_dir: PathBuf,

    /// Detail workbooks (default: "detail_downloads")
    #[serde(default = "default_detail_dir")]
    pub detail_dir: PathBuf,

    /// Attachment files (default: "attachments")
    #[serde(default = "default_attachment_dir")]
    pub attachment_dir: PathBuf,

    /// Failure ledgers, one file per phase (default: "failures")
    #[serde(default = "default_ledger_dir")]
    pub ledger_dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            listing_dir: default_listing_dir(),
            detail_dir: default_detail_dir(),
            attachment_dir: default_attachment_dir(),
            ledger_dir: default_ledger_dir(),
        }
    }
}

/// Proxy and user-agent supply
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Fixed proxy (a rotating tunnel endpoint), used for every attempt
    #[serde(default)]
    pub proxy: Option<String>,

    /// Endpoint returning a fresh `host:port` or proxy URL per request
    #[serde(default)]
    pub proxy_api_url: Option<String>,

    /// User-agent rotation pool
    #[serde(default = "default_user_agents")]
    pub user_agents: Vec<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            proxy_api_url: None,
            user_agents: default_user_agents(),
        }
    }
}

/// Endpoints and fixed request fields of the contract publication site
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Paged list endpoint (form POST)
    #[serde(default = "default_listing_url")]
    pub listing_url: String,

    /// Total-count endpoint (form POST); `None` walks pages until they run dry
    #[serde(default = "default_count_url")]
    pub count_url: Option<String>,

    /// Detail page URL, `{uuid}` is replaced by the row's uuid
    #[serde(default = "default_detail_url_template")]
    pub detail_url_template: String,

    /// Attachment download URL, `{id}` is replaced by the file id
    #[serde(default = "default_attachment_url_template")]
    pub attachment_url_template: String,

    /// Referer header sent with every request
    #[serde(default = "default_referer")]
    pub referer: Option<String>,

    /// Form fields sent with every listing and count request
    #[serde(default = "default_form")]
    pub form: BTreeMap<String, String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            listing_url: default_listing_url(),
            count_url: default_count_url(),
            detail_url_template: default_detail_url_template(),
            attachment_url_template: default_attachment_url_template(),
            referer: default_referer(),
            form: default_form(),
        }
    }
}

/// Main configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Remote endpoints
    #[serde(default)]
    pub source: SourceConfig,

    /// Output locations
    #[serde(default)]
    pub output: OutputConfig,

    /// Proxy and user-agent supply
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Listing phase
    #[serde(default = "default_listing_phase")]
    pub listing: PhaseConfig,

    /// Detail phase
    #[serde(default = "default_detail_phase")]
    pub detail: PhaseConfig,

    /// Attachment phase
    #[serde(default = "default_attachment_phase")]
    pub attachment: PhaseConfig,

    /// Rows per listing page (default: 20)
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Upper bound on pages walked when the total is unknown (default: 10000)
    #[serde(default = "default_max_unknown_pages")]
    pub max_unknown_pages: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            output: OutputConfig::default(),
            identity: IdentityConfig::default(),
            listing: default_listing_phase(),
            detail: default_detail_phase(),
            attachment: default_attachment_phase(),
            page_size: default_page_size(),
            max_unknown_pages: default_max_unknown_pages(),
        }
    }
}

impl Config {
    /// Load a JSON configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("cannot read {}: {e}", path.display()),
            key: None,
        })?;
        serde_json::from_str(&raw).map_err(|e| Error::Config {
            message: format!("invalid configuration in {}: {e}", path.display()),
            key: None,
        })
    }

    /// Settings of one phase
    pub fn phase(&self, phase: Phase) -> &PhaseConfig {
        match phase {
            Phase::Listing => &self.listing,
            Phase::Detail => &self.detail,
            Phase::Attachment => &self.attachment,
        }
    }

    /// Mutable settings of one phase
    pub fn phase_mut(&mut self, phase: Phase) -> &mut PhaseConfig {
        match phase {
            Phase::Listing => &mut self.listing,
            Phase::Detail => &mut self.detail,
            Phase::Attachment => &mut self.attachment,
        }
    }

    /// Check everything that must hold before the first fetch
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(Error::config("page_size", "page size must be positive"));
        }
        for phase in Phase::ALL {
            let settings = self.phase(phase);
            settings.date_range(phase)?;
            if settings.concurrency == 0 {
                return Err(Error::config(
                    format!("{phase}.concurrency"),
                    "at least one worker is required",
                ));
            }
            if settings.retry.max_attempts == 0 {
                return Err(Error::config(
                    format!("{phase}.retry.max_attempts"),
                    "at least one attempt is required",
                ));
            }
            if settings.retry.identity_attempts == 0 {
                return Err(Error::config(
                    format!("{phase}.retry.identity_attempts"),
                    "at least one identity attempt is required",
                ));
            }
        }
        if !self.source.detail_url_template.contains("{uuid}") {
            return Err(Error::config(
                "source.detail_url_template",
                "template must contain {uuid}",
            ));
        }
        if !self.source.attachment_url_template.contains("{id}") {
            return Err(Error::config(
                "source.attachment_url_template",
                "template must contain {id}",
            ));
        }
        if self.identity.user_agents.is_empty() {
            return Err(Error::config(
                "identity.user_agents",
                "user-agent pool must not be empty",
            ));
        }
        let urls = [
            ("source.listing_url", Some(&self.source.listing_url)),
            ("source.count_url", self.source.count_url.as_ref()),
            ("source.referer", self.source.referer.as_ref()),
            ("identity.proxy", self.identity.proxy.as_ref()),
            ("identity.proxy_api_url", self.identity.proxy_api_url.as_ref()),
        ];
        for (key, value) in urls {
            if let Some(value) = value {
                url::Url::parse(value)
                    .map_err(|e| Error::config(key, format!("invalid URL '{value}': {e}")))?;
            }
        }
        Ok(())
    }
}

fn parse_date(value: &str, key: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|e| Error::config(key, format!("invalid date '{value}': {e}")))
}

// Default value functions
fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    1.0
}

fn default_attempt_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_identity_attempts() -> u32 {
    5
}

fn default_identity_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_concurrency() -> usize {
    8
}

fn default_page_size() -> u32 {
    20
}

fn default_max_unknown_pages() -> u32 {
    10_000
}

fn default_listing_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_detail_dir() -> PathBuf {
    PathBuf::from("detail_downloads")
}

fn default_attachment_dir() -> PathBuf {
    PathBuf::from("attachments")
}

fn default_ledger_dir() -> PathBuf {
    PathBuf::from("failures")
}

fn default_listing_url() -> String {
    "http://htgs.ccgp.gov.cn/GS8/contractpublish/getContractByAjax?contractSign=0".into()
}

fn default_count_url() -> Option<String> {
    Some("http://htgs.ccgp.gov.cn/GS8/contractpublish/getCountByAjax?contractSign=0".into())
}

fn default_detail_url_template() -> String {
    "http://htgs.ccgp.gov.cn/GS8/contractpublish/detail/{uuid}?contractSign=0".into()
}

fn default_attachment_url_template() -> String {
    "https://download.ccgp.gov.cn/oss/download?uuid={id}".into()
}

fn default_referer() -> Option<String> {
    Some("http://htgs.ccgp.gov.cn/".into())
}

fn default_form() -> BTreeMap<String, String> {
    let mut form: BTreeMap<String, String> = [
        "isChange",
        "searchAgentName",
        "searchContractCode",
        "searchContractName",
        "searchProjCode",
        "searchProjName",
        "searchPurchaserName",
        "searchSupplyName",
    ]
    .into_iter()
    .map(|k| (k.to_string(), String::new()))
    .collect();
    form.insert("code".into(), "KL4S".into());
    form.insert("codeResult".into(), "eebb0586e81a4700e5758a228af0dfb5".into());
    form
}

fn default_user_agents() -> Vec<String> {
    vec![
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36".into(),
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/133.0.0.0 Safari/537.36 Edg/133.0.0.0".into(),
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15".into(),
    ]
}

fn default_listing_phase() -> PhaseConfig {
    PhaseConfig::new("2023-11-01", "2023-11-06")
}

fn default_detail_phase() -> PhaseConfig {
    PhaseConfig::new("2023-11-01", "2023-11-06")
}

fn default_attachment_phase() -> PhaseConfig {
    PhaseConfig::new("2023-11-01", "2023-11-06")
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
