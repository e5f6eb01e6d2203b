// src/bc_client.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, IF_MATCH};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::uom::ResourceUnitOfMeasure;

pub const BC_API_BASE_URL: &str = "https://api.businesscentral.dynamics.com/v2.0";
pub const DEFAULT_CACHE_DIR: &str = "./bc_cache";
pub const DEFAULT_CACHE_DURATION_SECS: u64 = 60 * 60; // 1 hour
pub const TOKEN_EXPIRY_BUFFER_SECS: u64 = 60;

// --- Business Central API Data Structures ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BcTimeSheet {
    pub no: String,
    pub resource_no: String,
    pub starting_date: String,
    pub ending_date: String,
    #[serde(default)]
    pub approver_user_id: Option<String>,
    /// User id of the resource the sheet belongs to.
    #[serde(default)]
    pub owner_user_id: Option<String>,
    #[serde(default)]
    pub open_exists: bool,
    #[serde(default)]
    pub submitted_exists: bool,
    #[serde(default)]
    pub rejected_exists: bool,
    #[serde(default)]
    pub approved_exists: bool,
}

impl BcTimeSheet {
    /// Whether `date` (ISO day) lies within the sheet's period.
    pub fn covers(&self, date: &str) -> bool {
        // ISO dates compare correctly as strings.
        self.starting_date.as_str() <= date && date <= self.ending_date.as_str()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BcTimeSheetLine {
    pub id: String,
    pub time_sheet_no: String,
    pub line_no: i64,
    #[serde(rename = "type", default)]
    pub line_type: String,
    #[serde(default)]
    pub job_no: Option<String>,
    #[serde(default)]
    pub job_task_no: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub chargeable: bool,
    #[serde(default)]
    pub total_quantity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BcTimeSheetDetail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub time_sheet_no: String,
    pub time_sheet_line_no: i64,
    pub date: String,
    pub quantity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BcResource {
    pub no: String,
    pub name: String,
    #[serde(default)]
    pub base_unit_of_measure: Option<String>,
    #[serde(rename = "type", default)]
    pub resource_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BcJob {
    pub no: String,
    pub description: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub bill_to_customer_no: Option<String>,
    #[serde(default)]
    pub person_responsible: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BcJobTask {
    pub job_no: String,
    pub job_task_no: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BcJobPlanningLine {
    pub job_no: String,
    pub job_task_no: String,
    #[serde(default)]
    pub line_no: i64,
    #[serde(rename = "type", default)]
    pub line_type: String,
    /// Resource number when `line_type` is "Resource".
    #[serde(default)]
    pub no: String,
    #[serde(default)]
    pub quantity: f64,
    #[serde(default)]
    pub unit_of_measure_code: Option<String>,
    #[serde(default)]
    pub planning_date: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTimeSheetLine {
    pub time_sheet_no: String,
    #[serde(rename = "type")]
    pub line_type: String,
    pub job_no: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_task_no: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub chargeable: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSheetLinePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_no: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_task_no: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chargeable: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJobPlanningLine {
    pub job_no: String,
    pub job_task_no: String,
    #[serde(rename = "type")]
    pub line_type: String,
    pub no: String,
    pub quantity: f64,
    pub planning_date: String,
}

/// Bound actions exposed on time sheet lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineAction {
    Submit,
    Approve,
    Reject,
    Reopen,
}

impl LineAction {
    fn action_name(self) -> &'static str {
        match self {
            Self::Submit => "Microsoft.NAV.submit",
            Self::Approve => "Microsoft.NAV.approve",
            Self::Reject => "Microsoft.NAV.reject",
            Self::Reopen => "Microsoft.NAV.reopen",
        }
    }
}

// --- OData envelopes ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ODataList<T> {
    pub value: Vec<T>,
    #[serde(rename = "@odata.nextLink", default, skip_serializing_if = "Option::is_none")]
    pub next_link: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ODataErrorInformation {
    pub code: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ODataErrorPayload {
    pub error: ODataErrorInformation,
}

// --- Error Type ---

#[derive(Error, Debug)]
pub enum BcError {
    #[error("HTTP request failed")]
    Request(#[from] reqwest::Error),

    #[error("JSON processing error")]
    Json(#[from] serde_json::Error),

    #[error("File I/O error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },

    #[error("URL parsing error")]
    UrlParse(#[from] url::ParseError),

    #[error("Access token not available (missing or expired)")]
    MissingToken,

    #[error("Rate limit exceeded (Status 429)")]
    RateLimitExceeded,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Business Central API error: Status={status}, Message='{message}'")]
    Api { status: StatusCode, message: String },

    #[error("System time error: {0}")]
    Time(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

fn io_context<E: Into<std::io::Error>, S: Into<String>>(source: E, context: S) -> BcError {
    BcError::Io {
        source: source.into(),
        context: context.into(),
    }
}

fn unix_now() -> Result<u64, BcError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|e| BcError::Time(format!("Failed to get system time duration: {}", e)))
}

/// Quotes a value for use inside an OData `$filter` string literal.
pub fn odata_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

// --- Configuration ---

fn default_api_base() -> String {
    BC_API_BASE_URL.to_string()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(DEFAULT_CACHE_DIR)
}

fn default_cache_duration() -> u64 {
    DEFAULT_CACHE_DURATION_SECS
}

fn default_api_version() -> String {
    "v1.0".to_string()
}

/// Loaded from `BC_*` environment variables.
#[derive(Clone, Debug, Deserialize)]
pub struct BcConfig {
    pub tenant_id: String,
    pub environment: String,
    pub company_id: String,
    pub api_publisher: String,
    pub api_group: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Bearer token issued by the identity provider, if supplied directly.
    #[serde(default)]
    pub access_token: Option<String>,
    /// Token file maintained by the identity provider's tooling.
    #[serde(default)]
    pub token_file: Option<PathBuf>,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_cache_duration")]
    pub cache_duration_secs: u64,
}

impl BcConfig {
    pub fn company_url(&self) -> String {
        format!(
            "{}/{}/{}/api/{}/{}/{}/companies({})",
            self.api_base.trim_end_matches('/'),
            self.tenant_id,
            self.environment,
            self.api_publisher,
            self.api_group,
            self.api_version,
            self.company_id
        )
    }
}

#[cfg(test)]
impl BcConfig {
    pub(crate) fn for_tests(api_base: &str, cache_dir: &Path) -> Self {
        Self {
            tenant_id: "tenant".to_string(),
            environment: "sandbox".to_string(),
            company_id: "c1".to_string(),
            api_publisher: "thyme".to_string(),
            api_group: "timesheets".to_string(),
            api_version: "v1.0".to_string(),
            api_base: api_base.to_string(),
            access_token: Some("test-token".to_string()),
            token_file: None,
            cache_dir: cache_dir.to_path_buf(),
            cache_duration_secs: 60,
        }
    }
}

// --- Access tokens ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTokenData {
    pub access_token: String,
    pub expires_at_unix_secs: u64,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl StoredTokenData {
    pub fn is_expired(&self, buffer_secs: u64) -> Result<bool, BcError> {
        let now_unix = unix_now()?;
        Ok(now_unix >= self.expires_at_unix_secs.saturating_sub(buffer_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenStatus {
    pub has_token: bool,
    pub is_valid: bool,
    pub is_expired: bool,
    pub expires_in_secs: u64,
    pub expires_at: String,
}

impl TokenStatus {
    fn missing() -> Self {
        Self {
            has_token: false,
            is_valid: false,
            is_expired: true,
            expires_in_secs: 0,
            expires_at: String::new(),
        }
    }
}

/// Supplies bearer tokens for Business Central. Tokens are obtained by the
/// identity provider's client; this side only reads them.
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    async fn access_token(&self) -> Result<String, BcError>;
    async fn status(&self) -> Result<TokenStatus, BcError>;
}

pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl AccessTokenSource for StaticTokenSource {
    async fn access_token(&self) -> Result<String, BcError> {
        if self.token.is_empty() {
            return Err(BcError::MissingToken);
        }
        Ok(self.token.clone())
    }

    async fn status(&self) -> Result<TokenStatus, BcError> {
        Ok(TokenStatus {
            has_token: !self.token.is_empty(),
            is_valid: !self.token.is_empty(),
            is_expired: false,
            expires_in_secs: 0,
            expires_at: String::new(),
        })
    }
}

/// Reads a token file and re-reads it once the held token is close to expiry,
/// picking up whatever the sign-in tooling wrote in the meantime.
pub struct StoredTokenSource {
    path: PathBuf,
    token_data: Mutex<Option<StoredTokenData>>,
}

impl StoredTokenSource {
    pub fn new(path: &Path) -> Result<Self, BcError> {
        let initial = Self::load_token_data(path)?;
        match &initial {
            Some(_) => info!("Loaded token data from {:?}", path),
            None => warn!("No token file at {:?}; sign in to create one.", path),
        }
        Ok(Self {
            path: path.to_path_buf(),
            token_data: Mutex::new(initial),
        })
    }

    pub fn load_token_data(path: &Path) -> Result<Option<StoredTokenData>, BcError> {
        if !path.exists() {
            return Ok(None);
        }
        let json_string = fs::read_to_string(path)
            .map_err(|e| io_context(e, format!("Failed to read token file: {:?}", path)))?;
        let stored_data: StoredTokenData = serde_json::from_str(&json_string)?;
        Ok(Some(stored_data))
    }
}

#[async_trait]
impl AccessTokenSource for StoredTokenSource {
    async fn access_token(&self) -> Result<String, BcError> {
        let mut token_guard = self.token_data.lock().await;

        let needs_reload = match &*token_guard {
            Some(data) => data.is_expired(TOKEN_EXPIRY_BUFFER_SECS)?,
            None => true,
        };
        if needs_reload {
            debug!("Token missing or near expiry, re-reading {:?}", self.path);
            *token_guard = Self::load_token_data(&self.path)?;
        }

        match &*token_guard {
            Some(data) if !data.is_expired(TOKEN_EXPIRY_BUFFER_SECS)? => {
                Ok(data.access_token.clone())
            }
            _ => Err(BcError::MissingToken),
        }
    }

    async fn status(&self) -> Result<TokenStatus, BcError> {
        let token_guard = self.token_data.lock().await;
        let Some(data) = &*token_guard else {
            return Ok(TokenStatus::missing());
        };

        let is_expired = data.is_expired(0)?;
        let is_valid_soon = !data.is_expired(TOKEN_EXPIRY_BUFFER_SECS)?;
        let expires_at_systemtime = UNIX_EPOCH + Duration::from_secs(data.expires_at_unix_secs);
        let expires_in_secs = expires_at_systemtime
            .duration_since(SystemTime::now())
            .unwrap_or_default()
            .as_secs();

        Ok(TokenStatus {
            has_token: true,
            is_valid: is_valid_soon,
            is_expired,
            expires_in_secs,
            expires_at: DateTime::<Utc>::from(expires_at_systemtime).to_rfc3339(),
        })
    }
}

// --- Cache ---

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheMetadata {
    last_updated_unix_secs: u64,
    resource_type: String,
    resource_id: Option<String>,
}

impl CacheMetadata {
    fn new(resource_type: &str, resource_id: Option<&str>) -> Result<Self, BcError> {
        Ok(Self {
            last_updated_unix_secs: unix_now()?,
            resource_type: resource_type.to_string(),
            resource_id: resource_id.map(String::from),
        })
    }

    fn is_stale(&self, max_age_secs: u64) -> Result<bool, BcError> {
        let cache_age = unix_now()?.saturating_sub(self.last_updated_unix_secs);
        Ok(cache_age > max_age_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedData<T> {
    metadata: CacheMetadata,
    data: T,
}

// --- Client ---

#[derive(Clone)]
pub struct BcClient {
    config: Arc<BcConfig>,
    http_client: Client,
    tokens: Arc<dyn AccessTokenSource>,
}

impl BcClient {
    pub fn new(config: BcConfig, tokens: Arc<dyn AccessTokenSource>) -> Result<Self, BcError> {
        let http_client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        if !config.cache_dir.exists() {
            fs::create_dir_all(&config.cache_dir).map_err(|e| {
                io_context(
                    e,
                    format!("Failed to create cache directory: {:?}", config.cache_dir),
                )
            })?;
        }

        Ok(Self {
            config: Arc::new(config),
            http_client,
            tokens,
        })
    }

    pub fn config(&self) -> &BcConfig {
        &self.config
    }

    pub async fn token_status(&self) -> Result<TokenStatus, BcError> {
        self.tokens.status().await
    }

    fn resolve_url(&self, endpoint: &str) -> Result<String, BcError> {
        let url = if endpoint.starts_with("http") {
            endpoint.to_string()
        } else if endpoint.starts_with('/') {
            format!("{}{}", self.config.company_url(), endpoint)
        } else {
            format!("{}/{}", self.config.company_url(), endpoint)
        };
        Url::parse(&url)?;
        Ok(url)
    }

    pub async fn build_request(
        &self,
        method: Method,
        endpoint: &str,
    ) -> Result<RequestBuilder, BcError> {
        let access_token = self.tokens.access_token().await?;
        let url = self.resolve_url(endpoint)?;

        Ok(self
            .http_client
            .request(method, &url)
            .header(AUTHORIZATION, format!("Bearer {}", access_token))
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json"))
    }

    async fn execute(
        &self,
        request_builder: RequestBuilder,
        context_msg: &str,
    ) -> Result<reqwest::Response, BcError> {
        let request = request_builder.build().map_err(|e| {
            error!("Request build failed for '{}': {}", context_msg, e);
            BcError::Request(e)
        })?;
        let request_url = request.url().to_string();
        debug!("Sending request for '{}' to URL: {}", context_msg, request_url);

        let response = self.http_client.execute(request).await.map_err(|e| {
            error!(
                "HTTP execution failed before receiving response for '{}' (URL: {}): {}",
                context_msg, request_url, e
            );
            BcError::Request(e)
        })?;

        let status = response.status();
        debug!(
            "Received response for '{}' (URL: {}): Status={}",
            context_msg, request_url, status
        );
        if status.is_success() {
            return Ok(response);
        }

        let error_body = response
            .text()
            .await
            .unwrap_or_else(|e| format!("Failed to read error body: {}", e));
        error!(
            "API Error Response: Status={}, Body='{}' for URL: {}",
            status, error_body, request_url
        );

        let message = match serde_json::from_str::<ODataErrorPayload>(&error_body) {
            Ok(parsed) => parsed.error.message.unwrap_or(error_body),
            Err(_) => error_body,
        };

        Err(match status {
            StatusCode::TOO_MANY_REQUESTS => {
                warn!("Rate limit exceeded for '{}' (URL: {})", context_msg, request_url);
                BcError::RateLimitExceeded
            }
            StatusCode::NOT_FOUND => BcError::NotFound(message),
            _ => BcError::Api { status, message },
        })
    }

    pub async fn send_and_deserialize<T: DeserializeOwned>(
        &self,
        request_builder: RequestBuilder,
        context_msg: &str,
    ) -> Result<T, BcError> {
        let response = self.execute(request_builder, context_msg).await?;
        let bytes = response.bytes().await?;
        serde_json::from_slice::<T>(&bytes).map_err(|e| {
            error!("JSON deserialization failed for '{}': {}", context_msg, e);
            BcError::Json(e)
        })
    }

    /// For endpoints answering `204 No Content`.
    pub async fn send_without_body(
        &self,
        request_builder: RequestBuilder,
        context_msg: &str,
    ) -> Result<(), BcError> {
        self.execute(request_builder, context_msg).await?;
        Ok(())
    }

    /// Fetches every page of an entity set, following `@odata.nextLink`.
    pub async fn get_all<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        filter: Option<&str>,
        context_msg: &str,
    ) -> Result<Vec<T>, BcError> {
        let mut request = self.build_request(Method::GET, endpoint).await?;
        if let Some(filter) = filter {
            request = request.query(&[("$filter", filter)]);
        }

        let mut items = Vec::new();
        let mut page = 1;
        loop {
            let list: ODataList<T> = self.send_and_deserialize(request, context_msg).await?;
            debug!(
                "Fetched {} records on page {} for '{}'",
                list.value.len(),
                page,
                context_msg
            );
            items.extend(list.value);

            match list.next_link {
                Some(next_link) => {
                    // The next link already carries the filter and skip token.
                    request = self.build_request(Method::GET, &next_link).await?;
                    page += 1;
                }
                None => break,
            }
        }
        Ok(items)
    }

    // --- Cache helpers ---

    pub fn generate_cache_key(&self, resource_type: &str, resource_id: Option<&str>) -> String {
        // ASCII only, so the truncation below always lands on a char boundary.
        let mut key = resource_type.replace(|c: char| !c.is_ascii_alphanumeric(), "_");
        if let Some(id) = resource_id {
            key.push_str("__ID_");
            key.push_str(&id.replace(|c: char| !c.is_ascii_alphanumeric(), "_"));
        }

        const MAX_KEY_LEN: usize = 100;
        if key.len() > MAX_KEY_LEN {
            use sha2::{Digest, Sha256};
            let mut hasher = Sha256::new();
            hasher.update(key.as_bytes());
            let hash = hasher.finalize();
            key = format!("{}_{}", &key[..MAX_KEY_LEN / 2], hex::encode(&hash[..8]));
        }
        key
    }

    pub fn get_cache_file_path(&self, cache_key: &str) -> PathBuf {
        self.config.cache_dir.join(format!("{}.json", cache_key))
    }

    pub fn save_to_cache<T: Serialize>(
        &self,
        resource_type: &str,
        resource_id: Option<&str>,
        data: &T,
    ) -> Result<(), BcError> {
        let cache_key = self.generate_cache_key(resource_type, resource_id);
        let cache_path = self.get_cache_file_path(&cache_key);

        if let Some(parent) = cache_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                io_context(e, format!("Failed to create cache directory: {:?}", parent))
            })?;
        }

        let cached_data = CachedData {
            metadata: CacheMetadata::new(resource_type, resource_id)?,
            data,
        };
        let json_string = serde_json::to_string_pretty(&cached_data)?;

        let mut file = File::create(&cache_path)
            .map_err(|e| io_context(e, format!("Failed to create cache file: {:?}", cache_path)))?;
        file.write_all(json_string.as_bytes()).map_err(|e| {
            io_context(e, format!("Failed to write to cache file: {:?}", cache_path))
        })?;

        debug!("Saved data to cache for key: {}", cache_key);
        Ok(())
    }

    pub fn load_from_cache<T: DeserializeOwned>(
        &self,
        resource_type: &str,
        resource_id: Option<&str>,
    ) -> Result<Option<T>, BcError> {
        let cache_key = self.generate_cache_key(resource_type, resource_id);
        let cache_path = self.get_cache_file_path(&cache_key);

        if !cache_path.exists() {
            debug!("Cache miss (file not found) for key: {}", cache_key);
            return Ok(None);
        }

        let json_string = fs::read_to_string(&cache_path)
            .map_err(|e| io_context(e, format!("Failed to read cache file: {:?}", cache_path)))?;

        let cached_data: CachedData<T> = match serde_json::from_str(&json_string) {
            Ok(data) => data,
            Err(e) => {
                warn!(
                    "Failed to deserialize cache file {:?}: {}. Removing corrupt cache file.",
                    cache_path, e
                );
                if let Err(remove_err) = fs::remove_file(&cache_path) {
                    error!(
                        "Failed to remove corrupt cache file {:?}: {}",
                        cache_path, remove_err
                    );
                }
                return Ok(None);
            }
        };

        if cached_data
            .metadata
            .is_stale(self.config.cache_duration_secs)?
        {
            debug!("Cache stale for key: {}", cache_key);
            return Ok(None);
        }

        debug!("Cache hit for key: {}", cache_key);
        Ok(Some(cached_data.data))
    }

    /// Like [`BcClient::get_all`], but served from the on-disk cache while fresh.
    pub async fn get_all_with_cache<T: DeserializeOwned + Serialize>(
        &self,
        endpoint: &str,
        filter: Option<&str>,
        resource_type: &str,
        resource_id: Option<&str>,
        context_msg: &str,
    ) -> Result<Vec<T>, BcError> {
        match self.load_from_cache::<Vec<T>>(resource_type, resource_id) {
            Ok(Some(cached)) => return Ok(cached),
            Ok(None) => {}
            Err(e) => warn!(
                "Failed to load from cache for {} ({}): {}. Attempting API fetch.",
                resource_type, context_msg, e
            ),
        }

        let items: Vec<T> = self.get_all(endpoint, filter, context_msg).await?;

        if let Err(e) = self.save_to_cache(resource_type, resource_id, &items) {
            error!(
                "Failed to save to cache for {} ({}): {}",
                resource_type, context_msg, e
            );
        }
        Ok(items)
    }

    pub fn clear_cache(&self, resource_type: &str, resource_id: Option<&str>) -> Result<(), BcError> {
        let cache_dir = &self.config.cache_dir;
        if !cache_dir.exists() {
            return Ok(());
        }

        let cache_key = self.generate_cache_key(resource_type, resource_id);
        let exact_name = format!("{}.json", cache_key);
        let id_prefix = format!("{}__ID_", cache_key);
        let entries = fs::read_dir(cache_dir)
            .map_err(|e| io_context(e, format!("Failed to read cache directory: {:?}", cache_dir)))?;

        for entry_result in entries {
            let entry = entry_result.map_err(|e| io_context(e, "Failed to read directory entry"))?;
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            // With an id only that id's file goes; without one, the type and all its ids.
            let matches = file_name == exact_name
                || (resource_id.is_none()
                    && file_name.starts_with(&id_prefix)
                    && file_name.ends_with(".json"));
            if path.is_file() && matches {
                info!("Clearing cache file: {:?}", path);
                fs::remove_file(&path)
                    .map_err(|e| io_context(e, format!("Failed to remove cache file: {:?}", path)))?;
            }
        }
        Ok(())
    }

    pub fn clear_all_cache(&self) -> Result<(), BcError> {
        let cache_dir = &self.config.cache_dir;
        if !cache_dir.exists() {
            info!("Cache directory {:?} does not exist, nothing to clear.", cache_dir);
            return Ok(());
        }

        info!("Clearing all cache files in directory: {:?}", cache_dir);
        let entries = fs::read_dir(cache_dir)
            .map_err(|e| io_context(e, format!("Failed to read cache directory: {:?}", cache_dir)))?;
        for entry_result in entries {
            let entry = entry_result.map_err(|e| io_context(e, "Failed to read directory entry"))?;
            let path = entry.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
                fs::remove_file(&path)
                    .map_err(|e| io_context(e, format!("Failed to remove cache file: {:?}", path)))?;
            }
        }
        Ok(())
    }

    // --- Reference data (cached) ---

    pub async fn get_resources(&self) -> Result<Vec<BcResource>, BcError> {
        self.get_all_with_cache("/resources", None, "resources", None, "Get Resources")
            .await
    }

    pub async fn get_resource_units_of_measure(
        &self,
    ) -> Result<Vec<ResourceUnitOfMeasure>, BcError> {
        self.get_all_with_cache(
            "/resourceUnitsOfMeasure",
            None,
            "resource_units_of_measure",
            None,
            "Get Resource Units of Measure",
        )
        .await
    }

    pub async fn get_jobs(&self) -> Result<Vec<BcJob>, BcError> {
        self.get_all_with_cache("/jobs", None, "jobs", None, "Get Jobs")
            .await
    }

    pub async fn get_job(&self, job_no: &str) -> Result<BcJob, BcError> {
        self.get_jobs()
            .await?
            .into_iter()
            .find(|job| job.no == job_no)
            .ok_or_else(|| BcError::NotFound(format!("job {}", job_no)))
    }

    pub async fn get_job_tasks(&self, job_no: &str) -> Result<Vec<BcJobTask>, BcError> {
        let filter = format!("jobNo eq {}", odata_quote(job_no));
        self.get_all_with_cache("/jobTasks", Some(&filter), "job_tasks", Some(job_no), "Get Job Tasks")
            .await
    }

    // --- Live data ---

    pub async fn get_job_planning_lines(
        &self,
        job_no: &str,
    ) -> Result<Vec<BcJobPlanningLine>, BcError> {
        let filter = format!("jobNo eq {}", odata_quote(job_no));
        self.get_all("/jobPlanningLines", Some(&filter), "Get Job Planning Lines")
            .await
    }

    pub async fn get_time_sheets(&self, resource_no: &str) -> Result<Vec<BcTimeSheet>, BcError> {
        let filter = format!("resourceNo eq {}", odata_quote(resource_no));
        self.get_all("/timeSheets", Some(&filter), "Get Time Sheets")
            .await
    }

    pub async fn get_time_sheet(&self, time_sheet_no: &str) -> Result<BcTimeSheet, BcError> {
        let filter = format!("no eq {}", odata_quote(time_sheet_no));
        self.get_all::<BcTimeSheet>("/timeSheets", Some(&filter), "Get Time Sheet")
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BcError::NotFound(format!("time sheet {}", time_sheet_no)))
    }

    pub async fn get_time_sheets_for_approver(
        &self,
        approver_user_id: &str,
    ) -> Result<Vec<BcTimeSheet>, BcError> {
        let filter = format!("approverUserId eq {}", odata_quote(approver_user_id));
        self.get_all("/timeSheets", Some(&filter), "Get Time Sheets for Approver")
            .await
    }

    pub async fn get_time_sheet_lines(
        &self,
        time_sheet_no: &str,
    ) -> Result<Vec<BcTimeSheetLine>, BcError> {
        let filter = format!("timeSheetNo eq {}", odata_quote(time_sheet_no));
        self.get_all("/timeSheetLines", Some(&filter), "Get Time Sheet Lines")
            .await
    }

    pub async fn get_time_sheet_details(
        &self,
        time_sheet_no: &str,
    ) -> Result<Vec<BcTimeSheetDetail>, BcError> {
        let filter = format!("timeSheetNo eq {}", odata_quote(time_sheet_no));
        self.get_all("/timeSheetDetails", Some(&filter), "Get Time Sheet Details")
            .await
    }

    // --- Writes ---

    pub async fn create_time_sheet_line(
        &self,
        line: &NewTimeSheetLine,
    ) -> Result<BcTimeSheetLine, BcError> {
        info!(
            "Creating time sheet line on {} for job {}",
            line.time_sheet_no, line.job_no
        );
        let request = self
            .build_request(Method::POST, "/timeSheetLines")
            .await?
            .json(line);
        self.send_and_deserialize(request, "Create Time Sheet Line")
            .await
    }

    pub async fn update_time_sheet_line(
        &self,
        line_id: &str,
        patch: &TimeSheetLinePatch,
    ) -> Result<BcTimeSheetLine, BcError> {
        let endpoint = format!("/timeSheetLines({})", line_id);
        let request = self
            .build_request(Method::PATCH, &endpoint)
            .await?
            .header(IF_MATCH, "*")
            .json(patch);
        self.send_and_deserialize(request, "Update Time Sheet Line")
            .await
    }

    pub async fn delete_time_sheet_line(&self, line_id: &str) -> Result<(), BcError> {
        let endpoint = format!("/timeSheetLines({})", line_id);
        let request = self
            .build_request(Method::DELETE, &endpoint)
            .await?
            .header(IF_MATCH, "*");
        self.send_without_body(request, "Delete Time Sheet Line")
            .await
    }

    /// The detail booked on one day of a line, if any.
    pub async fn find_time_sheet_detail(
        &self,
        time_sheet_no: &str,
        line_no: i64,
        date: &str,
    ) -> Result<Option<BcTimeSheetDetail>, BcError> {
        let filter = format!(
            "timeSheetNo eq {} and timeSheetLineNo eq {} and date eq {}",
            odata_quote(time_sheet_no),
            line_no,
            date
        );
        let existing: Vec<BcTimeSheetDetail> = self
            .get_all("/timeSheetDetails", Some(&filter), "Find Time Sheet Detail")
            .await?;
        Ok(existing.into_iter().find(|d| d.id.is_some()))
    }

    pub async fn create_time_sheet_detail(
        &self,
        detail: &BcTimeSheetDetail,
    ) -> Result<BcTimeSheetDetail, BcError> {
        let request = self
            .build_request(Method::POST, "/timeSheetDetails")
            .await?
            .json(detail);
        self.send_and_deserialize(request, "Create Time Sheet Detail")
            .await
    }

    pub async fn set_time_sheet_detail_quantity(
        &self,
        detail_id: &str,
        quantity: f64,
    ) -> Result<BcTimeSheetDetail, BcError> {
        let endpoint = format!("/timeSheetDetails({})", detail_id);
        let request = self
            .build_request(Method::PATCH, &endpoint)
            .await?
            .header(IF_MATCH, "*")
            .json(&serde_json::json!({ "quantity": quantity }));
        self.send_and_deserialize(request, "Update Time Sheet Detail")
            .await
    }

    /// Sets the quantity booked on one day of a line, creating the detail if needed.
    pub async fn upsert_time_sheet_detail(
        &self,
        detail: &BcTimeSheetDetail,
    ) -> Result<BcTimeSheetDetail, BcError> {
        let existing = self
            .find_time_sheet_detail(&detail.time_sheet_no, detail.time_sheet_line_no, &detail.date)
            .await?;
        match existing.and_then(|d| d.id) {
            Some(detail_id) => {
                self.set_time_sheet_detail_quantity(&detail_id, detail.quantity)
                    .await
            }
            None => self.create_time_sheet_detail(detail).await,
        }
    }

    pub async fn apply_line_action(&self, line_id: &str, action: LineAction) -> Result<(), BcError> {
        let endpoint = format!("/timeSheetLines({})/{}", line_id, action.action_name());
        info!("Applying {:?} to time sheet line {}", action, line_id);
        let request = self.build_request(Method::POST, &endpoint).await?;
        self.send_without_body(request, action.action_name()).await
    }

    pub async fn submit_time_sheet_line(&self, line_id: &str) -> Result<(), BcError> {
        self.apply_line_action(line_id, LineAction::Submit).await
    }

    pub async fn approve_time_sheet_line(&self, line_id: &str) -> Result<(), BcError> {
        self.apply_line_action(line_id, LineAction::Approve).await
    }

    pub async fn reject_time_sheet_line(&self, line_id: &str) -> Result<(), BcError> {
        self.apply_line_action(line_id, LineAction::Reject).await
    }

    pub async fn reopen_time_sheet_line(&self, line_id: &str) -> Result<(), BcError> {
        self.apply_line_action(line_id, LineAction::Reopen).await
    }

    pub async fn create_job_planning_line(
        &self,
        line: &NewJobPlanningLine,
    ) -> Result<BcJobPlanningLine, BcError> {
        let request = self
            .build_request(Method::POST, "/jobPlanningLines")
            .await?
            .json(line);
        self.send_and_deserialize(request, "Create Job Planning Line")
            .await
    }
}

