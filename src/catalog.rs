use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{CONTENT_DISPOSITION, HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde_json::json;

use crate::domain::{DatasetRecord, FileType, SearchQuery};
use crate::error::BidsError;
use crate::fs_util;
use crate::layout::names_dataset;

const CLIENT_ID: &str = "shanoir-uploader";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOutcome {
    Found(Vec<DatasetRecord>),
    /// The portal answered 204: nothing matches the filter.
    NoContent,
}

impl SearchOutcome {
    pub fn into_records(self) -> Vec<DatasetRecord> {
        match self {
            SearchOutcome::Found(records) => records,
            SearchOutcome::NoContent => Vec::new(),
        }
    }
}

pub trait CatalogClient: Send + Sync {
    fn search(&self, query: &SearchQuery) -> Result<SearchOutcome, BidsError>;
    fn download(
        &self,
        record: &DatasetRecord,
        file_type: FileType,
        destination_dir: &Path,
    ) -> Result<PathBuf, BidsError>;
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default)]
    content: Vec<DatasetRecord>,
}

pub struct ShanoirHttpClient {
    client: Client,
    host: String,
    credentials: Credentials,
    token: Mutex<Option<String>>,
}

impl ShanoirHttpClient {
    pub fn new(host: &str, credentials: Credentials) -> Result<Self, BidsError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("shanoir-bids/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| BidsError::CatalogHttp(err.to_string()))?,
        );
        // Archives of large series can take minutes to stream.
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30 * 60))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| BidsError::CatalogHttp(err.to_string()))?;

        Ok(Self {
            client,
            host: host.to_string(),
            credentials,
            token: Mutex::new(None),
        })
    }

    fn token_url(&self) -> String {
        format!(
            "https://{}/auth/realms/shanoir-ng/protocol/openid-connect/token",
            self.host
        )
    }

    fn search_url(&self) -> String {
        format!("https://{}/shanoir-ng/datasets/solr", self.host)
    }

    fn download_url(&self, dataset_id: &str) -> String {
        format!(
            "https://{}/shanoir-ng/datasets/datasets/download/{}",
            self.host, dataset_id
        )
    }

    fn authenticate(&self) -> Result<String, BidsError> {
        tracing::debug!(
            host = %self.host,
            user = %self.credentials.username,
            "requesting access token"
        );
        let response = self
            .client
            .post(self.token_url())
            .form(&[
                ("client_id", CLIENT_ID),
                ("grant_type", "password"),
                ("username", self.credentials.username.as_str()),
                ("password", self.credentials.password.as_str()),
                ("scope", "offline_access"),
            ])
            .send()
            .map_err(|err| BidsError::CatalogHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "token request failed".to_string());
            return Err(BidsError::Authentication(format!("status {status}: {message}")));
        }
        let token: TokenResponse = response
            .json()
            .map_err(|err| BidsError::Authentication(err.to_string()))?;
        Ok(token.access_token)
    }

    fn current_token(&self, refresh: bool) -> Result<String, BidsError> {
        let mut guard = self
            .token
            .lock()
            .map_err(|_| BidsError::Authentication("token cache poisoned".to_string()))?;
        if refresh || guard.is_none() {
            *guard = Some(self.authenticate()?);
        }
        guard
            .clone()
            .ok_or_else(|| BidsError::Authentication("no access token".to_string()))
    }

    /// Sends an authorized request, re-authenticating once when the token expired.
    fn send_authorized<F>(&self, make_req: F) -> Result<Response, BidsError>
    where
        F: Fn() -> RequestBuilder,
    {
        let token = self.current_token(false)?;
        let response = make_req()
            .bearer_auth(token)
            .send()
            .map_err(|err| BidsError::CatalogHttp(err.to_string()))?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        tracing::info!("access token rejected, authenticating again");
        let token = self.current_token(true)?;
        make_req()
            .bearer_auth(token)
            .send()
            .map_err(|err| BidsError::CatalogHttp(err.to_string()))
    }

    fn handle_status(response: Response) -> Result<Response, BidsError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "catalog request failed".to_string());
        Err(BidsError::CatalogStatus { status, message })
    }
}

impl CatalogClient for ShanoirHttpClient {
    fn search(&self, query: &SearchQuery) -> Result<SearchOutcome, BidsError> {
        let body = json!({
            "expertMode": true,
            "searchText": query.search_text(),
        });
        let sort = query.sort.to_string();
        let size = query.page_size.to_string();
        let response = self.send_authorized(|| {
            self.client
                .post(self.search_url())
                .query(&[("page", "0"), ("size", size.as_str()), ("sort", sort.as_str())])
                .json(&body)
        })?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(SearchOutcome::NoContent);
        }
        let response = Self::handle_status(response)?;
        let page: SearchPage = response
            .json()
            .map_err(|err| BidsError::CatalogHttp(format!("invalid search response: {err}")))?;
        Ok(SearchOutcome::Found(page.content))
    }

    fn download(
        &self,
        record: &DatasetRecord,
        file_type: FileType,
        destination_dir: &Path,
    ) -> Result<PathBuf, BidsError> {
        std::fs::create_dir_all(destination_dir)
            .map_err(|err| BidsError::Filesystem(err.to_string()))?;
        let url = self.download_url(&record.id);
        let response = self.send_authorized(|| {
            self.client
                .get(&url)
                .query(&[("format", file_type.download_format())])
        })?;
        let mut response = Self::handle_status(response)?;

        let served_name = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .and_then(filename_from_disposition);
        let file_name = archive_file_name(&record.id, served_name.as_deref());
        let destination = destination_dir.join(file_name);

        fs_util::stream_to_file(&mut response, &destination)?;
        tracing::info!(dataset = %record.id, path = %destination.display(), "downloaded archive");
        Ok(destination)
    }
}

/// Extracts the file name from a `Content-Disposition` header value.
pub fn filename_from_disposition(value: &str) -> Option<String> {
    value
        .split(';')
        .map(str::trim)
        .find_map(|part| {
            let (key, raw) = part.split_once('=')?;
            key.trim()
                .eq_ignore_ascii_case("filename")
                .then(|| raw.trim().trim_matches('"').to_string())
        })
        .map(|name| {
            Path::new(&name)
                .file_name()
                .map(|base| base.to_string_lossy().to_string())
                .unwrap_or(name)
        })
        .filter(|name| !name.is_empty())
}

/// Local name of a downloaded archive; always starts with the dataset id.
pub fn archive_file_name(dataset_id: &str, served_name: Option<&str>) -> String {
    match served_name {
        Some(name) if names_dataset(name, dataset_id) => name.to_string(),
        Some(name) => format!("{dataset_id}_{name}"),
        None => format!("{dataset_id}.zip"),
    }
}
