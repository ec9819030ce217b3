use std::time::{Duration, SystemTime};

use reqwest::{Client, StatusCode, header::HeaderMap};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use url::Url;

use crate::codes::ApiErrorCode;

const DEFAULT_BASE_URL: &str = "https://api.infomaniak.com";

#[derive(Debug, Error)]
pub enum DriveApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status} ({code}): {description}")]
    Api {
        status: StatusCode,
        code: ApiErrorCode,
        description: String,
        retry_after: Option<Duration>,
    },
    #[error("malformed response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("api response is missing its data payload")]
    MissingData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Clone)]
pub struct DriveClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl DriveClient {
    pub fn new(token: impl Into<String>) -> Result<Self, DriveApiError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, DriveApiError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub async fn start_session(
        &self,
        drive_id: i64,
        request: &StartSessionRequest,
    ) -> Result<UploadSessionStarted, DriveApiError> {
        let url = self.endpoint(&format!("/3/drive/{drive_id}/upload/session/start"))?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(request)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Builds the request for one chunk of an open session. Performs no I/O;
    /// the caller owns the transfer.
    pub fn append_chunk_request(
        &self,
        drive_id: i64,
        session: &SessionHandle,
        chunk: &ChunkParams,
    ) -> Result<ChunkRequest, DriveApiError> {
        let route = format!(
            "/3/drive/{drive_id}/upload/session/{}/chunk",
            session.token
        );
        let mut url = match &session.upload_url {
            Some(host) => host.join(&route)?,
            None => self.endpoint(&route)?,
        };
        url.query_pairs_mut()
            .append_pair("chunk_number", &chunk.number.to_string())
            .append_pair("chunk_size", &chunk.size.to_string())
            .append_pair("chunk_hash", &format!("sha256:{}", chunk.sha256));
        Ok(ChunkRequest {
            url,
            authorization: self.auth_header_value(),
        })
    }

    pub async fn close_session(
        &self,
        drive_id: i64,
        token: &str,
    ) -> Result<UploadedFile, DriveApiError> {
        let url = self.endpoint(&format!("/3/drive/{drive_id}/upload/session/{token}/finish"))?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn cancel_session(&self, drive_id: i64, token: &str) -> Result<bool, DriveApiError> {
        let url = self.endpoint(&format!("/3/drive/{drive_id}/upload/session/{token}"))?;
        let response = self
            .http
            .delete(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Single-request upload, used for payloads that cannot be split into
    /// chunks (empty files).
    pub async fn direct_upload(
        &self,
        drive_id: i64,
        request: &DirectUploadRequest,
        body: Vec<u8>,
    ) -> Result<RemoteFile, DriveApiError> {
        let mut url = self.endpoint(&format!("/3/drive/{drive_id}/upload"))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("total_size", &body.len().to_string())
                .append_pair("file_name", &request.file_name)
                .append_pair("directory_id", &request.directory_id.to_string())
                .append_pair("conflict", request.conflict.as_str());
            if let Some(modified) = request.last_modified_at {
                query.append_pair("last_modified_at", &modified.to_string());
            }
        }
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .body(body)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, DriveApiError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DriveApiError> {
        let status = response.status();
        let retry_after = retry_after_from_headers(response.headers());
        let body = response.bytes().await?;
        decode_response(status, &body, retry_after)
    }
}

/// Decodes a `{"result": ..., "data"|"error": ...}` envelope. Shared by the
/// client and by transports that receive raw chunk responses.
pub fn decode_response<T: DeserializeOwned>(
    status: StatusCode,
    body: &[u8],
    retry_after: Option<Duration>,
) -> Result<T, DriveApiError> {
    if status.is_success() {
        let envelope: Envelope<T> = serde_json::from_slice(body)?;
        if envelope.result == "success" {
            return envelope.data.ok_or(DriveApiError::MissingData);
        }
        let error = envelope.error.unwrap_or_default();
        return Err(DriveApiError::Api {
            status,
            code: ApiErrorCode::parse(&error.code),
            description: error.description,
            retry_after,
        });
    }

    let error = serde_json::from_slice::<Envelope<serde_json::Value>>(body)
        .ok()
        .and_then(|envelope| envelope.error)
        .unwrap_or_else(|| ApiErrorBody {
            code: String::new(),
            description: String::from_utf8_lossy(body).into_owned(),
        });
    Err(DriveApiError::Api {
        status,
        code: ApiErrorCode::parse(&error.code),
        description: error.description,
        retry_after,
    })
}

pub fn retry_after_from_headers(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    parse_retry_after(value, SystemTime::now())
}

fn parse_retry_after(value: &str, now: SystemTime) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(at.duration_since(now).unwrap_or_default())
}

impl DriveApiError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            DriveApiError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }

    pub fn code(&self) -> Option<&ApiErrorCode> {
        match self {
            DriveApiError::Api { code, .. } => Some(code),
            _ => None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DriveApiError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// True when the request never produced an HTTP response.
    pub fn is_transport(&self) -> bool {
        matches!(self, DriveApiError::Request(err) if err.status().is_none())
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    result: String,
    data: Option<T>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictOption {
    Error,
    Rename,
    Version,
}

impl ConflictOption {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "error" => Some(ConflictOption::Error),
            "rename" => Some(ConflictOption::Rename),
            "version" => Some(ConflictOption::Version),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictOption::Error => "error",
            ConflictOption::Rename => "rename",
            ConflictOption::Version => "version",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StartSessionRequest {
    pub conflict: ConflictOption,
    pub directory_id: i64,
    pub file_name: String,
    pub total_chunks: u64,
    pub total_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct DirectUploadRequest {
    pub conflict: ConflictOption,
    pub directory_id: i64,
    pub file_name: String,
    pub last_modified_at: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploadSessionStarted {
    pub token: String,
    #[serde(default)]
    pub upload_url: Option<Url>,
}

/// What a chunk request needs to know about its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub token: String,
    pub upload_url: Option<Url>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkParams {
    pub number: u64,
    pub size: u64,
    pub sha256: String,
}

/// A fully addressed chunk upload. The body is supplied by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRequest {
    pub url: Url,
    pub authorization: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct UploadedChunk {
    pub number: u64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub created_at: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploadedFile {
    pub token: String,
    pub file: RemoteFile,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RemoteFile {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<i64>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub last_modified_at: Option<i64>,
    #[serde(default)]
    pub path: Option<String>,
}
