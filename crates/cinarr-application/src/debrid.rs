// SPDX-License-Identifier: GPL-3.0-or-later
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const VIDEO_EXTENSIONS: &[&str] = &["mkv", "mp4", "avi"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentFile {
    pub id: u64,
    /// Path inside the torrent, `/` separated.
    pub path: String,
    pub bytes: u64,
}

impl TorrentFile {
    pub fn basename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    pub fn is_video(&self) -> bool {
        is_video_path(&self.path)
    }

    pub fn size_gb(&self) -> f64 {
        self.bytes as f64 / 1024.0_f64.powi(3)
    }
}

pub fn is_video_path(path: &str) -> bool {
    path.rsplit_once('.')
        .map(|(_, ext)| VIDEO_EXTENSIONS.iter().any(|v| v.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFileList {
    pub torrent_id: String,
    /// Display name of the torrent on the provider.
    pub filename: String,
    pub files: Vec<TorrentFile>,
}

#[derive(Debug, Error)]
pub enum DebridError {
    #[error("provider rate limit reached")]
    RateLimit,
    #[error("too many active downloads")]
    TooManyDownloads,
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("provider rejected the api key")]
    Unauthorized,
    #[error("provider refused access")]
    Forbidden,
    #[error("request failed: {0}")]
    Request(String),
    #[error("provider responded with status {status}: {body}")]
    HttpStatus { status: u16, body: String },
}

#[async_trait]
pub trait DebridProvider: Send + Sync {
    /// Add a magnet and return the provider's torrent id.
    async fn add_torrent(&self, magnet: &str) -> Result<String, DebridError>;

    /// Files of the torrent behind `magnet`. The id returned here may differ
    /// from the one `add_torrent` gave when the provider re-adds the torrent.
    async fn get_torrent_file_list(&self, magnet: &str) -> Result<TorrentFileList, DebridError>;

    /// Total size of the provider library in GB.
    async fn get_total_library_size(&self) -> Result<f64, DebridError>;

    async fn has_download_capacity(&self) -> Result<bool, DebridError>;

    async fn remove_torrent(&self, torrent_id: &str) -> Result<(), DebridError>;
}

/// Lowercased btih hash of a magnet link.
pub fn extract_info_hash(magnet: &str) -> Option<String> {
    let lower = magnet.to_ascii_lowercase();
    let start = lower.find("urn:btih:")? + "urn:btih:".len();
    let hash: String = lower[start..]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect();
    (!hash.is_empty()).then_some(hash)
}

// ============================================================================
// Real-Debrid
// ============================================================================

pub struct RealDebridClient {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct AddMagnetResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TorrentSummary {
    id: String,
    #[serde(default)]
    hash: String,
    #[serde(default)]
    bytes: u64,
}

#[derive(Debug, Deserialize)]
struct TorrentInfoResponse {
    id: String,
    filename: String,
    #[serde(default)]
    files: Vec<TorrentInfoFile>,
}

#[derive(Debug, Deserialize)]
struct TorrentInfoFile {
    id: u64,
    path: String,
    bytes: u64,
}

#[derive(Debug, Deserialize)]
struct ActiveCountResponse {
    nb: u32,
    limit: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_code: Option<i64>,
}

impl RealDebridClient {
    pub fn new(client: Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, DebridError> {
        Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|err| DebridError::Request(err.to_string()))
    }

    async fn check(response: Response) -> Result<Response, DebridError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .map_err(|e| DebridError::Request(e.to_string()))?;
        Err(map_error(status, body))
    }

    async fn info(&self, torrent_id: &str) -> Result<TorrentFileList, DebridError> {
        let url = self.endpoint(&format!("/torrents/info/{}", torrent_id))?;
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| DebridError::Request(e.to_string()))?;
        let info: TorrentInfoResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| DebridError::Request(e.to_string()))?;
        Ok(TorrentFileList {
            torrent_id: info.id,
            filename: info.filename,
            files: info
                .files
                .into_iter()
                .map(|f| TorrentFile {
                    id: f.id,
                    path: f.path,
                    bytes: f.bytes,
                })
                .collect(),
        })
    }

    async fn list_torrents(&self) -> Result<Vec<TorrentSummary>, DebridError> {
        let url = self.endpoint("/torrents?limit=2500")?;
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| DebridError::Request(e.to_string()))?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| DebridError::Request(e.to_string()))
    }
}

fn map_error(status: StatusCode, body: String) -> DebridError {
    let parsed: Option<ErrorBody> = serde_json::from_str(&body).ok();
    if let Some(err) = &parsed {
        if err.error == "too_many_active_downloads" || err.error_code == Some(21) {
            return DebridError::TooManyDownloads;
        }
    }
    match status.as_u16() {
        429 => DebridError::RateLimit,
        401 => DebridError::Unauthorized,
        403 => DebridError::Forbidden,
        500..=599 => DebridError::ProviderUnavailable(body),
        code => DebridError::HttpStatus { status: code, body },
    }
}

#[async_trait]
impl DebridProvider for RealDebridClient {
    async fn add_torrent(&self, magnet: &str) -> Result<String, DebridError> {
        let url = self.endpoint("/torrents/addMagnet")?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .form(&[("magnet", magnet)])
            .send()
            .await
            .map_err(|e| DebridError::Request(e.to_string()))?;
        let added: AddMagnetResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| DebridError::Request(e.to_string()))?;

        let url = self.endpoint(&format!("/torrents/selectFiles/{}", added.id))?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .form(&[("files", "all")])
            .send()
            .await
            .map_err(|e| DebridError::Request(e.to_string()))?;
        Self::check(response).await?;

        debug!(target: "debrid", torrent_id = %added.id, "magnet added");
        Ok(added.id)
    }

    async fn get_torrent_file_list(&self, magnet: &str) -> Result<TorrentFileList, DebridError> {
        let hash = extract_info_hash(magnet);
        let existing = match &hash {
            Some(hash) => self
                .list_torrents()
                .await?
                .into_iter()
                .find(|t| t.hash.eq_ignore_ascii_case(hash)),
            None => None,
        };
        let torrent_id = match existing {
            Some(t) => t.id,
            None => self.add_torrent(magnet).await?,
        };
        self.info(&torrent_id).await
    }

    async fn get_total_library_size(&self) -> Result<f64, DebridError> {
        let bytes: u64 = self.list_torrents().await?.iter().map(|t| t.bytes).sum();
        Ok(bytes as f64 / 1024.0_f64.powi(3))
    }

    async fn has_download_capacity(&self) -> Result<bool, DebridError> {
        let url = self.endpoint("/torrents/activeCount")?;
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| DebridError::Request(e.to_string()))?;
        let count: ActiveCountResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| DebridError::Request(e.to_string()))?;
        Ok(count.nb < count.limit)
    }

    async fn remove_torrent(&self, torrent_id: &str) -> Result<(), DebridError> {
        let url = self.endpoint(&format!("/torrents/delete/{}", torrent_id))?;
        let response = self
            .client
            .delete(url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| DebridError::Request(e.to_string()))?;
        Self::check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> RealDebridClient {
        RealDebridClient::new(Client::new(), server.uri(), "secret")
    }

    #[test]
    fn extracts_info_hash() {
        assert_eq!(
            extract_info_hash("magnet:?xt=urn:btih:ABCDEF0123&dn=Film"),
            Some("abcdef0123".to_string())
        );
        assert_eq!(extract_info_hash("https://example.invalid/file.torrent"), None);
    }

    #[test]
    fn recognises_video_files() {
        let file = TorrentFile {
            id: 1,
            path: "/Film.2019/Film.2019.1080p.MKV".into(),
            bytes: 10,
        };
        assert!(file.is_video());
        assert_eq!(file.basename(), "Film.2019.1080p.MKV");
        assert!(!is_video_path("/Film.2019/sample.nfo"));
    }

    #[tokio::test]
    async fn add_torrent_adds_and_selects_all_files() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/torrents/addMagnet"))
            .and(header("authorization", "Bearer secret"))
            .and(body_string_contains("magnet=magnet%3A%3Fxt%3Durn%3Abtih%3Aabc"))
            .respond_with(
                ResponseTemplate::new(201).set_body_string(r#"{"id":"T1","uri":"https://x/T1"}"#),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/torrents/selectFiles/T1"))
            .and(body_string_contains("files=all"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let id = client(&server).add_torrent("magnet:?xt=urn:btih:abc").await.unwrap();
        assert_eq!(id, "T1");
    }

    #[tokio::test]
    async fn file_list_reuses_a_torrent_with_the_same_hash() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/torrents"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"[{"id":"T9","hash":"ABC","bytes":1073741824,"filename":"Film"}]"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/torrents/info/T9"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"id":"T9","filename":"Film.2019.1080p","files":[
                    {"id":1,"path":"/Film.2019.1080p/Film.mkv","bytes":1000,"selected":1},
                    {"id":2,"path":"/Film.2019.1080p/Film.nfo","bytes":1,"selected":1}
                ]}"#,
            ))
            .mount(&server)
            .await;

        let list = client(&server)
            .get_torrent_file_list("magnet:?xt=urn:btih:abc")
            .await
            .unwrap();
        assert_eq!(list.torrent_id, "T9");
        assert_eq!(list.filename, "Film.2019.1080p");
        assert_eq!(list.files.len(), 2);

        let size = client(&server).get_total_library_size().await.unwrap();
        assert!((size - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn maps_provider_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/torrents/activeCount"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/torrents/addMagnet"))
            .respond_with(ResponseTemplate::new(503).set_body_string(
                r#"{"error":"too_many_active_downloads","error_code":21}"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/torrents/delete/T1"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let rd = client(&server);
        assert!(matches!(rd.has_download_capacity().await, Err(DebridError::RateLimit)));
        assert!(matches!(
            rd.add_torrent("magnet:?xt=urn:btih:abc").await,
            Err(DebridError::TooManyDownloads)
        ));
        assert!(matches!(rd.remove_torrent("T1").await, Err(DebridError::Unauthorized)));
    }

    #[tokio::test]
    async fn capacity_compares_active_count_with_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/torrents/activeCount"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"nb":25,"limit":25}"#))
            .mount(&server)
            .await;
        assert!(!client(&server).has_download_capacity().await.unwrap());
    }
}
