use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, info};

use crate::error::{PlayerError, Result};
use crate::track::Track;

#[derive(Debug, Clone, PartialEq)]
pub enum TrackSource {
    /// `http://`, `https://` or `file://`
    Url(String),
    Path(PathBuf),
    Bytes { label: String, data: Arc<[u8]> },
}

impl TrackSource {
    pub fn bytes(label: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        TrackSource::Bytes { label: label.into(), data: data.into() }
    }

    pub fn describe(&self) -> String {
        match self {
            TrackSource::Url(url) => url.clone(),
            TrackSource::Path(path) => path.display().to_string(),
            TrackSource::Bytes { label, data } => format!("{} ({} bytes)", label, data.len()),
        }
    }

    pub fn url(&self) -> Option<String> {
        match self {
            TrackSource::Url(url) => Some(url.clone()),
            _ => None,
        }
    }

    /// Guesses between URL and filesystem path, the way the CLI takes its argument.
    pub fn parse(input: &str) -> Self {
        let lower = input.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") || lower.starts_with("file://") {
            TrackSource::Url(input.to_string())
        } else {
            TrackSource::Path(PathBuf::from(input))
        }
    }
}

/// A record handed over by the catalog. Only `url` and the display fields are used.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogEntry {
    pub id: String,
    pub filename: String,
    pub path: String,
    pub url: String,
    pub title: String,
    pub artist: String,
    pub subsongs: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackRequest {
    pub source: TrackSource,
    pub id: Option<String>,
    pub title: Option<String>,
    pub artist: Option<String>,
}

impl TrackRequest {
    pub fn new(source: TrackSource) -> Self {
        TrackRequest { source, id: None, title: None, artist: None }
    }

    pub fn url(url: impl Into<String>) -> Self {
        Self::new(TrackSource::Url(url.into()))
    }
}

impl From<TrackSource> for TrackRequest {
    fn from(source: TrackSource) -> Self {
        TrackRequest::new(source)
    }
}

impl From<&CatalogEntry> for TrackRequest {
    fn from(entry: &CatalogEntry) -> Self {
        let non_empty = |s: &str| if s.trim().is_empty() { None } else { Some(s.to_string()) };
        TrackRequest {
            source: TrackSource::Url(entry.url.clone()),
            id: non_empty(&entry.id),
            title: non_empty(&entry.title),
            artist: non_empty(&entry.artist),
        }
    }
}

/// Pulls the whole resource in one go.
pub trait TrackFetcher: Send + Sync {
    fn fetch<'a>(&'a self, source: &'a TrackSource) -> BoxFuture<'a, Result<Vec<u8>>>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PlayerError::NotInitialized(format!("HTTP client: {}", e)))?;
        Ok(HttpFetcher { client })
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.client.get(url).send().await.map_err(|e| PlayerError::fetch(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PlayerError::fetch(url, format!("HTTP {}", status)));
        }

        let expected = response.content_length();
        let body = response.bytes().await.map_err(|e| PlayerError::fetch(url, e))?;
        if let Some(expected) = expected {
            if body.len() as u64 != expected {
                return Err(PlayerError::fetch(
                    url,
                    format!("truncated body: got {} of {} bytes", body.len(), expected),
                ));
            }
        }
        Ok(body.to_vec())
    }
}

async fn read_file(path: PathBuf) -> Result<Vec<u8>> {
    tokio::fs::read(&path)
        .await
        .map_err(|e| PlayerError::fetch(path.display().to_string(), e))
}

impl TrackFetcher for HttpFetcher {
    fn fetch<'a>(&'a self, source: &'a TrackSource) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            match source {
                TrackSource::Url(url) => match url.strip_prefix("file://") {
                    Some(path) => read_file(PathBuf::from(path)).await,
                    None => self.get(url).await,
                },
                TrackSource::Path(path) => read_file(path.clone()).await,
                TrackSource::Bytes { data, .. } => Ok(data.to_vec()),
            }
        })
    }
}

/// Fetches and parses tracks. Touches no session state.
#[derive(Clone)]
pub struct TrackLoader {
    fetcher: Arc<dyn TrackFetcher>,
}

impl TrackLoader {
    pub fn new(fetcher: Arc<dyn TrackFetcher>) -> Self {
        TrackLoader { fetcher }
    }

    pub fn http(timeout: Duration) -> Result<Self> {
        Ok(Self::new(Arc::new(HttpFetcher::new(timeout)?)))
    }

    pub async fn load(&self, request: &TrackRequest) -> Result<Track> {
        let desc = request.source.describe();
        debug!("Fetching {}", desc);

        let bytes = self.fetcher.fetch(&request.source).await?;
        let track = Track::from_bytes(bytes, request.source.url())?.with_display(
            request.id.as_deref(),
            request.title.as_deref(),
            request.artist.as_deref(),
        );

        info!(
            "Loaded '{}' by {} ({} subtunes) from {}",
            track.title, track.artist, track.subtune_count, desc
        );
        Ok(track)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::build_psid;
    use std::io::Write;

    fn loader() -> TrackLoader {
        TrackLoader::http(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn parses_cli_sources() {
        assert_eq!(TrackSource::parse("https://x/y.sid"), TrackSource::Url("https://x/y.sid".into()));
        assert_eq!(TrackSource::parse("tunes/y.sid"), TrackSource::Path("tunes/y.sid".into()));
    }

    #[test]
    fn catalog_entry_becomes_request() {
        let entry = CatalogEntry {
            id: "17".into(),
            url: "https://cdn/x.sid".into(),
            title: "Commando".into(),
            artist: "".into(),
            ..Default::default()
        };
        let req = TrackRequest::from(&entry);
        assert_eq!(req.source, TrackSource::Url("https://cdn/x.sid".into()));
        assert_eq!(req.id.as_deref(), Some("17"));
        assert_eq!(req.artist, None);
    }

    #[tokio::test]
    async fn loads_from_bytes_with_catalog_overrides() {
        let data = build_psid("Header Title", "Header Author", 2, 1, &[1, 2, 3]);
        let mut req = TrackRequest::new(TrackSource::bytes("mem", data));
        req.title = Some("Catalog Title".into());
        let track = loader().load(&req).await.unwrap();
        assert_eq!(track.title, "Catalog Title");
        assert_eq!(track.artist, "Header Author");
        assert_eq!(track.source_url, None);
    }

    #[tokio::test]
    async fn loads_from_path_and_file_url() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&build_psid("On Disk", "Me", 1, 1, &[9, 9])).unwrap();

        let by_path = loader()
            .load(&TrackSource::Path(file.path().to_path_buf()).into())
            .await
            .unwrap();
        assert_eq!(by_path.title, "On Disk");

        let url = format!("file://{}", file.path().display());
        let by_url = loader().load(&TrackRequest::url(url.clone())).await.unwrap();
        assert_eq!(by_url.source_url, Some(url));
    }

    #[tokio::test]
    async fn missing_file_is_fetch_error() {
        let err = loader()
            .load(&TrackSource::Path("/no/such/tune.sid".into()).into())
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "{}", err);
    }

    #[tokio::test]
    async fn garbage_is_format_error() {
        let err = loader()
            .load(&TrackSource::bytes("junk", vec![0u8; 300]).into())
            .await
            .unwrap_err();
        assert!(matches!(err, PlayerError::Format(_)));
    }
}
