// Now Playing Service
// Polls live metadata and republishes it to the overlay text files

use std::sync::Arc;
use std::time::Duration;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::models::{NowPlayingMode, NowPlayingSource};
use crate::services::events::{LogSeverity, PipelineEventSink};
use crate::services::station_paths::{write_atomic, StationPaths};

const LOG_SOURCE: &str = "now-playing";

#[derive(Debug, Error)]
pub enum NowPlayingError {
    #[error("No now-playing URL configured")]
    NotConfigured,
    #[error("Metadata request failed: {0}")]
    Http(String),
    #[error("Metadata request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Metadata endpoint returned HTTP {0}")]
    Status(u16),
    #[error("Invalid metadata payload: {0}")]
    Decode(String),
}

/// Normalized track metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrackInfo {
    pub artist: String,
    pub title: String,
}

impl TrackInfo {
    pub fn new(artist: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            artist: artist.into().trim().to_string(),
            title: title.into().trim().to_string(),
        }
    }

    /// "Artist - Title", or whichever half is present
    pub fn combined(&self) -> String {
        match (self.artist.is_empty(), self.title.is_empty()) {
            (false, false) => format!("{} - {}", self.artist, self.title),
            (true, false) => self.title.clone(),
            (false, true) => self.artist.clone(),
            (true, true) => String::new(),
        }
    }
}

/// Split "Artist - Title" on the first separator; no separator means title only
pub fn parse_combined(text: &str) -> TrackInfo {
    let text = text.trim();
    match text.split_once(" - ") {
        Some((artist, title)) => TrackInfo::new(artist, title),
        None => TrackInfo::new("", text),
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Prefer separate artist/title fields, else parse one of the combined keys
fn track_from_node(node: &Value, combined_keys: &[&str]) -> Option<TrackInfo> {
    let artist = str_field(node, "artist");
    let title = str_field(node, "title");
    if artist.is_some() {
        return Some(TrackInfo::new(artist.unwrap_or_default(), title.unwrap_or_default()));
    }

    combined_keys
        .iter()
        .find_map(|key| str_field(node, key))
        .map(parse_combined)
}

/// Pull the current track out of an upstream document
pub fn extract_track(mode: NowPlayingMode, payload: &Value) -> Option<TrackInfo> {
    match mode {
        NowPlayingMode::ExternalApi => {
            // Some APIs return a list of stations; the first one is ours
            let root = match payload {
                Value::Array(items) => items.first()?,
                other => other,
            };
            let now = root.get("now_playing").unwrap_or(root);
            now.get("song")
                .and_then(|song| track_from_node(song, &["text", "title"]))
                .or_else(|| track_from_node(now, &["text", "title"]))
        }
        NowPlayingMode::StatusEndpoint => {
            let node = payload
                .get("icestats")
                .and_then(|stats| stats.get("source"))
                .unwrap_or(payload);
            let node = match node {
                Value::Array(items) => items.first()?,
                other => other,
            };
            track_from_node(node, &["title", "yp_currently_playing", "song"])
        }
    }
}

/// Raw upstream payload alongside the parsed track, for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub raw: Value,
    pub parsed: TrackInfo,
    pub combined: String,
}

/// HTTP client for now-playing endpoints
#[derive(Clone)]
pub struct NowPlayingFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl NowPlayingFetcher {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                log::warn!("Failed to build metadata HTTP client, using defaults: {e}");
                reqwest::Client::new()
            });
        Self { client, timeout }
    }

    pub async fn fetch(&self, source: &NowPlayingSource) -> Result<ProbeResult, NowPlayingError> {
        let url = source.active_url().ok_or(NowPlayingError::NotConfigured)?;

        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| self.map_request_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NowPlayingError::Status(status.as_u16()));
        }

        let raw: Value = response
            .json()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    NowPlayingError::Timeout(self.timeout)
                } else {
                    NowPlayingError::Decode(e.to_string())
                }
            })?;

        let parsed = extract_track(source.mode, &raw).unwrap_or_default();
        let combined = parsed.combined();
        Ok(ProbeResult { raw, parsed, combined })
    }

    fn map_request_error(&self, e: reqwest::Error) -> NowPlayingError {
        if e.is_timeout() {
            NowPlayingError::Timeout(self.timeout)
        } else {
            NowPlayingError::Http(e.to_string())
        }
    }
}

/// One-shot fetch and parse, independent of any running poller
pub async fn probe_now_playing(
    source: &NowPlayingSource,
    timeout: Duration,
) -> Result<ProbeResult, NowPlayingError> {
    NowPlayingFetcher::new(timeout).fetch(source).await
}

/// Writes the three overlay files when the combined value changes
pub struct NowPlayingWriter {
    paths: StationPaths,
    last_combined: Option<String>,
}

impl NowPlayingWriter {
    pub fn new(paths: StationPaths) -> Self {
        Self { paths, last_combined: None }
    }

    /// Returns true when the files were rewritten
    pub fn publish(&mut self, track: &TrackInfo) -> Result<bool, String> {
        let combined = track.combined();
        if self.last_combined.as_deref() == Some(combined.as_str()) {
            return Ok(false);
        }

        write_atomic(&self.paths.artist(), track.artist.as_bytes())?;
        write_atomic(&self.paths.title(), track.title.as_bytes())?;
        write_atomic(&self.paths.now_playing(), combined.as_bytes())?;
        self.last_combined = Some(combined);
        Ok(true)
    }
}

/// Background poll loop owned by one running pipeline
pub struct NowPlayingPoller {
    handle: JoinHandle<()>,
}

impl NowPlayingPoller {
    /// Start polling; `None` when the station has no metadata URL
    pub fn spawn(
        station_id: String,
        source: NowPlayingSource,
        paths: StationPaths,
        fetch_timeout: Duration,
        events: Arc<dyn PipelineEventSink>,
    ) -> Option<Self> {
        if source.active_url().is_none() {
            log::info!("[{station_id}] No now-playing source configured, overlay text stays static");
            return None;
        }

        let interval = Duration::from_secs(source.poll_interval_secs.max(1));
        let fetcher = NowPlayingFetcher::new(fetch_timeout);
        let mut writer = NowPlayingWriter::new(paths);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                match fetcher.fetch(&source).await {
                    Ok(result) => match writer.publish(&result.parsed) {
                        Ok(true) => {
                            log::info!("[{station_id}] Now playing: {}", result.combined);
                            events.on_now_playing(&station_id, &result.combined);
                        }
                        Ok(false) => {}
                        Err(e) => {
                            log::warn!("[{station_id}] Failed to write now-playing files: {e}");
                            events.on_log(&station_id, LogSeverity::Warn, LOG_SOURCE, &e);
                        }
                    },
                    Err(e) => {
                        let message = e.to_string();
                        log::warn!("[{station_id}] {message}");
                        events.on_log(&station_id, LogSeverity::Warn, LOG_SOURCE, &message);
                    }
                }
            }
        });

        Some(Self { handle })
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for NowPlayingPoller {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::events::RecordingSink;
    use serde_json::json;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api_source(url: String) -> NowPlayingSource {
        NowPlayingSource {
            mode: NowPlayingMode::ExternalApi,
            api_url: Some(url),
            status_url: None,
            poll_interval_secs: 1,
        }
    }

    #[test]
    fn test_parse_combined() {
        assert_eq!(parse_combined("Artist - Title"), TrackInfo::new("Artist", "Title"));
        assert_eq!(parse_combined("Title Only"), TrackInfo::new("", "Title Only"));
        assert_eq!(parse_combined(""), TrackInfo::default());
        assert_eq!(
            parse_combined("A - B - C"),
            TrackInfo::new("A", "B - C")
        );
        assert_eq!(parse_combined("Dash-NoSpaces"), TrackInfo::new("", "Dash-NoSpaces"));
    }

    #[test]
    fn test_extract_external_api_prefers_song_fields() {
        let payload = json!({
            "now_playing": { "song": { "artist": "Nina Simone", "title": "Sinnerman", "text": "ignored - text" } }
        });
        assert_eq!(
            extract_track(NowPlayingMode::ExternalApi, &payload),
            Some(TrackInfo::new("Nina Simone", "Sinnerman"))
        );

        let fallback = json!({ "now_playing": { "song": { "text": "Miles Davis - So What" } } });
        assert_eq!(
            extract_track(NowPlayingMode::ExternalApi, &fallback),
            Some(TrackInfo::new("Miles Davis", "So What"))
        );
    }

    #[test]
    fn test_extract_status_endpoint_object_or_array() {
        let array = json!({ "icestats": { "source": [
            { "title": "Boards of Canada - Roygbiv" },
            { "title": "Other - Mount" }
        ] } });
        assert_eq!(
            extract_track(NowPlayingMode::StatusEndpoint, &array),
            Some(TrackInfo::new("Boards of Canada", "Roygbiv"))
        );

        let object = json!({ "icestats": { "source": { "artist": "Aphex Twin", "title": "Xtal" } } });
        assert_eq!(
            extract_track(NowPlayingMode::StatusEndpoint, &object),
            Some(TrackInfo::new("Aphex Twin", "Xtal"))
        );

        assert_eq!(extract_track(NowPlayingMode::StatusEndpoint, &json!({ "icestats": {} })), None);
    }

    #[test]
    fn test_writer_only_rewrites_on_change() {
        let dir = tempdir().unwrap();
        let paths = StationPaths::new(dir.path(), "alpha").unwrap();
        let mut writer = NowPlayingWriter::new(paths.clone());

        let track = TrackInfo::new("Artist", "Title");
        assert!(writer.publish(&track).unwrap());
        assert!(!writer.publish(&track).unwrap());
        assert_eq!(std::fs::read_to_string(paths.now_playing()).unwrap(), "Artist - Title");
        assert_eq!(std::fs::read_to_string(paths.artist()).unwrap(), "Artist");

        assert!(writer.publish(&TrackInfo::new("", "Station ID")).unwrap());
        assert_eq!(std::fs::read_to_string(paths.now_playing()).unwrap(), "Station ID");
        assert_eq!(std::fs::read_to_string(paths.artist()).unwrap(), "");
    }

    #[tokio::test]
    async fn test_probe_returns_raw_and_parsed() {
        let server = MockServer::start().await;
        let body = json!({ "now_playing": { "song": { "artist": "Khruangbin", "title": "Maria También" } } });
        Mock::given(method("GET"))
            .and(path("/api/nowplaying/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body.clone()))
            .mount(&server)
            .await;

        let source = api_source(format!("{}/api/nowplaying/1", server.uri()));
        let result = probe_now_playing(&source, Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.raw, body);
        assert_eq!(result.combined, "Khruangbin - Maria También");
    }

    #[tokio::test]
    async fn test_probe_reports_http_status_and_timeout() {
        let server = MockServer::start().await;
        Mock::given(path("/down"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let err = probe_now_playing(&api_source(format!("{}/down", server.uri())), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, NowPlayingError::Status(503)));

        let err = probe_now_playing(&api_source(format!("{}/slow", server.uri())), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, NowPlayingError::Timeout(_)));

        let err = probe_now_playing(&NowPlayingSource::default(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, NowPlayingError::NotConfigured));
    }

    #[tokio::test]
    async fn test_poller_publishes_and_stops() {
        let server = MockServer::start().await;
        Mock::given(path("/np"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({ "now_playing": { "song": { "artist": "Air", "title": "La Femme d'Argent" } } }),
            ))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let paths = StationPaths::new(dir.path(), "alpha").unwrap();
        let sink = Arc::new(RecordingSink::default());
        let poller = NowPlayingPoller::spawn(
            "st-1".to_string(),
            api_source(format!("{}/np", server.uri())),
            paths.clone(),
            Duration::from_secs(5),
            sink.clone(),
        )
        .unwrap();

        let mut published = false;
        for _ in 0..50 {
            if !sink.tracks.lock().unwrap().is_empty() {
                published = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(published);
        assert_eq!(
            std::fs::read_to_string(paths.now_playing()).unwrap(),
            "Air - La Femme d'Argent"
        );

        poller.stop();
        assert!(NowPlayingPoller::spawn(
            "st-1".to_string(),
            NowPlayingSource::default(),
            paths,
            Duration::from_secs(5),
            sink,
        )
        .is_none());
    }
}
