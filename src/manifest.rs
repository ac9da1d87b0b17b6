use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{BotError, Result};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// File extensions picked up when the manifest is a directory.
pub const AUDIO_EXTENSIONS: &[&str] = &[
    "mp3", "ogg", "oga", "opus", "flac", "wav", "m4a", "aac", "webm", "mka",
];

/// Ordered, non-empty list of track identifiers (file names or URLs).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackList(Vec<String>);

impl TrackList {
    pub fn new(tracks: Vec<String>) -> Result<Self> {
        if tracks.is_empty() {
            return Err(BotError::Config("track list is empty".to_string()));
        }
        Ok(Self(tracks))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always `false` for a constructed list.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// Where the track list comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestLocation {
    Static(Vec<String>),
    Directory(PathBuf),
    File(PathBuf),
    Remote(String),
}

impl ManifestLocation {
    pub fn parse(raw: &str) -> Self {
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return ManifestLocation::Remote(raw.to_string());
        }
        let path = PathBuf::from(raw);
        if path.is_dir() {
            ManifestLocation::Directory(path)
        } else {
            ManifestLocation::File(path)
        }
    }

    pub fn directory(&self) -> Option<&Path> {
        match self {
            ManifestLocation::Directory(dir) => Some(dir),
            _ => None,
        }
    }
}

impl std::fmt::Display for ManifestLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManifestLocation::Static(tracks) => write!(f, "static list ({} tracks)", tracks.len()),
            ManifestLocation::Directory(dir) => write!(f, "directory {}", dir.display()),
            ManifestLocation::File(path) => write!(f, "file {}", path.display()),
            ManifestLocation::Remote(url) => write!(f, "{}", url),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ManifestDocument {
    List(Vec<ManifestEntry>),
    Wrapped {
        #[serde(alias = "tracks", alias = "items")]
        files: Vec<ManifestEntry>,
    },
}

// Entries may carry extra metadata (book, chapter, timestamps); only the address matters here.
#[derive(Deserialize)]
#[serde(untagged)]
enum ManifestEntry {
    Name(String),
    Described {
        #[serde(alias = "file", alias = "path")]
        url: String,
    },
}

/// Normalizes a manifest body into a plain ordered list of identifiers.
pub fn parse_manifest(body: &str) -> Result<TrackList> {
    let document: ManifestDocument = serde_json::from_str(body)
        .map_err(|e| BotError::ManifestParse(format!("unexpected manifest shape: {}", e)))?;
    let entries = match document {
        ManifestDocument::List(entries) => entries,
        ManifestDocument::Wrapped { files } => files,
    };
    let tracks: Vec<String> = entries
        .into_iter()
        .map(|entry| match entry {
            ManifestEntry::Name(name) => name,
            ManifestEntry::Described { url } => url,
        })
        .filter(|id| !id.trim().is_empty())
        .collect();
    if tracks.is_empty() {
        return Err(BotError::ManifestParse("manifest lists no tracks".to_string()));
    }
    TrackList::new(tracks)
}

/// Resolves the track list with a bounded number of attempts.
pub struct ManifestResolver {
    location: ManifestLocation,
    max_attempts: u32,
    retry_delay: Duration,
    client: reqwest::Client,
}

impl ManifestResolver {
    pub fn new(location: ManifestLocation) -> Self {
        Self {
            location,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_retry(mut self, max_attempts: u32, retry_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    pub fn location(&self) -> &ManifestLocation {
        &self.location
    }

    pub async fn resolve(&self) -> Result<TrackList> {
        let mut last_error = None;
        for attempt in 1..=self.max_attempts {
            match self.fetch_once().await {
                Ok(tracks) => {
                    tracing::info!(
                        "Loaded {} track(s) from {} (attempt {}/{})",
                        tracks.len(),
                        self.location,
                        attempt,
                        self.max_attempts
                    );
                    return Ok(tracks);
                }
                Err(e) => {
                    tracing::warn!(
                        "Manifest attempt {}/{} for {} failed: {}",
                        attempt,
                        self.max_attempts,
                        self.location,
                        e
                    );
                    last_error = Some(e);
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }
        Err(BotError::Fetch {
            attempts: self.max_attempts,
            reason: last_error.map_or_else(|| "no attempt made".to_string(), |e| e.to_string()),
        })
    }

    async fn fetch_once(&self) -> Result<TrackList> {
        match &self.location {
            ManifestLocation::Static(tracks) => TrackList::new(tracks.clone()),
            ManifestLocation::Directory(dir) => list_directory(dir).await,
            ManifestLocation::File(path) => {
                let body = tokio::fs::read_to_string(path).await?;
                parse_manifest(&body)
            }
            ManifestLocation::Remote(url) => {
                let body = self
                    .client
                    .get(url)
                    .send()
                    .await?
                    .error_for_status()?
                    .text()
                    .await?;
                parse_manifest(&body)
            }
        }
    }
}

async fn list_directory(dir: &Path) -> Result<TrackList> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || !is_audio_file(&name) {
            continue;
        }
        // Follows symlinks; a dangling link is skipped.
        match tokio::fs::metadata(entry.path()).await {
            Ok(meta) if meta.is_file() => names.push(name),
            Ok(_) => {}
            Err(e) => tracing::debug!("Skipping {}: {}", entry.path().display(), e),
        }
    }
    names.sort();
    if names.is_empty() {
        return Err(BotError::ManifestParse(format!(
            "no audio files in {}",
            dir.display()
        )));
    }
    TrackList::new(names)
}

fn is_audio_file(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| AUDIO_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &TrackList) -> Vec<&str> {
        list.iter().collect()
    }

    #[test]
    fn parses_bare_list() {
        let list = parse_manifest(r#"["a.mp3", "b.mp3"]"#).unwrap();
        assert_eq!(ids(&list), vec!["a.mp3", "b.mp3"]);
    }

    #[test]
    fn parses_files_object() {
        let list = parse_manifest(r#"{"files": ["x.ogg", "y.ogg"], "version": 2}"#).unwrap();
        assert_eq!(ids(&list), vec!["x.ogg", "y.ogg"]);
    }

    #[test]
    fn parses_described_entries() {
        let body = r#"[
            {"book": "Matthew", "chapter": 1, "url": "https://cdn/mat1.ogg"},
            {"book": "Matthew", "chapter": 2, "url": "https://cdn/mat2.ogg"}
        ]"#;
        let list = parse_manifest(body).unwrap();
        assert_eq!(ids(&list), vec!["https://cdn/mat1.ogg", "https://cdn/mat2.ogg"]);
    }

    #[test]
    fn rejects_empty_and_non_sequences() {
        assert!(matches!(parse_manifest("[]"), Err(BotError::ManifestParse(_))));
        assert!(matches!(parse_manifest(r#"{"files": []}"#), Err(BotError::ManifestParse(_))));
        assert!(matches!(parse_manifest(r#""a.mp3""#), Err(BotError::ManifestParse(_))));
        assert!(matches!(parse_manifest(r#"{"count": 3}"#), Err(BotError::ManifestParse(_))));
        assert!(matches!(parse_manifest("not json"), Err(BotError::ManifestParse(_))));
    }

    #[test]
    fn track_list_rejects_empty() {
        assert!(matches!(TrackList::new(Vec::new()), Err(BotError::Config(_))));
    }

    #[test]
    fn location_detection() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            ManifestLocation::parse("https://host/manifest.json"),
            ManifestLocation::Remote("https://host/manifest.json".into())
        );
        assert_eq!(
            ManifestLocation::parse(dir.path().to_str().unwrap()),
            ManifestLocation::Directory(dir.path().to_path_buf())
        );
        assert_eq!(
            ManifestLocation::parse("playlist.json"),
            ManifestLocation::File(PathBuf::from("playlist.json"))
        );
    }

    #[tokio::test]
    async fn lists_directory_sorted_audio_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("02.mp3"), b"").unwrap();
        std::fs::write(dir.path().join("01.OGG"), b"").unwrap();
        std::fs::write(dir.path().join(".hidden.mp3"), b"").unwrap();
        std::fs::write(dir.path().join("cover.jpg"), b"").unwrap();
        std::fs::write(dir.path().join("README"), b"").unwrap();
        std::fs::create_dir(dir.path().join("sub.mp3")).unwrap();

        let resolver = ManifestResolver::new(ManifestLocation::Directory(dir.path().to_path_buf()));
        let list = resolver.resolve().await.unwrap();
        assert_eq!(ids(&list), vec!["01.OGG", "02.mp3"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn directory_listing_follows_symlinks() {
        let library = tempfile::tempdir().unwrap();
        std::fs::write(library.path().join("real.flac"), b"").unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(library.path().join("real.flac"), dir.path().join("linked.flac"))
            .unwrap();
        std::os::unix::fs::symlink(library.path().join("gone.mp3"), dir.path().join("dangling.mp3"))
            .unwrap();

        let resolver = ManifestResolver::new(ManifestLocation::Directory(dir.path().to_path_buf()));
        assert_eq!(ids(&resolver.resolve().await.unwrap()), vec!["linked.flac"]);
    }

    #[tokio::test]
    async fn reads_local_manifest_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, r#"{"files": ["one.mp3"]}"#).unwrap();

        let resolver = ManifestResolver::new(ManifestLocation::File(path));
        assert_eq!(ids(&resolver.resolve().await.unwrap()), vec!["one.mp3"]);
    }

    #[tokio::test]
    async fn exhausts_retries_then_fails() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = ManifestResolver::new(ManifestLocation::File(dir.path().join("missing.json")))
            .with_retry(2, Duration::from_millis(5));

        match resolver.resolve().await {
            Err(BotError::Fetch { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected fetch error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn empty_manifest_is_a_fetch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, "[]").unwrap();

        let resolver = ManifestResolver::new(ManifestLocation::File(path))
            .with_retry(1, Duration::from_millis(1));
        assert!(matches!(resolver.resolve().await, Err(BotError::Fetch { attempts: 1, .. })));
    }

    #[tokio::test]
    async fn static_list_resolves_without_io() {
        let resolver =
            ManifestResolver::new(ManifestLocation::Static(vec!["a".into(), "b".into()]));
        assert_eq!(ids(&resolver.resolve().await.unwrap()), vec!["a", "b"]);
    }
}
