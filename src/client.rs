use anyhow::{anyhow, Context, Result};
use rand::{distributions::Alphanumeric, Rng};
use reqwest::blocking::Client;
use serde::{Deserialize, Deserializer};
use std::io::Read;
use std::time::Duration;

use crate::config::{AuthMode, ServerConfig};

/// A top-level music root on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    pub id: String,
    pub name: String,
}

/// One artist entry from a collection's index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtistEntry {
    pub id: String,
    pub name: String,
}

/// Artist index for one collection, with the server's modification watermark.
#[derive(Debug, Clone)]
pub struct ArtistIndex {
    pub last_modified: u64,
    pub artists: Vec<ArtistEntry>,
}

/// One child of a remote directory: either a sub-directory or a song.
#[derive(Debug, Clone, Default)]
pub struct Child {
    pub id: String,
    pub title: String,
    pub is_dir: bool,
    /// Path relative to the collection root, forward-slash separated.
    pub path: String,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub year: Option<i32>,
    pub track: Option<u32>,
    pub genre: Option<String>,
    pub duration_secs: Option<u64>,
    pub bit_rate: Option<u32>,
    pub size: Option<u64>,
    pub cover_art: Option<String>,
    pub is_video: bool,
}

/// Blocking view of the remote catalog. Every public catalog operation in
/// this crate goes through this seam, so tests can drive the whole stack
/// with an in-memory implementation.
pub trait CatalogClient: Send + Sync {
    fn ping(&self) -> Result<()>;
    fn list_collections(&self) -> Result<Vec<Collection>>;
    fn list_artist_index(&self, collection_id: &str) -> Result<ArtistIndex>;
    fn list_directory(&self, folder_id: &str) -> Result<Vec<Child>>;
    fn fetch_cover_art(&self, file_id: &str) -> Result<Vec<u8>>;
    fn fetch_stream(&self, file_id: &str) -> Result<Box<dyn Read + Send>>;
}

// --- Subsonic REST implementation ---

const CLIENT_NAME: &str = "subfs";

/// Ids come back as strings or bare numbers depending on the server.
fn de_id<'de, D>(de: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(de)?;
    match value {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("expected string or number id")),
    }
}

fn de_opt_id<'de, D>(de: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(de)?;
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        _ => Err(serde::de::Error::custom("expected string or number id")),
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "subsonic-response")]
    response: SubsonicResponse,
}

#[derive(Debug, Deserialize)]
struct SubsonicResponse {
    status: String,
    error: Option<SubsonicError>,
    #[serde(rename = "musicFolders")]
    music_folders: Option<MusicFolders>,
    indexes: Option<Indexes>,
    directory: Option<Directory>,
}

#[derive(Debug, Deserialize)]
struct SubsonicError {
    code: i32,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MusicFolders {
    #[serde(rename = "musicFolder", default)]
    music_folder: Vec<MusicFolder>,
}

#[derive(Debug, Deserialize)]
struct MusicFolder {
    #[serde(deserialize_with = "de_id")]
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct Indexes {
    #[serde(rename = "lastModified", default)]
    last_modified: u64,
    #[serde(default)]
    index: Vec<IndexGroup>,
}

#[derive(Debug, Deserialize)]
struct IndexGroup {
    #[serde(default)]
    artist: Vec<IndexArtist>,
}

#[derive(Debug, Deserialize)]
struct IndexArtist {
    #[serde(deserialize_with = "de_id")]
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct Directory {
    #[serde(default)]
    child: Vec<ChildDto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChildDto {
    #[serde(deserialize_with = "de_id")]
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    is_dir: bool,
    #[serde(default)]
    path: String,
    artist: Option<String>,
    album: Option<String>,
    year: Option<i32>,
    track: Option<u32>,
    genre: Option<String>,
    duration: Option<u64>,
    bit_rate: Option<u32>,
    size: Option<u64>,
    #[serde(default, deserialize_with = "de_opt_id")]
    cover_art: Option<String>,
    #[serde(default)]
    is_video: bool,
}

impl From<ChildDto> for Child {
    fn from(dto: ChildDto) -> Self {
        Child {
            id: dto.id,
            title: dto.title,
            is_dir: dto.is_dir,
            path: dto.path,
            artist: dto.artist,
            album: dto.album,
            year: dto.year,
            track: dto.track,
            genre: dto.genre,
            duration_secs: dto.duration,
            bit_rate: dto.bit_rate,
            size: dto.size,
            cover_art: dto.cover_art,
            is_video: dto.is_video,
        }
    }
}

/// REST client against a Subsonic-compatible server (Subsonic, Navidrome,
/// Airsonic...). All calls are blocking; the service layer depends on that.
pub struct SubsonicClient {
    http: Client,
    base_url: String,
    username: String,
    password: String,
    auth_mode: AuthMode,
    api_version: String,
}

impl SubsonicClient {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            auth_mode: config.auth_mode,
            api_version: config.api_version.clone(),
        })
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/rest/{}.view", self.base_url, method)
    }

    /// Common query params: user, protocol version, client name, json format,
    /// and whichever auth scheme the config selects.
    fn auth_params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("u".to_string(), self.username.clone()),
            ("v".to_string(), self.api_version.clone()),
            ("c".to_string(), CLIENT_NAME.to_string()),
            ("f".to_string(), "json".to_string()),
        ];
        match self.auth_mode {
            AuthMode::Token => {
                let salt: String = rand::thread_rng()
                    .sample_iter(&Alphanumeric)
                    .take(12)
                    .map(char::from)
                    .collect();
                let token = format!("{:x}", md5::compute(format!("{}{}", self.password, salt)));
                params.push(("t".to_string(), token));
                params.push(("s".to_string(), salt));
            }
            AuthMode::HexPassword => {
                let enc = format!("enc:{}", hex::encode(self.password.as_bytes()));
                params.push(("p".to_string(), enc));
            }
        }
        params
    }

    fn call(&self, method: &str, extra: &[(&str, &str)]) -> Result<SubsonicResponse> {
        let mut params = self.auth_params();
        for (k, v) in extra {
            params.push((k.to_string(), v.to_string()));
        }
        tracing::debug!(method, "catalog request");
        let resp = self
            .http
            .get(self.endpoint(method))
            .query(&params)
            .send()
            .with_context(|| format!("Request to {} failed", method))?
            .error_for_status()
            .with_context(|| format!("Server rejected {}", method))?;
        let envelope: Envelope = resp
            .json()
            .with_context(|| format!("Malformed response from {}", method))?;
        let response = envelope.response;
        if response.status != "ok" {
            let (code, message) = response
                .error
                .map(|e| (e.code, e.message.unwrap_or_default()))
                .unwrap_or((0, String::new()));
            return Err(anyhow!("{} failed: error {} {}", method, code, message));
        }
        Ok(response)
    }

    /// Raw binary endpoint (cover art, stream). No JSON envelope; a failed
    /// request surfaces as an HTTP status error.
    fn call_binary(&self, method: &str, id: &str) -> Result<reqwest::blocking::Response> {
        let mut params = self.auth_params();
        params.push(("id".to_string(), id.to_string()));
        let resp = self
            .http
            .get(self.endpoint(method))
            .query(&params)
            .send()
            .with_context(|| format!("Request to {} failed", method))?
            .error_for_status()
            .with_context(|| format!("Server rejected {}", method))?;
        Ok(resp)
    }
}

impl CatalogClient for SubsonicClient {
    fn ping(&self) -> Result<()> {
        self.call("ping", &[])?;
        Ok(())
    }

    fn list_collections(&self) -> Result<Vec<Collection>> {
        let response = self.call("getMusicFolders", &[])?;
        let folders = response
            .music_folders
            .ok_or_else(|| anyhow!("getMusicFolders returned no folder list"))?;
        Ok(folders
            .music_folder
            .into_iter()
            .map(|f| Collection {
                id: f.id,
                name: f.name,
            })
            .collect())
    }

    fn list_artist_index(&self, collection_id: &str) -> Result<ArtistIndex> {
        let response = self.call("getIndexes", &[("musicFolderId", collection_id)])?;
        let indexes = response
            .indexes
            .ok_or_else(|| anyhow!("getIndexes returned no index"))?;
        let artists = indexes
            .index
            .into_iter()
            .flat_map(|group| group.artist)
            .map(|a| ArtistEntry {
                id: a.id,
                name: a.name,
            })
            .collect();
        Ok(ArtistIndex {
            last_modified: indexes.last_modified,
            artists,
        })
    }

    fn list_directory(&self, folder_id: &str) -> Result<Vec<Child>> {
        let response = self.call("getMusicDirectory", &[("id", folder_id)])?;
        let directory = response
            .directory
            .ok_or_else(|| anyhow!("getMusicDirectory returned no directory"))?;
        Ok(directory.child.into_iter().map(Child::from).collect())
    }

    fn fetch_cover_art(&self, file_id: &str) -> Result<Vec<u8>> {
        let resp = self.call_binary("getCoverArt", file_id)?;
        let bytes = resp.bytes().context("Failed to read cover art body")?;
        Ok(bytes.to_vec())
    }

    fn fetch_stream(&self, file_id: &str) -> Result<Box<dyn Read + Send>> {
        let resp = self.call_binary("stream", file_id)?;
        Ok(Box::new(resp))
    }
}
