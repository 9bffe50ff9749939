//! Blob-store readers for OS image artifacts.
//!
//! Every build directory holds the same fixed set of artifacts. Readers are
//! blocking and are only used from the blocking pool.
//!
//! `BucketIndex` is the bucket-wide view used to find a build directory in
//! the first place.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Public object-storage endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com/";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Artifacts of one OS build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Artifact {
    Kernel,
    Root,
    MiniOs,
    Stateful,
}

impl Artifact {
    pub fn object_name(&self) -> &'static str {
        match self {
            Artifact::Kernel => "full_dev_part_KERN.bin.gz",
            Artifact::Root => "full_dev_part_ROOT.bin.gz",
            Artifact::MiniOs => "full_dev_part_MINIOS.bin.gz",
            Artifact::Stateful => "stateful.tgz",
        }
    }

    /// Artifacts every OS update needs.
    pub fn required() -> [Artifact; 3] {
        [Artifact::Kernel, Artifact::Root, Artifact::Stateful]
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.object_name())
    }
}

/// An open artifact: its size on the store and a stream of its bytes.
pub struct BlobReader {
    pub size: u64,
    pub reader: Box<dyn Read + Send>,
}

/// Source of build artifacts.
pub trait BlobStore: Send + Sync {
    /// Open `name` for streaming read.
    fn open(&self, name: &str) -> io::Result<BlobReader>;

    /// Size of `name`, or an error if it cannot be read.
    fn stat(&self, name: &str) -> io::Result<u64>;

    /// Human readable location of `name`, for logs and errors.
    fn describe(&self, name: &str) -> String;
}

/// Object-storage bucket read over HTTPS with a bearer token.
#[derive(Clone)]
pub struct GcsBlobStore {
    endpoint: Url,
    bucket: String,
    directory: String,
    token: String,
}

impl fmt::Debug for GcsBlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcsBlobStore")
            .field("endpoint", &self.endpoint.as_str())
            .field("bucket", &self.bucket)
            .field("directory", &self.directory)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl GcsBlobStore {
    pub fn new(bucket: &str, directory: &str, token: &str) -> io::Result<Self> {
        Self::with_endpoint(DEFAULT_ENDPOINT, bucket, directory, token)
    }

    pub fn with_endpoint(
        endpoint: &str,
        bucket: &str,
        directory: &str,
        token: &str,
    ) -> io::Result<Self> {
        Ok(Self {
            endpoint: base_url(endpoint)?,
            bucket: bucket.to_string(),
            directory: directory.trim_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    /// `<endpoint>/<bucket>/<directory>/<name>`
    pub fn object_url(&self, name: &str) -> io::Result<Url> {
        let mut url = self.endpoint.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "endpoint is not a base URL")
            })?;
            segments.pop_if_empty().push(&self.bucket);
            segments.extend(self.directory.split('/').filter(|s| !s.is_empty()));
            segments.push(name);
        }
        Ok(url)
    }

    fn request(&self, method: reqwest::Method, name: &str) -> io::Result<reqwest::blocking::Response> {
        authorized(method, self.object_url(name)?, &self.token, &self.describe(name))
    }
}

fn http_client() -> io::Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        // Images take minutes to stream.
        .timeout(None::<Duration>)
        .build()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}

fn authorized(
    method: reqwest::Method,
    url: Url,
    token: &str,
    what: &str,
) -> io::Result<reqwest::blocking::Response> {
    debug!("[blob] {} {}", method, url);
    let response = http_client()?
        .request(method, url)
        .header(AUTHORIZATION, format!("Bearer {}", token))
        .send()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    check_status(response.status(), what)?;
    Ok(response)
}

fn base_url(endpoint: &str) -> io::Result<Url> {
    let endpoint =
        Url::parse(endpoint).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    if endpoint.cannot_be_a_base() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("endpoint {} cannot hold object paths", endpoint),
        ));
    }
    Ok(endpoint)
}

fn check_status(status: StatusCode, what: &str) -> io::Result<()> {
    if status.is_success() {
        return Ok(());
    }
    let kind = match status {
        StatusCode::NOT_FOUND => io::ErrorKind::NotFound,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => io::ErrorKind::PermissionDenied,
        _ => io::ErrorKind::Other,
    };
    Err(io::Error::new(kind, format!("{}: HTTP {}", what, status)))
}

impl BlobStore for GcsBlobStore {
    fn open(&self, name: &str) -> io::Result<BlobReader> {
        let response = self.request(reqwest::Method::GET, name)?;
        let size = response.content_length().unwrap_or(0);
        Ok(BlobReader {
            size,
            reader: Box::new(response),
        })
    }

    fn stat(&self, name: &str) -> io::Result<u64> {
        let response = self.request(reqwest::Method::HEAD, name)?;
        // content_length() reports the empty HEAD body, read the header instead.
        let size = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(size)
    }

    fn describe(&self, name: &str) -> String {
        format!("gs://{}/{}/{}", self.bucket, self.directory, name)
    }
}

/// Artifacts in a local directory, e.g. a lab mirror.
#[derive(Debug, Clone)]
pub struct DirBlobStore {
    root: PathBuf,
}

impl DirBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl BlobStore for DirBlobStore {
    fn open(&self, name: &str) -> io::Result<BlobReader> {
        let file = File::open(self.root.join(name))?;
        let size = file.metadata()?.len();
        Ok(BlobReader {
            size,
            reader: Box::new(file),
        })
    }

    fn stat(&self, name: &str) -> io::Result<u64> {
        Ok(fs::metadata(self.root.join(name))?.len())
    }

    fn describe(&self, name: &str) -> String {
        self.root.join(name).display().to_string()
    }
}

// ============================================================================
// Bucket listing
// ============================================================================

/// Bucket-wide read access, used to pick a build directory.
pub trait BucketIndex: Send + Sync {
    /// Names directly below `prefix`, listed the way object storage lists
    /// with a `/` delimiter: objects by full name, sub-directories with a
    /// trailing `/`.
    fn list(&self, prefix: &str) -> io::Result<Vec<String>>;

    /// Read a small object, such as a `LATEST-*` pointer file.
    fn read_to_string(&self, name: &str) -> io::Result<String>;

    fn stat(&self, name: &str) -> io::Result<u64>;

    fn describe(&self, name: &str) -> String;
}

/// One page of a JSON API object listing.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListPage {
    #[serde(default)]
    items: Vec<ListedObject>,
    #[serde(default)]
    prefixes: Vec<String>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListedObject {
    name: String,
}

fn parse_list_page(body: &str) -> io::Result<ListPage> {
    serde_json::from_str(body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// A whole object-storage bucket, read over HTTPS with a bearer token.
#[derive(Clone)]
pub struct GcsBucket {
    endpoint: Url,
    bucket: String,
    token: String,
}

impl fmt::Debug for GcsBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcsBucket")
            .field("endpoint", &self.endpoint.as_str())
            .field("bucket", &self.bucket)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl GcsBucket {
    pub fn new(bucket: &str, token: &str) -> io::Result<Self> {
        Self::with_endpoint(DEFAULT_ENDPOINT, bucket, token)
    }

    pub fn with_endpoint(endpoint: &str, bucket: &str, token: &str) -> io::Result<Self> {
        Ok(Self {
            endpoint: base_url(endpoint)?,
            bucket: bucket.to_string(),
            token: token.to_string(),
        })
    }

    /// `<endpoint>/<bucket>/<name>`
    pub fn object_url(&self, name: &str) -> io::Result<Url> {
        let mut url = self.endpoint.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "endpoint is not a base URL")
            })?;
            segments.pop_if_empty().push(&self.bucket);
            segments.extend(name.split('/').filter(|s| !s.is_empty()));
        }
        Ok(url)
    }

    /// `<endpoint>/storage/v1/b/<bucket>/o?prefix=..&delimiter=/`
    pub fn list_url(&self, prefix: &str, page_token: Option<&str>) -> io::Result<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "endpoint is not a base URL"))?
            .pop_if_empty()
            .extend(["storage", "v1", "b", self.bucket.as_str(), "o"]);
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("prefix", prefix)
                .append_pair("delimiter", "/")
                .append_pair("fields", "items(name),prefixes,nextPageToken");
            if let Some(token) = page_token {
                query.append_pair("pageToken", token);
            }
        }
        Ok(url)
    }
}

impl BucketIndex for GcsBucket {
    fn list(&self, prefix: &str) -> io::Result<Vec<String>> {
        let what = self.describe(&format!("{}*", prefix));
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let url = self.list_url(prefix, page_token.as_deref())?;
            let body = authorized(reqwest::Method::GET, url, &self.token, &what)?
                .text()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            let page = parse_list_page(&body)?;
            names.extend(page.prefixes);
            names.extend(page.items.into_iter().map(|o| o.name));
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(names)
    }

    fn read_to_string(&self, name: &str) -> io::Result<String> {
        authorized(reqwest::Method::GET, self.object_url(name)?, &self.token, &self.describe(name))?
            .text()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn stat(&self, name: &str) -> io::Result<u64> {
        let response = authorized(
            reqwest::Method::HEAD,
            self.object_url(name)?,
            &self.token,
            &self.describe(name),
        )?;
        Ok(response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    fn describe(&self, name: &str) -> String {
        format!("gs://{}/{}", self.bucket, name)
    }
}

/// A bucket mirrored into a local directory.
#[derive(Debug, Clone)]
pub struct DirBucket {
    root: PathBuf,
}

impl DirBucket {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, name: &str) -> PathBuf {
        name.split('/')
            .filter(|s| !s.is_empty())
            .fold(self.root.clone(), |path, s| path.join(s))
    }
}

impl BucketIndex for DirBucket {
    fn list(&self, prefix: &str) -> io::Result<Vec<String>> {
        let (dir, stem) = prefix.rsplit_once('/').unwrap_or(("", prefix));
        let entries = match fs::read_dir(self.path(dir)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(stem) {
                continue;
            }
            let full = if dir.is_empty() {
                name
            } else {
                format!("{}/{}", dir, name)
            };
            if entry.file_type()?.is_dir() {
                names.push(format!("{}/", full));
            } else {
                names.push(full);
            }
        }
        names.sort();
        Ok(names)
    }

    fn read_to_string(&self, name: &str) -> io::Result<String> {
        fs::read_to_string(self.path(name))
    }

    fn stat(&self, name: &str) -> io::Result<u64> {
        Ok(fs::metadata(self.path(name))?.len())
    }

    fn describe(&self, name: &str) -> String {
        self.path(name).display().to_string()
    }
}
