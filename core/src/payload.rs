//! Request and response bodies.
//!
//! # Design
//! A `Payload` is either in-memory bytes, a file on disk, or a single-use
//! byte stream. Bytes and files can be opened any number of times, which is
//! what makes a command replayable after a failure. Streams are handed out
//! once; clones share the same slot so a consumed stream stays consumed for
//! every holder.
//!
//! Content headers (type, length, MD5, ...) live in `ContentMetadata` rather
//! than in the header list of the enclosing message. The transport renders
//! them with `ContentMetadata::to_headers` when building the native request.

use std::fmt;
use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use md5::{Digest, Md5};

/// Reader type handed out by `Payload::open`.
pub type BoxedReader = Box<dyn Read + Send>;

pub const CONTENT_TYPE: &str = "Content-Type";
pub const CONTENT_LENGTH: &str = "Content-Length";
pub const CONTENT_MD5: &str = "Content-MD5";
pub const CONTENT_DISPOSITION: &str = "Content-Disposition";
pub const CONTENT_ENCODING: &str = "Content-Encoding";
pub const CONTENT_LANGUAGE: &str = "Content-Language";
pub const EXPIRES: &str = "Expires";

/// Headers that are carried by `ContentMetadata` instead of the message.
pub const CONTENT_HEADERS: [&str; 7] = [
    CONTENT_TYPE,
    CONTENT_LENGTH,
    CONTENT_MD5,
    CONTENT_DISPOSITION,
    CONTENT_ENCODING,
    CONTENT_LANGUAGE,
    EXPIRES,
];

/// Describes the body independently of how its bytes are stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentMetadata {
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub content_md5: Option<[u8; 16]>,
    pub content_disposition: Option<String>,
    pub content_encoding: Option<String>,
    pub content_language: Option<String>,
    pub expires: Option<String>,
}

impl ContentMetadata {
    /// Render the populated fields as HTTP headers, in a stable order.
    pub fn to_headers(&self) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        let mut push = |name: &str, value: Option<String>| {
            if let Some(value) = value {
                headers.push((name.to_string(), value));
            }
        };
        push(CONTENT_TYPE, self.content_type.clone());
        push(CONTENT_LENGTH, self.content_length.map(|len| len.to_string()));
        push(CONTENT_MD5, self.content_md5.map(|md5| STANDARD.encode(md5)));
        push(CONTENT_DISPOSITION, self.content_disposition.clone());
        push(CONTENT_ENCODING, self.content_encoding.clone());
        push(CONTENT_LANGUAGE, self.content_language.clone());
        push(EXPIRES, self.expires.clone());
        headers
    }

    /// Collect content metadata from a received header list. Malformed
    /// length or MD5 values are ignored.
    pub fn from_headers(headers: &[(String, String)]) -> Self {
        let find = |name: &str| {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
        };
        Self {
            content_type: find(CONTENT_TYPE),
            content_length: find(CONTENT_LENGTH).and_then(|v| v.trim().parse().ok()),
            content_md5: find(CONTENT_MD5).and_then(|v| decode_md5(&v)),
            content_disposition: find(CONTENT_DISPOSITION),
            content_encoding: find(CONTENT_ENCODING),
            content_language: find(CONTENT_LANGUAGE),
            expires: find(EXPIRES),
        }
    }
}

fn decode_md5(value: &str) -> Option<[u8; 16]> {
    let raw = STANDARD.decode(value.trim()).ok()?;
    raw.try_into().ok()
}

#[derive(Clone)]
enum Content {
    Bytes(Bytes),
    File(PathBuf),
    Stream(Arc<Mutex<Option<BoxedReader>>>),
}

/// Body of an HTTP request or response.
#[derive(Clone)]
pub struct Payload {
    content: Content,
    metadata: ContentMetadata,
}

impl Payload {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let metadata = ContentMetadata {
            content_length: Some(bytes.len() as u64),
            ..ContentMetadata::default()
        };
        Self {
            content: Content::Bytes(bytes),
            metadata,
        }
    }

    pub fn from_string(text: impl Into<String>) -> Self {
        let mut payload = Self::from_bytes(Bytes::from(text.into()));
        payload.metadata.content_type = Some("text/plain; charset=utf-8".to_string());
        payload
    }

    /// Payload backed by a file. The length is taken from the file system
    /// now; the file is opened again every time the payload is sent.
    pub fn from_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let len = std::fs::metadata(&path)?.len();
        Ok(Self {
            content: Content::File(path),
            metadata: ContentMetadata {
                content_length: Some(len),
                ..ContentMetadata::default()
            },
        })
    }

    /// Single-use payload. Without a length the request must be sent with
    /// chunked transfer encoding.
    pub fn from_reader(reader: impl Read + Send + 'static, content_length: Option<u64>) -> Self {
        Self {
            content: Content::Stream(Arc::new(Mutex::new(Some(Box::new(reader))))),
            metadata: ContentMetadata {
                content_length,
                ..ContentMetadata::default()
            },
        }
    }

    pub fn metadata(&self) -> &ContentMetadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut ContentMetadata {
        &mut self.metadata
    }

    /// Metadata rendered as the headers that travel with this payload.
    pub fn metadata_headers(&self) -> Vec<(String, String)> {
        self.metadata.to_headers()
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.metadata.content_type = Some(content_type.into());
        self
    }

    pub fn is_repeatable(&self) -> bool {
        !matches!(self.content, Content::Stream(_))
    }

    /// The in-memory bytes, if this payload holds any.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match &self.content {
            Content::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn file_path(&self) -> Option<&Path> {
        match &self.content {
            Content::File(path) => Some(path),
            _ => None,
        }
    }

    /// Open a reader over the content. Streams can be opened once.
    pub fn open(&self) -> io::Result<BoxedReader> {
        match &self.content {
            Content::Bytes(bytes) => Ok(Box::new(Cursor::new(bytes.clone()))),
            Content::File(path) => Ok(Box::new(File::open(path)?)),
            Content::Stream(slot) => lock(slot)?
                .take()
                .ok_or_else(|| io::Error::other("payload stream was already consumed")),
        }
    }

    /// Compute the MD5 of the content and record it in the metadata.
    pub fn calculate_md5(&mut self) -> io::Result<[u8; 16]> {
        if !self.is_repeatable() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot calculate the MD5 of a single-use stream",
            ));
        }
        let mut reader = self.open()?;
        let mut hasher = Md5::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let mut digest = [0u8; 16];
        digest.copy_from_slice(&hasher.finalize());
        self.metadata.content_md5 = Some(digest);
        Ok(digest)
    }

    /// Drain the content into memory, turning the payload into a repeatable
    /// one with the same metadata.
    pub fn buffer(&mut self) -> io::Result<Bytes> {
        if let Content::Bytes(bytes) = &self.content {
            return Ok(bytes.clone());
        }
        let mut data = Vec::new();
        self.open()?.read_to_end(&mut data)?;
        let bytes = Bytes::from(data);
        if self.metadata.content_length.is_none() {
            self.metadata.content_length = Some(bytes.len() as u64);
        }
        self.content = Content::Bytes(bytes.clone());
        Ok(bytes)
    }

    /// Drop any stream still held. Repeatable payloads are unaffected.
    pub fn release(&self) {
        if let Content::Stream(slot) = &self.content {
            if let Ok(mut guard) = slot.lock() {
                guard.take();
            }
        }
    }

    /// Swap the underlying stream for a wrapped one. No-op for repeatable
    /// payloads.
    pub(crate) fn wrap_stream(&mut self, wrap: impl FnOnce(BoxedReader) -> BoxedReader) -> io::Result<()> {
        if let Content::Stream(slot) = &self.content {
            let mut guard = lock(slot)?;
            if let Some(inner) = guard.take() {
                *guard = Some(wrap(inner));
            }
        }
        Ok(())
    }
}

fn lock(slot: &Mutex<Option<BoxedReader>>) -> io::Result<std::sync::MutexGuard<'_, Option<BoxedReader>>> {
    slot.lock()
        .map_err(|_| io::Error::other("payload stream lock poisoned"))
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.content {
            Content::Bytes(bytes) => format!("bytes({})", bytes.len()),
            Content::File(path) => format!("file({})", path.display()),
            Content::Stream(_) => "stream".to_string(),
        };
        f.debug_struct("Payload")
            .field("content", &kind)
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl From<&'static str> for Payload {
    fn from(text: &'static str) -> Self {
        Payload::from_string(text)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::from_bytes(bytes)
    }
}
