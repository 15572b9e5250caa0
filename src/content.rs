use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use camino::Utf8PathBuf;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::error::AccessionError;
use crate::metadata::LOCATION_SCHEME;

/// Content-store lookup for file artifacts referenced by the run.
///
/// Implementations must be consistent: repeated calls for the same location
/// return the same digest and size for the lifetime of a run.
pub trait ContentProvider: Send + Sync {
    /// Hex-encoded md5 digest of the object.
    fn hash(&self, location: &str) -> Result<String, AccessionError>;

    /// Object size in bytes.
    fn size(&self, location: &str) -> Result<u64, AccessionError>;

    /// Full object contents.
    fn read(&self, location: &str) -> Result<Vec<u8>, AccessionError>;

    /// Materializes the object on the local filesystem and returns its path.
    /// The caller owns (and removes) the file.
    fn download(&self, location: &str) -> Result<Utf8PathBuf, AccessionError>;
}

#[derive(Debug, Clone)]
struct ObjectMeta {
    md5_hex: String,
    size: u64,
    media_link: String,
}

/// Google Cloud Storage provider over the JSON API. Object metadata is
/// cached per location, so hash + size cost one roundtrip each distinct
/// location per run.
pub struct GcsContentProvider {
    client: Client,
    base_url: String,
    cache: Mutex<HashMap<String, ObjectMeta>>,
}

impl GcsContentProvider {
    pub fn new() -> Result<Self, AccessionError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("accessioner/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| AccessionError::ContentHttp(err.to_string()))?,
        );
        if let Ok(token) = std::env::var("GCS_OAUTH_TOKEN") {
            if !token.trim().is_empty() {
                headers.insert(
                    reqwest::header::AUTHORIZATION,
                    HeaderValue::from_str(&format!("Bearer {}", token.trim()))
                        .map_err(|err| AccessionError::ContentHttp(err.to_string()))?,
                );
            }
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|err| AccessionError::ContentHttp(err.to_string()))?;

        Ok(Self {
            client,
            base_url: "https://storage.googleapis.com/storage/v1".to_string(),
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn object_meta(&self, location: &str) -> Result<ObjectMeta, AccessionError> {
        if let Some(meta) = self.cache.lock().unwrap().get(location) {
            return Ok(meta.clone());
        }

        let (bucket, object) = split_location(location)?;
        let url = format!("{}/b/{}/o", self.base_url, bucket);
        let response = self
            .send_with_retries(|| self.client.get(&url).query(&[("prefix", object)]))?;
        if !response.status().is_success() {
            return Err(AccessionError::ContentLookup {
                location: location.to_string(),
                message: format!("object listing returned status {}", response.status()),
            });
        }

        let listing: serde_json::Value = response
            .json()
            .map_err(|err| AccessionError::ContentHttp(err.to_string()))?;
        let item = listing
            .get("items")
            .and_then(|items| items.as_array())
            .and_then(|items| {
                items.iter().find(|item| {
                    item.get("name").and_then(|name| name.as_str()) == Some(object)
                })
            })
            .ok_or_else(|| AccessionError::ContentLookup {
                location: location.to_string(),
                message: "object not found".to_string(),
            })?;

        let meta = ObjectMeta {
            md5_hex: md5_base64_to_hex(
                item.get("md5Hash")
                    .and_then(|value| value.as_str())
                    .ok_or_else(|| AccessionError::ContentLookup {
                        location: location.to_string(),
                        message: "object metadata has no md5Hash".to_string(),
                    })?,
            )
            .map_err(|message| AccessionError::ContentLookup {
                location: location.to_string(),
                message,
            })?,
            size: item
                .get("size")
                .and_then(|value| value.as_str())
                .and_then(|value| value.parse().ok())
                .ok_or_else(|| AccessionError::ContentLookup {
                    location: location.to_string(),
                    message: "object metadata has no size".to_string(),
                })?,
            media_link: item
                .get("mediaLink")
                .and_then(|value| value.as_str())
                .ok_or_else(|| AccessionError::ContentLookup {
                    location: location.to_string(),
                    message: "object metadata has no media link".to_string(),
                })?
                .to_string(),
        };

        tracing::debug!(location, size = meta.size, "resolved object metadata");
        self.cache
            .lock()
            .unwrap()
            .insert(location.to_string(), meta.clone());
        Ok(meta)
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, AccessionError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Err(AccessionError::ContentHttp(err.to_string()));
                }
            }
        }
    }
}

impl ContentProvider for GcsContentProvider {
    fn hash(&self, location: &str) -> Result<String, AccessionError> {
        Ok(self.object_meta(location)?.md5_hex)
    }

    fn size(&self, location: &str) -> Result<u64, AccessionError> {
        Ok(self.object_meta(location)?.size)
    }

    fn read(&self, location: &str) -> Result<Vec<u8>, AccessionError> {
        let meta = self.object_meta(location)?;
        let response = self.send_with_retries(|| self.client.get(&meta.media_link))?;
        if !response.status().is_success() {
            return Err(AccessionError::ContentLookup {
                location: location.to_string(),
                message: format!("object download returned status {}", response.status()),
            });
        }
        let bytes = response
            .bytes()
            .map_err(|err| AccessionError::ContentHttp(err.to_string()))?;
        Ok(bytes.to_vec())
    }

    fn download(&self, location: &str) -> Result<Utf8PathBuf, AccessionError> {
        let contents = self.read(location)?;
        let mut temp = tempfile::Builder::new()
            .prefix("accessioner")
            .tempfile()
            .map_err(|err| AccessionError::Filesystem(err.to_string()))?;
        temp.write_all(&contents)
            .map_err(|err| AccessionError::Filesystem(err.to_string()))?;
        let (_, path) = temp
            .keep()
            .map_err(|err| AccessionError::Filesystem(err.to_string()))?;
        Utf8PathBuf::from_path_buf(path)
            .map_err(|_| AccessionError::Filesystem("non-utf8 temp path".to_string()))
    }
}

/// Splits `gs://bucket/path/to/object` into bucket and object name.
pub fn split_location(location: &str) -> Result<(&str, &str), AccessionError> {
    let rest = location
        .strip_prefix(LOCATION_SCHEME)
        .ok_or_else(|| AccessionError::InvalidLocation(location.to_string()))?;
    let (bucket, object) = rest
        .split_once('/')
        .ok_or_else(|| AccessionError::InvalidLocation(location.to_string()))?;
    if bucket.is_empty() || object.is_empty() {
        return Err(AccessionError::InvalidLocation(location.to_string()));
    }
    Ok((bucket, object))
}

/// The store reports md5 digests base64-encoded; the catalog keys records by
/// the hex form.
fn md5_base64_to_hex(encoded: &str) -> Result<String, String> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|err| format!("invalid base64 md5: {err}"))?;
    Ok(hex::encode(bytes))
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn split_valid_location() {
        let (bucket, object) = split_location("gs://my-bucket/run/align/x.bam").unwrap();
        assert_eq!(bucket, "my-bucket");
        assert_eq!(object, "run/align/x.bam");
    }

    #[test]
    fn split_rejects_foreign_scheme() {
        let err = split_location("s3://bucket/key").unwrap_err();
        assert_matches!(err, AccessionError::InvalidLocation(_));
    }

    #[test]
    fn split_rejects_bucket_only() {
        let err = split_location("gs://bucket").unwrap_err();
        assert_matches!(err, AccessionError::InvalidLocation(_));
    }

    #[test]
    fn md5_decoding() {
        // base64 of the 16-byte digest d41d8cd98f00b204e9800998ecf8427e.
        let hex = md5_base64_to_hex("1B2M2Y8AsgTpgAmY7PhCfg==").unwrap();
        assert_eq!(hex, "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn md5_decoding_rejects_garbage() {
        assert!(md5_base64_to_hex("!!not-base64!!").is_err());
    }
}
