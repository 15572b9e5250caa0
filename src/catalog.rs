use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AccessionError;

/// Lifecycle states under which an existing record may be resubmitted in
/// place rather than treated as current.
const SOFT_DELETED_STATUSES: [&str; 2] = ["deleted", "revoked"];

/// An opaque catalog record: a key/value mapping with typed accessors for
/// the handful of fields the engine reasons about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Value);

impl Record {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.as_str())
    }

    /// The record's catalog identifier.
    pub fn id(&self) -> Result<&str, AccessionError> {
        self.str_field("accession")
            .ok_or_else(|| AccessionError::MalformedRecord("record has no accession".to_string()))
    }

    /// The record's resource path, e.g. `/files/ENCFF000AAA/`.
    pub fn at_id(&self) -> Result<&str, AccessionError> {
        self.str_field("@id")
            .ok_or_else(|| AccessionError::MalformedRecord("record has no @id".to_string()))
    }

    pub fn status(&self) -> Option<&str> {
        self.str_field("status")
    }

    pub fn md5sum(&self) -> Option<&str> {
        self.str_field("md5sum")
    }

    pub fn output_type(&self) -> Option<&str> {
        self.str_field("output_type")
    }

    pub fn dataset(&self) -> Option<&str> {
        self.str_field("dataset")
    }

    pub fn is_soft_deleted(&self) -> bool {
        self.status()
            .map(|status| SOFT_DELETED_STATUSES.contains(&status))
            .unwrap_or(false)
    }

    /// First biological replicate number, as attached-quality-metric
    /// payloads address per-replicate sections of the run's QC report.
    pub fn bio_replicate(&self) -> Result<u64, AccessionError> {
        self.0
            .get("biological_replicates")
            .and_then(|reps| reps.as_array())
            .and_then(|reps| reps.first())
            .and_then(|rep| rep.as_u64())
            .ok_or_else(|| {
                AccessionError::MalformedRecord("record has no biological replicate".to_string())
            })
    }

    /// The step-run reference, which the catalog returns either embedded or
    /// as a bare path.
    pub fn step_run_id(&self) -> Option<&str> {
        match self.0.get("step_run") {
            Some(Value::String(path)) => Some(path),
            Some(Value::Object(embedded)) => {
                embedded.get("@id").and_then(|value| value.as_str())
            }
            _ => None,
        }
    }

    /// True when a quality metric whose `@type` includes `type_name` is
    /// already attached.
    pub fn has_quality_metric(&self, type_name: &str) -> bool {
        self.0
            .get("quality_metrics")
            .and_then(|metrics| metrics.as_array())
            .map(|metrics| {
                metrics.iter().any(|metric| {
                    metric
                        .get("@type")
                        .and_then(|types| types.as_array())
                        .map(|types| {
                            types
                                .iter()
                                .filter_map(|entry| entry.as_str())
                                .any(|entry| entry.contains(type_name))
                        })
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    }
}

/// Remote metadata catalog. Records are searched by field equality, created
/// under a profile (record type), and patched by identifier.
pub trait CatalogClient: Send + Sync {
    /// Field-equality search. An empty result is not an error.
    fn find(&self, query: &[(&str, &str)]) -> Result<Vec<Record>, AccessionError>;

    /// Creates a record of the given profile. A duplicate rejection maps to
    /// [`AccessionError::CatalogConflict`].
    fn create(&self, profile: &str, payload: &Value) -> Result<Record, AccessionError>;

    /// Patches an existing record.
    fn update(&self, identifier: &str, payload: &Value) -> Result<Record, AccessionError>;

    /// Fetches one record by identifier or alias; `None` when absent.
    fn get(&self, identifier: &str) -> Result<Option<Record>, AccessionError>;

    /// Resolves the submitting identity. Failing here is fatal at startup.
    fn current_user(&self) -> Result<String, AccessionError>;
}

/// Blocking REST client for an ENCODE-portal style catalog, authenticated
/// with a key/secret pair over basic auth.
pub struct CatalogHttpClient {
    client: Client,
    base_url: String,
    key: String,
    secret: String,
}

impl CatalogHttpClient {
    pub fn new(server: &str, key: String, secret: String) -> Result<Self, AccessionError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("accessioner/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| AccessionError::CatalogHttp(err.to_string()))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| AccessionError::CatalogHttp(err.to_string()))?;

        Ok(Self {
            client,
            base_url: resolve_server(server),
            key,
            secret,
        })
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
            let request = make_req().basic_auth(&self.key, Some(&self.secret));
            match request.send() {
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
                    return Err(AccessionError::CatalogHttp(err.to_string()));
                }
            }
        }
    }

    /// Mutation responses wrap the affected record in an `@graph` array;
    /// reads return it bare.
    fn unwrap_record(body: Value) -> Result<Record, AccessionError> {
        match body.get("@graph").and_then(|graph| graph.as_array()) {
            Some(graph) => graph
                .first()
                .cloned()
                .map(Record::new)
                .ok_or_else(|| {
                    AccessionError::MalformedRecord("empty @graph in response".to_string())
                }),
            None => Ok(Record::new(body)),
        }
    }

    fn error_from_response(
        identifier: &str,
        response: reqwest::blocking::Response,
    ) -> AccessionError {
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "catalog request failed".to_string());
        if status == 409 {
            return AccessionError::CatalogConflict {
                identifier: identifier.to_string(),
            };
        }
        AccessionError::CatalogStatus { status, message }
    }
}

impl CatalogClient for CatalogHttpClient {
    fn find(&self, query: &[(&str, &str)]) -> Result<Vec<Record>, AccessionError> {
        let url = format!("{}/search/", self.base_url);
        let response = self.send_with_retries(|| {
            self.client
                .get(&url)
                .query(query)
                .query(&[("format", "json"), ("frame", "object")])
        })?;
        // The portal answers an empty search with 404 rather than an empty
        // result page.
        if response.status().as_u16() == 404 {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(Self::error_from_response("search", response));
        }
        let body: Value = response
            .json()
            .map_err(|err| AccessionError::CatalogHttp(err.to_string()))?;
        let records = body
            .get("@graph")
            .and_then(|graph| graph.as_array())
            .map(|graph| graph.iter().cloned().map(Record::new).collect())
            .unwrap_or_default();
        Ok(records)
    }

    fn create(&self, profile: &str, payload: &Value) -> Result<Record, AccessionError> {
        let url = format!("{}/{}/", self.base_url, profile);
        tracing::debug!(profile, "posting record");
        let response = self.send_with_retries(|| self.client.post(&url).json(payload))?;
        if !response.status().is_success() {
            return Err(Self::error_from_response(profile, response));
        }
        let body: Value = response
            .json()
            .map_err(|err| AccessionError::CatalogHttp(err.to_string()))?;
        Self::unwrap_record(body)
    }

    fn update(&self, identifier: &str, payload: &Value) -> Result<Record, AccessionError> {
        let url = format!("{}/{}", self.base_url, identifier.trim_start_matches('/'));
        tracing::debug!(identifier, "patching record");
        let response = self.send_with_retries(|| self.client.patch(&url).json(payload))?;
        if !response.status().is_success() {
            return Err(Self::error_from_response(identifier, response));
        }
        let body: Value = response
            .json()
            .map_err(|err| AccessionError::CatalogHttp(err.to_string()))?;
        Self::unwrap_record(body)
    }

    fn get(&self, identifier: &str) -> Result<Option<Record>, AccessionError> {
        let url = format!("{}/{}", self.base_url, identifier.trim_start_matches('/'));
        let response =
            self.send_with_retries(|| self.client.get(&url).query(&[("frame", "object")]))?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::error_from_response(identifier, response));
        }
        let body: Value = response
            .json()
            .map_err(|err| AccessionError::CatalogHttp(err.to_string()))?;
        Self::unwrap_record(body).map(Some)
    }

    fn current_user(&self) -> Result<String, AccessionError> {
        let url = format!("{}/session-properties", self.base_url);
        let response = self.send_with_retries(|| self.client.get(&url))?;
        if !response.status().is_success() {
            return Err(AccessionError::Authentication(format!(
                "session request returned status {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .map_err(|err| AccessionError::Authentication(err.to_string()))?;
        body.get("user")
            .and_then(|user| user.get("@id"))
            .and_then(|id| id.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                AccessionError::Authentication("authenticated user not found".to_string())
            })
    }
}

fn resolve_server(server: &str) -> String {
    match server {
        "dev" => "https://test.encodedcc.org".to_string(),
        "prod" => "https://www.encodeproject.org".to_string(),
        other => other.trim_end_matches('/').to_string(),
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn record_accessors() {
        let record = Record::new(json!({
            "accession": "ENCFF000AAA",
            "@id": "/files/ENCFF000AAA/",
            "status": "released",
            "md5sum": "abcd",
            "output_type": "alignments",
            "biological_replicates": [2, 1],
            "step_run": {"@id": "/analysis-step-runs/xyz/"},
        }));
        assert_eq!(record.id().unwrap(), "ENCFF000AAA");
        assert_eq!(record.at_id().unwrap(), "/files/ENCFF000AAA/");
        assert_eq!(record.md5sum(), Some("abcd"));
        assert_eq!(record.output_type(), Some("alignments"));
        assert_eq!(record.bio_replicate().unwrap(), 2);
        assert_eq!(record.step_run_id(), Some("/analysis-step-runs/xyz/"));
        assert!(!record.is_soft_deleted());
    }

    #[test]
    fn soft_deleted_statuses() {
        for status in ["deleted", "revoked"] {
            let record = Record::new(json!({"status": status}));
            assert!(record.is_soft_deleted());
        }
        let record = Record::new(json!({"status": "uploading"}));
        assert!(!record.is_soft_deleted());
    }

    #[test]
    fn quality_metric_detection() {
        let record = Record::new(json!({
            "quality_metrics": [
                {"@type": ["SamtoolsFlagstatsQualityMetric", "QualityMetric", "Item"]}
            ]
        }));
        assert!(record.has_quality_metric("SamtoolsFlagstatsQualityMetric"));
        assert!(!record.has_quality_metric("IDRQualityMetric"));
    }

    #[test]
    fn step_run_as_bare_path() {
        let record = Record::new(json!({"step_run": "/analysis-step-runs/xyz/"}));
        assert_eq!(record.step_run_id(), Some("/analysis-step-runs/xyz/"));
    }

    #[test]
    fn server_shorthand() {
        assert_eq!(resolve_server("prod"), "https://www.encodeproject.org");
        assert_eq!(
            resolve_server("https://example.org/"),
            "https://example.org"
        );
    }
}
