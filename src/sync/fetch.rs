//! Fetch one dataset, normalize its header row, and write it atomically.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::error::FetchError;
use super::filter::WorkItem;
use super::normalize::normalize;
use super::paths;
use crate::retry::{self, RetryAction, RetryConfig};

/// Result of processing one [`WorkItem`].
#[derive(Debug)]
pub enum FetchOutcome {
    Success {
        identifier: String,
        path: PathBuf,
        /// Data rows written, excluding the header.
        row_count: u64,
        /// SHA-256 (hex) of the bytes written.
        checksum: String,
    },
    Failure {
        identifier: String,
        title: String,
        cause: FetchError,
    },
}

impl FetchOutcome {
    pub fn failure(item: &WorkItem, cause: FetchError) -> Self {
        FetchOutcome::Failure {
            identifier: item.record.identifier.clone(),
            title: item.record.title().to_string(),
            cause,
        }
    }

    pub fn identifier(&self) -> &str {
        match self {
            FetchOutcome::Success { identifier, .. } | FetchOutcome::Failure { identifier, .. } => {
                identifier
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, FetchOutcome::Success { .. })
    }
}

/// Materializes one dataset. Implementations must not panic or return early
/// without an outcome: every error becomes [`FetchOutcome::Failure`].
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, item: &WorkItem) -> FetchOutcome;
}

/// Fetcher that downloads over HTTP and writes under the item's path.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    timeout: Duration,
    retry: RetryConfig,
}

/// Normalized CSV ready to be written.
#[derive(Debug)]
struct Transformed {
    bytes: Vec<u8>,
    row_count: u64,
}

impl HttpFetcher {
    pub fn new(client: Client, timeout: Duration, retry: RetryConfig) -> Self {
        Self {
            client,
            timeout,
            retry,
        }
    }

    async fn try_fetch(&self, item: &WorkItem) -> Result<(u64, String), FetchError> {
        let url = item
            .record
            .csv_distribution()
            .and_then(|d| d.download_url.as_deref())
            .ok_or(FetchError::NoEligibleDistribution)?;

        tracing::debug!(
            identifier = %item.record.identifier,
            url,
            path = %item.path.display(),
            "downloading",
        );

        let payload = retry::retry_with_backoff(
            &self.retry,
            |e: &FetchError| {
                if e.is_retryable() {
                    RetryAction::Retry
                } else {
                    RetryAction::Abort
                }
            },
            || self.download(url),
        )
        .await?;

        let transformed = tokio::task::spawn_blocking(move || transform(&payload))
            .await
            .map_err(|e| FetchError::Decode(format!("transform task failed: {e}")))??;

        let checksum = hex_digest(&transformed.bytes);
        let temp = paths::temp_path(&item.path, &item.record.identifier);
        write_atomic(&item.path, &temp, &transformed.bytes).await?;

        Ok((transformed.row_count, checksum))
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(FetchError::HttpStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, item: &WorkItem) -> FetchOutcome {
        match self.try_fetch(item).await {
            Ok((row_count, checksum)) => FetchOutcome::Success {
                identifier: item.record.identifier.clone(),
                path: item.path.clone(),
                row_count,
                checksum,
            },
            Err(cause) => FetchOutcome::failure(item, cause),
        }
    }
}

/// Decode `payload` as comma-delimited UTF-8, normalize the header row and
/// re-encode. Data rows are copied field for field; rows may vary in width and
/// blank lines are kept as empty rows. The output line terminator follows the
/// header row: CRLF if the header ends in CRLF, LF otherwise.
fn transform(payload: &[u8]) -> Result<Transformed, FetchError> {
    std::str::from_utf8(payload)
        .map_err(|e| FetchError::Decode(format!("payload is not UTF-8: {e}")))?;

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(payload);
    let mut record = csv::StringRecord::new();
    if !reader.read_record(&mut record).map_err(decode_error)? {
        return Err(FetchError::Decode("payload has no header row".into()));
    }
    let mut end = record_end(payload, reader.position().byte());

    let crlf = payload[end..].starts_with(b"\r\n");
    let (terminator, line_break): (_, &[u8]) = if crlf {
        (csv::Terminator::CRLF, b"\r\n")
    } else {
        (csv::Terminator::Any(b'\n'), b"\n")
    };

    let mut builder = csv::WriterBuilder::new();
    builder.flexible(true).terminator(terminator);
    let mut writer = builder.from_writer(Vec::with_capacity(payload.len()));
    writer
        .write_record(record.iter().map(normalize))
        .map_err(decode_error)?;

    let mut row_count = 0u64;
    loop {
        // The reader drops empty lines; put them back as empty rows.
        let blanks = skipped_blank_lines(payload, end);
        if blanks > 0 {
            let mut bytes = writer
                .into_inner()
                .map_err(|e| FetchError::Decode(e.to_string()))?;
            for _ in 0..blanks {
                bytes.extend_from_slice(line_break);
            }
            writer = builder.from_writer(bytes);
            row_count += blanks;
        }

        if !reader.read_record(&mut record).map_err(decode_error)? {
            break;
        }
        writer.write_record(&record).map_err(decode_error)?;
        row_count += 1;
        end = record_end(payload, reader.position().byte());
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| FetchError::Decode(e.to_string()))?;
    Ok(Transformed { bytes, row_count })
}

/// Offset just past the last field of the record ending at or before
/// `consumed`. A record never ends in a bare line break, so stepping back over
/// `\r` and `\n` lands on its content.
fn record_end(payload: &[u8], consumed: u64) -> usize {
    let mut end = usize::try_from(consumed)
        .unwrap_or(payload.len())
        .min(payload.len());
    while end > 0 && matches!(payload[end - 1], b'\r' | b'\n') {
        end -= 1;
    }
    end
}

/// Empty lines between the record ending at `end` and the next one (or the
/// end of the payload). The first line break is the record's own terminator.
fn skipped_blank_lines(payload: &[u8], end: usize) -> u64 {
    let mut i = end;
    let mut breaks = 0u64;
    while let Some(&b) = payload.get(i) {
        match b {
            b'\r' if payload.get(i + 1) == Some(&b'\n') => i += 2,
            b'\r' | b'\n' => i += 1,
            _ => break,
        }
        breaks += 1;
    }
    breaks.saturating_sub(1)
}

fn decode_error(e: csv::Error) -> FetchError {
    FetchError::Decode(e.to_string())
}

fn hex_digest(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Write `contents` to `temp`, then rename it over `path`. On any error the
/// temp file is removed and whatever was at `path` is left untouched.
async fn write_atomic(path: &Path, temp: &Path, contents: &[u8]) -> Result<(), FetchError> {
    let write_error = |source: std::io::Error| FetchError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await.map_err(write_error)?;
    }

    let result = async {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(temp)
            .await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(temp, path).await
    }
    .await;

    if let Err(source) = result {
        let _ = fs::remove_file(temp).await;
        return Err(write_error(source));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DatasetRecord;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(Client::new(), Duration::from_secs(5), RetryConfig::default())
    }

    fn item(dir: &Path, urls: &[String]) -> WorkItem {
        let distributions: Vec<_> = urls.iter().map(|u| json!({"downloadURL": u})).collect();
        let record: DatasetRecord = serde_json::from_value(json!({
            "identifier": "ds-1",
            "title": "Test Dataset",
            "theme": ["Hospitals"],
            "modified": "2024-01-01",
            "distribution": distributions
        }))
        .unwrap();
        WorkItem {
            path: dir.join("Test_Dataset.csv"),
            record,
        }
    }

    fn leftover_parts(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.to_string_lossy().ends_with(".part"))
            .collect()
    }

    #[test]
    fn test_transform_normalizes_header_only() {
        let payload = b"Facility Name,ZIP-Code!,\nMercy General,95819,x\n\"St. Mary's, North\",10001,\n";
        let out = transform(payload).unwrap();
        assert_eq!(out.row_count, 2);
        assert_eq!(
            String::from_utf8(out.bytes).unwrap(),
            "facility_name,zipcode,\nMercy General,95819,x\n\"St. Mary's, North\",10001,\n"
        );
    }

    #[test]
    fn test_transform_header_only_payload() {
        let out = transform(b"A B,C\n").unwrap();
        assert_eq!(out.row_count, 0);
        assert_eq!(String::from_utf8(out.bytes).unwrap(), "a_b,c\n");
    }

    #[test]
    fn test_transform_ragged_rows_pass_through() {
        let out = transform(b"a,b\n1\n1,2,3\n").unwrap();
        assert_eq!(out.row_count, 2);
        assert_eq!(String::from_utf8(out.bytes).unwrap(), "a,b\n1\n1,2,3\n");
    }

    #[test]
    fn test_transform_keeps_blank_rows() {
        let out = transform(b"a,b\n1,2\n\n3,4\n").unwrap();
        assert_eq!(out.row_count, 3);
        assert_eq!(String::from_utf8(out.bytes).unwrap(), "a,b\n1,2\n\n3,4\n");

        let out = transform(b"a,b\n\n\n1,2\n\n").unwrap();
        assert_eq!(out.row_count, 4);
        assert_eq!(String::from_utf8(out.bytes).unwrap(), "a,b\n\n\n1,2\n\n");
    }

    #[test]
    fn test_transform_keeps_crlf_terminator() {
        let out = transform(b"Facility Name,City\r\nA,B\r\n\r\n\"x\r\ny\",C\r\n").unwrap();
        assert_eq!(out.row_count, 3);
        assert_eq!(
            String::from_utf8(out.bytes).unwrap(),
            "facility_name,city\r\nA,B\r\n\r\n\"x\r\ny\",C\r\n"
        );
    }

    #[test]
    fn test_transform_without_trailing_newline() {
        let out = transform(b"a,b\n1,2").unwrap();
        assert_eq!(out.row_count, 1);
        assert_eq!(String::from_utf8(out.bytes).unwrap(), "a,b\n1,2\n");
    }

    #[test]
    fn test_transform_rejects_invalid_utf8() {
        let err = transform(&[0x66, 0x6f, 0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, FetchError::Decode(_)));
    }

    #[test]
    fn test_transform_rejects_empty_payload() {
        assert!(matches!(transform(b"").unwrap_err(), FetchError::Decode(_)));
    }

    #[tokio::test]
    async fn test_fetch_picks_csv_over_pdf() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/x.csv"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Col One\nv\n"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/x.pdf"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let item = item(
            dir.path(),
            &[format!("{}/x.pdf", server.uri()), format!("{}/x.csv", server.uri())],
        );
        let outcome = fetcher().fetch(&item).await;
        match outcome {
            FetchOutcome::Success {
                path, row_count, ..
            } => {
                assert_eq!(path, item.path);
                assert_eq!(row_count, 1);
                assert_eq!(std::fs::read_to_string(&path).unwrap(), "col_one\nv\n");
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_without_csv_does_no_io() {
        let dir = tempfile::tempdir().unwrap();
        let item = item(dir.path(), &["http://127.0.0.1:1/x.pdf".to_string()]);
        let outcome = fetcher().fetch(&item).await;
        assert!(matches!(
            outcome,
            FetchOutcome::Failure {
                cause: FetchError::NoEligibleDistribution,
                ..
            }
        ));
        assert!(!item.path.exists());
    }

    #[tokio::test]
    async fn test_fetch_overwrites_previous_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("New Header\n1\n"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let item = item(dir.path(), &[format!("{}/d.csv", server.uri())]);
        std::fs::write(&item.path, "old,content\n1,2\n3,4\n5,6\n").unwrap();

        let outcome = fetcher().fetch(&item).await;
        assert!(outcome.is_success());
        assert_eq!(std::fs::read_to_string(&item.path).unwrap(), "new_header\n1\n");
        assert!(leftover_parts(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_http_error_leaves_existing_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let item = item(dir.path(), &[format!("{}/d.csv", server.uri())]);
        std::fs::write(&item.path, "kept\n").unwrap();

        let outcome = fetcher().fetch(&item).await;
        match outcome {
            FetchOutcome::Failure { identifier, cause, .. } => {
                assert_eq!(identifier, "ds-1");
                assert!(matches!(cause, FetchError::HttpStatus { status: 404, .. }));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(std::fs::read_to_string(&item.path).unwrap(), "kept\n");
    }

    #[tokio::test]
    async fn test_decode_error_writes_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0xc3, 0x28, 0x0a]))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let item = item(dir.path(), &[format!("{}/d.csv", server.uri())]);
        let outcome = fetcher().fetch(&item).await;
        assert!(matches!(
            outcome,
            FetchOutcome::Failure {
                cause: FetchError::Decode(_),
                ..
            }
        ));
        assert!(!item.path.exists());
        assert!(leftover_parts(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_timeout_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("a\n1\n")
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let item = item(dir.path(), &[format!("{}/slow.csv", server.uri())]);
        let fetcher = HttpFetcher::new(
            Client::new(),
            Duration::from_millis(200),
            RetryConfig::default(),
        );
        let outcome = fetcher.fetch(&item).await;
        match outcome {
            FetchOutcome::Failure { cause, .. } => {
                assert!(matches!(cause, FetchError::Transport { .. }));
                assert_eq!(cause.kind(), crate::sync::FailureKind::Transport);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_from_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Ok\n1\n"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let item = item(dir.path(), &[format!("{}/flaky.csv", server.uri())]);
        let fetcher = HttpFetcher::new(
            Client::new(),
            Duration::from_secs(5),
            RetryConfig {
                max_retries: 2,
                base_delay_secs: 0,
                max_delay_secs: 0,
            },
        );
        assert!(fetcher.fetch(&item).await.is_success());
    }

    #[tokio::test]
    async fn test_write_failure_reports_write_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("a\n1\n"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let item = item(&blocker, &[format!("{}/d.csv", server.uri())]);

        let outcome = fetcher().fetch(&item).await;
        assert!(matches!(
            outcome,
            FetchOutcome::Failure {
                cause: FetchError::Write { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_hex_digest() {
        assert_eq!(
            hex_digest(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
