//! S3-compatible object store access.
//!
//! The remote tier treats the store as a flat namespace of whole objects:
//! HEAD for size probes, ranged GET for sector fetches, whole-object PUT on
//! writeback, DELETE and LIST for lifecycle management. Everything is
//! synchronous because the callers are engine VFS callbacks; run it on
//! blocking threads only.
//!
//! The [`ObjectStore`] trait is the seam between the remote VFS and the
//! concrete backend. [`S3Client`] signs requests with AWS Signature V4 and
//! works against any S3-compatible endpoint; [`InMemoryObjectStore`] backs
//! tests and offline development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::RemoteStorageConfig;

type HmacSha256 = Hmac<Sha256>;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found")]
    NotFound,

    #[error("object store request failed: {0}")]
    Request(String),

    #[error("object store returned status {0}")]
    Status(u16),
}

/// A listed object.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
}

/// Capability set the remote VFS and the stage manager need from the store.
pub trait ObjectStore: Send + Sync {
    /// Size of the object, or `None` if it does not exist.
    fn head(&self, key: &str) -> Result<Option<u64>, StoreError>;

    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Inclusive byte range `[start, end]`.
    fn get_range(&self, key: &str, start: u64, end: u64) -> Result<Vec<u8>, StoreError>;

    fn put(&self, key: &str, body: &[u8]) -> Result<(), StoreError>;

    fn delete(&self, key: &str) -> Result<(), StoreError>;

    fn list(&self) -> Result<Vec<ObjectInfo>, StoreError>;
}

/// Blocking S3-compatible client with SigV4 request signing.
pub struct S3Client {
    http: reqwest::blocking::Client,
    endpoint: String,
    host: String,
    bucket: String,
    access_key_id: String,
    secret_key: String,
    region: String,
}

impl S3Client {
    /// Build a client and probe the bucket; unreachable storage at startup
    /// is fatal for the service.
    pub fn connect(config: &RemoteStorageConfig) -> Result<Self, StoreError> {
        let client = Self::new(config)?;
        client.list()?;
        info!(bucket = %client.bucket, "Remote object store reachable");
        Ok(client)
    }

    pub fn new(config: &RemoteStorageConfig) -> Result<Self, StoreError> {
        debug!(
            endpoint = %config.endpoint,
            bucket = %config.bucket_name,
            region = %config.region,
            "Initializing remote object store client"
        );

        let endpoint = config.endpoint.trim_end_matches('/').to_string();
        let host = endpoint
            .strip_prefix("https://")
            .or_else(|| endpoint.strip_prefix("http://"))
            .unwrap_or(&endpoint)
            .to_string();

        let http = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StoreError::Request(e.to_string()))?;

        Ok(Self {
            http,
            endpoint,
            host,
            bucket: config.bucket_name.clone(),
            access_key_id: config.access_key_id.clone(),
            secret_key: config.secret_key.clone(),
            region: config.region.clone(),
        })
    }

    fn send(
        &self,
        method: &str,
        key: Option<&str>,
        query: &[(&str, &str)],
        range: Option<(u64, u64)>,
        body: Option<&[u8]>,
    ) -> Result<reqwest::blocking::Response, StoreError> {
        let canonical_uri = match key {
            Some(key) => format!("/{}/{}", self.bucket, uri_encode(key, false)),
            None => format!("/{}", self.bucket),
        };

        let mut query_pairs: Vec<(String, String)> = query
            .iter()
            .map(|(k, v)| (uri_encode(k, true), uri_encode(v, true)))
            .collect();
        query_pairs.sort();
        let canonical_query = query_pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        let now = chrono::Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();
        let payload_hash = hex(&Sha256::digest(body.unwrap_or(&[])));

        let mut headers: Vec<(String, String)> = vec![
            ("host".to_string(), self.host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some((start, end)) = range {
            headers.push(("range".to_string(), format!("bytes={}-{}", start, end)));
        }
        headers.sort();

        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();
        let signed_headers = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, canonical_uri, canonical_query, canonical_headers, signed_headers, payload_hash
        );

        let scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            scope,
            hex(&Sha256::digest(canonical_request.as_bytes()))
        );

        let signature = hex(&self.signing_key(&date_stamp, string_to_sign.as_bytes()));
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.access_key_id, scope, signed_headers, signature
        );

        let mut url = format!("{}{}", self.endpoint, canonical_uri);
        if !canonical_query.is_empty() {
            url.push('?');
            url.push_str(&canonical_query);
        }

        let mut request = match method {
            "GET" => self.http.get(&url),
            "HEAD" => self.http.head(&url),
            "PUT" => self.http.put(&url),
            "DELETE" => self.http.delete(&url),
            other => return Err(StoreError::Request(format!("unsupported method {}", other))),
        };
        for (name, value) in &headers {
            if name != "host" {
                request = request.header(name.as_str(), value.as_str());
            }
        }
        request = request.header("authorization", authorization);
        if let Some(body) = body {
            request = request.body(body.to_vec());
        }

        request
            .send()
            .map_err(|e| StoreError::Request(e.to_string()))
    }

    /// SigV4 key derivation chain.
    fn signing_key(&self, date_stamp: &str, message: &[u8]) -> Vec<u8> {
        let k_date = hmac_sha256(
            format!("AWS4{}", self.secret_key).as_bytes(),
            date_stamp.as_bytes(),
        );
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, b"s3");
        let k_signing = hmac_sha256(&k_service, b"aws4_request");
        hmac_sha256(&k_signing, message)
    }
}

impl ObjectStore for S3Client {
    fn head(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let response = self.send("HEAD", Some(key), &[], None, None)?;
        match response.status().as_u16() {
            200 => {
                let size = response
                    .headers()
                    .get(reqwest::header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                Ok(Some(size))
            }
            404 => Ok(None),
            status => Err(StoreError::Status(status)),
        }
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let response = self.send("GET", Some(key), &[], None, None)?;
        match response.status().as_u16() {
            200 => response
                .bytes()
                .map(|b| b.to_vec())
                .map_err(|e| StoreError::Request(e.to_string())),
            404 => Err(StoreError::NotFound),
            status => Err(StoreError::Status(status)),
        }
    }

    fn get_range(&self, key: &str, start: u64, end: u64) -> Result<Vec<u8>, StoreError> {
        let response = self.send("GET", Some(key), &[], Some((start, end)), None)?;
        match response.status().as_u16() {
            200 | 206 => response
                .bytes()
                .map(|b| b.to_vec())
                .map_err(|e| StoreError::Request(e.to_string())),
            404 => Err(StoreError::NotFound),
            status => Err(StoreError::Status(status)),
        }
    }

    fn put(&self, key: &str, body: &[u8]) -> Result<(), StoreError> {
        let response = self.send("PUT", Some(key), &[], None, Some(body))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(StoreError::Status(response.status().as_u16()))
        }
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let response = self.send("DELETE", Some(key), &[], None, None)?;
        let status = response.status().as_u16();
        // Deleting an absent key is not an error
        if response.status().is_success() || status == 404 {
            Ok(())
        } else {
            Err(StoreError::Status(status))
        }
    }

    fn list(&self) -> Result<Vec<ObjectInfo>, StoreError> {
        let response = self.send("GET", None, &[("list-type", "2")], None, None)?;
        if !response.status().is_success() {
            return Err(StoreError::Status(response.status().as_u16()));
        }
        let body = response
            .text()
            .map_err(|e| StoreError::Request(e.to_string()))?;
        Ok(parse_list_response(&body))
    }
}

fn hmac_sha256(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Percent-encode per the SigV4 canonical rules. Slashes in object keys stay
/// literal unless `encode_slash` is set (query components).
fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Pull `<Key>`/`<Size>` pairs out of a ListObjectsV2 response. The payload
/// shape is fixed, so a scoped scan avoids dragging in an XML dependency.
fn parse_list_response(xml: &str) -> Vec<ObjectInfo> {
    let mut objects = Vec::new();
    let mut rest = xml;

    while let Some(open) = rest.find("<Contents>") {
        let after_open = &rest[open + "<Contents>".len()..];
        let Some(close) = after_open.find("</Contents>") else {
            break;
        };
        let block = &after_open[..close];

        if let Some(key) = text_between(block, "<Key>", "</Key>") {
            let size = text_between(block, "<Size>", "</Size>")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            objects.push(ObjectInfo {
                key: xml_unescape(key),
                size,
            });
        }

        rest = &after_open[close + "</Contents>".len()..];
    }

    objects
}

fn text_between<'a>(haystack: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = haystack.find(open)? + open.len();
    let end = haystack[start..].find(close)? + start;
    Some(&haystack[start..end])
}

fn xml_unescape(input: &str) -> String {
    input
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// In-process object store used by tests and offline development.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    put_count: AtomicUsize,
    fail_puts: AtomicBool,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of PUTs issued so far.
    pub fn put_count(&self) -> usize {
        self.put_count.load(Ordering::SeqCst)
    }

    /// Make subsequent PUTs fail, to exercise writeback retry paths.
    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().contains_key(key)
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn head(&self, key: &str) -> Result<Option<u64>, StoreError> {
        Ok(self.objects.lock().get(key).map(|v| v.len() as u64))
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.objects
            .lock()
            .get(key)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn get_range(&self, key: &str, start: u64, end: u64) -> Result<Vec<u8>, StoreError> {
        let objects = self.objects.lock();
        let data = objects.get(key).ok_or(StoreError::NotFound)?;
        let start = (start as usize).min(data.len());
        let end = ((end + 1) as usize).min(data.len());
        Ok(data[start..end].to_vec())
    }

    fn put(&self, key: &str, body: &[u8]) -> Result<(), StoreError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StoreError::Status(503));
        }
        self.put_count.fetch_add(1, Ordering::SeqCst);
        self.objects.lock().insert(key.to_string(), body.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.objects.lock().remove(key);
        Ok(())
    }

    fn list(&self) -> Result<Vec<ObjectInfo>, StoreError> {
        let mut objects: Vec<ObjectInfo> = self
            .objects
            .lock()
            .iter()
            .map(|(key, data)| ObjectInfo {
                key: key.clone(),
                size: data.len() as u64,
            })
            .collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_encode() {
        assert_eq!(uri_encode("users.db", false), "users.db");
        assert_eq!(uri_encode("a b", false), "a%20b");
        assert_eq!(uri_encode("a/b", false), "a/b");
        assert_eq!(uri_encode("a/b", true), "a%2Fb");
        assert_eq!(uri_encode("café", false), "caf%C3%A9");
    }

    #[test]
    fn test_hex_encoding() {
        assert_eq!(hex(&[0x00, 0xff, 0x10]), "00ff10");
    }

    #[test]
    fn test_parse_list_response() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult>
  <Name>bucket</Name>
  <Contents><Key>users.db</Key><LastModified>2025-01-01T00:00:00Z</LastModified><Size>4096</Size></Contents>
  <Contents><Key>logs.db-journal</Key><Size>512</Size></Contents>
  <Contents><Key>a&amp;b.db</Key><Size>1</Size></Contents>
</ListBucketResult>"#;

        let objects = parse_list_response(xml);
        assert_eq!(objects.len(), 3);
        assert_eq!(objects[0].key, "users.db");
        assert_eq!(objects[0].size, 4096);
        assert_eq!(objects[1].key, "logs.db-journal");
        assert_eq!(objects[2].key, "a&b.db");
    }

    #[test]
    fn test_parse_list_response_empty() {
        let xml = "<ListBucketResult><Name>bucket</Name></ListBucketResult>";
        assert!(parse_list_response(xml).is_empty());
    }

    #[test]
    fn test_in_memory_store_round_trip() {
        let store = InMemoryObjectStore::new();
        assert_eq!(store.head("x").unwrap(), None);

        store.put("x", b"hello world").unwrap();
        assert_eq!(store.head("x").unwrap(), Some(11));
        assert_eq!(store.get("x").unwrap(), b"hello world");
        assert_eq!(store.get_range("x", 6, 10).unwrap(), b"world");
        // Range past the end clamps
        assert_eq!(store.get_range("x", 6, 100).unwrap(), b"world");

        store.delete("x").unwrap();
        assert!(matches!(store.get("x"), Err(StoreError::NotFound)));
    }

    #[test]
    fn test_in_memory_store_failing_puts() {
        let store = InMemoryObjectStore::new();
        store.set_fail_puts(true);
        assert!(store.put("x", b"data").is_err());
        assert_eq!(store.put_count(), 0);

        store.set_fail_puts(false);
        store.put("x", b"data").unwrap();
        assert_eq!(store.put_count(), 1);
    }
}
