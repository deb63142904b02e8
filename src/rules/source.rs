//! Rule list sources
//!
//! Fetches rule documents from remote URLs and local files, decodes the
//! base64 wrapping the published lists use, and compiles the result into a
//! [`ClassifierSnapshot`]. Any unreachable source is an error; the caller
//! decides whether that is fatal (startup) or keeps the previous snapshot
//! (reload).

use std::path::PathBuf;
use std::time::Duration;

use base64::prelude::{Engine as _, BASE64_STANDARD};
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::Request;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, info};

use super::engine::ClassifierSnapshot;
use super::matcher::RuleSet;
use crate::config::RulesConfig;
use crate::error::RuleError;

/// Per-source fetch timeout
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Fetch and compile all configured sources into a fresh snapshot
///
/// # Errors
///
/// Returns `RuleError` if any source cannot be fetched or read.
pub async fn build_snapshot(config: &RulesConfig) -> Result<ClassifierSnapshot, RuleError> {
    let tunnel_doc = load_documents(&config.list_urls, &config.list_files).await?;
    let block_doc = load_documents(&[], &config.block_files).await?;

    let snapshot = ClassifierSnapshot {
        tunnel: RuleSet::parse(&tunnel_doc),
        user_block: RuleSet::parse(&block_doc),
        version: 0,
    };

    info!(
        tunnel_rules = snapshot.tunnel.len(),
        block_rules = snapshot.user_block.len(),
        "Rule lists compiled"
    );

    Ok(snapshot)
}

/// Fetch every source and concatenate the decoded documents
async fn load_documents(urls: &[String], files: &[PathBuf]) -> Result<String, RuleError> {
    let mut combined = String::new();

    for url in urls {
        let raw = fetch_url(url).await?;
        combined.push_str(&decode_document(&raw));
        combined.push('\n');
    }

    for path in files {
        let raw = std::fs::read(path).map_err(|e| RuleError::File {
            path: path.display().to_string(),
            source: e,
        })?;
        combined.push_str(&decode_document(&raw));
        combined.push('\n');
    }

    Ok(combined)
}

/// Download one list over HTTP(S)
async fn fetch_url(url: &str) -> Result<Vec<u8>, RuleError> {
    debug!("Fetching rule list from {}", url);

    let _ = rustls::crypto::ring::default_provider().install_default();

    let https = HttpsConnectorBuilder::new()
        .with_native_roots()
        .map_err(|e| RuleError::fetch(url, e.to_string()))?
        .https_or_http()
        .enable_http1()
        .build();

    let client = Client::builder(TokioExecutor::new()).build::<_, Empty<Bytes>>(https);

    let request = Request::builder()
        .method("GET")
        .uri(url)
        .body(Empty::new())
        .map_err(|e| RuleError::fetch(url, e.to_string()))?;

    let response = tokio::time::timeout(FETCH_TIMEOUT, client.request(request))
        .await
        .map_err(|_| RuleError::fetch(url, "request timeout"))?
        .map_err(|e| RuleError::fetch(url, e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(RuleError::HttpStatus {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| RuleError::fetch(url, e.to_string()))?
        .to_bytes();

    Ok(body.to_vec())
}

/// Decode a rule document.
///
/// Published gfwlist documents are base64; user-maintained overrides are
/// plain text. Try base64 (ignoring whitespace) first and fall back to
/// treating the bytes as plain text.
fn decode_document(raw: &[u8]) -> String {
    let stripped: Vec<u8> = raw
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();

    if let Ok(decoded) = BASE64_STANDARD.decode(&stripped) {
        if let Ok(text) = String::from_utf8(decoded) {
            return text;
        }
    }

    String::from_utf8_lossy(raw).into_owned()
}
