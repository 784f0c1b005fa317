#![cfg(feature = "http-registry")]

//! DID registry over HTTP.
//!
//! Publication POSTs the document to the configured publish URL and then a
//! history entry to the per-DID history URL. Resolution follows `did:web`:
//! `did:web:host:a:b` is fetched from `https://host/a/b/did.json`, and a bare
//! `did:web:host` from `https://host/.well-known/did.json`.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use tracing::debug;

use crate::config::RegistrySettings;
use crate::did::{DidDocument, DidRegistry, DocumentDraft, RegistryError};

#[derive(Clone)]
pub struct HttpDidRegistry {
    settings: RegistrySettings,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct HistoryEntry<'a> {
    did: &'a str,
    version: u64,
    document: &'a DidDocument,
}

impl HttpDidRegistry {
    pub fn new(settings: RegistrySettings) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .build()
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;
        Ok(Self { settings, client })
    }

    async fn post_json<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<(), RegistryError> {
        let resp = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.ok();
        let detail = format!("status={status} body={body:?}");
        if status.is_client_error() {
            Err(RegistryError::Rejected(detail))
        } else {
            Err(RegistryError::Unavailable(detail))
        }
    }
}

/// Map a `did:web` identifier to the URL of its document.
pub fn did_web_url(did: &str) -> Result<String, RegistryError> {
    let rest = did
        .strip_prefix("did:web:")
        .ok_or_else(|| RegistryError::NotFound(format!("{did} is not a did:web identifier")))?;
    let mut parts = rest.split(':');
    let host = parts
        .next()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| RegistryError::NotFound(format!("{did} has no host")))?
        .replace("%3A", ":")
        .replace("%3a", ":");
    let path: Vec<&str> = parts.collect();
    if path.iter().any(|p| p.is_empty()) {
        return Err(RegistryError::NotFound(format!("{did} has an empty path segment")));
    }

    Ok(if path.is_empty() {
        format!("https://{host}/.well-known/did.json")
    } else {
        format!("https://{host}/{}/did.json", path.join("/"))
    })
}

#[async_trait]
impl DidRegistry for HttpDidRegistry {
    async fn resolve(&self, did: &str) -> Result<DidDocument, RegistryError> {
        let url = did_web_url(did)?;
        debug!(%did, %url, "fetching DID document");
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;

        match resp.status() {
            StatusCode::OK => {
                let document: DidDocument = resp
                    .json()
                    .await
                    .map_err(|e| RegistryError::Malformed(e.to_string()))?;
                if document.id != did {
                    return Err(RegistryError::Malformed(format!(
                        "document at {url} is for {}",
                        document.id
                    )));
                }
                Ok(document)
            }
            StatusCode::NOT_FOUND | StatusCode::GONE => Err(RegistryError::NotFound(did.to_string())),
            other => Err(RegistryError::Unavailable(format!("status={other} from {url}"))),
        }
    }

    async fn publish(&self, draft: &DocumentDraft) -> Result<String, RegistryError> {
        let did = match &draft.did {
            Some(did) => did.clone(),
            None => self.settings.did_for_name(&draft.name),
        };
        let document = DidDocument::from_draft(&did, draft);

        self.post_json(&self.settings.did_publish_url, &document).await?;
        self.post_json(
            &self.settings.history_url(&did),
            &HistoryEntry {
                did: &did,
                version: document.version,
                document: &document,
            },
        )
        .await?;

        debug!(%did, version = document.version, "document published over HTTP");
        Ok(did)
    }
}
