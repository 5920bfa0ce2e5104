//! Data-availability adapter.
//!
//! The Celestia node exposes a JSON-RPC API, spoken here with raw `reqwest`
//! requests.

mod proof;

pub use proof::{
    build_element_proof, element_root, merkle_path, merkle_root, root_from_path, DaProof,
    MerkleStep,
};

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine};
use ethers::types::{Bytes, H256};
use reqwest::Client as HttpClient;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::DaConfig;
use crate::error::{Error, Result};
use crate::types::{DaPointer, ElementIndex, Namespace};

/// Capability to publish and retrieve bundle blobs.
#[async_trait]
pub trait DaClient: Send + Sync {
    /// Publishes `blob` and returns where it landed.
    async fn publish(&self, blob: Bytes) -> Result<DaPointer>;

    async fn fetch(&self, pointer: &DaPointer) -> Result<Bytes>;

    /// Fresh inclusion proof for one element of the blob at `pointer`.
    async fn get_inclusion_proof(
        &self,
        pointer: &DaPointer,
        element: ElementIndex,
    ) -> Result<DaProof>;
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// Blob as it appears on the node API, binary fields base64 encoded.
#[derive(Debug, Serialize, Deserialize)]
struct RpcBlob {
    namespace: String,
    data: String,
    share_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    commitment: Option<String>,
}

fn b64(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

fn unb64(field: &str, s: &str) -> Result<Vec<u8>> {
    general_purpose::STANDARD
        .decode(s)
        .map_err(|e| Error::DaUnavailable(format!("bad base64 in {field}: {e}")))
}

fn is_not_found(message: &str) -> bool {
    message.contains("not found")
}

fn is_transient(message: &str) -> bool {
    ["deadline exceeded", "timed out", "timeout", "unavailable", "connection"]
        .iter()
        .any(|needle| message.contains(needle))
}

/// Celestia node client.
pub struct CelestiaClient {
    http: HttpClient,
    endpoint: String,
    auth_token: Option<String>,
    namespace: Namespace,
    next_id: AtomicU64,
}

impl CelestiaClient {
    pub fn new(config: &DaConfig) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::DaUnavailable(e.to_string()))?;

        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            auth_token: config.auth_token.clone(),
            namespace: config.namespace,
            next_id: AtomicU64::new(1),
        })
    }

    /// Sends one request. The outer `Result` carries transport failures, the
    /// inner one the node's own error message.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<std::result::Result<Option<T>, String>> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let mut builder = self.http.post(&self.endpoint).json(&request);
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| Error::DaUnavailable(format!("{method}: {e}")))?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(Error::DaUnavailable(format!("{method}: http {status}")));
        }
        if !status.is_success() {
            return Err(Error::DaRejected(format!("{method}: http {status}")));
        }

        let body: RpcResponse<T> = resp
            .json()
            .await
            .map_err(|e| Error::DaUnavailable(format!("{method}: bad response: {e}")))?;

        if let Some(err) = body.error {
            tracing::debug!(method, code = err.code, message = %err.message, "DA node error");
            return Ok(Err(err.message));
        }
        Ok(Ok(body.result))
    }

    fn pointer_params(pointer: &DaPointer) -> serde_json::Value {
        json!([
            pointer.height,
            b64(pointer.namespace.as_bytes()),
            b64(pointer.commitment.as_bytes())
        ])
    }

    fn read_error(what: String, message: String) -> Error {
        if is_not_found(&message) {
            Error::DaNotFound(format!("{what}: {message}"))
        } else {
            Error::DaUnavailable(format!("{what}: {message}"))
        }
    }

    /// Looks up the commitment the node computed for a blob we just
    /// submitted at `height`.
    async fn find_commitment(&self, height: u64, data: &str) -> Result<H256> {
        let ns = b64(self.namespace.as_bytes());
        let blobs: Vec<RpcBlob> = self
            .call("blob.GetAll", json!([height, [ns]]))
            .await?
            .map_err(|msg| Self::read_error(format!("blobs at {height}"), msg))?
            .unwrap_or_default();

        let commitment = blobs
            .into_iter()
            .find(|b| b.data == data)
            .and_then(|b| b.commitment)
            .ok_or_else(|| {
                Error::DaUnavailable(format!("submitted blob not yet visible at {height}"))
            })?;

        let raw = unb64("commitment", &commitment)?;
        if raw.len() != 32 {
            return Err(Error::DaUnavailable(format!(
                "commitment is {} bytes, expected 32",
                raw.len()
            )));
        }
        Ok(H256::from_slice(&raw))
    }
}

#[async_trait]
impl DaClient for CelestiaClient {
    async fn publish(&self, blob: Bytes) -> Result<DaPointer> {
        let data = b64(&blob);
        let request = RpcBlob {
            namespace: b64(self.namespace.as_bytes()),
            data: data.clone(),
            share_version: 0,
            commitment: None,
        };

        let height: u64 = match self.call("blob.Submit", json!([[request], {}])).await? {
            Ok(Some(height)) => height,
            Ok(None) => return Err(Error::DaUnavailable("blob.Submit returned no height".into())),
            Err(msg) if is_transient(&msg) => return Err(Error::DaUnavailable(msg)),
            Err(msg) => return Err(Error::DaRejected(msg)),
        };

        let commitment = self.find_commitment(height, &data).await?;
        let pointer = DaPointer {
            namespace: self.namespace,
            height,
            commitment,
        };

        tracing::info!(
            height,
            commitment = ?commitment,
            size = blob.len(),
            "Blob published"
        );
        Ok(pointer)
    }

    async fn fetch(&self, pointer: &DaPointer) -> Result<Bytes> {
        let blob: RpcBlob = self
            .call("blob.Get", Self::pointer_params(pointer))
            .await?
            .map_err(|msg| Self::read_error(format!("blob {pointer:?}"), msg))?
            .ok_or_else(|| Error::DaNotFound(format!("blob {pointer:?}")))?;

        Ok(unb64("data", &blob.data)?.into())
    }

    async fn get_inclusion_proof(
        &self,
        pointer: &DaPointer,
        element: ElementIndex,
    ) -> Result<DaProof> {
        let blob = self.fetch(pointer).await?;

        let share_proof: serde_json::Value = self
            .call("blob.GetProof", Self::pointer_params(pointer))
            .await?
            .map_err(|msg| Self::read_error(format!("proof {pointer:?}"), msg))?
            .ok_or_else(|| Error::DaNotFound(format!("proof {pointer:?}")))?;

        build_element_proof(*pointer, &blob, element, share_proof)
    }
}
