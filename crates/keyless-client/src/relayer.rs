//! Relayer API client
//!
//! The relayer submits commits and reveals to the wallet contract on the
//! client's behalf. It cannot forge or redirect an operation: the commit
//! binds the operation before the EOTP is disclosed.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use keyless_core::{Address, Authorization, Commit, Hash32, Operation};

/// Header carrying the relayer secret
pub const SECRET_HEADER: &str = "X-KEYLESS-SECRET";

/// Header carrying the network name
pub const NETWORK_HEADER: &str = "X-KEYLESS-NETWORK";

/// Relayer failures, classified by what the caller may do about them
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayerError {
    /// Request never got an answer (connect, timeout)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Relayer failed while processing (5xx)
    #[error("Relayer server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// The relayer or contract refused the request
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Response body could not be understood
    #[error("Malformed response: {0}")]
    Decode(String),
}

impl RelayerError {
    /// Whether resubmitting the same request may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, RelayerError::Transport(_) | RelayerError::Server { .. })
    }
}

/// Body of `POST /commit`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRequest {
    pub address: Address,
    pub hash: Hash32,
    pub params_hash: Hash32,
    pub verification_hash: Hash32,
}

impl CommitRequest {
    pub fn new(address: Address, commit: &Commit) -> Self {
        Self {
            address,
            hash: commit.hash,
            params_hash: commit.params_hash,
            verification_hash: commit.verification_hash,
        }
    }
}

/// Body of `POST /reveal/*`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevealRequest {
    pub address: Address,
    #[serde(flatten)]
    pub authorization: Authorization,
    #[serde(flatten)]
    pub operation: Operation,
}

/// `{success, error?}` response shape
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayerResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Transaction hash of the submitted call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx: Option<String>,
}

/// What a successful submission returns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayerReceipt {
    pub tx: Option<String>,
}

/// Relayer operations used by the commit-reveal flow
#[async_trait]
pub trait Relayer: Send + Sync {
    async fn commit(&self, request: &CommitRequest) -> Result<RelayerReceipt, RelayerError>;

    async fn reveal(&self, request: &RevealRequest) -> Result<RelayerReceipt, RelayerError>;

    async fn health(&self) -> Result<(), RelayerError>;
}

/// Relayer reached over HTTP
#[derive(Debug, Clone)]
pub struct HttpRelayer {
    base_url: String,
    client: Client,
    secret: Option<String>,
    network: Option<String>,
}

impl HttpRelayer {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, RelayerError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayerError::Transport(e.to_string()))?;
        Ok(Self {
            base_url: url.trim_end_matches('/').to_string(),
            client,
            secret: None,
            network: None,
        })
    }

    pub fn with_secret(mut self, secret: Option<String>) -> Self {
        self.secret = secret;
        self
    }

    pub fn with_network(mut self, network: &str) -> Self {
        self.network = Some(network.to_string());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<RelayerReceipt, RelayerError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.post(&url).json(body);
        if let Some(secret) = &self.secret {
            request = request.header(SECRET_HEADER, secret);
        }
        if let Some(network) = &self.network {
            request = request.header(NETWORK_HEADER, network);
        }

        let resp = request.send().await.map_err(|e| {
            warn!(path, error = %e, "Relayer request failed");
            RelayerError::Transport(e.to_string())
        })?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| RelayerError::Transport(e.to_string()))?;
        debug!(path, status = status.as_u16(), "Relayer responded");
        classify(status, &text)
    }
}

/// Map a status and body onto the error taxonomy
fn classify(status: StatusCode, body: &str) -> Result<RelayerReceipt, RelayerError> {
    let parsed = serde_json::from_str::<RelayerResponse>(body);
    if status.is_server_error() {
        let message = parsed
            .ok()
            .and_then(|r| r.error)
            .unwrap_or_else(|| body.to_string());
        return Err(RelayerError::Server {
            status: status.as_u16(),
            message,
        });
    }
    if !status.is_success() {
        let message = parsed
            .ok()
            .and_then(|r| r.error)
            .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
        return Err(RelayerError::Rejected(message));
    }
    let response = parsed.map_err(|e| RelayerError::Decode(e.to_string()))?;
    if !response.success {
        return Err(RelayerError::Rejected(
            response.error.unwrap_or_else(|| "unspecified".to_string()),
        ));
    }
    Ok(RelayerReceipt { tx: response.tx })
}

#[async_trait]
impl Relayer for HttpRelayer {
    async fn commit(&self, request: &CommitRequest) -> Result<RelayerReceipt, RelayerError> {
        self.post("/commit", request).await
    }

    async fn reveal(&self, request: &RevealRequest) -> Result<RelayerReceipt, RelayerError> {
        self.post(request.operation.reveal_path(), request).await
    }

    async fn health(&self) -> Result<(), RelayerError> {
        let url = format!("{}/health", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RelayerError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(RelayerError::Server {
                status: resp.status().as_u16(),
                message: "health check failed".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(StatusCode::OK, r#"{"success":true,"tx":"0xabc"}"#),
            Ok(RelayerReceipt {
                tx: Some("0xabc".to_string())
            })
        );
        assert_eq!(
            classify(StatusCode::OK, r#"{"success":false,"error":"insufficient balance"}"#),
            Err(RelayerError::Rejected("insufficient balance".to_string()))
        );
        assert_eq!(
            classify(StatusCode::BAD_REQUEST, r#"{"success":false,"error":"commit exists"}"#),
            Err(RelayerError::Rejected("commit exists".to_string()))
        );
        assert!(classify(StatusCode::BAD_GATEWAY, "upstream down")
            .unwrap_err()
            .is_transient());
        assert!(matches!(
            classify(StatusCode::OK, "not json"),
            Err(RelayerError::Decode(_))
        ));
    }

    #[test]
    fn test_reveal_body_is_flat() {
        let request = RevealRequest {
            address: Address([1; 20]),
            authorization: Authorization {
                index: 5,
                neighbors: vec![Hash32([2; 32])],
                eotp: Hash32([3; 32]),
            },
            operation: Operation::Transfer {
                dest: Address([4; 20]),
                amount: 100,
            },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["index"], 5);
        assert_eq!(json["amount"], "100");
        assert_eq!(json["operation"], "transfer");
        assert_eq!(json["dest"], format!("0x{}", "04".repeat(20)));
        assert!(json["neighbors"].is_array());
        assert!(json["eotp"].is_string());
    }
}
