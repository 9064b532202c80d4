//! JSON-RPC ledger gateway.
//!
//! Talks JSON-RPC 2.0 over HTTP to a ledger node that exposes the escrow
//! contract. Transport failures map to transient errors; RPC error objects
//! are classified by code.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::address::{Address, PayerCredential};
use crate::amount::Amount;
use crate::error::{LedgerError, Result};
use crate::gateway::{LedgerFuture, LedgerGateway};
use crate::submission::{Submission, TxRef};

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmationsResult {
    confirmations: u32,
}

/// Ledger gateway backed by a JSON-RPC node.
pub struct RpcLedger {
    endpoint: String,
    client: reqwest::Client,
    timeout: Duration,
    next_id: AtomicU64,
}

impl RpcLedger {
    /// Create a gateway for the given endpoint.
    ///
    /// # Errors
    ///
    /// Returns error if the endpoint is empty or the HTTP client cannot be
    /// built.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let endpoint = endpoint.into();
        if endpoint.trim().is_empty() {
            return Err(LedgerError::network("RPC endpoint is empty"));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            endpoint,
            client,
            timeout,
            next_id: AtomicU64::new(1),
        })
    }

    /// The configured endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        debug!(method, id = request.id, "ledger RPC request");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport_error(method, &e))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(LedgerError::network(format!("{method}: HTTP {status}")));
        }

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| self.transport_error(method, &e))?;

        decode_response(method, body)
    }

    fn transport_error(&self, method: &str, err: &reqwest::Error) -> LedgerError {
        if err.is_timeout() {
            LedgerError::Timeout {
                operation: method.to_string(),
                timeout_secs: self.timeout.as_secs(),
            }
        } else if err.is_decode() {
            LedgerError::Rpc {
                code: -32700,
                message: format!("{method}: malformed response: {err}"),
            }
        } else {
            LedgerError::network(format!("{method}: {err}"))
        }
    }

    async fn submit(&self, method: &str, params: Value) -> Result<Submission> {
        let submission: Submission = self.call(method, params).await?;
        info!(method, tx_ref = %submission.tx_ref, "ledger transaction submitted");
        Ok(submission)
    }
}

fn decode_response<T: DeserializeOwned>(method: &str, body: RpcResponse) -> Result<T> {
    if let Some(error) = body.error {
        warn!(method, code = error.code, message = %error.message, "ledger RPC error");
        return Err(match error.code {
            LedgerError::RPC_INVALID_ADDRESS => LedgerError::invalid_address(error.message),
            LedgerError::RPC_REJECTED => LedgerError::rejected(error.message),
            code => LedgerError::Rpc {
                code,
                message: error.message,
            },
        });
    }
    let result = body.result.ok_or_else(|| LedgerError::Rpc {
        code: -32603,
        message: format!("{method}: response carries neither result nor error"),
    })?;
    Ok(serde_json::from_value(result)?)
}

impl LedgerGateway for RpcLedger {
    fn submit_lock<'a>(
        &'a self,
        payer: &'a PayerCredential,
        payee: &'a Address,
        amount: Amount,
        job_id: &'a str,
    ) -> LedgerFuture<'a, Submission> {
        Box::pin(async move {
            let params = json!({
                "seed": payer.expose(),
                "payee": payee.as_str(),
                "amount": amount.micros(),
                "jobId": job_id,
            });
            self.submit("escrow_lock", params).await
        })
    }

    fn submit_release<'a>(
        &'a self,
        payee: &'a Address,
        amount: Amount,
        job_id: &'a str,
    ) -> LedgerFuture<'a, Submission> {
        Box::pin(async move {
            let params = json!({
                "payee": payee.as_str(),
                "amount": amount.micros(),
                "jobId": job_id,
            });
            self.submit("escrow_release", params).await
        })
    }

    fn submit_refund<'a>(
        &'a self,
        payer: &'a Address,
        amount: Amount,
        job_id: &'a str,
    ) -> LedgerFuture<'a, Submission> {
        Box::pin(async move {
            let params = json!({
                "payer": payer.as_str(),
                "amount": amount.micros(),
                "jobId": job_id,
            });
            self.submit("escrow_refund", params).await
        })
    }

    fn confirmations<'a>(&'a self, tx_ref: &'a TxRef) -> LedgerFuture<'a, u32> {
        Box::pin(async move {
            let result: ConfirmationsResult = self
                .call("tx_confirmations", json!({ "txRef": tx_ref.as_str() }))
                .await?;
            Ok(result.confirmations)
        })
    }

    fn name(&self) -> &'static str {
        "rpc"
    }
}

#[allow(clippy::missing_fields_in_debug)]
impl std::fmt::Debug for RpcLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcLedger")
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
