//! Thin JSON-RPC client over HTTP.
//!
//! Only the two methods the batcher needs: `eth_call` and `eth_blockNumber`.
//! Transport and node-side failures surface as `Err`; the multicall layer
//! turns those into per-address `None` values.

pub mod multicall;

use alloy_primitives::Address;
use eyre::{bail, WrapErr};
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<serde_json::Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

pub struct RpcClient {
    http: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(url: &str, timeout: Duration) -> eyre::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .wrap_err("failed to build RPC HTTP client")?;
        Ok(Self {
            http,
            url: url.to_string(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn request(&self, method: &str, params: serde_json::Value) -> eyre::Result<serde_json::Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        });

        let resp: RpcResponse = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .wrap_err_with(|| format!("{method} transport error"))?
            .error_for_status()
            .wrap_err_with(|| format!("{method} HTTP error"))?
            .json()
            .await
            .wrap_err_with(|| format!("{method} malformed response"))?;

        if let Some(err) = resp.error {
            bail!("{method} node error {}: {}", err.code, err.message);
        }
        resp.result
            .ok_or_else(|| eyre::eyre!("{method} response missing result"))
    }

    /// `eth_call` against `to` with raw calldata, at `block` or latest.
    pub async fn eth_call(
        &self,
        to: Address,
        data: &[u8],
        block: Option<u64>,
    ) -> eyre::Result<Vec<u8>> {
        let block_tag = match block {
            Some(n) => format!("0x{n:x}"),
            None => "latest".to_string(),
        };
        let params = json!([
            { "to": format!("{to:#x}"), "data": format!("0x{}", hex::encode(data)) },
            block_tag,
        ]);
        let result = self.request("eth_call", params).await?;
        decode_hex_bytes(&result)
    }

    /// Current chain head.
    pub async fn block_number(&self) -> eyre::Result<u64> {
        let result = self.request("eth_blockNumber", json!([])).await?;
        decode_hex_quantity(&result)
    }
}

fn decode_hex_bytes(value: &serde_json::Value) -> eyre::Result<Vec<u8>> {
    let s = value
        .as_str()
        .ok_or_else(|| eyre::eyre!("expected hex string, got {value}"))?;
    hex::decode(s.trim_start_matches("0x")).wrap_err("invalid hex return data")
}

fn decode_hex_quantity(value: &serde_json::Value) -> eyre::Result<u64> {
    let s = value
        .as_str()
        .ok_or_else(|| eyre::eyre!("expected hex quantity, got {value}"))?;
    u64::from_str_radix(s.trim_start_matches("0x"), 16).wrap_err("invalid hex quantity")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_hex_quantity() {
        assert_eq!(decode_hex_quantity(&json!("0x1b4")).unwrap(), 436);
        assert_eq!(decode_hex_quantity(&json!("0x0")).unwrap(), 0);
        assert!(decode_hex_quantity(&json!(12)).is_err());
        assert!(decode_hex_quantity(&json!("0xzz")).is_err());
    }

    #[test]
    fn decodes_hex_bytes() {
        assert_eq!(decode_hex_bytes(&json!("0x00ff")).unwrap(), vec![0u8, 255]);
        assert_eq!(decode_hex_bytes(&json!("0x")).unwrap(), Vec::<u8>::new());
        assert!(decode_hex_bytes(&json!(null)).is_err());
    }
}
