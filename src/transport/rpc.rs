//! Rate-limited JSON-RPC client
//!
//! One primary endpoint plus ordered backups. Transient failures retry with
//! exponential backoff and fall through to the next endpoint; protocol-level
//! errors surface immediately. Integer fields tolerate `0x`-hex, decimal
//! strings and plain numbers.

use alloy::primitives::{hex, Address, Bytes, U256};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::rate_limiter::{backoff_delay, RateLimiter};
use super::{build_request, unwrap_envelope, JsonRpcConnection};
use crate::error::{AdapterError, EngineError, ProtocolError, TransportError};
use crate::numeric;

/// Production connection: one HTTPS POST per payload.
pub struct HttpConnection {
    client: reqwest::Client,
}

impl HttpConnection {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl JsonRpcConnection for HttpConnection {
    async fn send(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: Value,
    ) -> Result<Value, TransportError> {
        let mut request = self.client.post(url).json(&body);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(0)
            } else {
                TransportError::Http(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::ServerError {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| TransportError::Http(format!("body decode: {}", e)))
    }
}

/// JSON-RPC client over an endpoint set with failover and batching.
pub struct RpcClient {
    conn: Arc<dyn JsonRpcConnection>,
    endpoints: Vec<String>,
    limiter: Arc<RateLimiter>,
    retries_per_endpoint: u32,
    id_counter: AtomicU64,
}

impl RpcClient {
    pub fn new(
        conn: Arc<dyn JsonRpcConnection>,
        endpoints: Vec<String>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            conn,
            endpoints,
            limiter,
            retries_per_endpoint: 2,
            id_counter: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.id_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Single request with failover: each endpoint gets bounded retries on
    /// transient errors before the next endpoint takes over.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, EngineError> {
        let body = build_request(self.next_id(), method, params);
        let mut last_transport: Option<TransportError> = None;

        for (endpoint_idx, endpoint) in self.endpoints.iter().enumerate() {
            for attempt in 0..=self.retries_per_endpoint {
                self.limiter.acquire().await?;
                match self.conn.send(endpoint, &[], body.clone()).await {
                    Ok(response) => {
                        return unwrap_envelope(response).map_err(EngineError::Protocol)
                    }
                    Err(e) if e.is_transient() => {
                        let delay = backoff_delay(
                            attempt,
                            Duration::from_millis(200),
                            Duration::from_secs(5),
                        );
                        debug!(
                            endpoint = endpoint_idx,
                            attempt,
                            error = %e,
                            "rpc request failed, backing off {:?}",
                            delay
                        );
                        last_transport = Some(e);
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => return Err(EngineError::Transport(e)),
                }
            }
            warn!(endpoint = endpoint_idx, method, "endpoint exhausted, failing over");
        }

        Err(EngineError::Transport(last_transport.unwrap_or(
            TransportError::EndpointsExhausted(self.endpoints.len()),
        )))
    }

    /// Batch request: one wire round-trip, per-call results in input order.
    /// Missing responses surface as malformed-response entries.
    pub async fn batch(
        &self,
        calls: &[(&str, Value)],
    ) -> Result<Vec<Result<Value, ProtocolError>>, EngineError> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }
        let first_id = self.id_counter.fetch_add(calls.len() as u64, Ordering::Relaxed);
        let body: Vec<Value> = calls
            .iter()
            .enumerate()
            .map(|(i, (method, params))| build_request(first_id + i as u64, method, params.clone()))
            .collect();

        let mut last_transport: Option<TransportError> = None;
        for endpoint in &self.endpoints {
            self.limiter.acquire().await?;
            match self.conn.send(endpoint, &[], Value::Array(body.clone())).await {
                Ok(Value::Array(responses)) => {
                    let mut ordered: Vec<Result<Value, ProtocolError>> = (0..calls.len())
                        .map(|_| {
                            Err(ProtocolError::MalformedResponse("missing batch entry".into()))
                        })
                        .collect();
                    for response in responses {
                        let Some(id) = response.get("id").and_then(|v| v.as_u64()) else {
                            continue;
                        };
                        let Some(index) = id.checked_sub(first_id) else { continue };
                        if (index as usize) < ordered.len() {
                            ordered[index as usize] = unwrap_envelope(response);
                        }
                    }
                    return Ok(ordered);
                }
                Ok(other) => {
                    // A bare error envelope in place of the array
                    return Err(EngineError::Protocol(
                        unwrap_envelope(other).map(|_| {
                            ProtocolError::MalformedResponse("expected batch array".into())
                        }).unwrap_or_else(|e| e),
                    ));
                }
                Err(e) if e.is_transient() => last_transport = Some(e),
                Err(e) => return Err(EngineError::Transport(e)),
            }
        }
        Err(EngineError::Transport(last_transport.unwrap_or(
            TransportError::EndpointsExhausted(self.endpoints.len()),
        )))
    }

    /// Current head block number.
    pub async fn block_number(&self) -> Result<u64, EngineError> {
        let result = self.request("eth_blockNumber", json!([])).await?;
        numeric::parse_hex_or_int(&result).ok_or_else(|| {
            EngineError::Protocol(ProtocolError::MalformedResponse(format!(
                "bad block number: {}",
                result
            )))
        })
    }

    /// Current gas price in wei.
    pub async fn gas_price(&self) -> Result<U256, EngineError> {
        let result = self.request("eth_gasPrice", json!([])).await?;
        numeric::parse_hex_or_u256(&result).ok_or_else(|| {
            EngineError::Protocol(ProtocolError::MalformedResponse(format!(
                "bad gas price: {}",
                result
            )))
        })
    }

    /// Block header lookup: (number, base fee). Pre-1559 blocks report a
    /// zero base fee.
    pub async fn block_base_fee(&self, number: u64) -> Result<(u64, U256), EngineError> {
        let result = self
            .request(
                "eth_getBlockByNumber",
                json!([numeric::to_hex_quantity(number), false]),
            )
            .await?;
        if result.is_null() {
            return Err(EngineError::Protocol(ProtocolError::MalformedResponse(
                format!("block {} not found", number),
            )));
        }
        let parsed_number = result
            .get("number")
            .and_then(numeric::parse_hex_or_int)
            .unwrap_or(number);
        let base_fee = result
            .get("baseFeePerGas")
            .and_then(numeric::parse_hex_or_u256)
            .unwrap_or(U256::ZERO);
        Ok((parsed_number, base_fee))
    }

    /// eth_call against a contract. RPC-level errors carrying revert data
    /// come back as adapter decode errors so quoting can continue.
    pub async fn eth_call(&self, to: Address, data: Bytes) -> Result<Vec<u8>, AdapterError> {
        let params = json!([
            {"to": numeric::checksum(to), "data": format!("0x{}", hex::encode(&data))},
            "latest"
        ]);
        match self.request("eth_call", params).await {
            Ok(result) => {
                let s = result.as_str().ok_or_else(|| {
                    AdapterError::Decode("eth_call result not a string".into())
                })?;
                hex::decode(s.trim_start_matches("0x"))
                    .map_err(|e| AdapterError::Decode(format!("bad call result hex: {}", e)))
            }
            Err(EngineError::Transport(e)) => Err(AdapterError::Transport(e)),
            Err(EngineError::Protocol(ProtocolError::Rpc { message, .. })) => {
                Err(AdapterError::Decode(format!("call reverted: {}", message)))
            }
            Err(e) => Err(AdapterError::Decode(e.to_string())),
        }
    }

    /// Build eth_call params for use inside a batch.
    pub fn eth_call_params(to: Address, data: &Bytes) -> Value {
        json!([
            {"to": numeric::checksum(to), "data": format!("0x{}", hex::encode(data))},
            "latest"
        ])
    }
}

#[cfg(test)]
pub mod testing {
    //! Scripted connection for tests: canned results per method, with
    //! calldata-prefix matching for eth_call.

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MockConnection {
        /// method -> FIFO of one-shot results
        queued: Mutex<HashMap<String, Vec<Value>>>,
        /// method -> repeating result
        defaults: Mutex<HashMap<String, Value>>,
        /// calldata prefix (lowercase, no 0x) -> repeating eth_call result
        call_routes: Mutex<Vec<(String, Value)>>,
        pub calls: Mutex<Vec<(String, Value)>>,
        /// Errors to burn through before anything succeeds
        transport_failures: Mutex<u32>,
    }

    impl MockConnection {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push(&self, method: &str, result: Value) {
            self.queued
                .lock()
                .unwrap()
                .entry(method.to_string())
                .or_default()
                .push(result);
        }

        pub fn set_default(&self, method: &str, result: Value) {
            self.defaults
                .lock()
                .unwrap()
                .insert(method.to_string(), result);
        }

        /// Route eth_call by calldata prefix (selector or longer).
        pub fn route_call(&self, data_prefix: &str, result: Value) {
            self.call_routes.lock().unwrap().push((
                data_prefix.trim_start_matches("0x").to_ascii_lowercase(),
                result,
            ));
        }

        pub fn fail_next(&self, count: u32) {
            *self.transport_failures.lock().unwrap() = count;
        }

        pub fn count(&self, method: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(m, _)| m == method)
                .count()
        }

        fn respond(&self, request: &Value) -> Value {
            let method = request["method"].as_str().unwrap_or("").to_string();
            let id = request["id"].clone();
            self.calls
                .lock()
                .unwrap()
                .push((method.clone(), request["params"].clone()));

            if method == "eth_call" {
                let data = request["params"][0]["data"]
                    .as_str()
                    .unwrap_or("")
                    .trim_start_matches("0x")
                    .to_ascii_lowercase();
                for (prefix, result) in self.call_routes.lock().unwrap().iter() {
                    if data.starts_with(prefix.as_str()) {
                        return wrap(id, result.clone());
                    }
                }
            }

            let queued = self.queued.lock().unwrap().get_mut(&method).and_then(|q| {
                if q.is_empty() {
                    None
                } else {
                    Some(q.remove(0))
                }
            });
            if let Some(result) = queued {
                return wrap(id, result);
            }
            if let Some(result) = self.defaults.lock().unwrap().get(&method) {
                return wrap(id, result.clone());
            }
            json!({
                "jsonrpc": "2.0", "id": id,
                "error": {"code": -32601, "message": format!("method {} not found", method)}
            })
        }
    }

    fn wrap(id: Value, result: Value) -> Value {
        // An object with an "error" key is treated as a pre-built error
        // envelope body
        if result.get("error").is_some() {
            let mut envelope = result;
            envelope["jsonrpc"] = json!("2.0");
            envelope["id"] = id;
            envelope
        } else {
            json!({"jsonrpc": "2.0", "id": id, "result": result})
        }
    }

    #[async_trait]
    impl JsonRpcConnection for MockConnection {
        async fn send(
            &self,
            _url: &str,
            _headers: &[(String, String)],
            body: Value,
        ) -> Result<Value, TransportError> {
            {
                let mut failures = self.transport_failures.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(TransportError::Http("connection reset".into()));
                }
            }
            match body {
                Value::Array(requests) => Ok(Value::Array(
                    requests.iter().map(|r| self.respond(r)).collect(),
                )),
                request => Ok(self.respond(&request)),
            }
        }
    }

    pub fn test_client(conn: Arc<MockConnection>) -> RpcClient {
        RpcClient::new(
            conn,
            vec!["http://primary".into(), "http://backup".into()],
            Arc::new(RateLimiter::new(1_000, Duration::from_secs(5))),
        )
    }
}
