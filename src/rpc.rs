//! 工作源接口和 getwork JSON-RPC 客户端

use std::time::Duration;

use log::{debug, trace};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::RpcEndpoint;
use crate::error::{MinerError, MinerResult};
use crate::work::{Target, WorkItem, encode_data_words, with_nonce};

/// 请求超时
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// 外部工作源
pub trait WorkSource: Send {
    /// 获取一个新的工作单元 (包含当前目标)
    fn fetch_work(&mut self) -> MinerResult<WorkItem>;

    /// 提交候选 nonce，返回是否被接受
    fn submit_candidate(&mut self, data_words: &[u32; 32], nonce: u32) -> MinerResult<bool>;
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct GetworkResult {
    data: String,
    midstate: String,
    target: String,
}

fn decode_hex<const N: usize>(field: &str, hexstr: &str) -> MinerResult<[u8; N]> {
    let mut out = [0u8; N];
    hex::decode_to_slice(hexstr, &mut out)
        .map_err(|e| MinerError::protocol(&format!("JSON invalid {field}"), e))?;
    Ok(out)
}

fn le_words<const N: usize>(bytes: &[u8]) -> [u32; N] {
    let mut words = [0u32; N];
    for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
        *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    words
}

/// 解码 getwork 的 `result` 对象
pub fn decode_work(result: &Value) -> MinerResult<WorkItem> {
    let work: GetworkResult = serde_json::from_value(result.clone())
        .map_err(|e| MinerError::protocol("work decode failed", e))?;
    let data: [u8; 128] = decode_hex("data", &work.data)?;
    let midstate: [u8; 32] = decode_hex("midstate", &work.midstate)?;
    let target: [u8; 32] = decode_hex("target", &work.target)?;
    Ok(WorkItem {
        data_words: le_words(&data),
        midstate: le_words(&midstate),
        target: Target(target),
    })
}

/// 构造提交请求的参数
pub fn submit_params(data_words: &[u32; 32], nonce: u32) -> Value {
    json!([hex::encode(encode_data_words(&with_nonce(data_words, nonce)))])
}

/// 比特币节点 getwork 客户端
pub struct GetworkClient {
    http: reqwest::blocking::Client,
    endpoint: RpcEndpoint,
    next_id: u64,
}

impl GetworkClient {
    pub fn new(endpoint: RpcEndpoint) -> MinerResult<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .tcp_nodelay(true)
            .build()?;
        Ok(Self {
            http,
            endpoint,
            next_id: 0,
        })
    }

    fn call(&mut self, params: Value) -> MinerResult<Value> {
        let request = json!({ "method": "getwork", "params": params, "id": self.next_id });
        self.next_id += 1;
        trace!("JSON protocol request: {}", request);

        let response: RpcResponse = self
            .http
            .post(self.endpoint.url())
            .basic_auth(&self.endpoint.user, Some(&self.endpoint.password))
            .json(&request)
            .send()?
            .error_for_status()?
            .json()?;

        if let Some(err) = response.error {
            return Err(MinerError::Protocol(format!(
                "getwork error {}: {}",
                err.code, err.message
            )));
        }
        Ok(response.result)
    }
}

impl WorkSource for GetworkClient {
    fn fetch_work(&mut self) -> MinerResult<WorkItem> {
        let result = self.call(json!([]))?;
        let work = decode_work(&result)?;
        debug!(
            "data: {:08x}... midstate: {:08x}... target: {}...",
            work.data_words[0],
            work.midstate[0],
            hex::encode(&work.target.0[..4])
        );
        Ok(work)
    }

    fn submit_candidate(&mut self, data_words: &[u32; 32], nonce: u32) -> MinerResult<bool> {
        let result = self.call(submit_params(data_words, nonce))?;
        Ok(result.as_bool().unwrap_or(false))
    }
}
