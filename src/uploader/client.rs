// 分片上传 HTTP 客户端
//
// 承载与服务端的全部交互：分片上传（multipart）、合并、秒传检查。
// 请求形状通过 RequestTransformer 开放定制，默认实现覆盖常见的
// 分片上传服务端约定。judge 成败只看 HTTP 状态码：非 2xx 一律按
// 可重试的服务端错误处理，重试决策交给上层

use crate::cache::CompletedChunk;
use crate::config::{EndpointConfig, RequestConfig};
use crate::error::{ErrorContext, UploadError};
use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::multipart;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// 分片上传请求的全部上下文
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub task_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub file_md5: Option<String>,
    /// 分片索引（0 起）
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub chunk_start: u64,
    pub chunk_end: u64,
    /// 分片数据
    pub data: Vec<u8>,
    /// 合并后的自定义参数（全局配置 + 任务级覆盖）
    pub params: HashMap<String, String>,
}

/// 合并请求上下文
#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub task_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub file_md5: Option<String>,
    pub total_chunks: usize,
    /// 已完成分片（索引 + etag）
    pub chunks: Vec<CompletedChunk>,
    pub params: HashMap<String, String>,
}

/// 秒传检查请求上下文
#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub file_name: String,
    pub file_size: u64,
    /// 文件 MD5，哈希关闭时为文件名
    pub identity: String,
    pub params: HashMap<String, String>,
}

/// 请求形状定制点
///
/// 服务端约定五花八门，字段名、载荷结构都可能不同；
/// 实现此 trait 即可适配，客户端只负责发送与状态码判定
pub trait RequestTransformer: Send + Sync {
    /// 构造分片上传的 multipart 表单
    fn chunk_form(&self, request: &ChunkRequest) -> Result<multipart::Form>;

    /// 构造合并请求的 JSON 载荷
    fn merge_body(&self, request: &MergeRequest) -> Value;

    /// 构造秒传检查的 JSON 载荷
    fn check_body(&self, request: &CheckRequest) -> Value;
}

/// 默认请求形状
pub struct DefaultTransformer;

impl RequestTransformer for DefaultTransformer {
    fn chunk_form(&self, request: &ChunkRequest) -> Result<multipart::Form> {
        let part = multipart::Part::bytes(request.data.clone())
            .file_name(request.file_name.clone())
            .mime_str("application/octet-stream")
            .context("构造分片数据 part 失败")?;

        let mut form = multipart::Form::new()
            .part("file", part)
            .text("task_id", request.task_id.clone())
            .text("chunk_index", request.chunk_index.to_string())
            .text("total_chunks", request.total_chunks.to_string())
            .text("file_name", request.file_name.clone())
            .text("file_size", request.file_size.to_string())
            .text("chunk_size", (request.chunk_end - request.chunk_start).to_string());

        if let Some(md5) = &request.file_md5 {
            form = form.text("file_md5", md5.clone());
        }
        for (key, value) in &request.params {
            form = form.text(key.clone(), value.clone());
        }
        Ok(form)
    }

    fn merge_body(&self, request: &MergeRequest) -> Value {
        let chunks: Vec<Value> = request
            .chunks
            .iter()
            .map(|c| json!({ "index": c.index, "etag": c.etag }))
            .collect();

        let mut body = json!({
            "task_id": request.task_id,
            "file_name": request.file_name,
            "file_size": request.file_size,
            "total_chunks": request.total_chunks,
            "chunks": chunks,
        });
        if let Some(md5) = &request.file_md5 {
            body["file_md5"] = json!(md5);
        }
        for (key, value) in &request.params {
            body[key.as_str()] = json!(value);
        }
        body
    }

    fn check_body(&self, request: &CheckRequest) -> Value {
        let mut body = json!({
            "file_md5": request.identity,
            "file_name": request.file_name,
            "file_size": request.file_size,
        });
        for (key, value) in &request.params {
            body[key.as_str()] = json!(value);
        }
        body
    }
}

/// 分片上传响应
#[derive(Debug, Clone)]
pub struct ChunkUploadResponse {
    /// 服务端返回的分片标识
    pub etag: Option<String>,
    /// 原始响应体
    pub raw: Value,
}

/// 合并响应
#[derive(Debug, Clone)]
pub struct MergeResponse {
    /// 合并后的文件引用
    pub file_url: Option<String>,
    pub raw: Value,
}

/// 秒传检查响应
#[derive(Debug, Clone)]
pub struct CheckResponse {
    /// 服务端是否已存在该文件
    pub exists: bool,
    pub file_url: Option<String>,
    pub raw: Value,
}

/// 在响应体里按多个惯用键名取值
fn extract_str(raw: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(v) = raw.get(key).and_then(|v| v.as_str()) {
            return Some(v.to_string());
        }
        if let Some(v) = raw.get("data").and_then(|d| d.get(key)).and_then(|v| v.as_str()) {
            return Some(v.to_string());
        }
    }
    None
}

fn extract_bool(raw: &Value, keys: &[&str]) -> Option<bool> {
    for key in keys {
        if let Some(v) = raw.get(key).and_then(|v| v.as_bool()) {
            return Some(v);
        }
        if let Some(v) = raw.get("data").and_then(|d| d.get(key)).and_then(|v| v.as_bool()) {
            return Some(v);
        }
    }
    None
}

/// 分片上传客户端
#[derive(Clone)]
pub struct ChunkClient {
    client: reqwest::Client,
    endpoints: EndpointConfig,
    timeout_secs: u64,
    transformer: Arc<dyn RequestTransformer>,
}

impl std::fmt::Debug for ChunkClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkClient")
            .field("endpoints", &self.endpoints)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl ChunkClient {
    /// 用默认请求形状创建客户端
    pub fn new(endpoints: EndpointConfig, request: &RequestConfig) -> Result<Self> {
        Self::with_transformer(endpoints, request, Arc::new(DefaultTransformer))
    }

    /// 用自定义请求形状创建客户端
    pub fn with_transformer(
        endpoints: EndpointConfig,
        request: &RequestConfig,
        transformer: Arc<dyn RequestTransformer>,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (key, value) in &request.headers {
            let name: HeaderName = key.parse().with_context(|| format!("非法请求头名: {}", key))?;
            let value =
                HeaderValue::from_str(value).with_context(|| format!("非法请求头值: {}", key))?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(request.timeout_secs))
            .default_headers(headers)
            .build()
            .context("创建 HTTP 客户端失败")?;

        Ok(Self {
            client,
            endpoints,
            timeout_secs: request.timeout_secs,
            transformer,
        })
    }

    /// 解析响应体（非 JSON 的 2xx 响应按空载荷处理）
    async fn parse_body(response: reqwest::Response) -> Value {
        let text = response.text().await.unwrap_or_default();
        if text.is_empty() {
            return Value::Null;
        }
        serde_json::from_str(&text).unwrap_or_else(|_| {
            debug!("响应体不是 JSON，忽略: {}", truncate(&text, 120));
            Value::Null
        })
    }

    /// 上传单个分片（一次请求，重试由上层驱动）
    pub async fn upload_chunk(
        &self,
        request: &ChunkRequest,
    ) -> Result<ChunkUploadResponse, UploadError> {
        let context = ErrorContext::for_task(&request.task_id).with_chunk(request.chunk_index);

        let form = self.transformer.chunk_form(request).map_err(|e| {
            UploadError::Unknown {
                message: format!("构造分片请求失败: {}", e),
                context: context.clone(),
            }
        })?;

        debug!(
            "上传分片: task={}, chunk={}/{}, bytes={}-{}",
            request.task_id,
            request.chunk_index + 1,
            request.total_chunks,
            request.chunk_start,
            request.chunk_end
        );

        let response = self
            .client
            .post(&self.endpoints.upload_url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| UploadError::from_reqwest(e, self.timeout_secs, context.clone()))?;

        let status = response.status();
        if !status.is_success() {
            let body = Self::parse_body(response).await;
            warn!(
                "分片上传返回非 2xx: task={}, chunk={}, status={}",
                request.task_id, request.chunk_index, status
            );
            return Err(UploadError::Server {
                status: status.as_u16(),
                message: truncate(&body.to_string(), 200),
                context,
            });
        }

        let raw = Self::parse_body(response).await;
        let etag = extract_str(&raw, &["etag", "md5", "chunk_etag"]);
        Ok(ChunkUploadResponse { etag, raw })
    }

    /// 合并全部分片
    pub async fn merge_chunks(&self, request: &MergeRequest) -> Result<MergeResponse, UploadError> {
        let context = ErrorContext::for_task(&request.task_id);
        let body = self.transformer.merge_body(request);

        debug!(
            "合并分片: task={}, chunks={}",
            request.task_id, request.total_chunks
        );

        let response = self
            .client
            .post(&self.endpoints.merge_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| UploadError::from_reqwest(e, self.timeout_secs, context.clone()))?;

        let status = response.status();
        if !status.is_success() {
            let body = Self::parse_body(response).await;
            warn!(
                "合并请求返回非 2xx: task={}, status={}",
                request.task_id, status
            );
            return Err(UploadError::Server {
                status: status.as_u16(),
                message: truncate(&body.to_string(), 200),
                context,
            });
        }

        let raw = Self::parse_body(response).await;
        let file_url = extract_str(&raw, &["url", "file_url", "location"]);
        Ok(MergeResponse { file_url, raw })
    }

    /// 秒传检查，未配置检查端点时返回 None
    pub async fn check_file(
        &self,
        request: &CheckRequest,
    ) -> Result<Option<CheckResponse>, UploadError> {
        let Some(check_url) = &self.endpoints.check_url else {
            return Ok(None);
        };
        let context = ErrorContext::default();
        let body = self.transformer.check_body(request);

        let response = self
            .client
            .post(check_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| UploadError::from_reqwest(e, self.timeout_secs, context.clone()))?;

        let status = response.status();
        if !status.is_success() {
            let body = Self::parse_body(response).await;
            return Err(UploadError::Server {
                status: status.as_u16(),
                message: truncate(&body.to_string(), 200),
                context,
            });
        }

        let raw = Self::parse_body(response).await;
        let exists = extract_bool(&raw, &["exists", "uploaded"]).unwrap_or(false);
        let file_url = extract_str(&raw, &["url", "file_url"]);
        debug!("秒传检查: identity={}, exists={}", request.identity, exists);
        Ok(Some(CheckResponse { exists, file_url, raw }))
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}
