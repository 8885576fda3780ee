// 配置管理模块
//
// 所有字段均可选且带默认值，支持从 TOML 文件加载/保存。
// 并发上限（文件数/分片数）是自适应调节的天花板，运行期只会在
// [1, 配置值] 区间内调整，不会越过用户声明的上限。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tracing::warn;

/// 上传客户端配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UploaderConfig {
    /// 服务端端点
    #[serde(default)]
    pub endpoints: EndpointConfig,
    /// 并发配置
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    /// 分片配置
    #[serde(default)]
    pub chunking: ChunkingConfig,
    /// 重试与退避配置
    #[serde(default)]
    pub retry: RetryConfig,
    /// 请求配置（超时、自定义头、自定义参数）
    #[serde(default)]
    pub request: RequestConfig,
    /// 文件过滤规则
    #[serde(default)]
    pub filters: FileFilterConfig,
    /// 功能开关
    #[serde(default)]
    pub features: FeatureFlags,
    /// 图片处理参数（预留，见 features 说明）
    #[serde(default)]
    pub image: ImageConfig,
    /// 网络自适应调节配置
    #[serde(default)]
    pub adaptive: AdaptiveConfig,
    /// 缓存配置（断点续传/秒传缓存）
    #[serde(default)]
    pub cache: CacheConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 服务端端点配置
///
/// 请求体由 transformer 策略构造，端点本身由调用方提供
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EndpointConfig {
    /// 分片上传端点（POST）
    #[serde(default)]
    pub upload_url: String,
    /// 合并端点（POST）
    #[serde(default)]
    pub merge_url: String,
    /// 秒传检查端点（POST，可选）
    #[serde(default)]
    pub check_url: Option<String>,
}

/// 并发配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// 最大同时上传文件数（自适应调节的上限）
    #[serde(default = "default_max_concurrent_files")]
    pub max_concurrent_files: usize,
    /// 单任务最大并发分片数（自适应调节的上限）
    #[serde(default = "default_max_concurrent_chunks")]
    pub max_concurrent_chunks: usize,
}

fn default_max_concurrent_files() -> usize {
    3
}

fn default_max_concurrent_chunks() -> usize {
    3
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_files: default_max_concurrent_files(),
            max_concurrent_chunks: default_max_concurrent_chunks(),
        }
    }
}

/// 分片配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// 默认分片大小（字节）
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// 分片大小下限
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: u64,
    /// 分片大小上限
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,
}

fn default_chunk_size() -> u64 {
    4 * 1024 * 1024 // 4MB
}

fn default_min_chunk_size() -> u64 {
    256 * 1024 // 256KB
}

fn default_max_chunk_size() -> u64 {
    32 * 1024 * 1024 // 32MB
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            min_chunk_size: default_min_chunk_size(),
            max_chunk_size: default_max_chunk_size(),
        }
    }
}

/// 重试与退避配置
///
/// 延迟公式: `min(base * multiplier^n, max_delay) + 随机抖动(≤ jitter_ratio)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 单分片最大重试次数（跨暂停/恢复累计）
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 退避基础延迟（毫秒）
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// 退避倍率
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// 退避延迟上限（毫秒）
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// 随机抖动比例（0.1 = 最多 10%），打散并发分片的重试风暴
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_jitter_ratio() -> f64 {
    0.1
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

/// 请求配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    /// 单次请求超时（秒）
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// 附加到每个请求的自定义头
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// 附加到默认请求体的自定义参数
    #[serde(default)]
    pub params: HashMap<String, String>,
}

fn default_timeout_secs() -> u64 {
    60
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            headers: HashMap::new(),
            params: HashMap::new(),
        }
    }
}

/// 文件过滤规则
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileFilterConfig {
    /// 允许的扩展名（小写，不含点；空列表 = 不限制）
    #[serde(default)]
    pub accept: Vec<String>,
    /// 单文件大小上限（字节）
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// 单文件大小下限（字节，0 = 不限制；空文件始终拒绝）
    #[serde(default)]
    pub min_file_size: u64,
    /// 队列中的文件数量上限
    #[serde(default = "default_max_file_count")]
    pub max_file_count: usize,
}

fn default_max_file_size() -> u64 {
    10 * 1024 * 1024 * 1024 // 10GB
}

fn default_max_file_count() -> usize {
    100
}

impl Default for FileFilterConfig {
    fn default() -> Self {
        Self {
            accept: Vec::new(),
            max_file_size: default_max_file_size(),
            min_file_size: 0,
            max_file_count: default_max_file_count(),
        }
    }
}

/// 功能开关
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// 断点续传（暂停时持久化分片状态，恢复时还原）
    #[serde(default = "default_true")]
    pub enable_resume: bool,
    /// 秒传检查（本地缓存 + 可选服务端检查端点）
    #[serde(default = "default_true")]
    pub enable_dedup: bool,
    /// 上传前压缩（预留，当前版本不参与流水线）
    #[serde(default)]
    pub enable_compression: bool,
    /// 生成预览图（预留，当前版本不参与流水线）
    #[serde(default)]
    pub enable_preview: bool,
    /// 文件级 MD5 计算（阻塞线程池执行）；关闭时秒传标识退回文件名
    #[serde(default = "default_true")]
    pub hash_in_worker: bool,
    /// 进度/秒传缓存持久化
    #[serde(default = "default_true")]
    pub enable_cache: bool,
    /// 网络自适应并发调节
    #[serde(default = "default_true")]
    pub network_adaptation: bool,
    /// 智能重试（按错误分类决定是否重试；关闭后除中止外一律重试）
    #[serde(default = "default_true")]
    pub smart_retry: bool,
}

fn default_true() -> bool {
    true
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            enable_resume: true,
            enable_dedup: true,
            enable_compression: false,
            enable_preview: false,
            hash_in_worker: true,
            enable_cache: true,
            network_adaptation: true,
            smart_retry: true,
        }
    }
}

/// 图片处理参数
///
/// 预留字段：压缩与预览属于浏览器 Canvas 能力，本实现接受配置但不消费
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// 压缩质量 (0.0 - 1.0)
    #[serde(default = "default_compression_quality")]
    pub compression_quality: f32,
    /// 预览图最大宽度（像素）
    #[serde(default = "default_preview_dimension")]
    pub preview_max_width: u32,
    /// 预览图最大高度（像素）
    #[serde(default = "default_preview_dimension")]
    pub preview_max_height: u32,
}

fn default_compression_quality() -> f32 {
    0.8
}

fn default_preview_dimension() -> u32 {
    200
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            compression_quality: default_compression_quality(),
            preview_max_width: default_preview_dimension(),
            preview_max_height: default_preview_dimension(),
        }
    }
}

/// 网络自适应调节配置
///
/// 定时采样全局速度，低于慢速阈值时收缩并发、高于快速阈值时扩张并发，
/// 调整始终被限制在 [1, 用户配置上限] 区间内
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// 检查间隔（秒），防止频繁调整
    #[serde(default = "default_adaptive_interval_secs")]
    pub check_interval_secs: u64,
    /// 速度采样窗口大小
    #[serde(default = "default_adaptive_window")]
    pub sample_window: usize,
    /// 慢速阈值（字节/秒），低于此值认为网络差
    #[serde(default = "default_slow_threshold")]
    pub slow_threshold_bytes: u64,
    /// 快速阈值（字节/秒），高于此值认为网络好
    #[serde(default = "default_fast_threshold")]
    pub fast_threshold_bytes: u64,
}

fn default_adaptive_interval_secs() -> u64 {
    5
}

fn default_adaptive_window() -> usize {
    8
}

fn default_slow_threshold() -> u64 {
    256 * 1024 // 256KB/s
}

fn default_fast_threshold() -> u64 {
    2 * 1024 * 1024 // 2MB/s
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_adaptive_interval_secs(),
            sample_window: default_adaptive_window(),
            slow_threshold_bytes: default_slow_threshold(),
            fast_threshold_bytes: default_fast_threshold(),
        }
    }
}

/// 缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// 缓存目录（None = 仅内存，不落盘）
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// 续传进度缓存有效期（秒，默认 7 天）
    #[serde(default = "default_progress_ttl_secs")]
    pub progress_ttl_secs: i64,
    /// 秒传记录有效期（秒，默认 24 小时）
    #[serde(default = "default_dedup_ttl_secs")]
    pub dedup_ttl_secs: i64,
}

fn default_progress_ttl_secs() -> i64 {
    7 * 24 * 3600
}

fn default_dedup_ttl_secs() -> i64 {
    24 * 3600
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            progress_ttl_secs: default_progress_ttl_secs(),
            dedup_ttl_secs: default_dedup_ttl_secs(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化（控制台输出始终可用）
    #[serde(default)]
    pub file_enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            file_enabled: false,
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

impl UploaderConfig {
    /// 校验配置合法性
    ///
    /// 端点必须非空，数值参数必须在合理区间内
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.upload_url.is_empty() {
            anyhow::bail!("配置无效：分片上传端点 (endpoints.upload_url) 不能为空");
        }
        if self.endpoints.merge_url.is_empty() {
            anyhow::bail!("配置无效：合并端点 (endpoints.merge_url) 不能为空");
        }
        if self.concurrency.max_concurrent_files == 0 {
            anyhow::bail!("配置无效：max_concurrent_files 必须大于 0");
        }
        if self.concurrency.max_concurrent_chunks == 0 {
            anyhow::bail!("配置无效：max_concurrent_chunks 必须大于 0");
        }
        if self.chunking.min_chunk_size == 0 || self.chunking.min_chunk_size > self.chunking.max_chunk_size {
            anyhow::bail!(
                "配置无效：分片大小边界非法 (min={}, max={})",
                self.chunking.min_chunk_size,
                self.chunking.max_chunk_size
            );
        }
        if self.retry.backoff_multiplier < 1.0 {
            anyhow::bail!("配置无效：backoff_multiplier 不能小于 1.0");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            anyhow::bail!("配置无效：jitter_ratio 必须在 [0, 1] 区间内");
        }
        if self.request.timeout_secs == 0 {
            anyhow::bail!("配置无效：timeout_secs 必须大于 0");
        }
        if self.filters.max_file_count == 0 {
            anyhow::bail!("配置无效：max_file_count 必须大于 0");
        }
        if self.adaptive.slow_threshold_bytes >= self.adaptive.fast_threshold_bytes {
            anyhow::bail!("配置无效：慢速阈值必须低于快速阈值");
        }
        if self.chunking.chunk_size < self.chunking.min_chunk_size
            || self.chunking.chunk_size > self.chunking.max_chunk_size
        {
            warn!(
                "配置的默认分片大小 {} 超出边界，运行时将被收拢到 [{}, {}]",
                self.chunking.chunk_size, self.chunking.min_chunk_size, self.chunking.max_chunk_size
            );
        }
        Ok(())
    }

    /// 从 TOML 文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: UploaderConfig =
            toml::from_str(&content).context("Failed to parse config file")?;

        config.validate().context("配置文件校验失败")?;

        Ok(config)
    }

    /// 保存配置到 TOML 文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        Ok(())
    }

    /// 加载配置，失败时回退到默认值
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => config,
            Err(e) => {
                warn!("加载配置失败（{}），使用默认配置", e);
                Self::default()
            }
        }
    }
}
