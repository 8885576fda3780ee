//! 日志系统配置
//!
//! 控制台输出始终开启；配置启用文件持久化时按天滚动落盘，
//! 并在初始化时清理超过保留期的旧日志

use crate::config::LogConfig;
use chrono::Local;
use std::fs;
use std::path::Path;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 日志文件名前缀，滚动后实际文件为 `upload-client.log.YYYY-MM-DD`
const LOG_FILE_PREFIX: &str = "upload-client.log";

/// 日志系统守卫
///
/// 必须保持存活，否则日志写入线程会终止
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志系统
///
/// 环境变量 `RUST_LOG` 优先于配置中的级别；
/// 文件层创建失败时回退到仅控制台输出，不阻塞启动
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
        .with_ansi(true);

    if config.file_enabled {
        if let Err(e) = fs::create_dir_all(&config.log_dir) {
            eprintln!("创建日志目录失败: {:?}, 错误: {}", config.log_dir, e);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .init();
            return LogGuard { _file_guard: None };
        }

        let appender = tracing_appender::rolling::daily(&config.log_dir, LOG_FILE_PREFIX);
        let (non_blocking, file_guard) = tracing_appender::non_blocking(appender);

        let file_layer = fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
            .with_ansi(false)
            .with_writer(non_blocking);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        info!(
            "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}",
            config.log_dir, config.retention_days, config.level
        );

        cleanup_old_logs(&config.log_dir, config.retention_days);

        LogGuard {
            _file_guard: Some(file_guard),
        }
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();

        info!("日志系统初始化完成（仅控制台输出）");

        LogGuard { _file_guard: None }
    }
}

/// 清理过期日志文件
///
/// 优先按文件名中的日期判断，文件名不规范时退回文件修改时间
fn cleanup_old_logs(log_dir: &Path, retention_days: u32) {
    let now = Local::now().date_naive();
    let retention = chrono::Duration::days(retention_days as i64);

    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return;
        }
    };

    let mut deleted = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(filename) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if !filename.starts_with(LOG_FILE_PREFIX) {
            continue;
        }

        let expired = match extract_date_from_filename(filename)
            .and_then(|d| chrono::NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok())
        {
            Some(file_date) => now.signed_duration_since(file_date) > retention,
            None => check_by_modified_time(&entry, retention_days),
        };

        if expired {
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e);
            } else {
                deleted += 1;
                tracing::debug!("已删除过期日志文件: {:?}", path);
            }
        }
    }

    if deleted > 0 {
        info!("已清理 {} 个过期日志文件", deleted);
    }
}

/// 从 `upload-client.log.YYYY-MM-DD` 中提取日期部分
fn extract_date_from_filename(filename: &str) -> Option<String> {
    let rest = filename.strip_prefix(LOG_FILE_PREFIX)?;
    let date = rest.strip_prefix('.')?;
    if date.len() == 10 {
        Some(date.to_string())
    } else {
        None
    }
}

/// 按文件修改时间判断是否过期（文件名无日期时的后备方案）
fn check_by_modified_time(entry: &fs::DirEntry, retention_days: u32) -> bool {
    let now = chrono::Utc::now();
    let retention = chrono::Duration::days(retention_days as i64);

    if let Ok(metadata) = entry.metadata() {
        if let Ok(modified) = metadata.modified() {
            let modified: chrono::DateTime<chrono::Utc> = modified.into();
            return now.signed_duration_since(modified) > retention;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_default_log_config() {
        let config = LogConfig::default();
        assert!(!config.file_enabled);
        assert_eq!(config.log_dir, PathBuf::from("logs"));
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.level, "info");
    }

    #[test]
    fn test_extract_date() {
        assert_eq!(
            extract_date_from_filename("upload-client.log.2026-08-01"),
            Some("2026-08-01".to_string())
        );
        assert_eq!(extract_date_from_filename("upload-client.log"), None);
        assert_eq!(extract_date_from_filename("other.log.2026-08-01"), None);
    }

    #[test]
    fn test_cleanup_removes_dated_files_past_retention() {
        let dir = TempDir::new().unwrap();
        let stale = dir.path().join("upload-client.log.2020-01-01");
        let fresh = dir
            .path()
            .join(format!("upload-client.log.{}", Local::now().format("%Y-%m-%d")));
        let unrelated = dir.path().join("other.txt");
        fs::write(&stale, b"old").unwrap();
        fs::write(&fresh, b"new").unwrap();
        fs::write(&unrelated, b"keep").unwrap();

        cleanup_old_logs(dir.path(), 7);

        assert!(!stale.exists());
        assert!(fresh.exists());
        assert!(unrelated.exists());
    }
}
