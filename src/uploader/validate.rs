// 文件准入校验
//
// 任务创建前的唯一闸口：空文件、大小越界、扩展名不符、数量超限
// 都在这里拦下，被拒绝的文件不会生成任务

use crate::config::FileFilterConfig;
use crate::error::{RejectedFile, ValidationError};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// 通过校验的文件
#[derive(Debug, Clone)]
pub struct AcceptedFile {
    pub path: PathBuf,
    pub file_name: String,
    pub file_size: u64,
}

/// 文件校验器
#[derive(Debug, Clone)]
pub struct FileValidator {
    filters: FileFilterConfig,
}

impl FileValidator {
    pub fn new(filters: FileFilterConfig) -> Self {
        Self { filters }
    }

    /// 校验单个文件
    ///
    /// `current_count` 为已存在的任务数（数量限制按全局累计）
    pub async fn validate_one(
        &self,
        path: &Path,
        current_count: usize,
    ) -> Result<AcceptedFile, ValidationError> {
        if current_count >= self.filters.max_file_count {
            return Err(ValidationError::TooManyFiles {
                limit: self.filters.max_file_count,
            });
        }

        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|_| ValidationError::Unreadable {
                path: path.display().to_string(),
            })?;
        if !metadata.is_file() {
            return Err(ValidationError::Unreadable {
                path: path.display().to_string(),
            });
        }

        let file_size = metadata.len();
        if file_size == 0 {
            return Err(ValidationError::EmptyFile);
        }
        if file_size > self.filters.max_file_size {
            return Err(ValidationError::TooLarge {
                size: file_size,
                limit: self.filters.max_file_size,
            });
        }
        if self.filters.min_file_size > 0 && file_size < self.filters.min_file_size {
            return Err(ValidationError::TooSmall {
                size: file_size,
                limit: self.filters.min_file_size,
            });
        }

        if !self.filters.accept.is_empty() {
            let extension = path
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            if !self.filters.accept.iter().any(|a| a == &extension) {
                return Err(ValidationError::UnsupportedType { extension });
            }
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());

        debug!("文件通过校验: {} ({} bytes)", file_name, file_size);
        Ok(AcceptedFile {
            path: path.to_path_buf(),
            file_name,
            file_size,
        })
    }

    /// 批量校验
    ///
    /// 逐个校验，通过的计入数量限制；返回 (通过列表, 拒绝列表)
    pub async fn validate_batch(
        &self,
        paths: &[PathBuf],
        current_count: usize,
    ) -> (Vec<AcceptedFile>, Vec<RejectedFile>) {
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();

        for path in paths {
            match self
                .validate_one(path, current_count + accepted.len())
                .await
            {
                Ok(file) => accepted.push(file),
                Err(reason) => {
                    let file_name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_else(|| path.display().to_string());
                    warn!("文件被拒绝: {} ({})", file_name, reason);
                    rejected.push(RejectedFile {
                        path: path.display().to_string(),
                        file_name,
                        reason,
                    });
                }
            }
        }

        (accepted, rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, size: usize) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&vec![0u8; size]).unwrap();
        path
    }

    fn validator(filters: FileFilterConfig) -> FileValidator {
        FileValidator::new(filters)
    }

    #[tokio::test]
    async fn test_empty_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "empty.bin", 0);

        let v = validator(FileFilterConfig::default());
        let err = v.validate_one(&path, 0).await.unwrap_err();
        assert!(matches!(err, ValidationError::EmptyFile));
    }

    #[tokio::test]
    async fn test_size_bounds() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "a.bin", 100);

        let mut filters = FileFilterConfig::default();
        filters.max_file_size = 50;
        let err = validator(filters).validate_one(&path, 0).await.unwrap_err();
        assert!(matches!(err, ValidationError::TooLarge { size: 100, limit: 50 }));

        let mut filters = FileFilterConfig::default();
        filters.min_file_size = 200;
        let err = validator(filters).validate_one(&path, 0).await.unwrap_err();
        assert!(matches!(err, ValidationError::TooSmall { size: 100, limit: 200 }));
    }

    #[tokio::test]
    async fn test_extension_filter_case_insensitive() {
        let dir = TempDir::new().unwrap();
        let jpg = write_file(&dir, "photo.JPG", 10);
        let exe = write_file(&dir, "tool.exe", 10);

        let mut filters = FileFilterConfig::default();
        filters.accept = vec!["jpg".to_string(), "png".to_string()];
        let v = validator(filters);

        assert!(v.validate_one(&jpg, 0).await.is_ok());
        let err = v.validate_one(&exe, 0).await.unwrap_err();
        assert!(matches!(err, ValidationError::UnsupportedType { .. }));
    }

    #[tokio::test]
    async fn test_file_count_limit() {
        let dir = TempDir::new().unwrap();
        let a = write_file(&dir, "a.bin", 10);
        let b = write_file(&dir, "b.bin", 10);
        let c = write_file(&dir, "c.bin", 10);

        let mut filters = FileFilterConfig::default();
        filters.max_file_count = 2;
        let v = validator(filters);

        let (accepted, rejected) = v.validate_batch(&[a, b, c], 0).await;
        assert_eq!(accepted.len(), 2);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].file_name, "c.bin");
        assert!(matches!(
            rejected[0].reason,
            ValidationError::TooManyFiles { limit: 2 }
        ));
    }

    #[tokio::test]
    async fn test_missing_file_unreadable() {
        let v = validator(FileFilterConfig::default());
        let err = v
            .validate_one(Path::new("/nonexistent/x.bin"), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::Unreadable { .. }));
    }

    #[tokio::test]
    async fn test_batch_mixed() {
        let dir = TempDir::new().unwrap();
        let good = write_file(&dir, "good.bin", 10);
        let empty = write_file(&dir, "empty.bin", 0);

        let v = validator(FileFilterConfig::default());
        let (accepted, rejected) = v.validate_batch(&[good, empty], 0).await;
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].file_name, "good.bin");
        assert_eq!(accepted[0].file_size, 10);
        assert_eq!(rejected.len(), 1);
    }
}
