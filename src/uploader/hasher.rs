// 文件哈希计算
//
// 秒传判定使用完整文件 MD5。大文件哈希是 CPU+IO 密集操作，
// 始终移到阻塞线程池执行，避免卡住异步运行时；
// hash_in_worker 关闭时上层直接跳过哈希，以文件名充当去重标识

use anyhow::{Context, Result};
use md5::Context as Md5Context;
use std::io::Read;
use std::path::Path;
use tracing::debug;

/// 文件哈希计算器
pub struct FileHasher;

impl FileHasher {
    /// 计算文件完整 MD5（十六进制小写），在阻塞线程池中执行
    pub async fn md5_file(path: &Path) -> Result<String> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::md5_file_sync(&path))
            .await
            .context("哈希计算任务执行失败")?
    }

    /// 同步计算文件 MD5
    fn md5_file_sync(path: &Path) -> Result<String> {
        use std::fs::File;

        let file = File::open(path).with_context(|| format!("无法打开文件: {:?}", path))?;
        let file_size = file.metadata().context("无法获取文件元数据")?.len();

        let mut reader = std::io::BufReader::with_capacity(1024 * 1024, file);
        let mut hasher = Md5Context::new();
        let mut buffer = [0u8; 65536]; // 64KB 缓冲区

        loop {
            let bytes_read = reader.read(&mut buffer).context("读取文件失败")?;
            if bytes_read == 0 {
                break;
            }
            hasher.consume(&buffer[..bytes_read]);
        }

        let md5 = format!("{:x}", hasher.compute());
        debug!("文件哈希计算完成: path={:?}, size={}, md5={}", path, file_size, md5);
        Ok(md5)
    }
}
