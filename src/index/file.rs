use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use super::FlatIndex;
use crate::error::{Error, Result};

/// 磁盘上的索引文件
///
/// 新内容总是先写入 `<path>.tmp`，确认账本提交后再重命名到 `<path>`
#[derive(Debug, Clone)]
pub struct IndexFile {
    path: PathBuf,
}

impl IndexFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// 写入临时文件并落盘，返回内容的校验和
    pub fn write_tmp(&self, bytes: &[u8]) -> Result<String> {
        let tmp = self.tmp_path();
        if let Some(parent) = tmp.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        debug!("写入临时索引: {} ({} 字节)", tmp.display(), bytes.len());
        Ok(checksum(bytes))
    }

    /// 用临时文件替换正式文件
    pub fn publish(&self) -> Result<()> {
        std::fs::rename(self.tmp_path(), &self.path)?;
        Ok(())
    }

    /// 丢弃未发布的临时文件
    pub fn discard_tmp(&self) {
        let tmp = self.tmp_path();
        if tmp.exists() {
            if let Err(e) = std::fs::remove_file(&tmp) {
                warn!("删除临时索引失败: {}: {e}", tmp.display());
            }
        }
    }

    /// 加载已发布的索引并和账本记录的校验和比对
    ///
    /// - 没有记录时返回空索引
    /// - 正式文件不一致但临时文件一致时，说明上次发布在重命名之前中断，此时补完重命名
    /// - 其余情况返回持久化错误
    pub fn load_verified(&self, dimension: usize, expected: Option<&str>) -> Result<FlatIndex> {
        let Some(expected) = expected else {
            if self.path.exists() {
                warn!("索引文件没有对应的发布记录，忽略: {}", self.path.display());
            }
            return Ok(FlatIndex::new(dimension));
        };

        let bytes = match read_if_exists(&self.path)? {
            Some(bytes) if checksum(&bytes) == expected => bytes,
            _ => {
                let tmp = self.tmp_path();
                match read_if_exists(&tmp)? {
                    Some(bytes) if checksum(&bytes) == expected => {
                        warn!("检测到未完成的索引发布，继续完成: {}", self.path.display());
                        self.publish()?;
                        bytes
                    }
                    _ => {
                        return Err(Error::persistence(format!(
                            "索引文件和账本不一致: {}",
                            self.path.display()
                        )));
                    }
                }
            }
        };

        let index = FlatIndex::deserialize(&bytes)?;
        if index.dimension() != dimension {
            return Err(Error::persistence(format!(
                "索引维度不一致: 文件 {}, 模型 {}",
                index.dimension(),
                dimension
            )));
        }
        Ok(index)
    }
}

/// blake3 校验和的十六进制表示
pub fn checksum(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn sample() -> FlatIndex {
        FlatIndex::from_vectors(2, &[[1f32, 0.], [0., 1.]]).unwrap()
    }

    #[test]
    fn test_publish_and_load() {
        let dir = TempDir::new().unwrap();
        let file = IndexFile::new(dir.path().join("visual.index"));
        let sum = file.write_tmp(&sample().serialize()).unwrap();
        file.publish().unwrap();
        assert!(!file.tmp_path().exists());
        assert_eq!(file.load_verified(2, Some(&sum)).unwrap(), sample());
    }

    #[test]
    fn test_load_without_state() {
        let dir = TempDir::new().unwrap();
        let file = IndexFile::new(dir.path().join("visual.index"));
        assert_eq!(file.load_verified(4, None).unwrap().count(), 0);
    }

    #[test]
    fn test_roll_forward() {
        let dir = TempDir::new().unwrap();
        let file = IndexFile::new(dir.path().join("visual.index"));
        let old = FlatIndex::from_vectors(2, &[[1f32, 0.]]).unwrap();
        file.write_tmp(&old.serialize()).unwrap();
        file.publish().unwrap();

        // 账本已经提交了新状态，但重命名没有执行
        let sum = file.write_tmp(&sample().serialize()).unwrap();
        assert_eq!(file.load_verified(2, Some(&sum)).unwrap(), sample());
        assert!(!file.tmp_path().exists());
    }

    #[test]
    fn test_mismatch_is_error() {
        let dir = TempDir::new().unwrap();
        let file = IndexFile::new(dir.path().join("visual.index"));
        file.write_tmp(&sample().serialize()).unwrap();
        file.publish().unwrap();
        let r = file.load_verified(2, Some("0000"));
        assert!(matches!(r, Err(Error::Persistence(_))));
    }

    #[test]
    fn test_dimension_mismatch() {
        let dir = TempDir::new().unwrap();
        let file = IndexFile::new(dir.path().join("visual.index"));
        let sum = file.write_tmp(&sample().serialize()).unwrap();
        file.publish().unwrap();
        assert!(matches!(file.load_verified(3, Some(&sum)), Err(Error::Persistence(_))));
    }
}
