// 上传分片管理
//
// 分片规则：
// - 第 k 个分片覆盖 [k * chunk_size, min((k + 1) * chunk_size, size))
// - 分片编号从 1 开始（与 S3 风格的 partNumber 一致）
// - 0 字节文件固定产生一个空分片，不跳过

use crate::remote::CompletedPart;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// 上传分片信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadChunk {
    /// 分片编号（从 1 开始）
    pub part_number: u32,
    /// 字节范围
    pub range: Range<u64>,
}

impl UploadChunk {
    pub fn new(part_number: u32, range: Range<u64>) -> Self {
        Self { part_number, range }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }
}

/// 分片划分
///
/// 只描述字节范围；已确认的分片记录在 [`PartList`] 中
#[derive(Debug, Clone)]
pub struct UploadChunkManager {
    chunks: Vec<UploadChunk>,
}

impl UploadChunkManager {
    /// 创建分片划分
    ///
    /// # 参数
    /// * `total_size` - 文件总大小
    /// * `chunk_size` - 分片大小（0 会被视为 1）
    pub fn new(total_size: u64, chunk_size: u64) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunks: Self::calculate_chunks(total_size, chunk_size),
        }
    }

    fn calculate_chunks(total_size: u64, chunk_size: u64) -> Vec<UploadChunk> {
        if total_size == 0 {
            return vec![UploadChunk::new(1, 0..0)];
        }

        let mut chunks = Vec::with_capacity(total_size.div_ceil(chunk_size) as usize);
        let mut offset = 0u64;
        let mut part_number = 1u32;

        while offset < total_size {
            let end = std::cmp::min(offset + chunk_size, total_size);
            chunks.push(UploadChunk::new(part_number, offset..end));
            offset = end;
            part_number += 1;
        }

        chunks
    }

    /// 获取所有分片
    pub fn chunks(&self) -> &[UploadChunk] {
        &self.chunks
    }

    /// 获取分片数量
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// 按编号顺序返回尚未确认的分片
    pub fn pending<'a>(&'a self, parts: &'a PartList) -> impl Iterator<Item = &'a UploadChunk> {
        self.chunks()
            .iter()
            .filter(move |c| !parts.contains(c.part_number))
    }
}

/// 已被远端确认的分片
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedPart {
    pub part_number: u32,
    pub etag: String,
    /// 分片字节数
    pub size: u64,
}

/// 已确认分片列表
///
/// 始终按 part_number 升序且不重复
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartList {
    parts: Vec<UploadedPart>,
}

impl PartList {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一个已确认的分片
    ///
    /// 同一编号重复确认时只更新 ETag，不重复计数字节；返回是否为新分片
    pub fn record(&mut self, part_number: u32, etag: String, size: u64) -> bool {
        match self
            .parts
            .binary_search_by_key(&part_number, |p| p.part_number)
        {
            Ok(idx) => {
                self.parts[idx].etag = etag;
                false
            }
            Err(idx) => {
                self.parts.insert(
                    idx,
                    UploadedPart {
                        part_number,
                        etag,
                        size,
                    },
                );
                true
            }
        }
    }

    pub fn contains(&self, part_number: u32) -> bool {
        self.parts
            .binary_search_by_key(&part_number, |p| p.part_number)
            .is_ok()
    }

    /// 已确认的字节数
    pub fn confirmed_bytes(&self) -> u64 {
        self.parts.iter().map(|p| p.size).sum()
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UploadedPart> {
        self.parts.iter()
    }

    pub fn clear(&mut self) {
        self.parts.clear();
    }

    /// 转换为 CompleteUpload 所需的列表（有序）
    pub fn to_completed_parts(&self) -> Vec<CompletedPart> {
        self.parts
            .iter()
            .map(|p| CompletedPart {
                part_number: p.part_number,
                etag: p.etag.clone(),
            })
            .collect()
    }
}

/// 计算上传进度百分比（向下取整）
pub fn progress_percent(uploaded: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let percent = (uploaded.min(total) as u128 * 100) / total as u128;
    percent as u8
}
