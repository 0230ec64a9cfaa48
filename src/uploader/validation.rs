// 批次准入校验
//
// 整批校验：任何一项不通过都拒绝整个提交，并列出所有问题

use crate::config::UploadConfig;
use crate::uploader::task::FileInput;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 单个文件的问题
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FileIssue {
    /// 超过单文件大小上限
    TooLarge { size: u64, limit: u64 },
    /// 扩展名不在白名单中
    UnsupportedExtension { extension: Option<String> },
}

impl fmt::Display for FileIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileIssue::TooLarge { size, limit } => {
                write!(f, "文件大小 {} 超过上限 {}", size, limit)
            }
            FileIssue::UnsupportedExtension { extension: Some(ext) } => {
                write!(f, "不支持的扩展名 .{}", ext)
            }
            FileIssue::UnsupportedExtension { extension: None } => write!(f, "缺少扩展名"),
        }
    }
}

/// 批次级问题
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum BatchIssue {
    /// 空提交
    Empty,
    /// 文件数超过上限
    TooManyFiles { count: usize, limit: usize },
    /// 总大小超过上限
    TotalTooLarge { total: u64, limit: u64 },
}

impl fmt::Display for BatchIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchIssue::Empty => write!(f, "没有要上传的文件"),
            BatchIssue::TooManyFiles { count, limit } => {
                write!(f, "文件数 {} 超过上限 {}", count, limit)
            }
            BatchIssue::TotalTooLarge { total, limit } => {
                write!(f, "总大小 {} 超过上限 {}", total, limit)
            }
        }
    }
}

/// 被拒绝的文件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedFile {
    /// 在提交列表中的位置
    pub index: usize,
    pub name: String,
    pub issues: Vec<FileIssue>,
}

/// 准入校验错误
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub struct ValidationError {
    pub batch_issues: Vec<BatchIssue>,
    pub files: Vec<RejectedFile>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "批次校验失败")?;
        for issue in &self.batch_issues {
            write!(f, "; {}", issue)?;
        }
        for file in &self.files {
            let reasons: Vec<String> = file.issues.iter().map(|i| i.to_string()).collect();
            write!(f, "; {}: {}", file.name, reasons.join(", "))?;
        }
        Ok(())
    }
}

impl ValidationError {
    /// 被拒绝文件的名称
    pub fn rejected_names(&self) -> Vec<&str> {
        self.files.iter().map(|f| f.name.as_str()).collect()
    }
}

/// 校验一次提交
pub fn validate_batch(files: &[FileInput], config: &UploadConfig) -> Result<(), ValidationError> {
    let mut batch_issues = Vec::new();

    if files.is_empty() {
        batch_issues.push(BatchIssue::Empty);
    }
    if files.len() > config.max_files_per_batch {
        batch_issues.push(BatchIssue::TooManyFiles {
            count: files.len(),
            limit: config.max_files_per_batch,
        });
    }
    let total = files.iter().map(|f| f.size).fold(0u64, u64::saturating_add);
    if total > config.max_total_batch_size {
        batch_issues.push(BatchIssue::TotalTooLarge {
            total,
            limit: config.max_total_batch_size,
        });
    }

    let rejected: Vec<RejectedFile> = files
        .iter()
        .enumerate()
        .filter_map(|(index, file)| {
            let issues = check_file(file, config);
            (!issues.is_empty()).then(|| RejectedFile {
                index,
                name: file.name.clone(),
                issues,
            })
        })
        .collect();

    if batch_issues.is_empty() && rejected.is_empty() {
        Ok(())
    } else {
        Err(ValidationError {
            batch_issues,
            files: rejected,
        })
    }
}

fn check_file(file: &FileInput, config: &UploadConfig) -> Vec<FileIssue> {
    let mut issues = Vec::new();
    if file.size > config.max_file_size {
        issues.push(FileIssue::TooLarge {
            size: file.size,
            limit: config.max_file_size,
        });
    }
    match file.extension() {
        Some(ext) if config.is_extension_supported(ext) => {}
        ext => issues.push(FileIssue::UnsupportedExtension {
            extension: ext.map(|e| e.to_string()),
        }),
    }
    issues
}
