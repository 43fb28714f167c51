// 该文件是 Kanjian （看见） 项目的一部分。
// src/labels.rs - 标签表
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::path::Path;

use thiserror::Error;
use tracing::{debug, warn};

/// 标签文件大小上限（10 MiB），超出视为损坏的输入
pub const LABELS_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;
/// 单个标签的最大字符数
pub const LABEL_MAX_LEN: usize = 60;
/// 默认分隔符
pub const LABEL_DELIMITER: char = '\n';

#[derive(Error, Debug)]
pub enum LabelError {
  #[error("标签文件过大: {size} 字节（上限 {limit} 字节）")]
  TooLarge { size: u64, limit: u64 },
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 标签表
///
/// 第 `i` 个标签对应输出张量的第 `i` 个元素。加载后不可变。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Labels {
  entries: Box<[String]>,
}

impl Labels {
  /// 从文件加载标签表
  ///
  /// 文件不存在或为空时返回空表，由调用者决定空表是否致命。
  pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, LabelError> {
    Self::load_with(path, LABEL_DELIMITER)
  }

  pub fn load_with<P: AsRef<Path>>(path: P, delimiter: char) -> Result<Self, LabelError> {
    let path = path.as_ref();
    let metadata = match std::fs::metadata(path) {
      Ok(metadata) => metadata,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        warn!("标签文件不存在: {}", path.display());
        return Ok(Self::default());
      }
      Err(e) => return Err(e.into()),
    };

    if metadata.len() > LABELS_MAX_FILE_SIZE {
      warn!("标签文件大小校验失败: {} 字节", metadata.len());
      return Err(LabelError::TooLarge {
        size: metadata.len(),
        limit: LABELS_MAX_FILE_SIZE,
      });
    }

    let data = std::fs::read(path)?;
    let labels = Self::parse(&String::from_utf8_lossy(&data), delimiter);
    debug!("从 {} 加载了 {} 个标签", path.display(), labels.len());
    Ok(labels)
  }

  /// 按分隔符拆分文本，忽略空项
  pub fn parse(text: &str, delimiter: char) -> Self {
    let entries = text
      .split(delimiter)
      .map(|line| line.strip_suffix('\r').unwrap_or(line))
      .filter(|line| !line.is_empty())
      .map(cap_label)
      .collect::<Vec<_>>();

    Self {
      entries: entries.into_boxed_slice(),
    }
  }

  pub fn get(&self, index: usize) -> Option<&str> {
    self.entries.get(index).map(String::as_str)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &str> {
    self.entries.iter().map(String::as_str)
  }
}

fn cap_label(line: &str) -> String {
  match line.char_indices().nth(LABEL_MAX_LEN) {
    Some((end, _)) => line[..end].to_string(),
    None => line.to_string(),
  }
}
