// 该文件是 RiceGuard （米粒质检） 项目的一部分。
// src/detect/workflow_id.rs - 工作流标识解析
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

use base64::{
  Engine as _,
  engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD},
};
use tracing::debug;

/// 将配置中的模型标识归一为工作流 ID
///
/// 支持三种写法：裸 ID、以 `/` 分隔的路径（取最后一段）、
/// 以及中段携带 `workflowId` 的三段式令牌。令牌解析失败时原样返回。
pub fn normalize_workflow_id(value: &str) -> String {
  let value = value.trim();
  if value.is_empty() {
    return String::new();
  }

  let value = if value.contains('/') {
    value.trim_end_matches('/').rsplit('/').next().unwrap_or(value)
  } else {
    value
  };

  if value.matches('.').count() >= 2
    && let Some(workflow_id) = workflow_id_from_token(value)
  {
    debug!("从令牌中解析出工作流 ID: {}", workflow_id);
    return workflow_id;
  }

  value.to_string()
}

fn workflow_id_from_token(token: &str) -> Option<String> {
  let payload = token.split('.').nth(1)?.trim_end_matches('=');
  let bytes = URL_SAFE_NO_PAD
    .decode(payload)
    .or_else(|_| STANDARD_NO_PAD.decode(payload))
    .ok()?;
  let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
  let workflow_id = claims.get("workflowId")?.as_str()?.trim();
  (!workflow_id.is_empty()).then(|| workflow_id.to_string())
}
