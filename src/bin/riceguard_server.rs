// 该文件是 RiceGuard （米粒质检） 项目的一部分。
// src/bin/riceguard_server.rs - 米粒质检 HTTP 服务
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

use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{
  Json, Router,
  extract::{DefaultBodyLimit, Multipart, State},
  http::StatusCode,
  response::{IntoResponse, Response},
  routing::{get, post},
};
use clap::Parser;
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};

use riceguard::{
  AnalysisResult, AnalyzeError, Analyzer, ServiceStatus, args::PipelineArgs, pipeline::ErrorKind,
};

/// RiceGuard 米粒质检服务
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 监听地址
  #[arg(long, env = "RICEGUARD_BIND", default_value = "0.0.0.0:8000")]
  pub bind: SocketAddr,

  /// 上传文件大小上限（MB）
  #[arg(long, default_value_t = 20)]
  pub max_upload_mb: usize,

  #[command(flatten)]
  pub pipeline: PipelineArgs,
}

enum ApiError {
  BadRequest(String),
  Analyze(AnalyzeError),
  Internal(String),
}

impl From<AnalyzeError> for ApiError {
  fn from(err: AnalyzeError) -> Self {
    ApiError::Analyze(err)
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let (status, detail) = match self {
      ApiError::BadRequest(detail) => (StatusCode::BAD_REQUEST, detail),
      ApiError::Analyze(err) => {
        let status = match err.kind() {
          ErrorKind::InvalidImage => StatusCode::BAD_REQUEST,
          ErrorKind::Configuration => StatusCode::SERVICE_UNAVAILABLE,
          ErrorKind::Upstream => StatusCode::BAD_GATEWAY,
          ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, err.to_string())
      }
      ApiError::Internal(detail) => (StatusCode::INTERNAL_SERVER_ERROR, detail),
    };
    if status.is_server_error() {
      error!("请求失败 ({}): {}", status, detail);
    } else {
      warn!("请求被拒绝 ({}): {}", status, detail);
    }
    (status, Json(json!({ "detail": detail }))).into_response()
  }
}

async fn analyze(
  State(analyzer): State<Arc<Analyzer>>,
  mut multipart: Multipart,
) -> Result<Json<AnalysisResult>, ApiError> {
  let mut upload = None;
  while let Some(field) = multipart
    .next_field()
    .await
    .map_err(|e| ApiError::BadRequest(format!("表单解析失败: {e}")))?
  {
    if field.name() == Some("file") {
      let data = field
        .bytes()
        .await
        .map_err(|e| ApiError::BadRequest(format!("读取上传文件失败: {e}")))?;
      upload = Some(data);
      break;
    }
  }
  let bytes = upload.ok_or_else(|| ApiError::BadRequest("缺少 file 字段".to_string()))?;
  info!("收到分析请求: {} 字节", bytes.len());

  let result = tokio::task::spawn_blocking(move || analyzer.analyze(&bytes))
    .await
    .map_err(|e| ApiError::Internal(format!("分析任务异常退出: {e}")))??;

  Ok(Json(result))
}

#[derive(Serialize)]
struct Health {
  status: &'static str,
  #[serde(flatten)]
  service: ServiceStatus,
  timestamp: String,
}

async fn health(State(analyzer): State<Arc<Analyzer>>) -> Json<Health> {
  let service = analyzer.status();
  Json(Health {
    status: if service.ready { "ok" } else { "degraded" },
    service,
    timestamp: chrono::Utc::now().to_rfc3339(),
  })
}

async fn wait_for_shutdown(signal: impl Future<Output = std::io::Result<()>>) {
  match signal.await {
    Ok(()) => info!("收到 Ctrl-C 信号，正在停止服务..."),
    Err(e) => {
      // 无法监听信号时保持运行，不触发停止
      error!("无法监听 Ctrl-C 信号: {}", e);
      std::future::pending::<()>().await
    }
  }
}

async fn shutdown_signal() {
  wait_for_shutdown(tokio::signal::ctrl_c()).await
}

fn upload_limit_bytes(max_upload_mb: usize) -> usize {
  max_upload_mb.saturating_mul(1024 * 1024)
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  let analyzer = Arc::new(Analyzer::new(args.pipeline.into_config()?)?);

  let status = analyzer.status();
  if !status.ready {
    warn!("当前没有就绪的检测器，分析请求将返回 503");
  }

  let app = Router::new()
    .route("/analyze", post(analyze))
    .route("/health", get(health))
    .layer(DefaultBodyLimit::max(upload_limit_bytes(args.max_upload_mb)))
    .with_state(analyzer);

  let listener = tokio::net::TcpListener::bind(args.bind).await?;
  info!("服务已启动: http://{}", args.bind);
  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await?;
  info!("服务已停止");

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[test]
  fn test_upload_limit_saturates() {
    assert_eq!(upload_limit_bytes(20), 20 * 1024 * 1024);
    assert_eq!(upload_limit_bytes(usize::MAX), usize::MAX);
    assert_eq!(upload_limit_bytes(usize::MAX / 1024), usize::MAX);
  }

  #[test]
  fn test_upload_limit_flag() {
    let args = Args::parse_from(["riceguard-server", "--max-upload-mb", "18446744073709551615"]);
    assert_eq!(upload_limit_bytes(args.max_upload_mb), usize::MAX);
  }

  #[tokio::test]
  async fn test_signal_error_keeps_serving() {
    let failed = async { Err::<(), _>(std::io::Error::other("signal unavailable")) };
    let waited = tokio::time::timeout(Duration::from_millis(50), wait_for_shutdown(failed)).await;
    assert!(waited.is_err());
  }

  #[tokio::test]
  async fn test_signal_received_stops() {
    let received = wait_for_shutdown(async { Ok(()) });
    let waited = tokio::time::timeout(Duration::from_millis(50), received).await;
    assert!(waited.is_ok());
  }
}
