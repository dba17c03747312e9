// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Synchronous KV command fan-out.
//!
//! One admitted command runs against every selected KV cloud through its
//! cluster client; the caller blocks until all clouds have answered. Each
//! cloud reports independently, so one unreachable cluster never hides the
//! others' results.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::registry::PoolRegistry;
use crate::types::{RedisCloudResult, RedisCommandRequest, RedisCommandResponse};

use super::value::redis_value_to_json;

/// Upper bound on a single KV command round trip.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// The KV command fan-out executor.
pub struct KvCommandExecutor {
    registry: Arc<PoolRegistry>,
}

impl KvCommandExecutor {
    /// Build an executor over the shared registry.
    pub fn new(registry: Arc<PoolRegistry>) -> Self {
        Self { registry }
    }

    /// Target KV cloud names for a request.
    pub fn resolve_clouds(&self, cloud: &str) -> Vec<String> {
        let config = self.registry.config();
        if cloud == "all" {
            config
                .kv_clouds
                .iter()
                .map(|c| c.cloud_name.clone())
                .collect()
        } else {
            vec![cloud.to_string()]
        }
    }

    /// Fan the command out and gather per-cloud results.
    pub async fn execute(&self, request: &RedisCommandRequest) -> RedisCommandResponse {
        let clouds = self.resolve_clouds(&request.cloud);
        let id = Uuid::new_v4().to_string();
        debug!(
            request_id = %id,
            command = %request.command,
            clouds = clouds.len(),
            "KV command fan-out"
        );

        let results = join_all(clouds.iter().map(|cloud| async {
            (cloud.clone(), self.run_on_cloud(cloud, request).await)
        }))
        .await;

        let clouds: HashMap<String, RedisCloudResult> = results.into_iter().collect();
        let success = !clouds.is_empty() && clouds.values().all(|r| r.success);
        RedisCommandResponse {
            id,
            success,
            command: request.command.to_ascii_uppercase(),
            clouds,
        }
    }

    async fn run_on_cloud(&self, cloud: &str, request: &RedisCommandRequest) -> RedisCloudResult {
        let started = Instant::now();
        let outcome = async {
            let mut conn = self.registry.kv_connection(cloud).await?;
            let cmd = build_command(request);
            let value: redis::Value =
                tokio::time::timeout(COMMAND_TIMEOUT, cmd.query_async(&mut conn))
                    .await
                    .map_err(|_| {
                        crate::error::CoreError::Other(format!(
                            "command timed out after {}s",
                            COMMAND_TIMEOUT.as_secs()
                        ))
                    })??;
            Ok::<_, crate::error::CoreError>(redis_value_to_json(&value))
        }
        .await;

        match outcome {
            Ok(data) => RedisCloudResult {
                success: true,
                data: Some(data),
                error: None,
                duration_ms: started.elapsed().as_millis() as u64,
            },
            Err(e) => {
                warn!(cloud, error = %e, "KV command failed");
                RedisCloudResult {
                    success: false,
                    data: None,
                    error: Some(e.to_string()),
                    duration_ms: started.elapsed().as_millis() as u64,
                }
            }
        }
    }
}

/// Build the engine command. For RAW, the first argument is the whole
/// command line and is split on whitespace; otherwise the structured
/// command name and arguments are used as-is.
fn build_command(request: &RedisCommandRequest) -> redis::Cmd {
    if request.command.eq_ignore_ascii_case("RAW") {
        let line = request.args.first().map(String::as_str).unwrap_or("");
        let mut parts = line.split_whitespace();
        let mut cmd = redis::cmd(parts.next().unwrap_or(""));
        for part in parts {
            cmd.arg(part);
        }
        cmd
    } else {
        let mut cmd = redis::cmd(&request.command.to_ascii_uppercase());
        for arg in &request.args {
            cmd.arg(arg);
        }
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_structured_command() {
        let request = RedisCommandRequest {
            command: "set".into(),
            args: vec!["k".into(), "v".into()],
            cloud: "all".into(),
        };
        let cmd = build_command(&request);
        let packed = cmd.get_packed_command();
        let text = String::from_utf8_lossy(&packed);
        assert!(text.contains("SET"));
        assert!(text.contains('k'));
        assert!(text.contains('v'));
    }

    #[test]
    fn test_build_raw_command_splits_line() {
        let request = RedisCommandRequest {
            command: "RAW".into(),
            args: vec!["HSET user:1 name ada".into()],
            cloud: "all".into(),
        };
        let cmd = build_command(&request);
        let packed = cmd.get_packed_command();
        let text = String::from_utf8_lossy(&packed);
        assert!(text.contains("HSET"));
        assert!(text.contains("user:1"));
        assert!(text.contains("ada"));
    }
}
