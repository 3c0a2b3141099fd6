//! Pre-flight source resolution
//!
//! Channels can mark their source as indirect; the launch path then asks
//! the external resolver tool (yt-dlp) to turn the raw URL into a playable
//! URL plus request headers. The result is used for a single launch only
//! and refreshed on every (re)spawn.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::errors::RelayError;
use crate::models::SourceHandler;

/// Outcome of a resolver run (or the identity result for direct sources)
#[derive(Debug, Clone, Default)]
pub struct ResolvedSource {
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// Extra FFmpeg input options implied by the resolved protocol
    pub input_options: BTreeMap<String, serde_json::Value>,
}

impl ResolvedSource {
    pub fn direct(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            input_options: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceResolver {
    command: String,
    timeout: Duration,
}

impl SourceResolver {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }

    /// Resolve `source` through the external tool.
    ///
    /// Playlist results take their first entry; an `m3u8*` protocol adds
    /// the `protocol_whitelist` input option FFmpeg needs for fetched HLS.
    pub async fn resolve(
        &self,
        source: &str,
        handler: &SourceHandler,
    ) -> Result<ResolvedSource, RelayError> {
        let SourceHandler::YtDlp { format, options } = handler;

        let mut cmd = Command::new(&self.command);
        cmd.arg("-J").arg("--no-warnings").arg("--no-playlist");
        cmd.arg("-f").arg(format.as_deref().unwrap_or("best"));
        for (key, value) in options {
            cmd.arg(format!("--{}", key.replace('_', "-")));
            match value {
                serde_json::Value::Null | serde_json::Value::Bool(true) => {}
                serde_json::Value::String(s) => {
                    cmd.arg(s);
                }
                other => {
                    cmd.arg(other.to_string());
                }
            }
        }
        cmd.arg(source);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        debug!(%source, command = %self.command, "resolving indirect source");

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| RelayError::ResolveFailed {
                message: format!("resolver timed out after {:?}", self.timeout),
            })?
            .map_err(|e| RelayError::ResolveFailed {
                message: format!("failed to execute {}: {e}", self.command),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(%source, "resolver exited with {}: {}", output.status, stderr.trim());
            return Err(RelayError::ResolveFailed {
                message: format!("resolver exited with {}", output.status),
            });
        }

        let info: serde_json::Value =
            serde_json::from_slice(&output.stdout).map_err(|e| RelayError::ResolveFailed {
                message: format!("resolver produced invalid JSON: {e}"),
            })?;

        Self::extract(&info).ok_or_else(|| RelayError::ResolveFailed {
            message: "resolver did not provide a playable URL".into(),
        })
    }

    fn extract(info: &serde_json::Value) -> Option<ResolvedSource> {
        // Playlist dumps nest the playable entry under `entries`
        let entry = match info.get("entries").and_then(|e| e.as_array()) {
            Some(entries) => entries.iter().find(|e| !e.is_null())?,
            None => info,
        };

        let url = entry
            .get("url")
            .or_else(|| entry.get("manifest_url"))
            .and_then(|u| u.as_str())?
            .to_string();

        let mut resolved = ResolvedSource::direct(url);

        if let Some(headers) = entry.get("http_headers").and_then(|h| h.as_object()) {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    resolved.headers.push((name.clone(), value.to_string()));
                }
            }
        }

        if let Some(protocol) = entry.get("protocol").and_then(|p| p.as_str()) {
            if protocol.starts_with("m3u8") {
                resolved.input_options.insert(
                    "protocol_whitelist".into(),
                    serde_json::Value::String("file,http,https,tcp,tls,crypto".into()),
                );
            }
        }

        Some(resolved)
    }
}
