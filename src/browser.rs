use std::time::Duration;

use crate::error::{CdpError, Result};

lazy_static::lazy_static! {
    static ref VERSION_CLIENT: reqwest::Client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .expect("http client");
}

/// Connection info reported by the browser's `/json/version` endpoint.
#[derive(serde::Deserialize, Debug, Default)]
pub struct BrowserConnection {
    #[serde(rename = "Browser", default)]
    pub browser: String,
    #[serde(rename = "Protocol-Version", default)]
    pub protocol_version: String,
    #[serde(rename = "User-Agent", default)]
    pub user_agent: String,
    #[serde(rename = "webSocketDebuggerUrl", default)]
    pub web_socket_debugger_url: String,
}

/// Resolve the root debugger WebSocket URL.
///
/// A `ws://`/`wss://` URL is taken as-is. An `http(s)://` URL is treated as
/// the browser's debug address and its `/json/version` endpoint is queried
/// for the `webSocketDebuggerUrl` field.
pub async fn resolve_ws_url(url: &str) -> Result<String> {
    if url.starts_with("ws://") || url.starts_with("wss://") {
        return Ok(url.to_string());
    }

    let version_url = if url.ends_with("/json/version") || url.ends_with("/json/version/") {
        url.to_string()
    } else {
        format!(
            "{}{}json/version",
            url,
            if url.ends_with('/') { "" } else { "/" }
        )
    };

    let resp = VERSION_CLIENT
        .get(&version_url)
        .send()
        .await
        .map_err(|e| CdpError::msg(format!("browser unreachable at {version_url}: {e}")))?;
    let connection: BrowserConnection = resp
        .json()
        .await
        .map_err(|e| CdpError::msg(format!("invalid /json/version reply: {e}")))?;

    if connection.web_socket_debugger_url.is_empty() {
        return Err(CdpError::msg(
            "browser reported no webSocketDebuggerUrl".to_string(),
        ));
    }
    tracing::debug!(
        browser = %connection.browser,
        protocol = %connection.protocol_version,
        "resolved debugger url"
    );
    Ok(connection.web_socket_debugger_url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ws_urls_pass_through() {
        let url = "ws://127.0.0.1:9222/devtools/browser/abc";
        assert_eq!(resolve_ws_url(url).await.unwrap(), url);
    }
}
