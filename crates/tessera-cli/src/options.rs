// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared option parsing helpers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use tessera_protocol::{ControllerClient, TesseraClient};

/// Parse `500ms` / `2s` / `1m` / `1h` durations.
pub fn parse_duration(text: &str) -> Result<Duration> {
    let (value, unit) = text
        .find(|c: char| !c.is_ascii_digit())
        .map(|i| text.split_at(i))
        .with_context(|| format!("duration {text:?} has no unit"))?;
    let value: u64 = value
        .parse()
        .with_context(|| format!("invalid duration {text:?}"))?;
    let duration = match unit {
        "ms" => Duration::from_millis(value),
        "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3600),
        _ => bail!("invalid duration unit {unit:?} in {text:?}"),
    };
    Ok(duration)
}

/// Consume the value following a `--flag`.
pub fn take_value<'a>(
    flag: &str,
    args: &'a [String],
    index: &mut usize,
) -> Result<&'a str> {
    *index += 1;
    args.get(*index)
        .map(String::as_str)
        .with_context(|| format!("{flag} requires a value"))
}

/// Controller endpoint the CLI should talk to. `TESSERA_BIND` may hold a
/// wildcard bind address; connecting swaps that for loopback.
pub fn controller_endpoint() -> Result<SocketAddr> {
    let text = std::env::var("TESSERA_BIND").unwrap_or_else(|_| "127.0.0.1:8892".to_string());
    let mut addr: SocketAddr = text
        .parse()
        .with_context(|| format!("invalid TESSERA_BIND {text:?}"))?;
    if addr.ip().is_unspecified() {
        addr.set_ip("127.0.0.1".parse().unwrap());
    }
    Ok(addr)
}

/// Connect a controller client to the configured endpoint.
pub fn controller_client() -> Result<ControllerClient> {
    let addr = controller_endpoint()?;
    let transport = TesseraClient::dev(addr).context("creating controller client")?;
    Ok(ControllerClient::new(Arc::new(transport)))
}

/// Wait for the controller to answer pings.
pub async fn wait_for_controller(client: &ControllerClient, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match client.ping().await {
            Ok(response) if response.not_ready.is_none() => return Ok(()),
            Ok(_) | Err(_) if tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Ok(response) => bail!(
                "controller not ready: {}",
                response.not_ready.unwrap_or_default()
            ),
            Err(e) => bail!("controller failed to start: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_parse() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("10").is_err());
    }
}
