//! Shared HTTP request helpers for CLI commands.

use anyhow::{Context, Result};
use serde::Deserialize;

pub fn base_url(port: u16) -> String {
    format!("http://127.0.0.1:{}", port)
}

pub async fn get_json<T: for<'de> Deserialize<'de>>(url: &str) -> Result<T> {
    reqwest::get(url)
        .await
        .with_context(|| format!("failed to connect to refuncd at {} — is it running?", url))?
        .json::<T>()
        .await
        .context("failed to parse response")
}

pub async fn get_text(url: &str) -> Result<String> {
    reqwest::get(url)
        .await
        .with_context(|| format!("failed to connect to refuncd at {} — is it running?", url))?
        .text()
        .await
        .context("failed to read response")
}
