// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `attend request`: arbitrary calls through the client pipeline.

use std::path::Path;

use anyhow::Context;
use reqwest::Method;

use attend_client::{ApiRequest, FormData};

#[derive(Debug, clap::Args)]
pub struct RequestArgs {
    /// HTTP method (GET, HEAD, POST, PUT, PATCH, DELETE).
    pub method: String,
    /// Path relative to the base URL, e.g. /attendance/today.
    pub path: String,
    /// JSON request body.
    #[arg(long, conflicts_with_all = ["fields", "files"])]
    pub data: Option<String>,
    /// Multipart text field (repeatable).
    #[arg(long = "field", value_name = "NAME=VALUE")]
    pub fields: Vec<String>,
    /// Multipart file part read from disk (repeatable).
    #[arg(long = "file", value_name = "NAME=PATH")]
    pub files: Vec<String>,
}

impl RequestArgs {
    pub fn method(&self) -> anyhow::Result<Method> {
        let upper = self.method.to_uppercase();
        match upper.as_str() {
            "GET" | "HEAD" | "POST" | "PUT" | "PATCH" | "DELETE" => {
                Method::from_bytes(upper.as_bytes()).context("invalid method")
            }
            _ => anyhow::bail!("unsupported method: {}", self.method),
        }
    }

    /// Turn the arguments into a request. Reads `--file` parts from disk.
    pub fn build(&self) -> anyhow::Result<ApiRequest> {
        let req = ApiRequest::new(self.method()?, self.path.clone());

        if let Some(ref data) = self.data {
            let value = serde_json::from_str(data).context("invalid JSON in --data")?;
            return Ok(req.with_json(value));
        }
        if self.fields.is_empty() && self.files.is_empty() {
            return Ok(req);
        }

        let mut form = FormData::new();
        for field in &self.fields {
            let (name, value) = split_pair(field)?;
            form = form.text(name, value);
        }
        for file in &self.files {
            let (name, path) = split_pair(file)?;
            let path = Path::new(path);
            let bytes =
                std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| name.to_owned());
            form = form.file(name, file_name, bytes, None);
        }
        Ok(req.with_form(form))
    }
}

fn split_pair(arg: &str) -> anyhow::Result<(&str, &str)> {
    match arg.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name, value)),
        _ => anyhow::bail!("expected NAME=VALUE, got {arg:?}"),
    }
}

#[cfg(test)]
#[path = "request_tests.rs"]
mod tests;
