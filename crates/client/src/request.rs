// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Outbound request description, rebuilt into a fresh transport request on
//! every attempt.

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::multipart::{Form, Part};
use reqwest::Method;
use serde_json::Value;

use crate::error::ClientError;

/// Header carrying a per-attempt correlation id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Per-call retry bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Never refresh-and-retry this call on 401 (login/refresh themselves).
    pub skip_auth_retry: bool,
    /// Already retried once after a refresh; a second 401 is final.
    pub retried: bool,
    /// 429 retries consumed so far.
    pub rate_limit_attempts: u32,
}

#[derive(Debug, Clone, Default)]
pub enum Body {
    #[default]
    Empty,
    Json(Value),
    Form(FormData),
}

#[derive(Debug, Clone)]
enum FormPart {
    Text(String),
    File { file_name: String, bytes: Vec<u8>, mime: Option<String> },
}

/// Multipart form body. Kept as plain data so retries can resend it.
#[derive(Debug, Clone, Default)]
pub struct FormData {
    parts: Vec<(String, FormPart)>,
}

impl FormData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.push((name.into(), FormPart::Text(value.into())));
        self
    }

    pub fn file(
        mut self,
        name: impl Into<String>,
        file_name: impl Into<String>,
        bytes: Vec<u8>,
        mime: Option<String>,
    ) -> Self {
        self.parts.push((name.into(), FormPart::File { file_name: file_name.into(), bytes, mime }));
        self
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Build a fresh multipart form for one attempt.
    pub fn to_multipart(&self) -> Result<Form, ClientError> {
        let mut form = Form::new();
        for (name, part) in &self.parts {
            form = match part {
                FormPart::Text(value) => form.text(name.clone(), value.clone()),
                FormPart::File { file_name, bytes, mime } => {
                    let mut p = Part::bytes(bytes.clone()).file_name(file_name.clone());
                    if let Some(mime) = mime {
                        p = p.mime_str(mime).map_err(|e| {
                            ClientError::InvalidRequest(format!("bad mime type for {name}: {e}"))
                        })?;
                    }
                    form.part(name.clone(), p)
                }
            };
        }
        Ok(form)
    }
}

/// A request against the backend, relative to the configured base URL.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Body,
    pub options: RequestOptions,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self { method, path: path.into(), body: Body::Empty, options: RequestOptions::default() }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn head(path: impl Into<String>) -> Self {
        Self::new(Method::HEAD, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_json(mut self, value: Value) -> Self {
        self.body = Body::Json(value);
        self
    }

    pub fn with_form(mut self, form: FormData) -> Self {
        self.body = Body::Form(form);
        self
    }

    pub fn skip_auth_retry(mut self) -> Self {
        self.options.skip_auth_retry = true;
        self
    }

    /// Path without its query string, for endpoint matching.
    pub fn route(&self) -> &str {
        self.path.split(['?', '#']).next().unwrap_or(&self.path)
    }

    /// Header fixup stage: everything but the body itself.
    ///
    /// Form bodies get no explicit content type so the transport can add
    /// its own multipart boundary.
    pub fn headers(&self, request_id: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Ok(id) = HeaderValue::from_str(request_id) {
            headers.insert(REQUEST_ID_HEADER, id);
        }
        match self.body {
            Body::Json(_) => {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            }
            Body::Form(_) | Body::Empty => {
                headers.remove(CONTENT_TYPE);
            }
        }
        headers
    }
}

#[cfg(test)]
#[path = "request_tests.rs"]
mod tests;
