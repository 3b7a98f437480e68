// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! CLI subcommands: `whoami`, `request`, `logout`.

pub mod request;

use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use serde_json::Value;

use attend_client::ApiClient;

use crate::config::Config;

pub use request::RequestArgs;

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Show the identity behind the current session.
    Whoami,
    /// Send one request through the resilient client and print the body.
    Request(RequestArgs),
    /// End the session.
    Logout,
}

#[derive(Serialize)]
struct Credentials<'a> {
    email: &'a str,
    password: &'a str,
}

/// Log in if credentials are configured, then run the subcommand.
///
/// Returns the response body to print (`null` when there is nothing to show).
pub async fn execute(client: &Arc<ApiClient>, config: &Config) -> anyhow::Result<Value> {
    if let Some((email, password)) = config.credentials() {
        client.login(&Credentials { email, password }).await.context("login failed")?;
    }

    match &config.command {
        Command::Whoami => Ok(client.whoami().await?),
        Command::Request(args) => {
            let req = args.build()?;
            client
                .request(req)
                .await
                .with_context(|| format!("{} {} failed", args.method.to_uppercase(), args.path))
        }
        Command::Logout => {
            client.logout().await?;
            Ok(Value::Null)
        }
    }
}
