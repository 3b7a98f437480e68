// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;

use attend_client::ClientConfig;

use crate::command::Command;

/// Command-line client for the attendance backend.
#[derive(Debug, Parser)]
#[command(name = "attend", version, about)]
pub struct Config {
    #[command(flatten)]
    pub client: ClientConfig,

    /// Log in with this email before running the command.
    #[arg(long, env = "ATTEND_EMAIL")]
    pub email: Option<String>,

    /// Password for --email.
    #[arg(long, env = "ATTEND_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Log format (json or text).
    #[arg(long, env = "ATTEND_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "ATTEND_LOG_LEVEL", default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.client.validate()?;

        if !matches!(self.log_format.as_str(), "json" | "text") {
            anyhow::bail!("--log-format must be json or text, got {:?}", self.log_format);
        }
        if self.email.is_some() != self.password.is_some() {
            anyhow::bail!("--email and --password must be given together");
        }
        Ok(())
    }

    /// Login credentials, when both halves are configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        Some((self.email.as_deref()?, self.password.as_deref()?))
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
