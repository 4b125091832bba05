// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

static CONFIG: OnceLock<AntlerConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

fn default_blacklist_timeout_s() -> u64 {
    60
}

fn default_blacklisting_enabled() -> bool {
    true
}

fn default_min_executor_group_size() -> i64 {
    1
}

#[derive(Clone, Deserialize)]
pub struct AntlerConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub membership: MembershipConfig,

    #[serde(default)]
    pub result_sink: ResultSinkConfig,
}

#[derive(Clone, Deserialize)]
pub struct MembershipConfig {
    /// Seconds a blacklisted executor stays off its groups before being
    /// moved to probation by blacklist maintenance.
    #[serde(default = "default_blacklist_timeout_s")]
    pub blacklist_timeout_s: u64,

    #[serde(default = "default_blacklisting_enabled")]
    pub blacklisting_enabled: bool,

    /// Minimum size an executor group must reach to count as healthy when
    /// the group descriptor does not carry its own minimum.
    #[serde(default = "default_min_executor_group_size")]
    pub min_executor_group_size: i64,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            blacklist_timeout_s: default_blacklist_timeout_s(),
            blacklisting_enabled: default_blacklisting_enabled(),
            min_executor_group_size: default_min_executor_group_size(),
        }
    }
}

impl MembershipConfig {
    pub fn blacklist_timeout(&self) -> Duration {
        Duration::from_secs(self.blacklist_timeout_s)
    }
}

#[derive(Clone, Default, Deserialize)]
pub struct ResultSinkConfig {
    /// Hard cap on rows a fragment may deliver through its result sink.
    /// Zero or absent means unlimited.
    #[serde(default)]
    pub rows_produced_limit: Option<i64>,
}

impl AntlerConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        let cfg: AntlerConfig =
            toml::from_str(&s).with_context(|| format!("parse toml: {}", path.display()))?;
        Ok(cfg)
    }

    pub fn effective_log_filter(&self) -> String {
        self.log_filter
            .clone()
            .unwrap_or_else(|| self.log_level.clone())
    }
}

impl Default for AntlerConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            membership: MembershipConfig::default(),
            result_sink: ResultSinkConfig::default(),
        }
    }
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static AntlerConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = AntlerConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn init_from_env_or_default() -> Result<&'static AntlerConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let cfg = match config_path_from_env()? {
        Some(path) => AntlerConfig::load_from_file(&path)?,
        None => AntlerConfig::default(),
    };
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn config() -> Result<&'static AntlerConfig> {
    init_from_env_or_default()
}

fn config_path_from_env() -> Result<Option<PathBuf>> {
    if let Ok(p) = std::env::var("ANTLER_CONFIG") {
        if !p.trim().is_empty() {
            let path = PathBuf::from(p);
            if !path.exists() {
                return Err(anyhow!("config file from $ANTLER_CONFIG not found: {}", path.display()));
            }
            return Ok(Some(path));
        }
    }

    let candidate = PathBuf::from("antler.toml");
    if candidate.exists() {
        return Ok(Some(candidate));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::AntlerConfig;

    #[test]
    fn defaults_apply_to_missing_sections() {
        let cfg: AntlerConfig = toml::from_str("").expect("parse");
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.membership.blacklist_timeout_s, 60);
        assert!(cfg.membership.blacklisting_enabled);
        assert!(cfg.result_sink.rows_produced_limit.is_none());
    }

    #[test]
    fn membership_section_overrides() {
        let cfg: AntlerConfig = toml::from_str(
            r#"
            log_level = "debug"

            [membership]
            blacklist_timeout_s = 5
            blacklisting_enabled = false

            [result_sink]
            rows_produced_limit = 1000
            "#,
        )
        .expect("parse");
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.membership.blacklist_timeout_s, 5);
        assert!(!cfg.membership.blacklisting_enabled);
        assert_eq!(cfg.result_sink.rows_produced_limit, Some(1000));
    }
}
