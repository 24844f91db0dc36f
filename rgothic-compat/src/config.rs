use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use log::LevelFilter;
use rgothic_script::nls::Encoding;
use serde::{Deserialize, Serialize};

use crate::mem32::{DEFAULT_BEGIN, DEFAULT_END};

/// Logger configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoggerConfig {
    /// Level for the workspace crates.
    pub app_level_filter: LevelFilter,
    /// Level for everything else.
    pub level_filter: LevelFilter,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self { app_level_filter: LevelFilter::Info, level_filter: LevelFilter::Warn }
    }
}

/// `section -> key -> value`, as read from an `.ini` file.
pub type IniMap = BTreeMap<String, BTreeMap<String, String>>;

/// Configuration of the compatibility layer.
/// Use [`CompatConfigBuilder`] to build it from code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CompatConfig {
    pub logger_config: LoggerConfig,
    pub mem_begin: u32,
    pub mem_end: u32,
    /// Instruction budget of one trampoline run.
    pub cpu_step_limit: usize,
    pub show_debug: bool,
    pub encoding: Encoding,
    pub command_line: String,
    pub gothic_ini: IniMap,
    pub mod_ini: IniMap,
}

impl Default for CompatConfig {
    fn default() -> Self {
        Self {
            logger_config: LoggerConfig::default(),
            mem_begin: DEFAULT_BEGIN,
            mem_end: DEFAULT_END,
            cpu_step_limit: 100_000,
            show_debug: false,
            encoding: Encoding::default(),
            command_line: String::new(),
            gothic_ini: IniMap::new(),
            mod_ini: IniMap::new(),
        }
    }
}

fn lookup<'a>(ini: &'a IniMap, section: &str, key: &str) -> Option<&'a str> {
    let (_, keys) = ini.iter().find(|(s, _)| s.eq_ignore_ascii_case(section))?;
    keys.iter().find(|(k, _)| k.eq_ignore_ascii_case(key)).map(|(_, v)| v.as_str())
}

impl CompatConfig {
    pub fn goth_opt(&self, section: &str, key: &str) -> Option<&str> {
        lookup(&self.gothic_ini, section, key)
    }

    pub fn set_goth_opt(&mut self, section: &str, key: &str, value: &str) {
        let section = self
            .gothic_ini
            .keys()
            .find(|s| s.eq_ignore_ascii_case(section))
            .cloned()
            .unwrap_or_else(|| section.to_string());
        let keys = self.gothic_ini.entry(section).or_default();
        let key = keys.keys().find(|k| k.eq_ignore_ascii_case(key)).cloned().unwrap_or_else(|| key.to_string());
        keys.insert(key, value.to_string());
    }

    pub fn mod_opt(&self, section: &str, key: &str) -> Option<&str> {
        lookup(&self.mod_ini, section, key)
    }
}

/// Parse `.ini` text. Keys before the first section header are dropped.
pub fn parse_ini(text: &str) -> IniMap {
    let mut out = IniMap::new();
    let mut current: Option<String> = None;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let name = name.trim().to_string();
            out.entry(name.clone()).or_default();
            current = Some(name);
            continue;
        }
        let (Some(section), Some((k, v))) = (current.as_ref(), line.split_once('=')) else {
            continue;
        };
        if let Some(keys) = out.get_mut(section) {
            keys.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    out
}

/// Convenience builder for [`CompatConfig`].
pub struct CompatConfigBuilder {
    config: CompatConfig,
}

impl Default for CompatConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CompatConfigBuilder {
    pub fn new() -> Self {
        Self { config: Default::default() }
    }

    pub fn with_logger_config(mut self, logger_config: LoggerConfig) -> Self {
        self.config.logger_config = logger_config;
        self
    }

    pub fn with_memory_range(mut self, begin: u32, end: u32) -> Self {
        self.config.mem_begin = begin;
        self.config.mem_end = end;
        self
    }

    pub fn with_cpu_step_limit(mut self, limit: usize) -> Self {
        self.config.cpu_step_limit = limit;
        self
    }

    pub fn with_show_debug(mut self, on: bool) -> Self {
        self.config.show_debug = on;
        self
    }

    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.config.encoding = encoding;
        self
    }

    pub fn with_command_line(mut self, command_line: impl Into<String>) -> Self {
        self.config.command_line = command_line.into();
        self
    }

    pub fn with_gothic_ini(mut self, ini: IniMap) -> Self {
        self.config.gothic_ini = ini;
        self
    }

    pub fn with_mod_ini(mut self, ini: IniMap) -> Self {
        self.config.mod_ini = ini;
        self
    }

    /// Retrieves the configuration built
    pub fn get(self) -> CompatConfig {
        self.config
    }
}

pub struct CompatConfigReader;

impl CompatConfigReader {
    /// Read `path`, or write the defaults there when it does not exist yet.
    pub fn read_or_create_default(path: &Path) -> Result<CompatConfig> {
        if !path.exists() {
            log::info!("couldn't find {}, generating a new one", path.display());
            let config = CompatConfig::default();
            let mut file = File::create(path).with_context(|| format!("create {}", path.display()))?;
            file.write_all(serde_json::to_string_pretty(&config)?.as_bytes())?;
            return Ok(config);
        }
        Self::read(path)
    }

    pub fn read(path: &Path) -> Result<CompatConfig> {
        let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let config = serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ini_lookup_ignores_case() {
        let ini = parse_ini("; comment\n[GAME]\nsubtitles=1\n\n[ENGINE]\nzVidResFullscreenX = 1280\n");
        let config = CompatConfigBuilder::new().with_gothic_ini(ini).get();
        assert_eq!(config.goth_opt("game", "SUBTITLES"), Some("1"));
        assert_eq!(config.goth_opt("engine", "zvidresfullscreenx"), Some("1280"));
        assert_eq!(config.goth_opt("engine", "missing"), None);
    }

    #[test]
    fn set_goth_opt_keeps_existing_spelling() {
        let mut config = CompatConfigBuilder::new().with_gothic_ini(parse_ini("[GAME]\nSubtitles=0\n")).get();
        config.set_goth_opt("game", "SUBTITLES", "1");
        config.set_goth_opt("INTERNAL", "extendedMenu", "1");
        assert_eq!(config.gothic_ini["GAME"]["Subtitles"], "1");
        assert_eq!(config.gothic_ini["INTERNAL"]["extendedMenu"], "1");
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: CompatConfig = serde_json::from_str(r#"{ "show_debug": true, "encoding": "Windows1250" }"#).unwrap();
        assert!(config.show_debug);
        assert_eq!(config.encoding, Encoding::Windows1250);
        assert_eq!(config.mem_end, DEFAULT_END);
        assert_eq!(config.logger_config, LoggerConfig::default());
    }
}
