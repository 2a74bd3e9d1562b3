//! Loopback configuration
//!
//! Parsed from a module argument string such as
//! `source=mic sink="Built-in Output" latency_msec=80`, or loaded from a
//! JSON file. Missing fields fall back to the defaults below.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::error::{LoopbackError, Result};
use crate::{
    DEFAULT_ADJUST_TIME_SEC, DEFAULT_LATENCY_MSEC, MAX_FAST_ADJUST_THRESHOLD_MSEC,
    MAX_LATENCY_MSEC, MAX_SAMPLE_RATE, MIN_SAMPLE_RATE, USEC_PER_MSEC, USEC_PER_SEC,
};

/// Keys accepted in a module argument string
pub const VALID_MODARGS: &[&str] = &[
    "source",
    "sink",
    "latency_msec",
    "max_latency_msec",
    "adjust_time",
    "fast_adjust_threshold_msec",
    "rate",
    "channels",
];

/// Highest channel count accepted for the loopback stream
const MAX_CHANNELS: u16 = 32;

fn default_latency_msec() -> u32 {
    DEFAULT_LATENCY_MSEC
}

fn default_adjust_time_sec() -> u32 {
    DEFAULT_ADJUST_TIME_SEC
}

fn default_fragment_size_msec() -> u32 {
    25
}

/// Everything needed to set up one source to sink loopback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopbackConfig {
    /// Capture device name
    #[serde(default)]
    pub source: Option<String>,
    /// Playback device name
    #[serde(default)]
    pub sink: Option<String>,
    /// Target end-to-end latency
    #[serde(default = "default_latency_msec")]
    pub latency_msec: u32,
    /// Ceiling for underrun-driven latency increases (0 = none)
    #[serde(default)]
    pub max_latency_msec: u32,
    /// Period of the rate adjustment cycle (0 = no adjustment)
    #[serde(default = "default_adjust_time_sec")]
    pub adjust_time_sec: u32,
    /// Latency error beyond which samples are dropped or inserted directly (0 = never)
    #[serde(default)]
    pub fast_adjust_threshold_msec: u32,
    /// Stream rate override, defaults to the source's rate
    #[serde(default)]
    pub sample_rate: Option<u32>,
    /// Stream channel override, defaults to the source's channels
    #[serde(default)]
    pub channels: Option<u16>,
    /// Fragment size assumed for fixed-latency ALSA sources
    #[serde(default = "default_fragment_size_msec")]
    pub default_fragment_size_msec: u32,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            source: None,
            sink: None,
            latency_msec: default_latency_msec(),
            max_latency_msec: 0,
            adjust_time_sec: default_adjust_time_sec(),
            fast_adjust_threshold_msec: 0,
            sample_rate: None,
            channels: None,
            default_fragment_size_msec: default_fragment_size_msec(),
        }
    }
}

impl LoopbackConfig {
    /// Parse and validate a module argument string on top of the defaults
    ///
    /// # Example
    /// ```
    /// use audioloop_core::LoopbackConfig;
    ///
    /// let config = LoopbackConfig::from_modargs("source=mic sink='USB Speaker' latency_msec=80").unwrap();
    /// assert_eq!(config.sink.as_deref(), Some("USB Speaker"));
    /// assert_eq!(config.latency_usec(), 80_000);
    /// ```
    pub fn from_modargs(args: &str) -> Result<Self> {
        let mut config = Self::default();
        config.apply_modargs(args)?;
        config.validate()?;
        Ok(config)
    }

    /// Overwrite the fields named in `args`, without validating the result
    pub fn apply_modargs(&mut self, args: &str) -> Result<()> {
        let mut seen = HashSet::new();
        for (key, value) in parse_modargs(args)? {
            if !VALID_MODARGS.contains(&key.as_str()) {
                return Err(LoopbackError::UnknownArgument(key));
            }
            if !seen.insert(key.clone()) {
                return Err(LoopbackError::DuplicateArgument(key));
            }
            match key.as_str() {
                "source" => self.source = Some(value),
                "sink" => self.sink = Some(value),
                "latency_msec" => self.latency_msec = parse_number(&key, &value)?,
                "max_latency_msec" => self.max_latency_msec = parse_number(&key, &value)?,
                "adjust_time" => self.adjust_time_sec = parse_number(&key, &value)?,
                "fast_adjust_threshold_msec" => {
                    self.fast_adjust_threshold_msec = parse_number(&key, &value)?
                }
                "rate" => self.sample_rate = Some(parse_number(&key, &value)?),
                "channels" => self.channels = Some(parse_number(&key, &value)?),
                _ => return Err(LoopbackError::UnknownArgument(key)),
            }
        }
        Ok(())
    }

    /// Check every value against its accepted range
    pub fn validate(&self) -> Result<()> {
        match &self.source {
            Some(name) if !name.is_empty() => {}
            _ => return Err(LoopbackError::MissingArgument("source")),
        }
        match &self.sink {
            Some(name) if !name.is_empty() => {}
            _ => return Err(LoopbackError::MissingArgument("sink")),
        }

        if self.latency_msec == 0 || self.latency_msec > MAX_LATENCY_MSEC {
            return Err(LoopbackError::invalid("latency_msec", self.latency_msec));
        }
        if self.max_latency_msec != 0
            && (self.max_latency_msec < self.latency_msec
                || self.max_latency_msec > MAX_LATENCY_MSEC)
        {
            return Err(LoopbackError::invalid(
                "max_latency_msec",
                self.max_latency_msec,
            ));
        }
        if self.fast_adjust_threshold_msec > MAX_FAST_ADJUST_THRESHOLD_MSEC {
            return Err(LoopbackError::invalid(
                "fast_adjust_threshold_msec",
                self.fast_adjust_threshold_msec,
            ));
        }
        if let Some(rate) = self.sample_rate {
            if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&rate) {
                return Err(LoopbackError::InvalidSampleSpec(format!(
                    "rate {} outside {}..={} Hz",
                    rate, MIN_SAMPLE_RATE, MAX_SAMPLE_RATE
                )));
            }
        }
        if let Some(channels) = self.channels {
            if channels == 0 || channels > MAX_CHANNELS {
                return Err(LoopbackError::InvalidSampleSpec(format!(
                    "{} channels outside 1..={}",
                    channels, MAX_CHANNELS
                )));
            }
        }
        Ok(())
    }

    pub fn latency_usec(&self) -> u64 {
        self.latency_msec as u64 * USEC_PER_MSEC
    }

    pub fn max_latency_usec(&self) -> u64 {
        self.max_latency_msec as u64 * USEC_PER_MSEC
    }

    pub fn adjust_time_usec(&self) -> u64 {
        self.adjust_time_sec as u64 * USEC_PER_SEC
    }

    pub fn fast_adjust_threshold_usec(&self) -> u64 {
        self.fast_adjust_threshold_msec as u64 * USEC_PER_MSEC
    }

    pub fn default_fragment_size_usec(&self) -> u64 {
        self.default_fragment_size_msec as u64 * USEC_PER_MSEC
    }

    /// Load config from disk, falling back to defaults on any error
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "Loaded config from disk");
                    config
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to parse config, using defaults");
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!(path = %path.display(), "No config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Save config to disk, creating parent directories if needed
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!(path = %path.display(), "Config saved to disk");
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| LoopbackError::invalid(key, value))
}

/// Split `key=value` pairs separated by whitespace
///
/// Values may be wrapped in single or double quotes to contain whitespace;
/// inside quotes a backslash escapes the next character.
fn parse_modargs(args: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    let mut chars = args.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(c) = chars.next_if(|c| *c != '=' && !c.is_whitespace()) {
            key.push(c);
        }
        if chars.next() != Some('=') || key.is_empty() {
            return Err(LoopbackError::invalid("arguments", args));
        }

        let mut value = String::new();
        match chars.peek().copied() {
            Some(quote @ ('"' | '\'')) => {
                chars.next();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    if c == quote {
                        closed = true;
                        break;
                    }
                    if c == '\\' {
                        match chars.next() {
                            Some(escaped) => value.push(escaped),
                            None => break,
                        }
                    } else {
                        value.push(c);
                    }
                }
                if !closed {
                    return Err(LoopbackError::invalid(&key, value));
                }
            }
            _ => {
                while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                    value.push(c);
                }
            }
        }
        pairs.push((key, value));
    }

    Ok(pairs)
}
