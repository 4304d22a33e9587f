use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BufferError, BufferResult};

/// Replacement policy used to pick eviction victims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictPolicy {
    /// Sequential (or random) scan over the frame array.
    #[default]
    Random,
    Gclock,
    Car,
}

impl FromStr for EvictPolicy {
    type Err = BufferError;

    fn from_str(s: &str) -> BufferResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "random" | "latched" => Ok(EvictPolicy::Random),
            "gclock" => Ok(EvictPolicy::Gclock),
            "car" => Ok(EvictPolicy::Car),
            other => Err(BufferError::InvalidOption(format!(
                "unknown eviction policy '{other}'"
            ))),
        }
    }
}

impl fmt::Display for EvictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EvictPolicy::Random => "random",
            EvictPolicy::Gclock => "gclock",
            EvictPolicy::Car => "car",
        };
        f.write_str(name)
    }
}

/// Buffer pool settings. Field names on the wire follow the `sm_*` option
/// keys so a JSON options file can be fed in directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BufferOptions {
    /// Worker wakeup period in milliseconds.
    #[serde(rename = "sm_eviction_interval")]
    pub eviction_interval_ms: u64,
    #[serde(rename = "sm_bufferpool_swizzle")]
    pub swizzle: bool,
    #[serde(rename = "sm_bf_maintain_emlsn")]
    pub maintain_emlsn: bool,
    #[serde(rename = "sm_evict_policy")]
    pub evict_policy: EvictPolicy,
    #[serde(rename = "sm_bufferpool_gclock_k")]
    pub gclock_k: u16,
    /// Pick candidates at random instead of sweeping sequentially.
    #[serde(rename = "sm_evict_random")]
    pub evict_random: bool,
    #[serde(rename = "sm_log_page_evictions")]
    pub log_page_evictions: bool,
    /// Failed picks before the page cleaner is woken; 0 never wakes it.
    #[serde(rename = "sm_evict_wakeup_cleaner_attempts")]
    pub wakeup_cleaner_attempts: u32,
    /// Failed picks before dirty frames become eligible; 0 means always.
    #[serde(rename = "sm_evict_clean_only_attempts")]
    pub clean_only_attempts: u32,
    #[serde(rename = "sm_evict_dirty_pages")]
    pub evict_dirty_pages: bool,
    /// Drop dirty pages on eviction without writing them back.
    #[serde(rename = "sm_write_elision")]
    pub write_elision: bool,
    /// No backing volume: nothing is ever written.
    #[serde(rename = "sm_no_db")]
    pub no_db: bool,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            eviction_interval_ms: 1000,
            swizzle: false,
            maintain_emlsn: false,
            evict_policy: EvictPolicy::Random,
            gclock_k: 10,
            evict_random: false,
            log_page_evictions: false,
            wakeup_cleaner_attempts: 0,
            clean_only_attempts: 0,
            evict_dirty_pages: false,
            write_elision: false,
            no_db: false,
        }
    }
}

impl BufferOptions {
    /// Parses options from a JSON object; missing keys keep their defaults.
    pub fn from_json(json: &str) -> BufferResult<Self> {
        serde_json::from_str(json).map_err(|e| BufferError::InvalidOption(e.to_string()))
    }

    /// Sets a single option by its `sm_*` key.
    pub fn set(&mut self, key: &str, value: &str) -> BufferResult<()> {
        match key {
            "sm_eviction_interval" => self.eviction_interval_ms = parse_num(key, value)?,
            "sm_bufferpool_swizzle" => self.swizzle = parse_bool(key, value)?,
            "sm_bf_maintain_emlsn" => self.maintain_emlsn = parse_bool(key, value)?,
            "sm_evict_policy" => self.evict_policy = value.parse()?,
            "sm_bufferpool_gclock_k" => self.gclock_k = parse_num(key, value)?,
            "sm_evict_random" => self.evict_random = parse_bool(key, value)?,
            "sm_log_page_evictions" => self.log_page_evictions = parse_bool(key, value)?,
            "sm_evict_wakeup_cleaner_attempts" => {
                self.wakeup_cleaner_attempts = parse_num(key, value)?
            }
            "sm_evict_clean_only_attempts" => self.clean_only_attempts = parse_num(key, value)?,
            "sm_evict_dirty_pages" => self.evict_dirty_pages = parse_bool(key, value)?,
            "sm_write_elision" => self.write_elision = parse_bool(key, value)?,
            "sm_no_db" => self.no_db = parse_bool(key, value)?,
            _ => {
                return Err(BufferError::InvalidOption(format!("unknown key '{key}'")));
            }
        }
        Ok(())
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_millis(self.eviction_interval_ms)
    }

    /// Dirty frames are always eligible when `sm_evict_dirty_pages` is set.
    pub fn effective_clean_only_attempts(&self) -> u32 {
        if self.evict_dirty_pages {
            1
        } else {
            self.clean_only_attempts
        }
    }

    /// GCLOCK weight, never below one.
    pub fn effective_gclock_k(&self) -> u16 {
        self.gclock_k.max(1)
    }
}

fn parse_bool(key: &str, value: &str) -> BufferResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(BufferError::InvalidOption(format!(
            "{key}: expected a boolean, got '{value}'"
        ))),
    }
}

fn parse_num<T: FromStr>(key: &str, value: &str) -> BufferResult<T> {
    value.trim().parse().map_err(|_| {
        BufferError::InvalidOption(format!("{key}: expected a number, got '{value}'"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let opts = BufferOptions::default();
        assert_eq!(opts.eviction_interval(), Duration::from_millis(1000));
        assert_eq!(opts.evict_policy, EvictPolicy::Random);
        assert_eq!(opts.gclock_k, 10);
        assert_eq!(opts.effective_clean_only_attempts(), 0);
        assert!(!opts.swizzle && !opts.write_elision && !opts.no_db);
    }

    #[test]
    fn from_json_overrides_only_given_keys() {
        let opts = BufferOptions::from_json(
            r#"{"sm_evict_policy": "car", "sm_bufferpool_swizzle": true}"#,
        )
        .unwrap();
        assert_eq!(opts.evict_policy, EvictPolicy::Car);
        assert!(opts.swizzle);
        assert_eq!(opts.gclock_k, 10);

        assert!(BufferOptions::from_json(r#"{"sm_bogus": 1}"#).is_err());
    }

    #[test]
    fn set_parses_values() {
        let mut opts = BufferOptions::default();
        opts.set("sm_evict_policy", "GCLOCK").unwrap();
        opts.set("sm_bufferpool_gclock_k", "3").unwrap();
        opts.set("sm_evict_clean_only_attempts", "7").unwrap();
        assert_eq!(opts.evict_policy, EvictPolicy::Gclock);
        assert_eq!(opts.gclock_k, 3);
        assert_eq!(opts.effective_clean_only_attempts(), 7);

        opts.set("sm_evict_dirty_pages", "yes").unwrap();
        assert_eq!(opts.effective_clean_only_attempts(), 1);

        assert!(opts.set("sm_bufferpool_gclock_k", "many").is_err());
        assert!(opts.set("sm_write_elision", "maybe").is_err());
        assert!(opts.set("nope", "1").is_err());
    }
}
