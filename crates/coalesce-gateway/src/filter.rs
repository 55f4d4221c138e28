//! Allow/block filtering on the raw sender id.
//!
//! Block wins over allow. An empty allow-list admits everyone. `"*"` matches
//! every sender and entries may include or omit the leading `+`.

use coalesce_core::config::FilterConfig;

#[derive(Debug, Clone, Default)]
pub struct SenderFilter {
    allow: Vec<String>,
    block: Vec<String>,
}

impl SenderFilter {
    pub fn from_config(config: &FilterConfig) -> Self {
        Self {
            allow: normalize(&config.allow),
            block: normalize(&config.block),
        }
    }

    /// `true` when `sender` may be buffered or dispatched at all.
    pub fn admits(&self, sender: &str) -> bool {
        if matches(&self.block, sender) {
            return false;
        }
        self.allow.is_empty() || matches(&self.allow, sender)
    }

    pub fn is_active(&self) -> bool {
        !self.allow.is_empty() || !self.block.is_empty()
    }
}

fn normalize(entries: &[String]) -> Vec<String> {
    entries
        .iter()
        .map(|e| e.trim().trim_start_matches('+').to_string())
        .filter(|e| !e.is_empty())
        .collect()
}

fn matches(list: &[String], sender: &str) -> bool {
    let sender = sender.trim_start_matches('+');
    list.iter().any(|entry| entry == "*" || entry == sender)
}
