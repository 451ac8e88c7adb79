//! Regex blocklist for contacted hosts.
//!
//! The pattern file holds one regular expression per line; `#` comments and
//! blank lines are skipped. A line that fails to compile is logged and
//! skipped so one bad pattern never disables the rest of the list.

use regex::Regex;
use std::path::Path;
use tracing::{info, warn};

#[derive(Default)]
pub struct Blocklist {
    patterns: Vec<Regex>,
}

impl Blocklist {
    /// A list that blocks nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut patterns = Vec::new();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match Regex::new(line) {
                Ok(re) => patterns.push(re),
                Err(e) => warn!("invalid blocklist pattern '{line}': {e}"),
            }
        }

        info!("loaded {} blocklist patterns from {:?}", patterns.len(), path);
        Ok(Self { patterns })
    }

    /// True iff any pattern matches `host`. Callers strip the port first;
    /// matching is case-sensitive on the host as received.
    pub fn is_blocked(&self, host: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(host))
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
