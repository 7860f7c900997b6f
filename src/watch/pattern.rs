//! Marker patterns: what to look for in a line and which part to keep

use std::fmt;

use regex::Regex;

use crate::common::{Error, Result};

/// A labeled capture over one line of output
#[derive(Debug, Clone)]
pub enum MarkerPattern {
    /// Literal, case-sensitive label; the value is whatever follows it
    Label(String),
    /// Regular expression; the value is the `value` group, else group 1
    Regex(Regex),
}

impl MarkerPattern {
    pub fn label(text: impl Into<String>) -> Self {
        MarkerPattern::Label(text.into())
    }

    /// Compile a regex pattern; it needs a capture group to extract from
    pub fn regex(pattern: &str) -> Result<Self> {
        let re = Regex::new(pattern).map_err(|e| Error::InvalidPattern(e.to_string()))?;
        let has_value = re.capture_names().flatten().any(|n| n == "value");
        if !has_value && re.captures_len() < 2 {
            return Err(Error::InvalidPattern(format!(
                "'{pattern}' has no capture group to extract a value from"
            )));
        }
        Ok(MarkerPattern::Regex(re))
    }

    /// Extract the trimmed value if `line` carries the marker
    pub fn extract(&self, line: &str) -> Option<String> {
        match self {
            MarkerPattern::Label(label) => {
                let (_, rest) = line.split_once(label.as_str())?;
                Some(rest.trim().to_string())
            }
            MarkerPattern::Regex(re) => {
                let caps = re.captures(line)?;
                let value = caps.name("value").or_else(|| caps.get(1))?;
                Some(value.as_str().trim().to_string())
            }
        }
    }

    /// Short human-readable name for logs and errors
    pub fn describe(&self) -> String {
        match self {
            MarkerPattern::Label(label) => label.clone(),
            MarkerPattern::Regex(re) => format!("/{}/", re.as_str()),
        }
    }
}

impl fmt::Display for MarkerPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}
