//! `KEY=VALUE` flag parsing
//!
//! Repeated flags such as `--env`, `--label` or `--annotation` carry one
//! `KEY=VALUE` pair each. A trailing `-` on the key (`KEY-`) requests removal,
//! and a bare `KEY` without `=` sets an empty value.

use indexmap::IndexMap;

use crate::error::{CoreError, Result};

/// Parsed set of upserts and removals, in the order given on the command line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyValueUpdates {
    /// Keys to set, last occurrence wins but first position is kept
    pub upserts: IndexMap<String, String>,
    /// Keys to remove
    pub removals: Vec<String>,
}

impl KeyValueUpdates {
    /// Parse a list of raw flag values
    ///
    /// `flag` names the originating flag for error messages.
    pub fn parse<S: AsRef<str>>(flag: &str, values: &[S]) -> Result<Self> {
        let mut updates = Self::default();
        for raw in values {
            updates.push(flag, raw.as_ref())?;
        }
        Ok(updates)
    }

    fn push(&mut self, flag: &str, raw: &str) -> Result<()> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(CoreError::user_input(format!(
                "--{flag}: argument must not be empty, expected KEY=VALUE"
            )));
        }

        match raw.split_once('=') {
            Some((key, value)) => {
                let key = key.trim();
                if key.is_empty() {
                    return Err(CoreError::user_input(format!(
                        "--{flag}: missing key in '{raw}', expected KEY=VALUE"
                    )));
                }
                self.upserts.insert(key.to_string(), value.to_string());
            }
            None => match raw.strip_suffix('-') {
                Some(key) if !key.is_empty() => {
                    self.upserts.shift_remove(key);
                    self.removals.push(key.to_string());
                }
                Some(_) => {
                    return Err(CoreError::user_input(format!(
                        "--{flag}: '-' is not a valid key"
                    )));
                }
                None => {
                    self.upserts.insert(raw.to_string(), String::new());
                }
            },
        }
        Ok(())
    }

    /// Whether nothing was requested
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }

    /// Apply the updates to a plain string map
    pub fn apply_to(&self, map: &mut std::collections::BTreeMap<String, String>) {
        for key in &self.removals {
            map.remove(key);
        }
        for (key, value) in &self.upserts {
            map.insert(key.clone(), value.clone());
        }
    }

    /// Apply to optional metadata maps, leaving `None` when the result is empty
    pub fn apply_to_option(&self, map: &mut Option<std::collections::BTreeMap<String, String>>) {
        if self.is_empty() {
            return;
        }
        let mut current = map.take().unwrap_or_default();
        self.apply_to(&mut current);
        *map = (!current.is_empty()).then_some(current);
    }

    /// Merge another set of updates on top of this one
    pub fn extend(&mut self, other: &KeyValueUpdates) {
        for key in &other.removals {
            self.upserts.shift_remove(key);
            self.removals.push(key.clone());
        }
        for (key, value) in &other.upserts {
            self.removals.retain(|k| k != key);
            self.upserts.insert(key.clone(), value.clone());
        }
    }
}

/// Split a comma separated flag value, ignoring empty segments
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
