//! Traffic split resolution
//!
//! Computes a new routing table from the current one and the user's
//! `--untag`, `--tag` and `--traffic` instructions, applied in that order.
//! The function is pure; the result either sums to exactly 100 percent with
//! unique tags or is rejected with a [`TrafficError`].

use thiserror::Error;

use crate::keyvalue::split_list;
use crate::resources::TrafficTarget;

/// Reference to the latest ready revision
pub const LATEST_REF: &str = "@latest";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrafficError {
    #[error("--{flag}: expected {expected}, got '{value}'")]
    Syntax {
        flag: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("percent for '{reference}' must be an integer, got '{value}'")]
    InvalidPercent { reference: String, value: String },

    #[error("percent for '{reference}' must be between 0 and 100, got {percent}")]
    PercentOutOfRange { reference: String, percent: i64 },

    #[error("traffic percents must sum to 100, got {sum}")]
    SumNot100 { sum: i64 },

    #[error("tag '{tag}' is used more than once, remove it first with --untag {tag}")]
    DuplicateTag { tag: String },

    #[error("'{reference}' is assigned traffic more than once")]
    DuplicateReference { reference: String },

    #[error("tag '{tag}' does not exist in the routing table")]
    TagNotFound { tag: String },

    #[error("--{flag}: @latest may only be referenced once")]
    RepeatedLatest { flag: &'static str },

    #[error("a new service can route to a single target only, got {count}")]
    MultipleTargetsOnCreate { count: usize },
}

/// Traffic instructions as given on the command line
///
/// Every entry may hold several comma separated items.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrafficInstructions {
    /// `REF=PERCENT` items, REF being `@latest`, a tag or a revision name
    pub traffic: Vec<String>,
    /// `REF=TAG` items, REF being `@latest` or a revision name
    pub tags: Vec<String>,
    /// Tags to remove
    pub untag: Vec<String>,
}

impl TrafficInstructions {
    /// Whether any traffic flag was given
    pub fn is_empty(&self) -> bool {
        self.traffic.is_empty() && self.tags.is_empty() && self.untag.is_empty()
    }
}

/// Resolve a new routing table
///
/// An empty `current` table stands for "100% to the latest revision".
/// `creating` restricts the result to a single target since no earlier
/// revision can exist yet.
pub fn resolve(
    current: &[TrafficTarget],
    instructions: &TrafficInstructions,
    creating: bool,
) -> Result<Vec<TrafficTarget>, TrafficError> {
    let percents = parse_percents(&instructions.traffic)?;
    let tags = parse_tags(&instructions.tags)?;
    let untags: Vec<String> = instructions
        .untag
        .iter()
        .flat_map(|u| split_list(u))
        .collect();

    let mut targets: Vec<TrafficTarget> = if current.is_empty() {
        vec![TrafficTarget::latest(100)]
    } else {
        current
            .iter()
            .cloned()
            .map(|mut t| {
                t.url = None;
                t
            })
            .collect()
    };

    // ========== Untag ==========
    for tag in &untags {
        let target = targets
            .iter_mut()
            .find(|t| t.tag.as_deref() == Some(tag.as_str()))
            .ok_or_else(|| TrafficError::TagNotFound { tag: tag.clone() })?;
        target.tag = None;
    }

    // ========== Tag ==========
    for (reference, tag) in tags {
        if targets.iter().any(|t| t.tag.as_deref() == Some(tag.as_str())) {
            return Err(TrafficError::DuplicateTag { tag });
        }

        let untagged = targets.iter_mut().find(|t| {
            t.tag.is_none()
                && if reference == LATEST_REF {
                    t.is_latest()
                } else {
                    t.revision_name.as_deref() == Some(reference.as_str())
                }
        });

        match untagged {
            Some(target) => target.tag = Some(tag),
            None if reference == LATEST_REF => {
                targets.push(TrafficTarget::latest(0).with_tag(tag));
            }
            None => targets.push(TrafficTarget::revision(reference, 0).with_tag(tag)),
        }
    }

    // ========== Traffic ==========
    if !percents.is_empty() {
        let mut assigned = vec![false; targets.len()];
        for (reference, percent) in percents {
            match lookup(&targets, &reference) {
                Some(index) if assigned[index] => {
                    return Err(TrafficError::DuplicateReference { reference });
                }
                Some(index) => {
                    targets[index].percent = Some(percent);
                    assigned[index] = true;
                }
                None => {
                    let target = if reference == LATEST_REF {
                        TrafficTarget::latest(percent)
                    } else {
                        TrafficTarget::revision(reference, percent)
                    };
                    targets.push(target);
                    assigned.push(true);
                }
            }
        }

        for (target, assigned) in targets.iter_mut().zip(assigned) {
            if !assigned {
                target.percent = Some(0);
            }
        }
    }

    let targets = compact(targets);
    validate(&targets, creating)?;
    Ok(targets)
}

/// Find the target a `--traffic` reference points at
///
/// Tags take precedence over revision names; untagged targets are preferred
/// when a revision appears more than once.
fn lookup(targets: &[TrafficTarget], reference: &str) -> Option<usize> {
    if reference == LATEST_REF {
        return targets
            .iter()
            .position(|t| t.is_latest() && t.tag.is_none())
            .or_else(|| targets.iter().position(TrafficTarget::is_latest));
    }

    targets
        .iter()
        .position(|t| t.tag.as_deref() == Some(reference))
        .or_else(|| {
            targets.iter().position(|t| {
                t.tag.is_none() && t.revision_name.as_deref() == Some(reference)
            })
        })
        .or_else(|| {
            targets
                .iter()
                .position(|t| t.revision_name.as_deref() == Some(reference))
        })
}

/// Drop untagged zero-percent targets and merge untagged duplicates
fn compact(targets: Vec<TrafficTarget>) -> Vec<TrafficTarget> {
    let mut result: Vec<TrafficTarget> = Vec::with_capacity(targets.len());
    for target in targets {
        if target.tag.is_none() && target.percent_or_zero() == 0 {
            continue;
        }
        if target.tag.is_none()
            && let Some(existing) = result.iter_mut().find(|t| {
                t.tag.is_none()
                    && t.is_latest() == target.is_latest()
                    && t.revision_name == target.revision_name
            })
        {
            existing.percent = Some(existing.percent_or_zero() + target.percent_or_zero());
            continue;
        }
        result.push(target);
    }
    result
}

fn validate(targets: &[TrafficTarget], creating: bool) -> Result<(), TrafficError> {
    let mut seen = std::collections::HashSet::new();
    for tag in targets.iter().filter_map(|t| t.tag.as_deref()) {
        if !seen.insert(tag) {
            return Err(TrafficError::DuplicateTag {
                tag: tag.to_string(),
            });
        }
    }

    let sum: i64 = targets.iter().map(TrafficTarget::percent_or_zero).sum();
    if sum != 100 {
        return Err(TrafficError::SumNot100 { sum });
    }

    if creating && targets.len() > 1 {
        return Err(TrafficError::MultipleTargetsOnCreate {
            count: targets.len(),
        });
    }
    Ok(())
}

fn parse_percents(values: &[String]) -> Result<Vec<(String, i64)>, TrafficError> {
    let mut result: Vec<(String, i64)> = Vec::new();
    for item in values.iter().flat_map(|v| split_list(v)) {
        let (reference, raw) = split_pair(&item, "traffic", "REF=PERCENT")?;
        let percent: i64 = raw.parse().map_err(|_| TrafficError::InvalidPercent {
            reference: reference.clone(),
            value: raw.clone(),
        })?;
        if !(0..=100).contains(&percent) {
            return Err(TrafficError::PercentOutOfRange { reference, percent });
        }
        if result.iter().any(|(r, _)| *r == reference) {
            return Err(if reference == LATEST_REF {
                TrafficError::RepeatedLatest { flag: "traffic" }
            } else {
                TrafficError::DuplicateReference { reference }
            });
        }
        result.push((reference, percent));
    }
    Ok(result)
}

fn parse_tags(values: &[String]) -> Result<Vec<(String, String)>, TrafficError> {
    let mut result: Vec<(String, String)> = Vec::new();
    for item in values.iter().flat_map(|v| split_list(v)) {
        let (reference, tag) = split_pair(&item, "tag", "REF=TAG")?;
        if reference == LATEST_REF && result.iter().any(|(r, _)| r == LATEST_REF) {
            return Err(TrafficError::RepeatedLatest { flag: "tag" });
        }
        if result.iter().any(|(_, t)| *t == tag) {
            return Err(TrafficError::DuplicateTag { tag });
        }
        result.push((reference, tag));
    }
    Ok(result)
}

fn split_pair(
    item: &str,
    flag: &'static str,
    expected: &'static str,
) -> Result<(String, String), TrafficError> {
    match item.split_once('=') {
        Some((left, right)) if !left.trim().is_empty() && !right.trim().is_empty() => {
            Ok((left.trim().to_string(), right.trim().to_string()))
        }
        _ => Err(TrafficError::Syntax {
            flag,
            expected,
            value: item.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instructions(traffic: &[&str], tags: &[&str], untag: &[&str]) -> TrafficInstructions {
        let owned = |v: &[&str]| v.iter().map(|s| s.to_string()).collect();
        TrafficInstructions {
            traffic: owned(traffic),
            tags: owned(tags),
            untag: owned(untag),
        }
    }

    fn sum(targets: &[TrafficTarget]) -> i64 {
        targets.iter().map(TrafficTarget::percent_or_zero).sum()
    }

    #[test]
    fn test_tag_and_split_between_revision_and_latest() {
        let current = vec![TrafficTarget::revision("r1", 100)];
        let result = resolve(
            &current,
            &instructions(
                &["stable=80,canary=20"],
                &["r1=stable", "@latest=canary"],
                &[],
            ),
            false,
        )
        .unwrap();

        assert_eq!(result.len(), 2);
        assert_eq!(result[0].revision_name.as_deref(), Some("r1"));
        assert_eq!(result[0].tag.as_deref(), Some("stable"));
        assert_eq!(result[0].percent, Some(80));
        assert!(!result[0].is_latest());

        assert!(result[1].is_latest());
        assert_eq!(result[1].tag.as_deref(), Some("canary"));
        assert_eq!(result[1].percent, Some(20));
    }

    #[test]
    fn test_empty_current_means_latest() {
        let result = resolve(&[], &instructions(&[], &["@latest=current"], &[]), true).unwrap();
        assert_eq!(result.len(), 1);
        assert!(result[0].is_latest());
        assert_eq!(result[0].tag.as_deref(), Some("current"));
        assert_eq!(result[0].percent, Some(100));
    }

    #[test]
    fn test_unmentioned_targets_drop_to_zero() {
        let current = vec![
            TrafficTarget::revision("r1", 50),
            TrafficTarget::revision("r2", 50).with_tag("blue"),
        ];
        let result = resolve(&current, &instructions(&["@latest=100"], &[], &[]), false).unwrap();

        // r1 is untagged at 0% and disappears, blue stays reachable by tag
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].tag.as_deref(), Some("blue"));
        assert_eq!(result[0].percent, Some(0));
        assert!(result[1].is_latest());
        assert_eq!(result[1].percent, Some(100));
    }

    #[test]
    fn test_untag_then_merge_duplicates() {
        let current = vec![
            TrafficTarget::revision("r1", 60),
            TrafficTarget::revision("r1", 40).with_tag("old"),
        ];
        let result = resolve(&current, &instructions(&[], &[], &["old"]), false).unwrap();
        assert_eq!(result, vec![TrafficTarget::revision("r1", 100)]);
    }

    #[test]
    fn test_untag_unknown_fails() {
        let err = resolve(&[], &instructions(&[], &[], &["nope"]), false).unwrap_err();
        assert_eq!(err, TrafficError::TagNotFound { tag: "nope".into() });
    }

    #[test]
    fn test_sum_must_be_100() {
        let current = vec![TrafficTarget::revision("r1", 100)];
        let err = resolve(&current, &instructions(&["r1=50,@latest=40"], &[], &[]), false)
            .unwrap_err();
        assert_eq!(err, TrafficError::SumNot100 { sum: 90 });
    }

    #[test]
    fn test_percent_validation() {
        let err = resolve(&[], &instructions(&["@latest=abc"], &[], &[]), false).unwrap_err();
        assert!(matches!(err, TrafficError::InvalidPercent { .. }));

        let err = resolve(&[], &instructions(&["@latest=101"], &[], &[]), false).unwrap_err();
        assert!(matches!(err, TrafficError::PercentOutOfRange { percent: 101, .. }));

        let err = resolve(&[], &instructions(&["@latest"], &[], &[]), false).unwrap_err();
        assert!(matches!(err, TrafficError::Syntax { flag: "traffic", .. }));
    }

    #[test]
    fn test_duplicate_tags_rejected() {
        let err = resolve(&[], &instructions(&[], &["r1=x", "r2=x"], &[]), false).unwrap_err();
        assert_eq!(err, TrafficError::DuplicateTag { tag: "x".into() });

        let current = vec![TrafficTarget::latest(100).with_tag("x")];
        let err = resolve(&current, &instructions(&[], &["r1=x"], &[]), false).unwrap_err();
        assert_eq!(err, TrafficError::DuplicateTag { tag: "x".into() });
    }

    #[test]
    fn test_retag_after_untag() {
        let current = vec![TrafficTarget::latest(100).with_tag("x")];
        let result = resolve(&current, &instructions(&[], &["@latest=y"], &["x"]), false).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].tag.as_deref(), Some("y"));
    }

    #[test]
    fn test_latest_only_once_per_family() {
        let err = resolve(&[], &instructions(&["@latest=50,@latest=50"], &[], &[]), false)
            .unwrap_err();
        assert_eq!(err, TrafficError::RepeatedLatest { flag: "traffic" });

        let err = resolve(&[], &instructions(&[], &["@latest=a", "@latest=b"], &[]), false)
            .unwrap_err();
        assert_eq!(err, TrafficError::RepeatedLatest { flag: "tag" });
    }

    #[test]
    fn test_create_rejects_multiple_targets() {
        let err = resolve(&[], &instructions(&[], &["r0=old"], &[]), true).unwrap_err();
        assert_eq!(err, TrafficError::MultipleTargetsOnCreate { count: 2 });
    }

    #[test]
    fn test_tag_reference_wins_over_revision_name() {
        let current = vec![
            TrafficTarget::revision("r1", 50).with_tag("r2"),
            TrafficTarget::revision("r2", 50),
        ];
        let result = resolve(&current, &instructions(&["r2=100"], &[], &[]), false).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].revision_name.as_deref(), Some("r1"));
        assert_eq!(result[0].percent, Some(100));
    }

    #[test]
    fn test_result_always_sums_to_100() {
        let current = vec![
            TrafficTarget::revision("r1", 30),
            TrafficTarget::revision("r2", 30).with_tag("b"),
            TrafficTarget::latest(40),
        ];
        let cases = [
            instructions(&[], &["r1=a"], &[]),
            instructions(&["a=10,b=20,@latest=70"], &["r1=a"], &[]),
            instructions(&[], &[], &["b"]),
            instructions(&["r3=100"], &[], &[]),
        ];
        for case in &cases {
            let result = resolve(&current, case, false).unwrap();
            assert_eq!(sum(&result), 100, "{case:?}");
        }
    }
}
