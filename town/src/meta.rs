//! Structured blocks carried inside bead descriptions.
//!
//! The store exposes labels-as-strings and no key-value field set, so
//! scheduler metadata and dispatch side records ride in the description,
//! fenced by sentinel lines so they can be losslessly stripped:
//!
//! ```text
//! <!-- scheduler-metadata -->
//! rig: gastown
//! formula: mol-polecat-work
//! failures: 1
//! <!-- /scheduler-metadata -->
//! ```
//!
//! Both block kinds are first-class value types with `parse`/`format`/
//! `strip`; call sites never build them by string concatenation. The law
//! `strip(append(desc, m)) == desc` holds for any description.

use std::collections::BTreeMap;

/// A sentinel-fenced region of a description.
#[derive(Debug, Clone)]
pub struct Fence {
    open: String,
    close: String,
}

impl Fence {
    pub fn new(name: &str) -> Self {
        Self {
            open: format!("<!-- {name} -->"),
            close: format!("<!-- /{name} -->"),
        }
    }

    /// The body lines of this fence in `desc`, if present.
    pub fn extract<'a>(&self, desc: &'a str) -> Option<&'a str> {
        let open_at = desc.find(&self.open)?;
        let body_start = desc[open_at..]
            .find('\n')
            .map(|i| open_at + i + 1)
            .unwrap_or(desc.len());
        let close_at = desc[body_start..].find(&self.close)? + body_start;
        Some(&desc[body_start..close_at])
    }

    /// Remove this fence (and the separator `append` added) from `desc`.
    /// Descriptions without the fence pass through unchanged.
    pub fn strip(&self, desc: &str) -> String {
        let Some(open_at) = desc.find(&self.open) else {
            return desc.to_string();
        };
        let line_start = desc[..open_at].rfind('\n').map(|i| i + 1).unwrap_or(0);
        let head = &desc[..line_start];
        let head = head
            .strip_suffix("\n\n")
            .or_else(|| head.strip_suffix('\n'))
            .unwrap_or(head);

        // Anything after the close line survives the strip.
        let tail = desc[open_at..]
            .find(&self.close)
            .map(|i| {
                let after = open_at + i + self.close.len();
                desc[after..].trim_start_matches('\n')
            })
            .unwrap_or("");

        if tail.is_empty() {
            head.to_string()
        } else if head.is_empty() {
            tail.to_string()
        } else {
            format!("{head}\n\n{tail}")
        }
    }

    /// Append this fence with `body` (newline-separated lines, no trailing
    /// newline) to `desc`, replacing any existing copy.
    pub fn append(&self, desc: &str, body: &str) -> String {
        let base = self.strip(desc);
        let block = if body.is_empty() {
            format!("{}\n{}\n", self.open, self.close)
        } else {
            format!("{}\n{}\n{}\n", self.open, body, self.close)
        };
        if base.is_empty() {
            block
        } else {
            format!("{base}\n\n{block}")
        }
    }
}

fn parse_kv(body: &str) -> Vec<(&str, &str)> {
    body.lines()
        .filter_map(|line| {
            let (k, v) = line.split_once(':')?;
            Some((k.trim(), v.trim()))
        })
        .collect()
}

/// One line of text, safe to embed in a `key: value` body.
fn one_line(s: &str) -> String {
    s.replace(['\n', '\r'], " ")
}

// ---------------------------------------------------------------------------
// Scheduler metadata
// ---------------------------------------------------------------------------

pub const SCHED_META_FENCE: &str = "scheduler-metadata";

/// Scheduler metadata serialized into a queued bead's description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedMeta {
    /// Rig the work will be dispatched to.
    pub target_rig: String,
    pub formula: Option<String>,
    pub args: Vec<String>,
    pub vars: BTreeMap<String, String>,
    pub merge_strategy: Option<String>,
    pub owned: bool,
    /// Consecutive dispatch failures; the circuit breaker trips at
    /// [`crate::scheduler::MAX_DISPATCH_FAILURES`].
    pub dispatch_failures: u32,
    pub last_failure: Option<String>,
}

impl SchedMeta {
    pub fn for_rig(rig: &str) -> Self {
        Self { target_rig: rig.to_string(), ..Default::default() }
    }

    fn fence() -> Fence {
        Fence::new(SCHED_META_FENCE)
    }

    fn format_body(&self) -> String {
        let mut lines = vec![format!("rig: {}", self.target_rig)];
        if let Some(formula) = &self.formula {
            lines.push(format!("formula: {formula}"));
        }
        if !self.args.is_empty() {
            let joined = shlex::try_join(self.args.iter().map(String::as_str))
                .unwrap_or_else(|_| self.args.join(" "));
            lines.push(format!("args: {joined}"));
        }
        for (k, v) in &self.vars {
            lines.push(format!("var.{k}: {}", one_line(v)));
        }
        if let Some(merge) = &self.merge_strategy {
            lines.push(format!("merge: {merge}"));
        }
        if self.owned {
            lines.push("owned: true".to_string());
        }
        if self.dispatch_failures > 0 {
            lines.push(format!("failures: {}", self.dispatch_failures));
        }
        if let Some(failure) = &self.last_failure {
            lines.push(format!("last-failure: {}", one_line(failure)));
        }
        lines.join("\n")
    }

    /// Replace any existing metadata block on `desc` with this one.
    pub fn append_to(&self, desc: &str) -> String {
        Self::fence().append(desc, &self.format_body())
    }

    /// Parse the metadata block out of a description, if present.
    pub fn parse(desc: &str) -> Option<SchedMeta> {
        let body = Self::fence().extract(desc)?;
        let mut meta = SchedMeta::default();
        for (key, value) in parse_kv(body) {
            match key {
                "rig" => meta.target_rig = value.to_string(),
                "formula" => meta.formula = Some(value.to_string()),
                "args" => meta.args = shlex::split(value).unwrap_or_default(),
                "merge" => meta.merge_strategy = Some(value.to_string()),
                "owned" => meta.owned = value == "true",
                "failures" => meta.dispatch_failures = value.parse().unwrap_or(0),
                "last-failure" => meta.last_failure = Some(value.to_string()),
                _ => {
                    if let Some(var) = key.strip_prefix("var.") {
                        meta.vars.insert(var.to_string(), value.to_string());
                    }
                    // Unknown keys from newer versions are ignored.
                }
            }
        }
        Some(meta)
    }

    /// Remove the metadata block from a description.
    pub fn strip(desc: &str) -> String {
        Self::fence().strip(desc)
    }
}

// ---------------------------------------------------------------------------
// Dispatch side records
// ---------------------------------------------------------------------------

pub const DISPATCH_RECORD_FENCE: &str = "dispatch-record";

/// Side records written by sling onto the work item. Best-effort; losing
/// one is a warning, never a failed dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchRecord {
    pub dispatcher: Option<String>,
    pub raw_args: Option<String>,
    pub no_merge: bool,
    pub merge_strategy: Option<String>,
    pub owned: bool,
    pub attached_molecule: Option<String>,
}

impl DispatchRecord {
    fn fence() -> Fence {
        Fence::new(DISPATCH_RECORD_FENCE)
    }

    fn format_body(&self) -> String {
        let mut lines = Vec::new();
        if let Some(dispatcher) = &self.dispatcher {
            lines.push(format!("dispatcher: {dispatcher}"));
        }
        if let Some(raw) = &self.raw_args {
            lines.push(format!("args: {}", one_line(raw)));
        }
        if self.no_merge {
            lines.push("no-merge: true".to_string());
        }
        if let Some(merge) = &self.merge_strategy {
            lines.push(format!("merge: {merge}"));
        }
        if self.owned {
            lines.push("owned: true".to_string());
        }
        if let Some(molecule) = &self.attached_molecule {
            lines.push(format!("molecule: {molecule}"));
        }
        lines.join("\n")
    }

    pub fn append_to(&self, desc: &str) -> String {
        Self::fence().append(desc, &self.format_body())
    }

    pub fn parse(desc: &str) -> Option<DispatchRecord> {
        let body = Self::fence().extract(desc)?;
        let mut record = DispatchRecord::default();
        for (key, value) in parse_kv(body) {
            match key {
                "dispatcher" => record.dispatcher = Some(value.to_string()),
                "args" => record.raw_args = Some(value.to_string()),
                "no-merge" => record.no_merge = value == "true",
                "merge" => record.merge_strategy = Some(value.to_string()),
                "owned" => record.owned = value == "true",
                "molecule" => record.attached_molecule = Some(value.to_string()),
                _ => {}
            }
        }
        Some(record)
    }

    pub fn strip(desc: &str) -> String {
        Self::fence().strip(desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_meta() -> SchedMeta {
        let mut meta = SchedMeta::for_rig("gastown");
        meta.formula = Some("mol-polecat-work".into());
        meta.args = vec!["--force".into(), "two words".into()];
        meta.vars.insert("feature".into(), "Add parser".into());
        meta.merge_strategy = Some("squash".into());
        meta.owned = true;
        meta.dispatch_failures = 2;
        meta.last_failure = Some("spawn timed out".into());
        meta
    }

    #[test]
    fn test_strip_append_is_identity() {
        let meta = sample_meta();
        for desc in ["", "Fix the parser.", "Fix the parser.\n", "a\n\nb\n\n"] {
            let appended = meta.append_to(desc);
            assert_eq!(SchedMeta::strip(&appended), desc, "desc={desc:?}");
        }
    }

    #[test]
    fn test_parse_round_trip() {
        let meta = sample_meta();
        let desc = meta.append_to("Fix the parser.");
        let parsed = SchedMeta::parse(&desc).unwrap();
        assert_eq!(parsed, meta);

        // Re-appending the parsed value is stable.
        let again = parsed.append_to(&SchedMeta::strip(&desc));
        assert_eq!(again, desc);
    }

    #[test]
    fn test_append_replaces_existing_block() {
        let first = SchedMeta::for_rig("gastown");
        let mut second = SchedMeta::for_rig("gastown");
        second.dispatch_failures = 1;

        let desc = first.append_to("body");
        let desc = second.append_to(&desc);
        assert_eq!(desc.matches(SCHED_META_FENCE).count(), 2); // open + close only
        assert_eq!(SchedMeta::parse(&desc).unwrap().dispatch_failures, 1);
        assert_eq!(SchedMeta::strip(&desc), "body");
    }

    #[test]
    fn test_parse_ignores_unknown_keys() {
        let desc = "x\n\n<!-- scheduler-metadata -->\nrig: gastown\nfrobnicate: yes\n<!-- /scheduler-metadata -->\n";
        let meta = SchedMeta::parse(desc).unwrap();
        assert_eq!(meta.target_rig, "gastown");
    }

    #[test]
    fn test_args_shell_round_trip() {
        let mut meta = SchedMeta::for_rig("gastown");
        meta.args = vec!["--subject".into(), "needs spaces".into()];
        let parsed = SchedMeta::parse(&meta.append_to("")).unwrap();
        assert_eq!(parsed.args, meta.args);
    }

    #[test]
    fn test_missing_block_parses_none() {
        assert!(SchedMeta::parse("no block here").is_none());
        assert_eq!(SchedMeta::strip("no block here"), "no block here");
    }

    #[test]
    fn test_dispatch_record_coexists_with_metadata() {
        let meta = SchedMeta::for_rig("gastown");
        let record = DispatchRecord {
            dispatcher: Some("mayor".into()),
            attached_molecule: Some("wisp-9".into()),
            ..Default::default()
        };

        let desc = meta.append_to("body");
        let desc = record.append_to(&desc);
        assert_eq!(SchedMeta::parse(&desc).unwrap(), meta);
        assert_eq!(DispatchRecord::parse(&desc).unwrap(), record);

        // Stripping one block leaves the other intact.
        let without_meta = SchedMeta::strip(&desc);
        assert_eq!(DispatchRecord::parse(&without_meta).unwrap(), record);
    }
}
