//! Recording metadata derived from file names.
//!
//! Naming conventions are tried in a fixed order and the first matcher that
//! recognises the name wins. A name that happens to satisfy an earlier
//! convention is read by that convention even when a later one was meant;
//! e.g. `ID1CON2TI3_T9_rest` is read as the `ID..CON..TI..` form.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Sentinel for fields no convention could resolve.
pub const UNKNOWN: &str = "unknown";

/// Timepoint assigned to bare `id_condition` names.
pub const DEFAULT_TIMEPOINT: &str = "T1";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Metadata {
    pub participant_id: String,
    pub condition: String,
    pub timepoint: String,
    /// Empty when the name carries no group.
    #[serde(default)]
    pub group: String,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            participant_id: UNKNOWN.to_string(),
            condition: UNKNOWN.to_string(),
            timepoint: UNKNOWN.to_string(),
            group: String::new(),
        }
    }
}

impl Metadata {
    pub fn new(
        participant_id: impl Into<String>,
        condition: impl Into<String>,
        timepoint: impl Into<String>,
    ) -> Self {
        Self {
            participant_id: participant_id.into(),
            condition: condition.into(),
            timepoint: timepoint.into(),
            group: String::new(),
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    /// True when participant, condition and timepoint are all resolved.
    pub fn is_complete(&self) -> bool {
        self.participant_id != UNKNOWN && self.condition != UNKNOWN && self.timepoint != UNKNOWN
    }
}

/// A naming convention. Receives the file name without its extension.
pub type Matcher = fn(&str) -> Option<Metadata>;

static FULL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)ID(\d+)CON(\d+)TI(\d+)GR(\d+)").expect("valid regex"));
static COMPACT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)ID(\d+)CON(\d+)TI(\d+)").expect("valid regex"));
static UTF_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)UTF-(\w+)_T(\d+)_(\w+)").expect("valid regex"));

/// `ID<p>CON<c>TI<t>GR<g>` anywhere in the name.
pub fn match_full(stem: &str) -> Option<Metadata> {
    let caps = FULL_PATTERN.captures(stem)?;
    Some(Metadata::new(&caps[1], &caps[2], &caps[3]).with_group(&caps[4]))
}

/// `ID<p>CON<c>TI<t>` anywhere in the name.
pub fn match_compact(stem: &str) -> Option<Metadata> {
    let caps = COMPACT_PATTERN.captures(stem)?;
    Some(Metadata::new(&caps[1], &caps[2], &caps[3]))
}

/// `UTF-<p>_T<t>_<condition>`. The timepoint keeps only its digits.
pub fn match_utf(stem: &str) -> Option<Metadata> {
    let caps = UTF_PATTERN.captures(stem)?;
    Some(Metadata::new(&caps[1], &caps[3], &caps[2]))
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

/// Three or more underscore-separated segments, read by prefix:
/// `UTF-`/`ID` mark the participant, `T<n>` the timepoint, `CON<n>` the
/// condition. Unprefixed segments fill participant, timepoint and condition
/// by position (first, second, third) when still unresolved.
pub fn match_positional(stem: &str) -> Option<Metadata> {
    let parts: Vec<&str> = stem.split('_').collect();
    if parts.len() < 3 {
        return None;
    }
    let mut meta = Metadata::default();
    for (i, part) in parts.iter().enumerate() {
        if part.starts_with("UTF-") || part.starts_with("ID") {
            meta.participant_id = part.replace("UTF-", "").replace("ID", "");
        } else if part.starts_with('T') && is_digits(&part[1..]) {
            meta.timepoint = part.to_string();
        } else if part.starts_with("CON") && is_digits(&part[3..]) {
            meta.condition = part[3..].to_string();
        } else if i == 0 && meta.participant_id == UNKNOWN {
            meta.participant_id = part.to_string();
        } else if i == 1 && meta.timepoint == UNKNOWN {
            meta.timepoint = part.to_string();
        } else if i == 2 && meta.condition == UNKNOWN {
            meta.condition = part.to_string();
        }
    }
    Some(meta)
}

/// `<numeric id>_<condition>`; the timepoint defaults to [`DEFAULT_TIMEPOINT`].
pub fn match_id_condition(stem: &str) -> Option<Metadata> {
    let (id, condition) = stem.split_once('_')?;
    if condition.contains('_') || !is_digits(id) {
        return None;
    }
    Some(Metadata::new(id, condition, DEFAULT_TIMEPOINT))
}

/// Ordered list of naming conventions.
#[derive(Clone)]
pub struct MetadataExtractor {
    matchers: Vec<(&'static str, Matcher)>,
}

impl Default for MetadataExtractor {
    fn default() -> Self {
        Self {
            matchers: vec![
                ("id-con-ti-gr", match_full as Matcher),
                ("id-con-ti", match_compact),
                ("utf", match_utf),
                ("positional", match_positional),
                ("id-condition", match_id_condition),
            ],
        }
    }
}

impl MetadataExtractor {
    /// Rule names in priority order.
    pub fn rules(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.matchers.iter().map(|(name, _)| *name)
    }

    /// Metadata for a file name (a path is accepted; only its final
    /// component is used). Never fails: unresolved fields hold [`UNKNOWN`].
    pub fn extract(&self, filename: &str) -> Metadata {
        self.extract_with_rule(filename).0
    }

    /// Like [`extract`](Self::extract), also naming the rule that matched.
    pub fn extract_with_rule(&self, filename: &str) -> (Metadata, Option<&'static str>) {
        let stem = file_stem(filename);
        for (name, matcher) in &self.matchers {
            if let Some(meta) = matcher(stem) {
                return (meta, Some(*name));
            }
        }
        (Metadata::default(), None)
    }
}

fn file_stem(filename: &str) -> &str {
    Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename)
}
