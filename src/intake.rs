//! Request intake from a plain-text name list.
//!
//! One artifact name per line. Lines are trimmed, blank lines skipped, and
//! repeated names dropped after their first occurrence. Names are not
//! validated here; [`BatchPlan`](crate::batch::BatchPlan) does that.

use std::collections::HashSet;
use std::path::Path;

use crate::error::Result;

/// Split a name list into names, in order, without duplicates.
pub fn parse_name_list(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| seen.insert(*line))
        .map(str::to_string)
        .collect()
}

/// Read a name list from a file.
pub fn read_name_list(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path.as_ref())?;
    Ok(parse_name_list(&text))
}

/// Merge names from several sources, keeping first occurrences.
pub fn merge_names<I>(sources: I) -> Vec<String>
where
    I: IntoIterator<Item = Vec<String>>,
{
    let mut seen = HashSet::new();
    sources
        .into_iter()
        .flatten()
        .filter(|name| seen.insert(name.clone()))
        .collect()
}
