use std::collections::HashSet;

/// Alternative Advisor. It makes no choices of its own: the caller's fallback
/// list is stored as given, minus duplicates and the requested slot itself.
pub(crate) fn normalize(slot_id: &str, alternatives: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    alternatives
        .into_iter()
        .filter(|alt| alt.as_str() != slot_id && seen.insert(alt.clone()))
        .collect()
}
