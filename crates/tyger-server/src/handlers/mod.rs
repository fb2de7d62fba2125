pub mod buffers;
pub mod codespecs;
pub mod metadata;
pub mod runs;

use std::collections::HashMap;

use tyger_types::TagSet;

/// Query params are handed to handlers as a flat `HashMap<String, String>`
/// (spec §6's `tag[k]=v` repeating-bracket convention doesn't fit a typed
/// extractor); this pulls the `tag[...]` entries out into a [`TagSet`] and
/// leaves the rest alone.
pub(crate) fn extract_tag_filter(params: &HashMap<String, String>) -> TagSet {
    params
        .iter()
        .filter_map(|(k, v)| {
            let key = k.strip_prefix("tag[")?.strip_suffix(']')?;
            Some((key.to_string(), v.clone()))
        })
        .collect()
}
