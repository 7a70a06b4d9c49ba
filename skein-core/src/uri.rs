//! Resource URI helpers.
//!
//! Expanded and non-expanded views of a resource are distinct cache keys
//! that must be invalidated together.

/// Query appended to a URI to request its expanded view.
pub const EXPAND_QUERY: &str = "$expand=*";

/// Returns true when the URI carries a query component.
pub fn has_query(uri: &str) -> bool {
    uri.contains('?')
}

/// The expanded counterpart of `uri`.
pub fn expanded(uri: &str) -> String {
    if has_query(uri) {
        format!("{}&{}", uri, EXPAND_QUERY)
    } else {
        format!("{}?{}", uri, EXPAND_QUERY)
    }
}

/// Returns true when `uri` already requests the expanded view.
pub fn is_expanded(uri: &str) -> bool {
    match uri.split_once('?') {
        Some((_, query)) => query.split('&').any(|part| part == EXPAND_QUERY),
        None => false,
    }
}

/// Path portion of the URI, without query.
pub fn path(uri: &str) -> &str {
    match uri.split_once('?') {
        Some((path, _)) => path,
        None => uri,
    }
}

/// The collection a member resource belongs to.
///
/// `/widgets/7` -> `/widgets`. Returns `None` for the root.
pub fn parent_collection(uri: &str) -> Option<String> {
    let trimmed = path(uri).trim_end_matches('/');
    let (parent, _) = trimmed.rsplit_once('/')?;
    if parent.is_empty() {
        None
    } else {
        Some(parent.to_string())
    }
}
