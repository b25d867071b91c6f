//! JSON Pointer (RFC 6901) parsing and formatting

use vibe_core::{Result, VibeError};

/// Unescape a single pointer component (`~1` -> `/`, `~0` -> `~`)
pub fn unescape_component(component: &str) -> String {
    if !component.contains('~') {
        return component.to_string();
    }
    component.replace("~1", "/").replace("~0", "~")
}

/// Escape a single pointer component
pub fn escape_component(component: &str) -> String {
    if !component.contains('/') && !component.contains('~') {
        return component.to_string();
    }
    component.replace('~', "~0").replace('/', "~1")
}

/// Parse a pointer into its unescaped components.
///
/// The empty pointer is the document root. Any other pointer must start
/// with `/`.
pub fn parse(pointer: &str) -> Result<Vec<String>> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    if !pointer.starts_with('/') {
        return Err(VibeError::InvalidPointer(pointer.to_string()));
    }
    Ok(pointer[1..].split('/').map(unescape_component).collect())
}

/// Format components back into a pointer string
pub fn format(path: &[String]) -> String {
    let mut out = String::with_capacity(path.len() * 8);
    for component in path {
        out.push('/');
        out.push_str(&escape_component(component));
    }
    out
}

/// True if `child` lies strictly below `parent`
pub fn is_child(parent: &[String], child: &[String]) -> bool {
    parent.len() < child.len() && child[..parent.len()] == parent[..]
}
