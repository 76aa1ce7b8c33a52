//! Storage key encoding shared by the counter stores.

/// Join `parts` under `namespace`, prefixing each part with its byte length.
///
/// Principals and feature ids may contain `:`, so plain joining is ambiguous:
/// `("a:b", "c")` and `("a", "b:c")` must not share a counter.
pub(crate) fn scoped_key(namespace: &str, parts: &[&str]) -> String {
    let extra: usize = parts.iter().map(|p| p.len() + 8).sum();
    let mut key = String::with_capacity(namespace.len() + extra);
    key.push_str(namespace);
    for part in parts {
        key.push(':');
        key.push_str(&part.len().to_string());
        key.push(':');
        key.push_str(part);
    }
    key
}
