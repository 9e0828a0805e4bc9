//! Lexical helpers for hierarchical keys.

/// Lexically clean a slash separated key: collapse repeated separators,
/// resolve `.` and `..`, and drop any trailing separator.
///
/// An empty input cleans to `"."`, matching the usual path semantics.
pub fn clean(key: &str) -> String {
    let rooted = key.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for segment in key.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|last| *last != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// The prefix a key must start with to live below `key`.
pub fn dir_prefix(key: &str) -> String {
    let cleaned = clean(key);
    if cleaned == "/" {
        cleaned
    } else {
        format!("{cleaned}/")
    }
}

/// True when `candidate` lies strictly below `dir` in the key hierarchy.
pub fn is_under(dir: &str, candidate: &str) -> bool {
    candidate.starts_with(&dir_prefix(dir))
}

/// Join a parent key and a child name with exactly one separator.
pub fn join(parent: &str, child: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{child}")
    } else {
        format!("{parent}/{child}")
    }
}
