use std::path::{Path, PathBuf};

/// Join two paths, only including the normal components.
pub fn join_normalized(base: impl AsRef<Path>, path: impl AsRef<Path>) -> PathBuf {
    let mut out = base.as_ref().to_path_buf();
    out.extend(path.as_ref().components().filter(|v| matches!(v, std::path::Component::Normal(_))));
    out
}

/// Keep the last `max` bytes of command output for error messages, cut on a
/// character boundary.
pub fn tail(output: &str, max: usize) -> &str {
    let output = output.trim_end();
    if output.len() <= max {
        return output;
    }
    let mut start = output.len() - max;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    &output[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_normalized() {
        assert_eq!(join_normalized("/srv/repos", "a/b"), PathBuf::from("/srv/repos/a/b"));
        assert_eq!(join_normalized("/srv/repos", "../../etc"), PathBuf::from("/srv/repos/etc"));
        assert_eq!(join_normalized("/srv/repos", "/a/./b"), PathBuf::from("/srv/repos/a/b"));
    }

    #[test]
    fn test_tail() {
        assert_eq!(tail("short\n", 10), "short");
        assert_eq!(tail("0123456789", 4), "6789");
        assert_eq!(tail("aé", 1), "");
    }
}
