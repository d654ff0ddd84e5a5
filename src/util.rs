use std::path::PathBuf;

/// Expand a leading `~` against `$HOME`. Stored model paths come from the
/// browser UI and routinely use the shorthand.
pub fn expanduser(path: &str) -> PathBuf {
    if path == "~" {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home);
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expanduser_plain_path_untouched() {
        assert_eq!(expanduser("/models/llama"), PathBuf::from("/models/llama"));
        assert_eq!(expanduser("relative/dir"), PathBuf::from("relative/dir"));
    }

    #[test]
    fn test_expanduser_tilde() {
        // HOME is set in any environment the tests run in; fall back gracefully.
        if let Ok(home) = std::env::var("HOME") {
            assert_eq!(expanduser("~/models"), PathBuf::from(home).join("models"));
        }
    }
}
