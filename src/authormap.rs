//! Optional author-map file (spec §6): maps a bare CVS username to a full
//! `Name <email>` identity, with an optional trailing timezone used when
//! formatting commit timestamps.

use std::collections::HashMap;
use std::path::Path;

use crate::diagnostics::FatalError;

#[derive(Debug, Clone)]
pub struct AuthorInfo {
    pub full_name: String,
    pub email: String,
    pub timezone: Option<String>,
}

pub type AuthorMap = HashMap<String, AuthorInfo>;

/// Parse lines of the form `cvsname = Full Name <email> [timezone]`.
/// Blank lines and lines starting with `#` are ignored.
pub fn parse(path: &Path) -> Result<AuthorMap, FatalError> {
    let text = std::fs::read_to_string(path).map_err(|e| FatalError::CannotOpen(path.to_path_buf(), e))?;
    let mut map = HashMap::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((cvsname, rest)) = line.split_once('=') else {
            return Err(FatalError::MalformedMaster {
                master: path.to_path_buf(),
                reason: format!("line {}: missing '='", lineno + 1),
            });
        };
        let rest = rest.trim();
        let Some(lt) = rest.find('<') else {
            return Err(FatalError::MalformedMaster {
                master: path.to_path_buf(),
                reason: format!("line {}: missing '<email>'", lineno + 1),
            });
        };
        let full_name = rest[..lt].trim().to_string();
        let after_lt = &rest[lt + 1..];
        let Some(gt) = after_lt.find('>') else {
            return Err(FatalError::MalformedMaster {
                master: path.to_path_buf(),
                reason: format!("line {}: unterminated '<email>'", lineno + 1),
            });
        };
        let email = after_lt[..gt].to_string();
        let timezone = after_lt[gt + 1..].trim();
        let timezone = if timezone.is_empty() { None } else { Some(timezone.to_string()) };
        map.insert(cvsname.trim().to_string(), AuthorInfo { full_name, email, timezone });
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_mapping() {
        let path = std::env::temp_dir().join(format!("authormap-test-{}.txt", std::process::id()));
        std::fs::write(&path, b"alice = Alice A. <alice@example.com> -0500\n# comment\n").unwrap();
        let map = parse(&path).unwrap();
        std::fs::remove_file(&path).ok();
        let info = map.get("alice").unwrap();
        assert_eq!(info.full_name, "Alice A.");
        assert_eq!(info.email, "alice@example.com");
        assert_eq!(info.timezone.as_deref(), Some("-0500"));
    }

    #[test]
    fn timezone_is_optional() {
        let path = std::env::temp_dir().join(format!("authormap-test-notz-{}.txt", std::process::id()));
        std::fs::write(&path, b"bob = Bob B. <bob@example.com>\n").unwrap();
        let map = parse(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(map.get("bob").unwrap().timezone, None);
    }

    #[test]
    fn missing_equals_is_a_fatal_error() {
        let path = std::env::temp_dir().join(format!("authormap-test-bad-{}.txt", std::process::id()));
        std::fs::write(&path, b"not a mapping line\n").unwrap();
        let result = parse(&path);
        std::fs::remove_file(&path).ok();
        assert!(result.is_err());
    }
}
