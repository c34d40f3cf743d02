//! Session names – filesystem-safe slugs for recording directories.

use serde_json::Value;

/// Non-ASCII text is transliterated first (`Über` → `uber`).  Lower-case
/// ASCII letters and digits are kept; every other run of characters
/// becomes a single `-`.
pub fn slugify(name: &str) -> String {
    let ascii = deunicode::deunicode(name);
    let mut slug = String::with_capacity(ascii.len());
    let mut gap = false;
    for c in ascii.chars() {
        if c.is_ascii_alphanumeric() {
            if gap && !slug.is_empty() {
                slug.push('-');
            }
            gap = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            gap = true;
        }
    }
    slug
}

/// Slug for a user-supplied name, falling back to the current Unix time in
/// milliseconds when the name is missing or has no usable characters.
pub fn session_name(name: Option<&str>) -> String {
    let slug = name.map(slugify).unwrap_or_default();
    if slug.is_empty() {
        chrono::Utc::now().timestamp_millis().to_string()
    } else {
        slug
    }
}

/// Read a name from a control message field.  Clients sometimes send a
/// bare timestamp, so numbers are accepted too.
pub fn name_from_value(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Run 1"), "run-1");
        assert_eq!(slugify("  level 3 / hard!! "), "level-3-hard");
        assert_eq!(slugify("../../etc"), "etc");
    }

    #[test]
    fn test_slugify_transliterates() {
        assert_eq!(slugify("Ünïcode"), "unicode");
        assert_eq!(slugify("Über"), "uber");
        assert_ne!(slugify("Über"), slugify("ber"));
        assert_eq!(slugify("Straße 2"), "strasse-2");
    }

    #[test]
    fn test_session_name_fallback() {
        let name = session_name(None);
        assert!(name.parse::<i64>().is_ok());
        let name = session_name(Some("???"));
        assert!(name.parse::<i64>().is_ok());
        assert_eq!(session_name(Some("run1")), "run1");
    }

    #[test]
    fn test_name_from_value() {
        assert_eq!(name_from_value(Some(&json!("a"))), Some("a".into()));
        assert_eq!(name_from_value(Some(&json!(1700000000000i64))), Some("1700000000000".into()));
        assert_eq!(name_from_value(Some(&json!(null))), None);
        assert_eq!(name_from_value(None), None);
    }
}
