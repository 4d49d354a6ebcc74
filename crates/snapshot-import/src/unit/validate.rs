//! Value validation with default substitution.

/// Return `value` if it is one of `allowed`, otherwise `default`.
///
/// `on_invalid(&value, &default)` is invoked exactly once when the default is
/// substituted, and never when the value is accepted.
pub fn ensure_valid_value<T, F>(value: T, allowed: &[T], default: T, on_invalid: F) -> T
where
    T: PartialEq,
    F: FnOnce(&T, &T),
{
    if allowed.contains(&value) {
        value
    } else {
        on_invalid(&value, &default);
        default
    }
}

/// Truncate `value` to at most `max_chars` characters.
///
/// Returns `None` when the value already fits.
pub fn truncate_chars(value: &str, max_chars: usize) -> Option<String> {
    value
        .char_indices()
        .nth(max_chars)
        .map(|(idx, _)| value[..idx].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_value_passes_without_callback() {
        let mut calls = 0;
        let out = ensure_valid_value(2, &[0, 1, 2, 3, 4], 1, |_, _| calls += 1);
        assert_eq!(out, 2);
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_invalid_value_falls_back_and_reports_once() {
        let mut seen = Vec::new();
        let out = ensure_valid_value(9, &[0, 1, 2, 3, 4], 1, |v, d| seen.push((*v, *d)));
        assert_eq!(out, 1);
        assert_eq!(seen, vec![(9, 1)]);
    }

    #[test]
    fn test_works_with_strings() {
        let allowed = ["public".to_string(), "members".to_string()];
        let mut reported = None;
        let out = ensure_valid_value(
            "secret".to_string(),
            &allowed,
            "public".to_string(),
            |v, d| reported = Some(format!("{v}->{d}")),
        );
        assert_eq!(out, "public");
        assert_eq!(reported.as_deref(), Some("secret->public"));
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("hello", 10), None);
        assert_eq!(truncate_chars("hello", 5), None);
        assert_eq!(truncate_chars("hello", 3).as_deref(), Some("hel"));
        assert_eq!(truncate_chars("héllo", 2).as_deref(), Some("hé"));
    }
}
