//! Scatter Iteration Tags
//!
//! Scatter instances are named `call-<id>-<tag>`. The tag is the iteration
//! index, followed by a short label derived from the item when it has a
//! natural string form. Labeling never fails.

use std::path::Path;

use crate::workflow::Value;

/// Derives the run identifier suffix for scatter iteration `index`.
///
/// `max_len` bounds the derived label; 0 disables labels.
pub fn scatter_tag(index: usize, item: &Value, max_len: usize) -> String {
    match label(item, max_len) {
        Some(label) => format!("{}-{}", index, label),
        None => index.to_string(),
    }
}

fn label(item: &Value, max_len: usize) -> Option<String> {
    if max_len == 0 {
        return None;
    }

    let text = match item {
        // basename only
        Value::File(p) | Value::Directory(p) => Path::new(p.trim_end_matches('/'))
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())?,
        other => other.scalar_string()?,
    };

    let mut sanitized = String::with_capacity(max_len);
    for c in text.chars() {
        if sanitized.chars().count() >= max_len {
            break;
        }
        if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
            sanitized.push(c);
        } else if !sanitized.ends_with('_') {
            sanitized.push('_');
        }
    }

    let sanitized = sanitized.trim_matches(|c| c == '_' || c == '.').to_string();
    if sanitized.is_empty() {
        None
    } else {
        Some(sanitized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_tags() {
        assert_eq!(scatter_tag(0, &Value::String("chr1".into()), 32), "0-chr1");
        assert_eq!(scatter_tag(3, &Value::Int(42), 32), "3-42");
        assert_eq!(scatter_tag(1, &Value::Boolean(true), 32), "1-true");
    }

    #[test]
    fn test_file_uses_basename() {
        let tag = scatter_tag(2, &Value::file("/data/samples/NA12878.bam"), 32);
        assert_eq!(tag, "2-NA12878.bam");
    }

    #[test]
    fn test_tag_is_bounded_and_sanitized() {
        let tag = scatter_tag(0, &Value::String("a very long label with spaces!".into()), 8);
        assert_eq!(tag, "0-a_very_l");

        let tag = scatter_tag(5, &Value::String("x/y:z".into()), 32);
        assert_eq!(tag, "5-x_y_z");
    }

    #[test]
    fn test_index_only_fallbacks() {
        assert_eq!(scatter_tag(4, &Value::String("anything".into()), 0), "4");
        assert_eq!(scatter_tag(4, &Value::Array(vec![Value::Int(1)]), 32), "4");
        assert_eq!(scatter_tag(4, &Value::Null, 32), "4");
        assert_eq!(scatter_tag(4, &Value::String("!!!".into()), 32), "4");
    }
}
