//! Outline normalization and loose integer parsing for caller inputs.

use serde_json::Value;

use crate::core::types::{Outline, OutlineChapter};
use crate::error::EngineError;

/// Parse a required integer input that may arrive as a number or a string.
///
/// Floats and numeric strings (`"2"`, `"2.0"`) are truncated toward zero.
pub fn parse_int(value: Option<&Value>, field: &'static str) -> Result<i64, EngineError> {
    let parsed = match value {
        None | Some(Value::Null) => return Err(EngineError::MissingInput(field)),
        Some(Value::String(text)) if text.trim().is_empty() => {
            return Err(EngineError::MissingInput(field));
        }
        Some(Value::String(text)) => text.trim().parse::<f64>().ok(),
        Some(Value::Number(number)) => number.as_f64(),
        Some(_) => None,
    };
    match parsed {
        Some(value) if value.is_finite() => Ok(value.trunc() as i64),
        _ => Err(EngineError::InvalidInteger(field)),
    }
}

/// Validate and canonicalize a provider- or caller-supplied outline.
///
/// Chapters must be a non-empty array numbered `1..=N` in order, each with a
/// non-empty title. Bullet points are trimmed and empty ones dropped.
pub fn normalize_outline(raw: &Value) -> Result<Outline, EngineError> {
    let Value::Object(outline) = raw else {
        return Err(invalid("outline must be an object"));
    };
    let chapters = match outline.get("chapters") {
        Some(Value::Array(chapters)) if !chapters.is_empty() => chapters,
        _ => return Err(invalid("outline.chapters must be a non-empty array")),
    };

    let mut normalized = Vec::with_capacity(chapters.len());
    for (index, chapter) in chapters.iter().enumerate() {
        let expected = index as i64 + 1;
        let Value::Object(chapter) = chapter else {
            return Err(invalid("outline chapter must be an object"));
        };
        let number = parse_int(chapter.get("number"), "outline.chapter.number")?;
        if number != expected {
            return Err(invalid(
                "outline chapter numbers must be sequential starting at 1",
            ));
        }
        let title = chapter
            .get("title")
            .map(value_text)
            .unwrap_or_default();
        if title.is_empty() {
            return Err(EngineError::InvalidOutline(format!(
                "outline chapter {expected} missing title"
            )));
        }
        let bullet_points = match chapter.get("bullet_points") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(points)) => points
                .iter()
                .map(value_text)
                .filter(|point| !point.is_empty())
                .collect(),
            Some(_) => {
                return Err(EngineError::InvalidOutline(format!(
                    "outline chapter {expected} bullet_points must be an array"
                )));
            }
        };
        normalized.push(OutlineChapter {
            number: expected as u32,
            title,
            bullet_points,
        });
    }

    Ok(Outline {
        synopsis: outline.get("synopsis").map(value_text).unwrap_or_default(),
        chapters: normalized,
    })
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.trim().to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn invalid(message: &str) -> EngineError {
    EngineError::InvalidOutline(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_int_accepts_numbers_and_numeric_strings() {
        assert_eq!(parse_int(Some(&json!(2)), "chapter_number"), Ok(2));
        assert_eq!(parse_int(Some(&json!(2.9)), "chapter_number"), Ok(2));
        assert_eq!(parse_int(Some(&json!(" 3.0 ")), "chapter_number"), Ok(3));
    }

    #[test]
    fn parse_int_distinguishes_missing_from_invalid() {
        assert_eq!(
            parse_int(None, "chapter_number"),
            Err(EngineError::MissingInput("chapter_number"))
        );
        assert_eq!(
            parse_int(Some(&json!("  ")), "chapter_number"),
            Err(EngineError::MissingInput("chapter_number"))
        );
        assert_eq!(
            parse_int(Some(&json!("two")), "chapter_number"),
            Err(EngineError::InvalidInteger("chapter_number"))
        );
        assert_eq!(
            parse_int(Some(&json!([1])), "chapter_number"),
            Err(EngineError::InvalidInteger("chapter_number"))
        );
    }

    #[test]
    fn normalize_trims_and_drops_empty_bullets() {
        let outline = normalize_outline(&json!({
            "synopsis": "  A book.  ",
            "chapters": [
                {"number": 1, "title": " Opening ", "bullet_points": [" a ", "", "  ", "b"]},
                {"number": "2", "title": "Middle"},
            ],
        }))
        .expect("normalize");
        assert_eq!(outline.synopsis, "A book.");
        assert_eq!(outline.chapters[0].title, "Opening");
        assert_eq!(outline.chapters[0].bullet_points, vec!["a", "b"]);
        assert!(outline.chapters[1].bullet_points.is_empty());
        assert_eq!(outline.chapter_count(), 2);
    }

    #[test]
    fn normalize_rejects_gaps_in_numbering() {
        let err = normalize_outline(&json!({
            "chapters": [
                {"number": 1, "title": "One"},
                {"number": 3, "title": "Three"},
            ],
        }))
        .unwrap_err();
        assert!(err.to_string().contains("sequential"));
    }

    #[test]
    fn normalize_rejects_empty_or_missing_chapters() {
        assert!(normalize_outline(&json!({"chapters": []})).is_err());
        assert!(normalize_outline(&json!({"synopsis": "x"})).is_err());
        assert!(normalize_outline(&json!("outline")).is_err());
    }

    #[test]
    fn normalize_rejects_blank_titles() {
        let err = normalize_outline(&json!({
            "chapters": [{"number": 1, "title": "   "}],
        }))
        .unwrap_err();
        assert_eq!(
            err,
            EngineError::InvalidOutline("outline chapter 1 missing title".to_string())
        );
    }
}
