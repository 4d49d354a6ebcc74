//! Tags.

use async_trait::async_trait;

use crate::core::{EntityType, SourceQuery, SourceRow};
use crate::error::Result;
use crate::unit::{NewRow, PreloadSource, Transformed, Unit, UnitContext, UnitDefinition};

use super::created_at;

const MAX_TAG_LEN: usize = 30;

/// Normalize a tag name: lowercase, words joined by dashes, limited length.
///
/// Returns `None` if nothing usable is left.
pub fn normalize_tag(raw: &str) -> Option<String> {
    let mut tag = String::with_capacity(raw.len());
    for ch in raw.trim().chars().flat_map(char::to_lowercase) {
        if ch.is_whitespace() || ch == '-' || ch == '_' {
            if !tag.is_empty() && !tag.ends_with('-') {
                tag.push('-');
            }
        } else if ch.is_alphanumeric() || ch == '.' {
            tag.push(ch);
        }
    }
    let tag: String = tag.trim_end_matches('-').chars().take(MAX_TAG_LEN).collect();
    let tag = tag.trim_end_matches('-').to_string();
    (!tag.is_empty()).then_some(tag)
}

/// Creates one target tag per normalized name.
pub struct TagsUnit {
    def: UnitDefinition,
}

impl TagsUnit {
    pub fn new() -> Result<Self> {
        let def = UnitDefinition::builder("tags")
            .produces(EntityType::Tag)
            .table("tags")
            .columns(&["name", "created_at"])
            .rows_query(
                SourceQuery::new(concat!("SELECT t.id, t.name, t.created_at FROM tags t WHERE ", unmapped!("t")))
                    .bind(EntityType::Tag.as_str())
                    .order_by(&["t.id"]),
            )
            .total_rows_query(
                SourceQuery::new(concat!("SELECT COUNT(*) FROM tags t WHERE ", unmapped!("t")))
                    .bind(EntityType::Tag.as_str()),
            )
            .requires_mapping(
                "existing",
                PreloadSource::Target,
                SourceQuery::new("SELECT lower(name), id FROM tags"),
            )
            .build()?;

        Ok(Self { def })
    }
}

#[async_trait]
impl Unit for TagsUnit {
    fn definition(&self) -> &UnitDefinition {
        &self.def
    }

    async fn transform(&mut self, ctx: &mut UnitContext<'_>, row: &SourceRow) -> Result<Transformed> {
        let raw = row.text("name")?.unwrap_or_default();
        let Some(name) = normalize_tag(&raw) else {
            return Ok(Transformed::Reject(format!("unusable tag name '{}'", raw)));
        };
        if let Some(existing) = ctx.preloaded().get("existing", &name)? {
            return Ok(Transformed::MapExisting(existing));
        }

        // Duplicates within the run are mapped onto the first by natural key.
        Ok(Transformed::Insert(
            NewRow::new(vec![name.clone().into(), created_at(row)?.into()]).with_natural_key(name),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_tag() {
        assert_eq!(normalize_tag("  Rust Lang ").as_deref(), Some("rust-lang"));
        assert_eq!(normalize_tag("rust_lang").as_deref(), Some("rust-lang"));
        assert_eq!(normalize_tag("C#!").as_deref(), Some("c"));
        assert_eq!(normalize_tag("v1.2").as_deref(), Some("v1.2"));
        assert_eq!(normalize_tag(" ?! "), None);
        assert_eq!(normalize_tag(&"x".repeat(40)).map(|t| t.len()), Some(MAX_TAG_LEN));
    }
}
