//! Categories and subcategories.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;

use crate::core::{normalize_name, EntityType, SourceQuery, SourceRow};
use crate::error::Result;
use crate::unit::{
    NewRow, PreloadSource, Transformed, UniqueNameGenerator, Unit, UnitContext, UnitDefinition,
};

use super::{created_at, ForeignKey};

const DEFAULT_COLOR: &str = "0088CC";
const MAX_NAME_LEN: usize = 50;
const MAX_SLUG_LEN: usize = 50;

/// Creates the category tree, parents before children.
///
/// Names are unique among siblings: a category whose parent already has a
/// child of the same name is mapped onto it. Slugs are made unique among
/// siblings.
pub struct CategoriesUnit {
    def: UnitDefinition,
    /// `parent:name` keys inserted this run.
    names: HashSet<String>,
    /// Slug generators per parent (`""` for top level).
    slugs: Option<HashMap<String, UniqueNameGenerator>>,
}

impl CategoriesUnit {
    pub fn new() -> Result<Self> {
        let def = UnitDefinition::builder("categories")
            .depends_on(&["users"])
            .produces(EntityType::Category)
            .table("categories")
            .columns(&[
                "name",
                "slug",
                "description",
                "color",
                "parent_category_id",
                "user_id",
                "position",
                "created_at",
            ])
            .rows_query(
                SourceQuery::new(concat!(
                    "WITH RECURSIVE tree (id, depth) AS (
                        SELECT id, 0 FROM categories WHERE parent_category_id IS NULL
                        UNION ALL
                        SELECT c.id, tree.depth + 1
                        FROM categories c JOIN tree ON c.parent_category_id = tree.id
                     )
                     SELECT c.id, c.name, c.slug, c.description, c.color, c.parent_category_id,
                            c.user_id, c.position, c.created_at, COALESCE(tree.depth, 0) AS depth
                     FROM categories c LEFT JOIN tree ON tree.id = c.id
                     WHERE ",
                    unmapped!("c")
                ))
                .bind(EntityType::Category.as_str())
                .order_by(&["depth", "c.id"]),
            )
            .total_rows_query(
                SourceQuery::new(concat!("SELECT COUNT(*) FROM categories c WHERE ", unmapped!("c")))
                    .bind(EntityType::Category.as_str()),
            )
            .requires_mapping(
                "existing",
                PreloadSource::Target,
                SourceQuery::new(
                    "SELECT COALESCE(CAST(parent_category_id AS TEXT), '') || ':' || lower(name), id
                     FROM categories",
                ),
            )
            .requires_set(
                "slugs",
                PreloadSource::Target,
                SourceQuery::new(
                    "SELECT COALESCE(CAST(parent_category_id AS TEXT), ''), lower(slug) FROM categories",
                ),
            )
            .self_reference("parent_category_id")
            .build()?;

        Ok(Self {
            def,
            names: HashSet::new(),
            slugs: None,
        })
    }

    fn slug_generator(&mut self, ctx: &UnitContext<'_>, parent: &str) -> Result<&mut UniqueNameGenerator> {
        if self.slugs.is_none() {
            let mut slugs: HashMap<String, UniqueNameGenerator> = HashMap::new();
            for entry in ctx.preloaded().set("slugs")? {
                if let Some((parent, slug)) = entry.split_once(':') {
                    slugs
                        .entry(parent.to_string())
                        .or_insert_with(|| UniqueNameGenerator::with_max_len(MAX_SLUG_LEN))
                        .reserve(slug);
                }
            }
            self.slugs = Some(slugs);
        }
        Ok(self
            .slugs
            .get_or_insert_with(HashMap::new)
            .entry(parent.to_string())
            .or_insert_with(|| UniqueNameGenerator::with_max_len(MAX_SLUG_LEN)))
    }
}

/// Lowercase ASCII slug with single dashes between words.
pub(crate) fn slugify(raw: &str) -> String {
    let mut slug = String::with_capacity(raw.len());
    for ch in raw.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}

/// Normalize a hex color to six uppercase digits.
pub(crate) fn normalize_color(raw: &str) -> Option<String> {
    let hex = raw.trim().trim_start_matches('#');
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    match hex.len() {
        6 => Some(hex.to_ascii_uppercase()),
        3 => Some(hex.chars().flat_map(|c| [c, c]).collect::<String>().to_ascii_uppercase()),
        _ => None,
    }
}

#[async_trait]
impl Unit for CategoriesUnit {
    fn definition(&self) -> &UnitDefinition {
        &self.def
    }

    async fn transform(&mut self, ctx: &mut UnitContext<'_>, row: &SourceRow) -> Result<Transformed> {
        let Some(name) = row.text("name")? else {
            return Ok(Transformed::Reject("missing category name".to_string()));
        };
        let name = ctx.ensure_max_length("name", name.trim().to_string(), MAX_NAME_LEN);

        let parent = ctx.self_reference();
        let parent_key = parent.map(|id| id.to_string()).unwrap_or_default();
        let key = format!("{}:{}", parent_key, normalize_name(&name));
        if let Some(existing) = ctx.preloaded().get("existing", &key)? {
            return Ok(Transformed::MapExisting(existing));
        }
        if self.names.contains(&key) {
            return Ok(Transformed::MapToKey(key));
        }

        let slug = row
            .text("slug")?
            .map(|s| slugify(&s))
            .filter(|s| !s.is_empty())
            .or_else(|| Some(slugify(&name)).filter(|s| !s.is_empty()))
            .unwrap_or_else(|| "category".to_string());
        let slug = self.slug_generator(ctx, &parent_key)?.unique_name(&slug);

        let color = match row.text("color")? {
            Some(raw) => match normalize_color(&raw) {
                Some(color) => color,
                None => {
                    ctx.record_warning("color", raw, DEFAULT_COLOR.to_string());
                    DEFAULT_COLOR.to_string()
                }
            },
            None => DEFAULT_COLOR.to_string(),
        };

        let user_id = ForeignKey::resolve(ctx, row, "user_id", EntityType::User)
            .await?
            .optional();

        self.names.insert(key.clone());
        Ok(Transformed::Insert(
            NewRow::new(vec![
                name.into(),
                slug.into(),
                row.text("description")?.into(),
                color.into(),
                parent.into(),
                user_id.into(),
                row.i64("position")?.into(),
                created_at(row)?.into(),
            ])
            .with_natural_key(key),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("  General Discussion! "), "general-discussion");
        assert_eq!(slugify("C++ & Rust"), "c-rust");
        assert_eq!(slugify("???"), "");
    }

    #[test]
    fn test_normalize_color() {
        assert_eq!(normalize_color("#0088cc").as_deref(), Some("0088CC"));
        assert_eq!(normalize_color("f0a").as_deref(), Some("FF00AA"));
        assert_eq!(normalize_color("blue"), None);
        assert_eq!(normalize_color("12345"), None);
    }
}
