//! Topics.

use async_trait::async_trait;
use tracing::info;

use crate::core::{EntityType, SourceQuery, SourceRow};
use crate::error::Result;
use crate::unit::{NewRow, Transformed, Unit, UnitContext, UnitDefinition};

use super::{created_at, ForeignKey};

const ARCHETYPES: [&str; 3] = ["regular", "private_message", "banner"];
const MAX_TITLE_LEN: usize = 255;

/// Creates topics in their mapped categories.
///
/// A topic without a category is kept uncategorized; one whose category did
/// not migrate is rejected.
pub struct TopicsUnit {
    def: UnitDefinition,
}

impl TopicsUnit {
    pub fn new() -> Result<Self> {
        let def = UnitDefinition::builder("topics")
            .depends_on(&["categories", "users"])
            .produces(EntityType::Topic)
            .table("topics")
            .columns(&[
                "title",
                "category_id",
                "user_id",
                "archetype",
                "views",
                "closed",
                "created_at",
            ])
            .rows_query(
                SourceQuery::new(concat!(
                    "SELECT t.id, t.title, t.category_id, t.user_id, t.archetype, t.views,
                            t.closed, t.created_at
                     FROM topics t WHERE ",
                    unmapped!("t")
                ))
                .bind(EntityType::Topic.as_str())
                .order_by(&["t.id"]),
            )
            .total_rows_query(
                SourceQuery::new(concat!("SELECT COUNT(*) FROM topics t WHERE ", unmapped!("t")))
                    .bind(EntityType::Topic.as_str()),
            )
            .build()?;

        Ok(Self { def })
    }
}

#[async_trait]
impl Unit for TopicsUnit {
    fn definition(&self) -> &UnitDefinition {
        &self.def
    }

    async fn transform(&mut self, ctx: &mut UnitContext<'_>, row: &SourceRow) -> Result<Transformed> {
        let Some(title) = row.text("title")? else {
            return Ok(Transformed::Reject("missing title".to_string()));
        };
        let title = ctx.ensure_max_length("title", title.trim().to_string(), MAX_TITLE_LEN);

        let category_id = match ForeignKey::resolve(ctx, row, "category_id", EntityType::Category).await? {
            ForeignKey::Absent => None,
            category => match category.required("category_id") {
                Ok(id) => Some(id),
                Err(reject) => return Ok(reject),
            },
        };
        let user_id = ForeignKey::resolve(ctx, row, "user_id", EntityType::User)
            .await?
            .optional();

        let archetype = row
            .text("archetype")?
            .map(|a| a.to_lowercase())
            .unwrap_or_else(|| ARCHETYPES[0].to_string());
        let archetype = ctx
            .ensure_valid("archetype", archetype.as_str(), &ARCHETYPES, ARCHETYPES[0])
            .to_string();

        Ok(Transformed::Insert(NewRow::new(vec![
            title.into(),
            category_id.into(),
            user_id.into(),
            archetype.into(),
            row.i64("views")?.unwrap_or(0).max(0).into(),
            row.bool("closed")?.unwrap_or(false).into(),
            created_at(row)?.into(),
        ])))
    }

    async fn after(&mut self, ctx: &mut UnitContext<'_>, inserted: u64) -> Result<()> {
        // Recomputed even when nothing was added, so a rerun repairs the
        // counters after a run that failed before reaching this hook.
        let updated = ctx
            .target()
            .exec(&SourceQuery::new(
                "UPDATE categories SET topic_count =
                    (SELECT COUNT(*) FROM topics t WHERE t.category_id = categories.id)",
            ))
            .await?;
        info!(
            "topics: {} topics added, topic counts refreshed for {} categories",
            inserted, updated
        );
        Ok(())
    }
}
