//! Tags attached to topics.

use async_trait::async_trait;

use crate::core::{EntityType, SourceQuery, SourceRow};
use crate::error::Result;
use crate::unit::{NewRow, PreloadSource, Transformed, Unit, UnitContext, UnitDefinition};

use super::ForeignKey;

pub struct TopicTagsUnit {
    def: UnitDefinition,
}

impl TopicTagsUnit {
    pub fn new() -> Result<Self> {
        let def = UnitDefinition::builder("topic_tags")
            .depends_on(&["topics", "tags"])
            .table("topic_tags")
            .columns(&["topic_id", "tag_id"])
            .rows_query(
                SourceQuery::new("SELECT tt.topic_id, tt.tag_id FROM topic_tags tt")
                    .order_by(&["tt.topic_id", "tt.tag_id"]),
            )
            .total_rows_query(SourceQuery::new("SELECT COUNT(*) FROM topic_tags"))
            .requires_set(
                "existing",
                PreloadSource::Target,
                SourceQuery::new("SELECT topic_id, tag_id FROM topic_tags"),
            )
            .build()?;

        Ok(Self { def })
    }
}

#[async_trait]
impl Unit for TopicTagsUnit {
    fn definition(&self) -> &UnitDefinition {
        &self.def
    }

    async fn transform(&mut self, ctx: &mut UnitContext<'_>, row: &SourceRow) -> Result<Transformed> {
        let topic_id = match ForeignKey::resolve(ctx, row, "topic_id", EntityType::Topic)
            .await?
            .required("topic_id")
        {
            Ok(id) => id,
            Err(reject) => return Ok(reject),
        };
        let tag_id = match ForeignKey::resolve(ctx, row, "tag_id", EntityType::Tag)
            .await?
            .required("tag_id")
        {
            Ok(id) => id,
            Err(reject) => return Ok(reject),
        };

        // Tags that normalize to the same name collapse onto one.
        if !ctx
            .preloaded_mut()
            .insert("existing", format!("{}:{}", topic_id, tag_id))?
        {
            return Ok(Transformed::Skip);
        }

        Ok(Transformed::Insert(NewRow::new(vec![topic_id.into(), tag_id.into()])))
    }
}
