//! Per-user category notification settings.

use async_trait::async_trait;

use crate::core::{EntityType, SourceQuery, SourceRow};
use crate::error::Result;
use crate::unit::{NewRow, PreloadSource, Transformed, Unit, UnitContext, UnitDefinition};

use super::ForeignKey;

/// muted, regular, tracking, watching, watching first post
const NOTIFICATION_LEVELS: [i64; 5] = [0, 1, 2, 3, 4];
const DEFAULT_NOTIFICATION_LEVEL: i64 = 1;

pub struct CategoryUsersUnit {
    def: UnitDefinition,
}

impl CategoryUsersUnit {
    pub fn new() -> Result<Self> {
        let def = UnitDefinition::builder("category_users")
            .depends_on(&["categories", "users"])
            .table("category_users")
            .columns(&["category_id", "user_id", "notification_level"])
            .rows_query(
                SourceQuery::new(
                    "SELECT cu.category_id, cu.user_id, cu.notification_level FROM category_users cu",
                )
                .order_by(&["cu.category_id", "cu.user_id"]),
            )
            .total_rows_query(SourceQuery::new("SELECT COUNT(*) FROM category_users"))
            .requires_set(
                "existing",
                PreloadSource::Target,
                SourceQuery::new("SELECT category_id, user_id FROM category_users"),
            )
            .build()?;

        Ok(Self { def })
    }
}

#[async_trait]
impl Unit for CategoryUsersUnit {
    fn definition(&self) -> &UnitDefinition {
        &self.def
    }

    async fn transform(&mut self, ctx: &mut UnitContext<'_>, row: &SourceRow) -> Result<Transformed> {
        let category_id = match ForeignKey::resolve(ctx, row, "category_id", EntityType::Category)
            .await?
            .required("category_id")
        {
            Ok(id) => id,
            Err(reject) => return Ok(reject),
        };
        let user_id = match ForeignKey::resolve(ctx, row, "user_id", EntityType::User)
            .await?
            .required("user_id")
        {
            Ok(id) => id,
            Err(reject) => return Ok(reject),
        };

        if !ctx
            .preloaded_mut()
            .insert("existing", format!("{}:{}", category_id, user_id))?
        {
            return Ok(Transformed::Skip);
        }

        let level = match row.i64("notification_level")? {
            Some(level) => ctx.ensure_valid(
                "notification_level",
                level,
                &NOTIFICATION_LEVELS,
                DEFAULT_NOTIFICATION_LEVEL,
            ),
            None => DEFAULT_NOTIFICATION_LEVEL,
        };

        Ok(Transformed::Insert(NewRow::new(vec![
            category_id.into(),
            user_id.into(),
            level.into(),
        ])))
    }
}
