//! Group memberships.

use async_trait::async_trait;
use tracing::info;

use crate::core::{EntityType, SourceQuery, SourceRow};
use crate::error::Result;
use crate::unit::{NewRow, PreloadSource, Transformed, Unit, UnitContext, UnitDefinition};

use super::ForeignKey;

const NOTIFICATION_LEVELS: [i64; 4] = [0, 1, 2, 3];
const DEFAULT_NOTIFICATION_LEVEL: i64 = 3;

pub struct GroupUsersUnit {
    def: UnitDefinition,
}

impl GroupUsersUnit {
    pub fn new() -> Result<Self> {
        let def = UnitDefinition::builder("group_users")
            .depends_on(&["groups", "users"])
            .table("group_users")
            .columns(&["group_id", "user_id", "notification_level", "owner"])
            .rows_query(
                SourceQuery::new(
                    "SELECT gu.group_id, gu.user_id, gu.notification_level, gu.owner FROM group_users gu",
                )
                .order_by(&["gu.group_id", "gu.user_id"]),
            )
            .total_rows_query(SourceQuery::new("SELECT COUNT(*) FROM group_users"))
            .requires_set(
                "existing",
                PreloadSource::Target,
                SourceQuery::new("SELECT group_id, user_id FROM group_users"),
            )
            .build()?;

        Ok(Self { def })
    }
}

#[async_trait]
impl Unit for GroupUsersUnit {
    fn definition(&self) -> &UnitDefinition {
        &self.def
    }

    async fn transform(&mut self, ctx: &mut UnitContext<'_>, row: &SourceRow) -> Result<Transformed> {
        let group_id = match ForeignKey::resolve(ctx, row, "group_id", EntityType::Group)
            .await?
            .required("group_id")
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

        // Merged users can turn two memberships into one.
        if !ctx
            .preloaded_mut()
            .insert("existing", format!("{}:{}", group_id, user_id))?
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
            group_id.into(),
            user_id.into(),
            level.into(),
            row.bool("owner")?.unwrap_or(false).into(),
        ])))
    }

    async fn after(&mut self, ctx: &mut UnitContext<'_>, inserted: u64) -> Result<()> {
        // Recomputed even when nothing was added, so a rerun repairs the
        // counters after a run that failed before reaching this hook.
        let updated = ctx
            .target()
            .exec(&SourceQuery::new(
                "UPDATE \"groups\" SET user_count =
                    (SELECT COUNT(*) FROM group_users gu WHERE gu.group_id = \"groups\".id)",
            ))
            .await?;
        info!(
            "group_users: {} memberships added, user counts refreshed for {} groups",
            inserted, updated
        );
        Ok(())
    }
}
