//! Groups.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::core::{normalize_name, EntityType, NameKind, SourceQuery, SourceRow};
use crate::error::Result;
use crate::unit::{
    sanitize_username, NewRow, PreloadSource, Transformed, Unit, UnitContext, UnitDefinition,
};

use super::{created_at, reserved_names};

/// Visibility names in level order.
const VISIBILITIES: [&str; 5] = ["public", "logged_on_users", "members", "staff", "owners"];

/// Creates groups, mapping those whose name already exists in the target.
///
/// Group names live in the same namespace as usernames.
pub struct GroupsUnit {
    def: UnitDefinition,
    names: HashSet<String>,
}

impl GroupsUnit {
    pub fn new() -> Result<Self> {
        let def = UnitDefinition::builder("groups")
            .produces(EntityType::Group)
            .table("groups")
            .columns(&["name", "full_name", "visibility_level", "created_at"])
            .rows_query(
                SourceQuery::new(concat!(
                    "SELECT g.id, g.name, g.full_name, g.visibility, g.created_at
                     FROM \"groups\" g WHERE ",
                    unmapped!("g")
                ))
                .bind(EntityType::Group.as_str())
                .order_by(&["g.id"]),
            )
            .total_rows_query(
                SourceQuery::new(concat!("SELECT COUNT(*) FROM \"groups\" g WHERE ", unmapped!("g")))
                    .bind(EntityType::Group.as_str()),
            )
            .requires_mapping(
                "existing",
                PreloadSource::Target,
                SourceQuery::new("SELECT lower(name), id FROM \"groups\""),
            )
            .build()?;

        Ok(Self {
            def,
            names: HashSet::new(),
        })
    }
}

#[async_trait]
impl Unit for GroupsUnit {
    fn definition(&self) -> &UnitDefinition {
        &self.def
    }

    async fn transform(&mut self, ctx: &mut UnitContext<'_>, row: &SourceRow) -> Result<Transformed> {
        let Some(original) = row.text("name")? else {
            return Ok(Transformed::Reject("missing group name".to_string()));
        };
        let key = normalize_name(&original);
        if let Some(existing) = ctx.preloaded().get("existing", &key)? {
            return Ok(Transformed::MapExisting(existing));
        }
        if self.names.contains(&key) {
            return Ok(Transformed::MapToKey(key));
        }

        let candidate = sanitize_username(&original, "group");
        let name = reserved_names(ctx).await?.lock().await.unique_name(&candidate);

        let visibility = row
            .text("visibility")?
            .map(|v| v.to_lowercase())
            .unwrap_or_else(|| VISIBILITIES[0].to_string());
        let visibility = ctx.ensure_valid(
            "visibility",
            visibility.as_str(),
            &VISIBILITIES,
            VISIBILITIES[0],
        );
        let level = VISIBILITIES
            .iter()
            .position(|v| *v == visibility)
            .unwrap_or_default() as i64;

        let full_name = row
            .text("full_name")?
            .map(|n| ctx.ensure_max_length("full_name", n, 100));

        self.names.insert(key.clone());
        Ok(Transformed::Insert(
            NewRow::new(vec![
                name.clone().into(),
                full_name.into(),
                level.into(),
                created_at(row)?.into(),
            ])
            .with_natural_key(key)
            .with_name(NameKind::GroupName, original, name),
        ))
    }
}
