//! Users, deduplicated by email.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::core::{normalize_name, EntityType, NameKind, SourceQuery, SourceRow};
use crate::error::Result;
use crate::unit::{
    sanitize_username, NewRow, PreloadSource, Transformed, Unit, UnitContext, UnitDefinition,
};

use super::{created_at, reserved_names};

const TRUST_LEVELS: [i64; 5] = [0, 1, 2, 3, 4];
const DEFAULT_TRUST_LEVEL: i64 = 1;

/// Creates one target user per distinct email.
///
/// A user whose email already belongs to a target user is mapped onto it, as
/// is a second snapshot user with the same email. Usernames are made unique
/// against every user and group name in the target.
pub struct UsersUnit {
    def: UnitDefinition,
    emails: HashSet<String>,
}

impl UsersUnit {
    pub fn new() -> Result<Self> {
        let def = UnitDefinition::builder("users")
            .produces(EntityType::User)
            .table("users")
            .columns(&[
                "username",
                "username_lower",
                "name",
                "trust_level",
                "admin",
                "created_at",
            ])
            .rows_query(
                SourceQuery::new(concat!(
                    "SELECT u.id, u.username, u.name, u.email, u.trust_level, u.admin, u.created_at
                     FROM users u WHERE ",
                    unmapped!("u")
                ))
                .bind(EntityType::User.as_str())
                .order_by(&["u.id"]),
            )
            .total_rows_query(
                SourceQuery::new(concat!("SELECT COUNT(*) FROM users u WHERE ", unmapped!("u")))
                    .bind(EntityType::User.as_str()),
            )
            .requires_mapping(
                "emails",
                PreloadSource::Target,
                SourceQuery::new("SELECT lower(email), user_id FROM user_emails"),
            )
            .build()?;

        Ok(Self {
            def,
            emails: HashSet::new(),
        })
    }
}

#[async_trait]
impl Unit for UsersUnit {
    fn definition(&self) -> &UnitDefinition {
        &self.def
    }

    async fn transform(&mut self, ctx: &mut UnitContext<'_>, row: &SourceRow) -> Result<Transformed> {
        let email = row.text("email")?.map(|e| normalize_name(&e));
        if let Some(email) = &email {
            if let Some(user_id) = ctx.preloaded().get("emails", email)? {
                return Ok(Transformed::MapExisting(user_id));
            }
            if self.emails.contains(email) {
                return Ok(Transformed::MapToKey(email.clone()));
            }
        }

        let original = match row.text("username")? {
            Some(username) => Some(username),
            None => row.text("name")?,
        };
        let fallback = format!("user{}", ctx.original_id().unwrap_or_default());
        let candidate = sanitize_username(original.as_deref().unwrap_or_default(), &fallback);
        let username = reserved_names(ctx).await?.lock().await.unique_name(&candidate);

        let trust_level = match row.i64("trust_level")? {
            Some(level) => ctx.ensure_valid("trust_level", level, &TRUST_LEVELS, DEFAULT_TRUST_LEVEL),
            None => DEFAULT_TRUST_LEVEL,
        };
        let name = row
            .text("name")?
            .map(|name| ctx.ensure_max_length("name", name, 255));

        let mut new_row = NewRow::new(vec![
            username.clone().into(),
            username.to_lowercase().into(),
            name.into(),
            trust_level.into(),
            row.bool("admin")?.unwrap_or(false).into(),
            created_at(row)?.into(),
        ]);
        if let Some(email) = email {
            self.emails.insert(email.clone());
            new_row = new_row.with_natural_key(email);
        }
        if let Some(original) = original {
            new_row = new_row.with_name(NameKind::Username, original, username);
        }
        Ok(Transformed::Insert(new_row))
    }
}
