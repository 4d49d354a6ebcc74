//! Primary and secondary email addresses.

use async_trait::async_trait;

use crate::core::{normalize_name, EntityType, SourceQuery, SourceRow};
use crate::error::Result;
use crate::unit::{NewRow, PreloadSource, Transformed, Unit, UnitContext, UnitDefinition};

use super::{created_at, ForeignKey};

/// Migrates `users.email` as primary addresses (original id `p<user id>`)
/// and `user_emails` as secondary ones (`s<id>`).
///
/// Addresses already present in the target are mapped, not inserted again.
pub struct UserEmailsUnit {
    def: UnitDefinition,
}

impl UserEmailsUnit {
    pub fn new() -> Result<Self> {
        let def = UnitDefinition::builder("user_emails")
            .depends_on(&["users"])
            .produces(EntityType::UserEmail)
            .table("user_emails")
            .columns(&["user_id", "email", "is_primary", "created_at"])
            .rows_query(
                SourceQuery::new(concat!(
                    "SELECT e.id, e.user_id, e.email, e.is_primary, e.created_at
                     FROM (
                        SELECT 'p' || u.id AS id, u.id AS user_id, u.email AS email,
                               1 AS is_primary, u.created_at AS created_at
                        FROM users u
                        WHERE u.email IS NOT NULL AND trim(u.email) <> ''
                        UNION ALL
                        SELECT 's' || x.id, x.user_id, x.email, 0, x.created_at
                        FROM user_emails x
                     ) e
                     WHERE ",
                    unmapped!("e")
                ))
                .bind(EntityType::UserEmail.as_str())
                .order_by(&["e.is_primary DESC", "e.user_id", "e.id"]),
            )
            .requires_mapping(
                "existing",
                PreloadSource::Target,
                SourceQuery::new("SELECT lower(email), id FROM user_emails"),
            )
            .build()?;

        Ok(Self { def })
    }
}

fn is_plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.contains('@') && !email.contains(' ')
        }
        None => false,
    }
}

#[async_trait]
impl Unit for UserEmailsUnit {
    fn definition(&self) -> &UnitDefinition {
        &self.def
    }

    async fn transform(&mut self, ctx: &mut UnitContext<'_>, row: &SourceRow) -> Result<Transformed> {
        let user_id = match ForeignKey::resolve(ctx, row, "user_id", EntityType::User)
            .await?
            .required("user_id")
        {
            Ok(id) => id,
            Err(reject) => return Ok(reject),
        };

        let Some(email) = row.text("email")?.map(|e| normalize_name(&e)) else {
            return Ok(Transformed::Reject("missing email".to_string()));
        };
        if !is_plausible_email(&email) {
            return Ok(Transformed::Reject(format!("invalid email '{}'", email)));
        }
        if let Some(existing) = ctx.preloaded().get("existing", &email)? {
            return Ok(Transformed::MapExisting(existing));
        }

        Ok(Transformed::Insert(
            NewRow::new(vec![
                user_id.into(),
                email.clone().into(),
                row.bool("is_primary")?.unwrap_or(false).into(),
                created_at(row)?.into(),
            ])
            .with_natural_key(email),
        ))
    }
}
