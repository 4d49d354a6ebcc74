//! Units migrating a forum snapshot.
//!
//! | unit | depends on | produces |
//! |------|------------|----------|
//! | `users` | | user |
//! | `user_emails` | users | user_email |
//! | `groups` | | group |
//! | `group_users` | groups, users | |
//! | `categories` | users | category |
//! | `category_users` | categories, users | |
//! | `tags` | | tag |
//! | `topics` | categories, users | topic |
//! | `topic_tags` | topics, tags | |
//! | `posts` | topics, users | post |

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::core::{parse_timestamp, EntityType, SourceQuery, SourceRow};
use crate::error::Result;
use crate::unit::{Transformed, UniqueNameGenerator, Unit, UnitContext};

/// `NOT EXISTS` filter selecting rows of `$alias` whose `id` is not mapped to
/// the entity type bound as `$1`.
macro_rules! unmapped {
    ($alias:literal) => {
        concat!(
            "NOT EXISTS (SELECT 1 FROM mapped.ids m WHERE m.entity_type = $1 AND m.original_id = CAST(",
            $alias,
            ".id AS TEXT))"
        )
    };
}

mod categories;
mod category_users;
mod group_users;
mod groups;
mod posts;
mod tags;
mod topic_tags;
mod topics;
mod user_emails;
mod users;

pub use categories::CategoriesUnit;
pub use category_users::CategoryUsersUnit;
pub use group_users::GroupUsersUnit;
pub use groups::GroupsUnit;
pub use posts::{rewrite_mentions, PostsUnit};
pub use tags::{normalize_tag, TagsUnit};
pub use topic_tags::TopicTagsUnit;
pub use topics::TopicsUnit;
pub use user_emails::UserEmailsUnit;
pub use users::UsersUnit;

/// Shared cache entry with the usernames and group names taken in the target.
pub const RESERVED_NAMES: &str = "reserved_names";

/// Usernames and group names share this length limit.
pub const MAX_NAME_LEN: usize = 20;

/// Every unit of a forum import.
pub fn all_units() -> Result<Vec<Box<dyn Unit>>> {
    Ok(vec![
        Box::new(UsersUnit::new()?),
        Box::new(UserEmailsUnit::new()?),
        Box::new(GroupsUnit::new()?),
        Box::new(GroupUsersUnit::new()?),
        Box::new(CategoriesUnit::new()?),
        Box::new(CategoryUsersUnit::new()?),
        Box::new(TagsUnit::new()?),
        Box::new(TopicsUnit::new()?),
        Box::new(TopicTagsUnit::new()?),
        Box::new(PostsUnit::new()?),
    ])
}

/// Names already taken by users or groups, loaded once per run.
pub(crate) async fn reserved_names(
    ctx: &UnitContext<'_>,
) -> Result<Arc<Mutex<UniqueNameGenerator>>> {
    let target = ctx.target();
    ctx.cache()
        .get_or_try_init(RESERVED_NAMES, || async move {
            let mut names = UniqueNameGenerator::with_max_len(MAX_NAME_LEN);
            let users = target
                .query_set(&SourceQuery::new("SELECT username_lower FROM users"))
                .await?;
            let groups = target
                .query_set(&SourceQuery::new("SELECT lower(name) FROM \"groups\""))
                .await?;
            for name in users.iter().chain(&groups) {
                names.reserve(name);
            }
            Ok(Mutex::new(names))
        })
        .await
}

/// Creation time of a snapshot row, or now if it has none.
pub(crate) fn created_at(row: &SourceRow) -> Result<DateTime<Utc>> {
    Ok(row
        .text("created_at")?
        .as_deref()
        .and_then(parse_timestamp)
        .unwrap_or_else(Utc::now))
}

/// A foreign key column resolved through the mapping store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ForeignKey {
    /// The column is NULL.
    Absent,
    Mapped(i64),
    /// The referenced original id has no mapping.
    Unmapped(String),
}

impl ForeignKey {
    pub(crate) async fn resolve(
        ctx: &UnitContext<'_>,
        row: &SourceRow,
        column: &str,
        entity_type: EntityType,
    ) -> Result<Self> {
        let Some(original_id) = row.key(column)? else {
            return Ok(ForeignKey::Absent);
        };
        Ok(match ctx.lookup(entity_type, &original_id).await? {
            Some(id) => ForeignKey::Mapped(id),
            None => ForeignKey::Unmapped(original_id),
        })
    }

    /// Target id, treating an unmapped reference like NULL.
    pub(crate) fn optional(&self) -> Option<i64> {
        match self {
            ForeignKey::Mapped(id) => Some(*id),
            _ => None,
        }
    }

    /// Target id of a reference that must resolve, or the rejection to return.
    pub(crate) fn required(self, column: &str) -> std::result::Result<i64, Transformed> {
        match self {
            ForeignKey::Mapped(id) => Ok(id),
            ForeignKey::Absent => Err(Transformed::Reject(format!("missing {}", column))),
            ForeignKey::Unmapped(original_id) => Err(Transformed::Reject(format!(
                "unresolved {} '{}'",
                column, original_id
            ))),
        }
    }
}

#[cfg(test)]
mod tests;
