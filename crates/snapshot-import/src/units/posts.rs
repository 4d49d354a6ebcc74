//! Posts, numbered per topic.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::info;

use crate::core::{normalize_name, EntityType, NameKind, SourceQuery, SourceRow};
use crate::error::Result;
use crate::unit::{NewRow, PreloadSource, Transformed, Unit, UnitContext, UnitDefinition};

use super::{created_at, ForeignKey};

/// regular, moderator action, small action, whisper
const POST_TYPES: [i64; 4] = [1, 2, 3, 4];
const DEFAULT_POST_TYPE: i64 = 1;

/// Creates posts in creation order so that replies follow the post they
/// answer.
///
/// Post numbers continue after the highest number already used in the
/// target topic. Mentions of users whose username changed during the import
/// are rewritten.
pub struct PostsUnit {
    def: UnitDefinition,
    /// Highest post number handed out per target topic.
    last_numbers: HashMap<i64, i64>,
    renamed: Option<HashMap<String, String>>,
}

impl PostsUnit {
    pub fn new() -> Result<Self> {
        let def = UnitDefinition::builder("posts")
            .depends_on(&["topics", "users"])
            .produces(EntityType::Post)
            .table("posts")
            .columns(&[
                "topic_id",
                "user_id",
                "post_number",
                "raw",
                "reply_to_post_id",
                "post_type",
                "created_at",
            ])
            .rows_query(
                SourceQuery::new(concat!(
                    "SELECT p.id, p.topic_id, p.user_id, p.raw, p.reply_to_post_id, p.post_type,
                            p.created_at
                     FROM posts p WHERE ",
                    unmapped!("p")
                ))
                .bind(EntityType::Post.as_str())
                .order_by(&["p.created_at", "p.id"]),
            )
            .total_rows_query(
                SourceQuery::new(concat!("SELECT COUNT(*) FROM posts p WHERE ", unmapped!("p")))
                    .bind(EntityType::Post.as_str()),
            )
            .requires_mapping(
                "post_numbers",
                PreloadSource::Target,
                SourceQuery::new("SELECT topic_id, MAX(post_number) FROM posts GROUP BY topic_id"),
            )
            .self_reference("reply_to_post_id")
            .build()?;

        Ok(Self {
            def,
            last_numbers: HashMap::new(),
            renamed: None,
        })
    }

    fn next_post_number(&mut self, ctx: &UnitContext<'_>, topic_id: i64) -> Result<i64> {
        let last = match self.last_numbers.get(&topic_id) {
            Some(&last) => last,
            None => ctx
                .preloaded()
                .get("post_numbers", &topic_id.to_string())?
                .unwrap_or(0),
        };
        self.last_numbers.insert(topic_id, last + 1);
        Ok(last + 1)
    }
}

fn is_mention_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '.' | '-')
}

/// Replace `@name` mentions whose (normalized) name appears in `renamed`.
///
/// A mention must start the text or follow a character that cannot be part
/// of a name, so email addresses are left alone.
pub fn rewrite_mentions(raw: &str, renamed: &HashMap<String, String>) -> String {
    if renamed.is_empty() || !raw.contains('@') {
        return raw.to_string();
    }

    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    let mut prev: Option<char> = None;
    while let Some(at) = rest.find('@') {
        let (before, after) = rest.split_at(at);
        out.push_str(before);
        if let Some(c) = before.chars().next_back() {
            prev = Some(c);
        }
        let after = &after[1..];

        let len = after
            .char_indices()
            .find(|(_, c)| !is_mention_char(*c))
            .map(|(i, _)| i)
            .unwrap_or(after.len());
        // Trailing punctuation ends a sentence, not a name.
        let name = after[..len].trim_end_matches(['.', '-']);

        out.push('@');
        match renamed.get(&normalize_name(name)) {
            Some(target) if !name.is_empty() && !prev.is_some_and(is_mention_char) => {
                out.push_str(target);
                rest = &after[name.len()..];
            }
            _ => {
                out.push_str(name);
                rest = &after[name.len()..];
            }
        }
        prev = name.chars().next_back().or(Some('@'));
    }
    out.push_str(rest);
    out
}

#[async_trait]
impl Unit for PostsUnit {
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
        let Some(raw) = row.text("raw")? else {
            return Ok(Transformed::Reject("empty post".to_string()));
        };
        let user_id = ForeignKey::resolve(ctx, row, "user_id", EntityType::User)
            .await?
            .optional();

        if self.renamed.is_none() {
            self.renamed = Some(ctx.mappings().renamed_names(NameKind::Username).await?);
        }
        let raw = match &self.renamed {
            Some(renamed) => rewrite_mentions(&raw, renamed),
            None => raw,
        };

        let post_type = match row.i64("post_type")? {
            Some(post_type) => ctx.ensure_valid("post_type", post_type, &POST_TYPES, DEFAULT_POST_TYPE),
            None => DEFAULT_POST_TYPE,
        };
        let post_number = self.next_post_number(ctx, topic_id)?;

        Ok(Transformed::Insert(NewRow::new(vec![
            topic_id.into(),
            user_id.into(),
            post_number.into(),
            raw.into(),
            ctx.self_reference().into(),
            post_type.into(),
            created_at(row)?.into(),
        ])))
    }

    async fn after(&mut self, ctx: &mut UnitContext<'_>, inserted: u64) -> Result<()> {
        // Recomputed even when nothing was added, so a rerun repairs the
        // counters after a run that failed before reaching this hook.
        let updated = ctx
            .target()
            .exec(&SourceQuery::new(
                "UPDATE topics SET posts_count =
                    (SELECT COUNT(*) FROM posts p WHERE p.topic_id = topics.id)",
            ))
            .await?;
        info!(
            "posts: {} posts added, post counts refreshed for {} topics",
            inserted, updated
        );
        Ok(())
    }
}
