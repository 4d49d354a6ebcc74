use std::sync::Arc;

use super::*;
use crate::core::{EntityType, SourceQuery};
use crate::mapping::RunStatus;
use crate::target::TargetStore;
use crate::testing::{FailingTarget, TestEnv};

const SNAPSHOT_SCHEMA: &str = include_str!("../../fixtures/snapshot_schema.sql");
const TARGET_SCHEMA: &str = include_str!("../../fixtures/target_schema.sql");

const FORUM: &str = "
    INSERT INTO users (id, username, name, email, trust_level, admin, created_at) VALUES
        (1, 'alice', 'Alice A', 'alice@example.com', 2, 1, '2020-01-01 10:00:00'),
        (2, 'bob', 'Bob', 'bob@example.com', 9, 0, '2020-01-02 10:00:00'),
        (3, NULL, 'Carol Smith', 'carol@example.com', NULL, 0, NULL),
        (4, 'bobby', 'Bob again', 'BOB@example.com', 1, 0, '2020-01-04 10:00:00');
    INSERT INTO user_emails (id, user_id, email, created_at) VALUES
        (1, 1, 'alice.alt@example.com', NULL),
        (2, 2, 'not-an-email', NULL),
        (3, 4, 'bob.work@example.com', NULL);
    INSERT INTO \"groups\" (id, name, full_name, visibility, created_at) VALUES
        (1, 'Moderators', 'Mods', 'staff', NULL),
        (2, 'alice', 'Alice fans', 'public', NULL),
        (3, 'moderators', NULL, 'nobody', NULL);
    INSERT INTO group_users (group_id, user_id, notification_level, owner) VALUES
        (1, 1, 3, 1), (1, 2, NULL, 0), (3, 4, 2, 0), (2, 99, 0, 0);
    INSERT INTO categories
        (id, name, slug, description, color, parent_category_id, user_id, position, created_at)
    VALUES
        (2, 'Sub', NULL, NULL, 'purple', 1, NULL, 1, NULL),
        (1, 'General', 'general', 'Anything', '#abc', NULL, 1, 1, NULL),
        (3, 'Other', 'general', NULL, NULL, NULL, 99, 2, NULL);
    INSERT INTO category_users (category_id, user_id, notification_level) VALUES
        (1, 1, 3), (2, 2, 9), (3, 4, 1);
    INSERT INTO tags (id, name, created_at) VALUES
        (1, 'Rust', '2019-05-01 08:00:00'), (2, 'rust ', NULL), (3, 'Async Await', NULL), (4, '??', NULL);
    INSERT INTO topics (id, title, category_id, user_id, archetype, views, closed, created_at) VALUES
        (1, 'Hello', 1, 1, 'regular', 10, 0, '2020-02-01 09:00:00'),
        (2, 'Second', 2, 2, NULL, NULL, 1, '2020-02-01 09:30:00'),
        (3, 'Lost', 99, 1, 'regular', 0, 0, NULL),
        (4, 'No category', NULL, 3, 'bogus', 1, 0, NULL);
    INSERT INTO topic_tags (topic_id, tag_id) VALUES (1, 1), (1, 2), (1, 3), (2, 4), (3, 1);
    INSERT INTO posts (id, topic_id, user_id, raw, reply_to_post_id, post_type, created_at) VALUES
        (6, 1, 4, 'answer', 2, 1, '2020-02-01 10:25:00'),
        (1, 1, 1, 'first post', NULL, 1, '2020-02-01 10:00:00'),
        (2, 1, 3, 'a reply', 1, NULL, '2020-02-01 10:05:00'),
        (3, 2, 2, 'hi', NULL, 1, '2020-02-01 10:10:00'),
        (4, 3, 1, 'lost', NULL, 1, '2020-02-01 10:15:00'),
        (5, 1, 1, '  ', NULL, 1, '2020-02-01 10:20:00');
";

const TABLES: [&str; 10] = [
    "SELECT COUNT(*) FROM users",
    "SELECT COUNT(*) FROM user_emails",
    "SELECT COUNT(*) FROM \"groups\"",
    "SELECT COUNT(*) FROM group_users",
    "SELECT COUNT(*) FROM categories",
    "SELECT COUNT(*) FROM category_users",
    "SELECT COUNT(*) FROM tags",
    "SELECT COUNT(*) FROM topics",
    "SELECT COUNT(*) FROM topic_tags",
    "SELECT COUNT(*) FROM posts",
];

async fn forum() -> TestEnv {
    TestEnv::new(&format!("{}\n{}", SNAPSHOT_SCHEMA, FORUM), TARGET_SCHEMA).await
}

async fn table_counts(env: &TestEnv) -> Vec<i64> {
    let mut counts = Vec::with_capacity(TABLES.len());
    for sql in TABLES {
        counts.push(env.count(sql).await);
    }
    counts
}

async fn target_id(env: &TestEnv, entity_type: EntityType, original_id: &str) -> i64 {
    env.mappings
        .lookup(entity_type, original_id)
        .await
        .unwrap()
        .unwrap_or_else(|| panic!("{} {} is not mapped", entity_type, original_id))
}

async fn text(env: &TestEnv, query: SourceQuery) -> String {
    let rows = env.target.query_set(&query).await.unwrap();
    assert_eq!(rows.len(), 1, "expected one value for {}", query.sql());
    rows.into_iter().next().unwrap()
}

#[tokio::test]
async fn test_categories_and_memberships() {
    let env = TestEnv::new(
        &format!(
            "{}
             INSERT INTO users (id, username, email) VALUES
                (1, 'u1', 'u1@example.com'), (2, 'u2', 'u2@example.com');
             INSERT INTO categories (id, name, parent_category_id) VALUES
                (1, 'One', NULL), (2, 'Two', NULL), (3, 'Three', 1);
             INSERT INTO category_users (category_id, user_id, notification_level) VALUES
                (1, 1, 3), (1, 2, 3), (2, 1, 1), (3, 1, 2), (3, 2, 0);",
            SNAPSHOT_SCHEMA
        ),
        TARGET_SCHEMA,
    )
    .await;
    let units: Vec<Box<dyn Unit>> = vec![
        Box::new(CategoryUsersUnit::new().unwrap()),
        Box::new(CategoriesUnit::new().unwrap()),
        Box::new(UsersUnit::new().unwrap()),
    ];

    let report = env.engine(100).run(units).await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.plan, vec!["users", "categories", "category_users"]);
    assert_eq!(report.rows_rejected, 0);
    assert_eq!(env.mappings.mapped_count(EntityType::Category).await.unwrap(), 3);
    assert_eq!(report.unit("category_users").unwrap().rows_inserted, 5);
    assert_eq!(env.count("SELECT COUNT(*) FROM category_users").await, 5);

    let parent = target_id(&env, EntityType::Category, "1").await;
    let child = target_id(&env, EntityType::Category, "3").await;
    assert_eq!(
        env.count(
            "SELECT COUNT(*) FROM categories c JOIN categories p ON c.parent_category_id = p.id
             WHERE c.name = 'Three' AND p.name = 'One'"
        )
        .await,
        1
    );
    assert_ne!(parent, child);
}

#[tokio::test]
async fn test_users_sharing_an_email_are_merged() {
    let env = TestEnv::new(
        &format!(
            "{}
             INSERT INTO users (id, username, email) VALUES
                (10, 'jane', 'jane@example.com'), (11, 'jane_doe', ' Jane@Example.com ');",
            SNAPSHOT_SCHEMA
        ),
        TARGET_SCHEMA,
    )
    .await;

    let report = env.engine(100).run(all_units().unwrap()).await.unwrap();
    assert!(report.is_success());
    let users = report.unit("users").unwrap();
    assert_eq!(users.rows_inserted, 1);
    assert_eq!(users.rows_merged, 1);
    assert_eq!(env.count("SELECT COUNT(*) FROM users").await, 1);
    assert_eq!(
        target_id(&env, EntityType::User, "10").await,
        target_id(&env, EntityType::User, "11").await
    );
    assert_eq!(env.count("SELECT COUNT(*) FROM user_emails").await, 1);
}

#[tokio::test]
async fn test_full_import() {
    let env = forum().await;
    let report = env.engine(2).run(all_units().unwrap()).await.unwrap();
    assert!(report.is_success(), "{:?}", report.failure);
    assert_eq!(report.units.len(), 10);

    let expected = [
        ("users", 3, 1, 0, 0),
        ("user_emails", 5, 1, 0, 1),
        ("groups", 2, 1, 0, 0),
        ("group_users", 2, 0, 1, 1),
        ("categories", 3, 0, 0, 0),
        ("category_users", 3, 0, 0, 0),
        ("tags", 2, 1, 0, 1),
        ("topics", 3, 0, 0, 1),
        ("topic_tags", 2, 0, 1, 2),
        ("posts", 4, 0, 0, 2),
    ];
    for (unit, inserted, merged, skipped, rejected) in expected {
        let stats = report.unit(unit).unwrap();
        assert_eq!(
            (stats.rows_inserted, stats.rows_merged, stats.rows_skipped, stats.rows_rejected),
            (inserted, merged, skipped, rejected),
            "{}",
            unit
        );
    }
    assert_eq!(report.rows_inserted, 29);
    assert_eq!(report.rows_rejected, 8);
    assert_eq!(report.rejections.len(), 8);
    let lost = report
        .rejections
        .iter()
        .find(|r| r.unit == "topics")
        .unwrap();
    assert_eq!(lost.original_id.as_deref(), Some("3"));
    assert_eq!(lost.reason, "unresolved category_id '99'");
    assert!(report
        .rejections
        .iter()
        .any(|r| r.unit == "tags" && r.reason == "unusable tag name '??'"));
    assert_eq!(table_counts(&env).await, vec![3, 5, 2, 2, 3, 3, 2, 3, 2, 4]);
}

#[tokio::test]
async fn test_full_import_values() {
    let env = forum().await;
    env.engine(100).run(all_units().unwrap()).await.unwrap();

    // Bob's second account and work address belong to the first one.
    let bob = target_id(&env, EntityType::User, "2").await;
    assert_eq!(target_id(&env, EntityType::User, "4").await, bob);
    assert_eq!(
        env.target
            .count(
                &SourceQuery::new("SELECT user_id FROM user_emails WHERE email = $1")
                    .bind("bob.work@example.com")
            )
            .await
            .unwrap(),
        bob
    );

    // Usernames and group names share one namespace.
    let carol = target_id(&env, EntityType::User, "3").await;
    assert_eq!(
        text(&env, SourceQuery::new("SELECT username FROM users WHERE id = $1").bind(carol)).await,
        "Carol_Smith"
    );
    let fans = target_id(&env, EntityType::Group, "2").await;
    assert_eq!(
        text(&env, SourceQuery::new("SELECT name FROM \"groups\" WHERE id = $1").bind(fans)).await,
        "alice1"
    );
    assert_eq!(
        target_id(&env, EntityType::Group, "3").await,
        target_id(&env, EntityType::Group, "1").await
    );
    assert_eq!(
        env.count("SELECT user_count FROM \"groups\" WHERE name = 'Moderators'").await,
        2
    );
    assert_eq!(
        env.count("SELECT visibility_level FROM \"groups\" WHERE name = 'Moderators'").await,
        3
    );

    // Sibling slugs are unique, colors normalized.
    assert_eq!(
        env.count("SELECT COUNT(*) FROM categories WHERE slug IN ('general', 'general1', 'sub')")
            .await,
        3
    );
    assert_eq!(
        env.count("SELECT COUNT(*) FROM categories WHERE name = 'General' AND color = 'AABBCC'")
            .await,
        1
    );
    assert_eq!(
        env.count("SELECT COUNT(*) FROM categories WHERE name = 'Other' AND user_id IS NULL")
            .await,
        1
    );

    // Tags collapse by normalized name.
    assert_eq!(
        target_id(&env, EntityType::Tag, "2").await,
        target_id(&env, EntityType::Tag, "1").await
    );
    assert_eq!(env.count("SELECT COUNT(*) FROM tags WHERE name = 'async-await'").await, 1);
    assert_eq!(
        env.count("SELECT COUNT(*) FROM tags WHERE name = 'rust' AND created_at = '2019-05-01T08:00:00Z'")
            .await,
        1
    );

    // Counters maintained by the after hooks.
    let general = target_id(&env, EntityType::Category, "1").await;
    assert_eq!(
        env.target
            .count(&SourceQuery::new("SELECT topic_count FROM categories WHERE id = $1").bind(general))
            .await
            .unwrap(),
        1
    );
    let hello = target_id(&env, EntityType::Topic, "1").await;
    assert_eq!(
        env.target
            .count(&SourceQuery::new("SELECT posts_count FROM topics WHERE id = $1").bind(hello))
            .await
            .unwrap(),
        3
    );
    assert_eq!(
        env.count("SELECT COUNT(*) FROM topics WHERE title = 'No category' AND archetype = 'regular'")
            .await,
        1
    );
}

const NUMBER: &str = "SELECT post_number FROM posts WHERE id = $1";
const REPLY_TO: &str = "SELECT reply_to_post_id FROM posts WHERE id = $1";

async fn post_value(env: &TestEnv, sql: &'static str, id: i64) -> i64 {
    env.target.count(&SourceQuery::new(sql).bind(id)).await.unwrap()
}

#[tokio::test]
async fn test_posts_are_numbered_and_linked() {
    let env = forum().await;
    env.engine(2).run(all_units().unwrap()).await.unwrap();

    let first = target_id(&env, EntityType::Post, "1").await;
    let reply = target_id(&env, EntityType::Post, "2").await;
    let answer = target_id(&env, EntityType::Post, "6").await;
    assert_eq!(post_value(&env, NUMBER, first).await, 1);
    assert_eq!(post_value(&env, NUMBER, reply).await, 2);
    assert_eq!(post_value(&env, NUMBER, answer).await, 3);
    assert_eq!(post_value(&env, REPLY_TO, reply).await, first);
    assert_eq!(post_value(&env, REPLY_TO, answer).await, reply);

    let second = target_id(&env, EntityType::Post, "3").await;
    assert_eq!(post_value(&env, NUMBER, second).await, 1);
}

#[tokio::test]
async fn test_second_run_changes_nothing() {
    let env = forum().await;
    let first = env.engine(3).run(all_units().unwrap()).await.unwrap();
    let counts = table_counts(&env).await;
    let mapped = env.mappings.total_mapped().await.unwrap();

    let second = env.engine(3).run(all_units().unwrap()).await.unwrap();
    assert!(second.is_success());
    assert_eq!(second.rows_inserted, 0);
    assert_eq!(table_counts(&env).await, counts);
    assert_eq!(env.mappings.total_mapped().await.unwrap(), mapped);
    // Only the rows that never map are read again.
    assert_eq!(second.rows_rejected, first.rows_rejected);
}

#[tokio::test]
async fn test_rerun_after_failure_matches_uninterrupted_run() {
    let reference = forum().await;
    reference.engine(2).run(all_units().unwrap()).await.unwrap();

    let env = forum().await;
    let failing = Arc::new(FailingTarget::new(env.target.clone(), "user_emails", 2));
    let report = env
        .engine_with_target(failing, 2)
        .run(all_units().unwrap())
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Failed);
    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.unit, "user_emails");
    assert!(failure.message.contains("connection reset"));
    assert_eq!(report.units.len(), 2);
    assert_eq!(env.count("SELECT COUNT(*) FROM user_emails").await, 2);
    assert_eq!(env.count("SELECT COUNT(*) FROM \"groups\"").await, 0);

    let rerun = env.engine(2).run(all_units().unwrap()).await.unwrap();
    assert!(rerun.is_success());
    assert_eq!(rerun.unit("users").unwrap().rows_processed, 0);
    assert_eq!(table_counts(&env).await, table_counts(&reference).await);
}

#[tokio::test]
async fn test_renamed_usernames_rewrite_mentions() {
    let env = TestEnv::new(
        &format!(
            "{}
             INSERT INTO users (id, username, email) VALUES (1, 'Alice', 'new-alice@example.com');
             INSERT INTO topics (id, title) VALUES (1, 'Welcome');
             INSERT INTO posts (id, topic_id, user_id, raw, created_at) VALUES
                (1, 1, 1, 'hello, I am @alice', '2020-01-01 10:00:00'),
                (2, 1, 1, 'write to alice@example.com or @bob', '2020-01-01 11:00:00');",
            SNAPSHOT_SCHEMA
        ),
        &format!(
            "{}
             INSERT INTO users (username, username_lower, trust_level, created_at)
             VALUES ('alice', 'alice', 1, '2019-01-01T00:00:00Z');
             INSERT INTO topics (title, archetype, views, closed, posts_count, created_at)
             VALUES ('Existing', 'regular', 0, 0, 0, '2019-01-01T00:00:00Z');",
            TARGET_SCHEMA
        ),
    )
    .await;

    let report = env.engine(100).run(all_units().unwrap()).await.unwrap();
    assert!(report.is_success());

    let alice = target_id(&env, EntityType::User, "1").await;
    assert_eq!(
        text(&env, SourceQuery::new("SELECT username FROM users WHERE id = $1").bind(alice)).await,
        "Alice1"
    );
    let hello = target_id(&env, EntityType::Post, "1").await;
    assert_eq!(
        text(&env, SourceQuery::new("SELECT raw FROM posts WHERE id = $1").bind(hello)).await,
        "hello, I am @Alice1"
    );
    let other = target_id(&env, EntityType::Post, "2").await;
    assert_eq!(
        text(&env, SourceQuery::new("SELECT raw FROM posts WHERE id = $1").bind(other)).await,
        "write to alice@example.com or @bob"
    );
}

#[tokio::test]
async fn test_existing_target_rows_are_mapped() {
    let env = TestEnv::new(
        &format!(
            "{}
             INSERT INTO users (id, username, email) VALUES (1, 'jane', 'jane@example.com');
             INSERT INTO \"groups\" (id, name) VALUES (1, 'Staff');
             INSERT INTO tags (id, name) VALUES (1, 'Rust');",
            SNAPSHOT_SCHEMA
        ),
        &format!(
            "{}
             INSERT INTO users (username, username_lower, trust_level, created_at)
             VALUES ('jane_d', 'jane_d', 2, '2019-01-01T00:00:00Z');
             INSERT INTO user_emails (user_id, email, is_primary, created_at)
             VALUES (1, 'jane@example.com', 1, '2019-01-01T00:00:00Z');
             INSERT INTO \"groups\" (name, visibility_level, created_at)
             VALUES ('staff', 3, '2019-01-01T00:00:00Z');
             INSERT INTO tags (name, created_at) VALUES ('rust', '2019-01-01T00:00:00Z');",
            TARGET_SCHEMA
        ),
    )
    .await;

    let report = env.engine(100).run(all_units().unwrap()).await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.rows_inserted, 0);
    assert_eq!(target_id(&env, EntityType::User, "1").await, 1);
    assert_eq!(target_id(&env, EntityType::UserEmail, "p1").await, 1);
    assert_eq!(target_id(&env, EntityType::Group, "1").await, 1);
    assert_eq!(target_id(&env, EntityType::Tag, "1").await, 1);
}

#[tokio::test]
async fn test_replaced_values_are_reported() {
    let env = forum().await;
    let report = env.engine(100).run(all_units().unwrap()).await.unwrap();

    assert_eq!(report.warning_count, 4);
    let fields: Vec<(&str, &str, &str)> = report
        .warnings
        .iter()
        .map(|w| (w.unit.as_str(), w.field.as_str(), w.value.as_str()))
        .collect();
    assert!(fields.contains(&("users", "trust_level", "9")));
    assert!(fields.contains(&("categories", "color", "purple")));
    assert!(fields.contains(&("category_users", "notification_level", "9")));
    assert!(fields.contains(&("topics", "archetype", "bogus")));
}

#[tokio::test]
async fn test_rerun_repairs_stale_counters() {
    let env = forum().await;
    env.engine(100).run(all_units().unwrap()).await.unwrap();
    let hello = target_id(&env, EntityType::Topic, "1").await;
    let posts_count = SourceQuery::new("SELECT posts_count FROM topics WHERE id = $1").bind(hello);
    env.target
        .exec(&SourceQuery::new("UPDATE topics SET posts_count = 99"))
        .await
        .unwrap();

    let rerun = env.engine(100).run(all_units().unwrap()).await.unwrap();
    assert_eq!(rerun.unit("posts").unwrap().rows_inserted, 0);
    assert_eq!(env.target.count(&posts_count).await.unwrap(), 3);

    env.update_snapshot(
        "INSERT INTO posts (id, topic_id, user_id, raw, post_type, created_at)
         VALUES (7, 1, 2, 'late reply', 1, '2020-02-02 10:00:00');",
    )
    .await;
    let rerun = env.engine(100).run(all_units().unwrap()).await.unwrap();
    assert_eq!(rerun.unit("posts").unwrap().rows_inserted, 1);
    assert_eq!(env.target.count(&posts_count).await.unwrap(), 4);
}

#[tokio::test]
async fn test_failed_mapping_write_is_recovered_without_duplicates() {
    let reference = forum().await;
    reference.engine(100).run(all_units().unwrap()).await.unwrap();

    let env = forum().await;
    env.update_mappings(
        "CREATE TRIGGER refuse_topic_mappings BEFORE INSERT ON ids
         WHEN NEW.entity_type = 'topic'
         BEGIN SELECT RAISE(ABORT, 'mapping write refused'); END;",
    )
    .await;
    let report = env.engine(100).run(all_units().unwrap()).await.unwrap();
    assert_eq!(report.status, RunStatus::Failed);
    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.unit, "topics");
    assert!(failure.message.contains("mapping write refused"), "{}", failure.message);
    // The rows are committed and their mappings wait in the journal.
    assert_eq!(env.count("SELECT COUNT(*) FROM topics").await, 3);
    assert_eq!(env.count("SELECT COUNT(*) FROM import_journal").await, 1);
    assert_eq!(env.mappings.mapped_count(EntityType::Topic).await.unwrap(), 0);

    env.update_mappings("DROP TRIGGER refuse_topic_mappings;").await;
    let rerun = env.engine(100).run(all_units().unwrap()).await.unwrap();
    assert!(rerun.is_success(), "{:?}", rerun.failure);
    assert_eq!(rerun.unit("topics").unwrap().rows_inserted, 0);
    assert_eq!(env.mappings.mapped_count(EntityType::Topic).await.unwrap(), 3);
    assert_eq!(env.count("SELECT COUNT(*) FROM import_journal").await, 0);
    assert_eq!(table_counts(&env).await, table_counts(&reference).await);
    assert_eq!(
        env.count("SELECT SUM(topic_count) FROM categories").await,
        reference.count("SELECT SUM(topic_count) FROM categories").await
    );
}
