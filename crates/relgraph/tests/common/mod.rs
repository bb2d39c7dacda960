#![allow(dead_code)]

use relgraph::prelude::*;
use relgraph::StoreError;

/// Blogging model shared by the integration tests.
///
/// - `Blog` 1:N `Post` (required, cascade), `Post` 1:N `Comment` (required, restrict)
/// - `Blog` 1:1 `Header` (optional), `Blog` 1:1 `BlogSettings` (required, key is the FK)
/// - `Blog.url` 1:N `Sponsor.blog_url` (alternate key, set null)
/// - `FeaturedPost` derives from `Post`; `FeaturedPost` 1:N `Badge` (optional, set null)
/// - `Edition (blog_id, number)` 1:N `Article` (composite, optional)
/// - `Blog` 1:N `Subscriber` (required, no action: the store decides)
pub fn model() -> Arc<Model> {
    let model = Model::builder()
        .entity(
            EntityTypeDef::new("Blog")
                .property(PropertyDef::new("id", ValueKind::BigInt).generated_on_add())
                .property(PropertyDef::new("name", ValueKind::Text).nullable())
                .property(PropertyDef::new("url", ValueKind::Text).nullable())
                .primary_key(&["id"]),
        )
        .entity(
            EntityTypeDef::new("Post")
                .property(PropertyDef::new("id", ValueKind::BigInt).generated_on_add())
                .property(PropertyDef::new("blog_id", ValueKind::BigInt))
                .property(PropertyDef::new("title", ValueKind::Text).nullable())
                .primary_key(&["id"]),
        )
        .entity(
            EntityTypeDef::new("FeaturedPost")
                .derives_from("Post")
                .property(PropertyDef::new("rank", ValueKind::Int).nullable()),
        )
        .entity(
            EntityTypeDef::new("Comment")
                .property(PropertyDef::new("id", ValueKind::BigInt).generated_on_add())
                .property(PropertyDef::new("post_id", ValueKind::BigInt))
                .property(PropertyDef::new("body", ValueKind::Text).nullable())
                .primary_key(&["id"]),
        )
        .entity(
            EntityTypeDef::new("Header")
                .property(PropertyDef::new("id", ValueKind::BigInt).generated_on_add())
                .property(PropertyDef::new("blog_id", ValueKind::BigInt).nullable())
                .primary_key(&["id"]),
        )
        .entity(
            EntityTypeDef::new("BlogSettings")
                .property(PropertyDef::new("blog_id", ValueKind::BigInt))
                .property(PropertyDef::new("theme", ValueKind::Text).nullable())
                .primary_key(&["blog_id"]),
        )
        .entity(
            EntityTypeDef::new("Sponsor")
                .property(PropertyDef::new("id", ValueKind::BigInt).generated_on_add())
                .property(PropertyDef::new("blog_url", ValueKind::Text).nullable())
                .primary_key(&["id"]),
        )
        .entity(
            EntityTypeDef::new("Badge")
                .property(PropertyDef::new("id", ValueKind::BigInt).generated_on_add())
                .property(PropertyDef::new("featured_post_id", ValueKind::BigInt).nullable())
                .primary_key(&["id"]),
        )
        .entity(
            EntityTypeDef::new("Subscriber")
                .property(PropertyDef::new("id", ValueKind::BigInt).generated_on_add())
                .property(PropertyDef::new("blog_id", ValueKind::BigInt))
                .primary_key(&["id"]),
        )
        .entity(
            EntityTypeDef::new("Edition")
                .property(PropertyDef::new("blog_id", ValueKind::BigInt))
                .property(PropertyDef::new("number", ValueKind::Int))
                .primary_key(&["blog_id", "number"]),
        )
        .entity(
            EntityTypeDef::new("Article")
                .property(PropertyDef::new("id", ValueKind::BigInt).generated_on_add())
                .property(PropertyDef::new("edition_blog_id", ValueKind::BigInt).nullable())
                .property(PropertyDef::new("edition_number", ValueKind::Int).nullable())
                .primary_key(&["id"]),
        )
        .relationship(
            RelationshipDef::one_to_many("Blog", "Post")
                .foreign_key(&["blog_id"])
                .principal_navigation("posts")
                .dependent_navigation("blog"),
        )
        .relationship(
            RelationshipDef::one_to_many("Post", "Comment")
                .foreign_key(&["post_id"])
                .principal_navigation("comments")
                .dependent_navigation("post")
                .on_delete(DeleteBehavior::Restrict),
        )
        .relationship(
            RelationshipDef::one_to_one("Blog", "Header")
                .foreign_key(&["blog_id"])
                .principal_navigation("header")
                .dependent_navigation("blog"),
        )
        .relationship(
            RelationshipDef::one_to_one("Blog", "BlogSettings")
                .foreign_key(&["blog_id"])
                .principal_navigation("settings")
                .dependent_navigation("blog"),
        )
        .relationship(
            RelationshipDef::one_to_many("Blog", "Sponsor")
                .foreign_key(&["blog_url"])
                .principal_key(&["url"])
                .principal_navigation("sponsors")
                .dependent_navigation("blog")
                .on_delete(DeleteBehavior::SetNull),
        )
        .relationship(
            RelationshipDef::one_to_many("FeaturedPost", "Badge")
                .foreign_key(&["featured_post_id"])
                .principal_navigation("badges")
                .dependent_navigation("featured_post")
                .on_delete(DeleteBehavior::SetNull),
        )
        .relationship(
            RelationshipDef::one_to_many("Blog", "Subscriber")
                .foreign_key(&["blog_id"])
                .principal_navigation("subscribers")
                .dependent_navigation("blog")
                .on_delete(DeleteBehavior::NoAction),
        )
        .relationship(
            RelationshipDef::one_to_many("Edition", "Article")
                .foreign_key(&["edition_blog_id", "edition_number"])
                .principal_navigation("articles")
                .dependent_navigation("edition"),
        )
        .build()
        .expect("build blogging model");
    Arc::new(model)
}

pub fn context() -> TrackingContext<InMemoryStore> {
    context_with(TrackerConfig::default())
}

pub fn context_with(config: TrackerConfig) -> TrackingContext<InMemoryStore> {
    let model = model();
    TrackingContext::with_config(Arc::clone(&model), InMemoryStore::new(model), config)
}

/// Seed a row in the store and materialize it as an `Unchanged` entity.
pub fn load(
    context: &TrackingContext<InMemoryStore>,
    type_name: &str,
    values: &[(&str, Value)],
) -> EntityId {
    seed(context, type_name, values).expect("seed row");
    context
        .materialize(type_name, values)
        .expect("materialize row")
}

pub fn seed(
    context: &TrackingContext<InMemoryStore>,
    type_name: &str,
    values: &[(&str, Value)],
) -> std::result::Result<(), StoreError> {
    context.store().seed(type_name, values)
}

pub fn state(context: &TrackingContext<InMemoryStore>, entity: EntityId) -> EntityState {
    context.entry(entity).state().expect("entity state")
}

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}
