mod common;

use common::{context, load, state};
use relgraph::prelude::*;
use relgraph::InvalidOperationKind;

#[test]
fn derived_entity_is_principal_of_its_own_relationships() {
    let context = context();
    let blog = load(&context, "Blog", &[("id", Value::BigInt(100))]);
    let featured = load(
        &context,
        "FeaturedPost",
        &[
            ("id", Value::BigInt(1)),
            ("blog_id", Value::BigInt(100)),
            ("rank", Value::Int(3)),
        ],
    );
    let badge = load(
        &context,
        "Badge",
        &[("id", Value::BigInt(30)), ("featured_post_id", Value::BigInt(1))],
    );

    assert_eq!(context.entity_type_of(featured).unwrap(), "FeaturedPost");
    assert_eq!(context.collection(blog, "posts").unwrap(), vec![featured]);
    assert_eq!(context.reference(badge, "featured_post").unwrap(), Some(featured));
    assert_eq!(context.collection(featured, "badges").unwrap(), vec![badge]);
    assert_eq!(
        context.find("Post", &[Value::BigInt(1)]).unwrap(),
        Some(featured)
    );
}

#[test]
fn base_entity_cannot_stand_in_for_derived_principal() {
    let context = context();
    load(&context, "Blog", &[("id", Value::BigInt(100))]);
    let post = load(
        &context,
        "Post",
        &[("id", Value::BigInt(2)), ("blog_id", Value::BigInt(100))],
    );

    let badge = context
        .materialize(
            "Badge",
            &[("id", Value::BigInt(31)), ("featured_post_id", Value::BigInt(2))],
        )
        .unwrap();
    assert_eq!(context.reference(badge, "featured_post").unwrap(), None);

    let err = context
        .set_reference(badge, "featured_post", Some(post))
        .unwrap_err();
    assert_eq!(
        err.invalid_operation_kind(),
        Some(InvalidOperationKind::InvalidNavigationTarget)
    );
}

#[test]
fn removing_derived_principal_nulls_its_dependents() {
    let context = context();
    load(&context, "Blog", &[("id", Value::BigInt(100))]);
    let featured = load(
        &context,
        "FeaturedPost",
        &[("id", Value::BigInt(1)), ("blog_id", Value::BigInt(100))],
    );
    let badge = load(
        &context,
        "Badge",
        &[("id", Value::BigInt(30)), ("featured_post_id", Value::BigInt(1))],
    );

    context.remove(featured).unwrap();
    assert_eq!(context.value(badge, "featured_post_id").unwrap(), Value::Null);
    assert_eq!(state(&context, badge), EntityState::Modified);
    assert_eq!(context.save_changes().unwrap(), 2);
    assert!(context.store().rows("FeaturedPost").is_empty());
}

#[test]
fn alternate_key_links_and_moves_dependents() {
    let context = context();
    let first = load(
        &context,
        "Blog",
        &[("id", Value::BigInt(100)), ("url", Value::from("a.example"))],
    );
    let second = load(
        &context,
        "Blog",
        &[("id", Value::BigInt(101)), ("url", Value::from("b.example"))],
    );
    let sponsor = load(
        &context,
        "Sponsor",
        &[("id", Value::BigInt(20)), ("blog_url", Value::from("a.example"))],
    );
    assert_eq!(context.collection(first, "sponsors").unwrap(), vec![sponsor]);

    context.set_value(sponsor, "blog_url", "b.example").unwrap();
    assert_eq!(context.reference(sponsor, "blog").unwrap(), Some(second));
    assert!(context.collection(first, "sponsors").unwrap().is_empty());

    context.set_reference(sponsor, "blog", Some(first)).unwrap();
    assert_eq!(
        context.value(sponsor, "blog_url").unwrap(),
        Value::from("a.example")
    );
    assert_eq!(context.save_changes().unwrap(), 0);
}

#[test]
fn alternate_key_of_saved_principal_is_immutable() {
    let context = context();
    let blog = load(
        &context,
        "Blog",
        &[("id", Value::BigInt(100)), ("url", Value::from("a.example"))],
    );
    let err = context.set_value(blog, "url", "z.example").unwrap_err();
    assert_eq!(
        err.invalid_operation_kind(),
        Some(InvalidOperationKind::KeyModified)
    );
    assert_eq!(context.value(blog, "url").unwrap(), Value::from("a.example"));
}

#[test]
fn alternate_key_change_on_added_principal_propagates() {
    let context = context();
    let blog = context
        .create_with("Blog", &[("url", Value::from("a.example"))])
        .unwrap();
    let sponsor = context.create("Sponsor").unwrap();
    context.add_to_collection(blog, "sponsors", sponsor).unwrap();
    context.add(blog).unwrap();
    assert_eq!(
        context.value(sponsor, "blog_url").unwrap(),
        Value::from("a.example")
    );

    context.set_value(blog, "url", "c.example").unwrap();
    assert_eq!(
        context.value(sponsor, "blog_url").unwrap(),
        Value::from("c.example")
    );

    assert_eq!(context.save_changes().unwrap(), 2);
    let sponsors = context.store().rows("Sponsor");
    assert_eq!(sponsors.len(), 1);
    assert_eq!(sponsors[0].get("blog_url"), Some(&Value::from("c.example")));
}

#[test]
fn composite_foreign_key_links_only_when_complete() {
    let context = context();
    let edition = load(
        &context,
        "Edition",
        &[("blog_id", Value::BigInt(100)), ("number", Value::Int(1))],
    );
    let linked = load(
        &context,
        "Article",
        &[
            ("id", Value::BigInt(40)),
            ("edition_blog_id", Value::BigInt(100)),
            ("edition_number", Value::Int(1)),
        ],
    );
    let partial = load(
        &context,
        "Article",
        &[
            ("id", Value::BigInt(41)),
            ("edition_blog_id", Value::BigInt(100)),
            ("edition_number", Value::Null),
        ],
    );

    assert_eq!(context.reference(linked, "edition").unwrap(), Some(edition));
    assert_eq!(context.reference(partial, "edition").unwrap(), None);

    context.set_value(partial, "edition_number", 1_i32).unwrap();
    context.set_value(linked, "edition_number", Value::Null).unwrap();
    context.detect_changes().unwrap();

    assert_eq!(context.reference(partial, "edition").unwrap(), Some(edition));
    assert_eq!(context.reference(linked, "edition").unwrap(), None);
    assert_eq!(context.collection(edition, "articles").unwrap(), vec![partial]);
}

#[test]
fn composite_key_is_copied_from_navigation() {
    let context = context();
    let edition = load(
        &context,
        "Edition",
        &[("blog_id", Value::BigInt(100)), ("number", Value::Int(2))],
    );
    let article = context.create("Article").unwrap();
    context.add_to_collection(edition, "articles", article).unwrap();

    assert_eq!(state(&context, article), EntityState::Added);
    assert_eq!(
        context.value(article, "edition_blog_id").unwrap(),
        Value::BigInt(100)
    );
    assert_eq!(context.value(article, "edition_number").unwrap(), Value::Int(2));
    assert_eq!(context.save_changes().unwrap(), 1);
}
