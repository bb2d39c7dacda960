mod common;

use common::{context, context_with, load, state};
use relgraph::prelude::*;
use relgraph::{InvalidOperationKind, RelationshipErrorKind};

#[test]
fn navigation_then_add_fixes_up_key_and_collection() {
    let context = context();
    let blog = context.create("Blog").unwrap();
    let post = context.create("Post").unwrap();
    context.set_reference(post, "blog", Some(blog)).unwrap();
    context.add(post).unwrap();

    assert_eq!(state(&context, blog), EntityState::Added);
    assert_eq!(state(&context, post), EntityState::Added);
    assert_eq!(context.collection(blog, "posts").unwrap(), vec![post]);
    assert_eq!(
        context.value(post, "blog_id").unwrap(),
        context.value(blog, "id").unwrap()
    );
    let blog_id = context.entry(post).property("blog_id").unwrap();
    assert!(blog_id.is_temporary().unwrap());
}

#[test]
fn loads_link_by_key_in_either_order() {
    let context = context();
    let early_post = context
        .materialize("Post", &[("id", Value::BigInt(1)), ("blog_id", Value::BigInt(200))])
        .unwrap();
    assert_eq!(context.reference(early_post, "blog").unwrap(), None);

    let blog = context.materialize("Blog", &[("id", Value::BigInt(200))]).unwrap();
    let late_post = context
        .materialize("Post", &[("id", Value::BigInt(2)), ("blog_id", Value::BigInt(200))])
        .unwrap();

    assert_eq!(context.reference(early_post, "blog").unwrap(), Some(blog));
    assert_eq!(context.reference(late_post, "blog").unwrap(), Some(blog));
    assert_eq!(
        context.collection(blog, "posts").unwrap(),
        vec![early_post, late_post]
    );
    assert_eq!(context.count(EntityState::Unchanged).unwrap(), 3);
}

#[test]
fn foreign_key_to_added_principal_becomes_temporary() {
    let context = context();
    let blog = context.create("Blog").unwrap();
    context.add(blog).unwrap();
    let temporary_key = context.value(blog, "id").unwrap();

    let post = context
        .create_with("Post", &[("blog_id", temporary_key.clone())])
        .unwrap();
    context.add(post).unwrap();

    assert_eq!(context.reference(post, "blog").unwrap(), Some(blog));
    assert_eq!(context.value(post, "blog_id").unwrap(), temporary_key);
    let blog_id = context.entry(post).property("blog_id").unwrap();
    assert!(blog_id.is_temporary().unwrap());
}

#[test]
fn foreign_key_write_moves_dependent() {
    let context = context();
    let first = load(&context, "Blog", &[("id", Value::BigInt(100))]);
    let second = load(&context, "Blog", &[("id", Value::BigInt(101))]);
    let post = load(
        &context,
        "Post",
        &[("id", Value::BigInt(1)), ("blog_id", Value::BigInt(100))],
    );
    assert_eq!(context.collection(first, "posts").unwrap(), vec![post]);

    context.set_value(post, "blog_id", 101_i64).unwrap();

    assert_eq!(context.reference(post, "blog").unwrap(), Some(second));
    assert_eq!(context.collection(second, "posts").unwrap(), vec![post]);
    assert!(context.collection(first, "posts").unwrap().is_empty());
    assert_eq!(state(&context, post), EntityState::Modified);
    assert_eq!(
        context.entry(post).modified_properties().unwrap(),
        vec!["blog_id".to_string()]
    );
}

#[test]
fn navigation_write_wins_over_foreign_key_write() {
    for navigation_first in [true, false] {
        let context = context();
        let first = load(&context, "Blog", &[("id", Value::BigInt(100))]);
        let second = load(&context, "Blog", &[("id", Value::BigInt(101))]);
        let third = load(&context, "Blog", &[("id", Value::BigInt(102))]);
        let post = load(
            &context,
            "Post",
            &[("id", Value::BigInt(1)), ("blog_id", Value::BigInt(100))],
        );

        if navigation_first {
            context.set_reference(post, "blog", Some(third)).unwrap();
            context.set_value(post, "blog_id", 101_i64).unwrap();
        } else {
            context.set_value(post, "blog_id", 101_i64).unwrap();
            context.set_reference(post, "blog", Some(third)).unwrap();
        }
        context.detect_changes().unwrap();

        assert_eq!(context.value(post, "blog_id").unwrap(), Value::BigInt(102));
        assert_eq!(context.collection(third, "posts").unwrap(), vec![post]);
        assert!(context.collection(first, "posts").unwrap().is_empty());
        assert!(context.collection(second, "posts").unwrap().is_empty());
    }
}

#[test]
fn moving_between_collections_is_order_independent() {
    for remove_first in [true, false] {
        let context = context();
        let first = load(&context, "Blog", &[("id", Value::BigInt(100))]);
        let second = load(&context, "Blog", &[("id", Value::BigInt(101))]);
        let post = load(
            &context,
            "Post",
            &[("id", Value::BigInt(1)), ("blog_id", Value::BigInt(100))],
        );

        if remove_first {
            assert!(context.remove_from_collection(first, "posts", post).unwrap());
            assert!(context.add_to_collection(second, "posts", post).unwrap());
        } else {
            assert!(context.add_to_collection(second, "posts", post).unwrap());
            assert!(context.remove_from_collection(first, "posts", post).unwrap());
        }
        let changes = context.detect_changes().unwrap();
        assert!(!changes.is_empty());

        assert_eq!(state(&context, post), EntityState::Modified);
        assert_eq!(context.value(post, "blog_id").unwrap(), Value::BigInt(101));
        assert_eq!(context.reference(post, "blog").unwrap(), Some(second));
        assert!(context.collection(first, "posts").unwrap().is_empty());
        assert_eq!(context.collection(second, "posts").unwrap(), vec![post]);
    }
}

#[test]
fn detection_is_idempotent() {
    let context = context();
    let blog = load(&context, "Blog", &[("id", Value::BigInt(100))]);
    let post = load(
        &context,
        "Post",
        &[("id", Value::BigInt(1)), ("blog_id", Value::BigInt(100))],
    );
    context.set_value(post, "title", "draft").unwrap();

    let first = context.detect_changes().unwrap();
    assert_eq!(first.modified_properties.len(), 1);
    assert_eq!(first.state_changes.len(), 1);
    let second = context.detect_changes().unwrap();
    assert!(second.is_empty());
    assert_eq!(state(&context, post), EntityState::Modified);
    assert_eq!(context.collection(blog, "posts").unwrap(), vec![post]);
}

#[test]
fn conflicting_collection_claims_are_rejected() {
    let context = context_with(TrackerConfig::default().with_auto_detect_changes(false));
    let first = load(&context, "Blog", &[("id", Value::BigInt(100))]);
    let second = load(&context, "Blog", &[("id", Value::BigInt(101))]);
    let third = load(&context, "Blog", &[("id", Value::BigInt(102))]);
    let post = load(
        &context,
        "Post",
        &[("id", Value::BigInt(1)), ("blog_id", Value::BigInt(100))],
    );

    context.add_to_collection(second, "posts", post).unwrap();
    context.add_to_collection(third, "posts", post).unwrap();
    let err = context.detect_changes().unwrap_err();
    assert_eq!(
        err.relationship_kind(),
        Some(RelationshipErrorKind::AmbiguousPrincipal)
    );
    assert_eq!(err.entities(), &[post]);

    // Nothing was fixed up.
    assert_eq!(context.value(post, "blog_id").unwrap(), Value::BigInt(100));
    assert_eq!(context.reference(post, "blog").unwrap(), Some(first));
    assert_eq!(state(&context, post), EntityState::Unchanged);

    context.remove_from_collection(third, "posts", post).unwrap();
    context.detect_changes().unwrap();
    assert_eq!(context.value(post, "blog_id").unwrap(), Value::BigInt(101));
    assert_eq!(context.reference(post, "blog").unwrap(), Some(second));
    assert!(context.collection(first, "posts").unwrap().is_empty());
}

#[test]
fn navigation_to_wrong_type_is_rejected() {
    let context = context();
    let header = context.create("Header").unwrap();
    let post = context.create("Post").unwrap();
    let err = context.set_reference(post, "blog", Some(header)).unwrap_err();
    assert_eq!(
        err.invalid_operation_kind(),
        Some(InvalidOperationKind::InvalidNavigationTarget)
    );
    let err = context.add_to_collection(post, "blog", header).unwrap_err();
    assert_eq!(
        err.invalid_operation_kind(),
        Some(InvalidOperationKind::InvalidNavigationTarget)
    );
}

#[test]
fn notifications_fix_up_on_every_write() {
    let context = context_with(
        TrackerConfig::default()
            .with_change_tracking(ChangeTrackingStrategy::Notifications)
            .with_auto_detect_changes(false),
    );
    let first = load(&context, "Blog", &[("id", Value::BigInt(100))]);
    let second = load(&context, "Blog", &[("id", Value::BigInt(101))]);
    let post = load(
        &context,
        "Post",
        &[("id", Value::BigInt(1)), ("blog_id", Value::BigInt(100))],
    );

    context.set_reference(post, "blog", Some(second)).unwrap();
    assert_eq!(context.value(post, "blog_id").unwrap(), Value::BigInt(101));
    assert_eq!(context.collection(second, "posts").unwrap(), vec![post]);
    assert!(context.collection(first, "posts").unwrap().is_empty());
    assert_eq!(state(&context, post), EntityState::Modified);
}

#[test]
fn attach_order_does_not_matter() {
    for principal_first in [true, false] {
        let context = context();
        let blog = context
            .create_with("Blog", &[("id", Value::BigInt(100))])
            .unwrap();
        let post = context
            .create_with(
                "Post",
                &[("id", Value::BigInt(1)), ("blog_id", Value::BigInt(100))],
            )
            .unwrap();

        if principal_first {
            context.attach(blog).unwrap();
            context.attach(post).unwrap();
        } else {
            context.attach(post).unwrap();
            context.attach(blog).unwrap();
        }

        assert_eq!(context.reference(post, "blog").unwrap(), Some(blog));
        assert_eq!(context.collection(blog, "posts").unwrap(), vec![post]);
        assert_eq!(state(&context, blog), EntityState::Unchanged);
        assert_eq!(state(&context, post), EntityState::Unchanged);
    }
}

#[test]
fn dependent_added_before_principal_receives_generated_key() {
    let context = context();
    let blog = context.create("Blog").unwrap();
    let post = context.create("Post").unwrap();
    context.set_reference(post, "blog", Some(blog)).unwrap();
    context.add(post).unwrap();
    context.add(blog).unwrap();

    assert_eq!(context.save_changes().unwrap(), 2);
    let blog_id = context.value(blog, "id").unwrap();
    assert!(blog_id.as_i64().is_some_and(|id| id > 0));
    assert_eq!(context.value(post, "blog_id").unwrap(), blog_id);
    assert_eq!(state(&context, post), EntityState::Unchanged);
    assert_eq!(state(&context, blog), EntityState::Unchanged);
}
