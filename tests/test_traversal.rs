//! Planner-level tests: graph construction and traversal ordering against
//! the documented scenarios, without touching any store.

use pretty_assertions::assert_eq;

use shroud::graph::config::{Collection, Field, FieldAddress, RefDirection};
use shroud::{CollectionAddress, Dataset, DatasetGraph, Engine, EngineError, FieldValue, SeedSnapshot, Traversal};

fn users_orders_datasets() -> Vec<Dataset> {
    vec![Dataset {
        name: "app".into(),
        connection_key: "sqlite_main".into(),
        collections: vec![
            Collection {
                name: "users".into(),
                fields: vec![
                    Field::new("id").with_primary_key(),
                    Field::new("email")
                        .with_identity("email")
                        .with_category("contact.email"),
                ],
            },
            Collection {
                name: "orders".into(),
                fields: vec![
                    Field::new("id").with_primary_key(),
                    Field::new("user_email").with_reference(
                        FieldAddress::new("app", "users", "email"),
                        RefDirection::From,
                    ),
                ],
            },
        ],
    }]
}

fn email_seed() -> SeedSnapshot {
    SeedSnapshot::from([(
        "email".to_string(),
        Some(FieldValue::from("x@example.com")),
    )])
}

#[test]
fn test_seeded_order_is_users_then_orders() {
    let graph = DatasetGraph::new(users_orders_datasets()).unwrap();
    let traversal = Traversal::plan(&graph, &email_seed()).unwrap();
    assert_eq!(
        traversal.order,
        vec![
            CollectionAddress::new("app", "users"),
            CollectionAddress::new("app", "orders"),
        ]
    );
}

#[test]
fn test_mutual_references_fail_with_cycle() {
    let datasets = vec![Dataset {
        name: "shop".into(),
        connection_key: "sqlite_main".into(),
        collections: vec![
            Collection {
                name: "entry".into(),
                fields: vec![
                    Field::new("email").with_identity("email"),
                    Field::new("order_ref").with_reference(
                        FieldAddress::new("shop", "orders", "id"),
                        RefDirection::To,
                    ),
                ],
            },
            Collection {
                name: "orders".into(),
                fields: vec![Field::new("id").with_reference(
                    FieldAddress::new("shop", "customers", "order_id"),
                    RefDirection::To,
                )],
            },
            Collection {
                name: "customers".into(),
                fields: vec![Field::new("order_id").with_reference(
                    FieldAddress::new("shop", "orders", "id"),
                    RefDirection::To,
                )],
            },
        ],
    }];
    let graph = DatasetGraph::new(datasets).unwrap();
    let err = Traversal::plan(&graph, &email_seed()).unwrap_err();
    match err {
        EngineError::CycleDetected { nodes } => {
            assert!(
                nodes.contains(&CollectionAddress::new("shop", "orders"))
                    || nodes.contains(&CollectionAddress::new("shop", "customers"))
            );
        }
        other => panic!("expected cycle error, got {other:?}"),
    }
}

#[test]
fn test_every_reachable_node_visited_exactly_once() {
    // diamond: users feeds orders and payments, both feed shipments
    let mut datasets = users_orders_datasets();
    datasets[0].collections.push(Collection {
        name: "payments".into(),
        fields: vec![Field::new("payer_email").with_reference(
            FieldAddress::new("app", "users", "email"),
            RefDirection::From,
        )],
    });
    datasets[0].collections.push(Collection {
        name: "shipments".into(),
        fields: vec![
            Field::new("order_id").with_reference(
                FieldAddress::new("app", "orders", "id"),
                RefDirection::From,
            ),
            Field::new("payment_ref").with_reference(
                FieldAddress::new("app", "payments", "payer_email"),
                RefDirection::From,
            ),
        ],
    });
    let graph = DatasetGraph::new(datasets).unwrap();
    let traversal = Traversal::plan(&graph, &email_seed()).unwrap();

    assert_eq!(traversal.order.len(), graph.node_count());
    let mut seen = std::collections::HashSet::new();
    for address in &traversal.order {
        assert!(seen.insert(address.clone()), "{} visited twice", address);
    }
    // shipments has to come after both of its upstreams
    let position: std::collections::HashMap<_, _> = traversal
        .order
        .iter()
        .enumerate()
        .map(|(i, a)| (a.clone(), i))
        .collect();
    let shipments = position[&CollectionAddress::new("app", "shipments")];
    assert!(position[&CollectionAddress::new("app", "orders")] < shipments);
    assert!(position[&CollectionAddress::new("app", "payments")] < shipments);
}

#[test]
fn test_validate_reports_traversable() {
    let details = Engine::validate(&users_orders_datasets(), "sqlite_main");
    assert!(details.traversable);
    assert_eq!(details.message, None);
}

#[test]
fn test_validate_names_missing_reference_target() {
    let mut datasets = users_orders_datasets();
    datasets[0].collections[1].fields[1].references[0].target =
        FieldAddress::new("app", "ghosts", "email");
    let details = Engine::validate(&datasets, "sqlite_main");
    assert!(!details.traversable);
    let message = details.message.unwrap();
    assert!(message.contains("app:ghosts.email"));
    assert!(message.contains("app:orders"));
}

#[test]
fn test_validate_is_repeatable() {
    let mut datasets = users_orders_datasets();
    datasets[0].collections.push(Collection {
        name: "island".into(),
        fields: vec![Field::new("value")],
    });
    for _ in 0..3 {
        let details = Engine::validate(&datasets, "sqlite_main");
        assert!(!details.traversable);
        assert!(details.message.as_deref().unwrap().contains("app:island"));
    }
}
