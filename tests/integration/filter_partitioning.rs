//! Filter partitioning properties.
//!
//! Conjunctions of fragments over root properties, single-valued navigations
//! and one collection-valued navigation must land one fragment per bucket
//! entry, each in the bucket of the entity it is evaluated against.

#![allow(missing_docs)]

mod common;

use proptest::prelude::*;

use odata_query::protocol::Dialect;
use odata_query::query::{analyze::process_filter, EntityFilters, ExpressionAnalyzer, Expr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reach {
    Root,
    SingleValued,
    CollectionValued,
}

fn fragment(reach: Reach, value: i32) -> Expr {
    match reach {
        Reach::Root => Expr::reference("Freight").gt(value),
        Reach::SingleValued => Expr::reference("Customer/CompanyName").eq(format!("C{value}")),
        Reach::CollectionValued => Expr::reference("OrderDetails/Quantity").gt(value),
    }
}

fn arb_reach() -> impl Strategy<Value = Reach> {
    prop_oneof![
        Just(Reach::Root),
        Just(Reach::SingleValued),
        Just(Reach::CollectionValued),
    ]
}

fn conjunction(atoms: &[(Reach, i32)]) -> Expr {
    let mut iter = atoms.iter().map(|(reach, value)| fragment(*reach, *value));
    let first = iter.next().expect("at least one atom");
    iter.fold(first, |acc, next| acc & next)
}

fn total(buckets: &EntityFilters) -> usize {
    buckets.values().map(Vec::len).sum()
}

proptest! {
    #[test]
    fn every_fragment_lands_in_exactly_one_bucket(
        atoms in prop::collection::vec((arb_reach(), 0i32..1000), 1..12)
    ) {
        let model = common::northwind("4.0");
        let filter = conjunction(&atoms);
        for dialect in [Dialect::Legacy, Dialect::Modern] {
            let buckets = process_filter(&filter, "Orders", &model, dialect).unwrap();
            prop_assert_eq!(total(&buckets), atoms.len());

            let on_root = atoms.iter().filter(|(reach, _)| *reach != Reach::CollectionValued).count();
            let on_details = atoms.len() - on_root;
            prop_assert_eq!(buckets.get("Orders").map_or(0, Vec::len), on_root);
            prop_assert_eq!(buckets.get("OrderDetails").map_or(0, Vec::len), on_details);

            let expected_ref = match dialect {
                Dialect::Legacy => "OrderDetails/Quantity",
                Dialect::Modern => "Quantity",
            };
            for fragment in buckets.get("OrderDetails").into_iter().flatten() {
                let Expr::Binary { left, .. } = fragment else {
                    panic!("comparison expected, got {fragment:?}");
                };
                prop_assert_eq!(left.as_reference(), Some(expected_ref));
            }
        }
    }

    #[test]
    fn fragments_keep_conjunct_order_within_a_bucket(
        values in prop::collection::vec(0i32..1000, 1..8)
    ) {
        let model = common::northwind("4.0");
        let atoms: Vec<(Reach, i32)> = values.iter().map(|v| (Reach::Root, *v)).collect();
        let buckets = process_filter(&conjunction(&atoms), "Orders", &model, Dialect::Modern).unwrap();
        let expected: Vec<Expr> = values.iter().map(|v| fragment(Reach::Root, *v)).collect();
        prop_assert_eq!(&buckets["Orders"], &expected);
    }

    #[test]
    fn mixed_disjunction_falls_back_to_root(value in 0i32..1000) {
        let model = common::northwind("4.0");
        let filter = fragment(Reach::Root, value) | fragment(Reach::CollectionValued, value);
        let buckets = process_filter(&filter, "Orders", &model, Dialect::Modern).unwrap();
        prop_assert_eq!(buckets.len(), 1);
        prop_assert_eq!(&buckets["Orders"], &vec![filter.clone()]);

        let strict = ExpressionAnalyzer::new(&model, Dialect::Modern).strict_targets(true);
        let err = strict.process_filter(&filter, "Orders").unwrap_err();
        prop_assert_eq!(err.code(), "AmbiguousTarget");
    }
}

#[test]
fn lambda_range_variable_contributes_no_entity() {
    let model = common::northwind("4.0");
    let filter = Expr::any("OrderDetails", "d", Expr::reference("d/Quantity").gt(50))
        & Expr::reference("Freight").lt(10);
    let buckets = process_filter(&filter, "Orders", &model, Dialect::Modern).unwrap();
    assert_eq!(buckets["Orders"], vec![Expr::reference("Freight").lt(10)]);
    assert_eq!(buckets["OrderDetails"].len(), 1);
    assert!(buckets["OrderDetails"][0].as_lambda().is_some());
}

#[test]
fn unknown_root_is_reported() {
    let model = common::northwind("4.0");
    let err = process_filter(&Expr::reference("X").eq(1), "Widgets", &model, Dialect::Modern)
        .unwrap_err();
    assert_eq!(err.code(), "UnknownEntity");
}
