//! End-to-end compilation of fluent commands against both protocol families.

#![allow(missing_docs)]

mod common;

use std::sync::Arc;

use odata_query::protocol::{
    create_adapter, AdapterOptions, HttpMethod, ProtocolAdapter, ProtocolVersion,
};
use odata_query::query::{
    command::{BatchEntries, Entry},
    CommandBuilder, Expr, NavigationResolver, Value,
};

fn adapter(version: ProtocolVersion, options: AdapterOptions) -> Arc<dyn ProtocolAdapter> {
    let resolver: Arc<dyn NavigationResolver> = Arc::new(common::northwind(version.as_str()));
    create_adapter(None, version, resolver, &options).unwrap()
}

fn modern() -> Arc<dyn ProtocolAdapter> {
    adapter(ProtocolVersion::V4, AdapterOptions::default())
}

fn legacy() -> Arc<dyn ProtocolAdapter> {
    adapter(ProtocolVersion::V3, AdapterOptions::default())
}

#[test]
fn single_valued_navigation_filter_stays_on_root() {
    let command = CommandBuilder::new()
        .collection("Products")
        .filter(Expr::reference("Category/Name").eq("Beverages") & Expr::reference("Price").gt(10))
        .build()
        .unwrap();
    for adapter in [modern(), legacy()] {
        let request = adapter.compile(&command).unwrap();
        assert_eq!(
            request.relative_uri(),
            "Products?$filter=Category/Name eq 'Beverages' and Price gt 10"
        );
    }
}

#[test]
fn collection_filter_nests_only_when_expanded_on_modern() {
    let plain = CommandBuilder::new()
        .collection("Orders")
        .filter(Expr::reference("OrderDetails/Quantity").gt(50))
        .build()
        .unwrap();
    assert_eq!(
        modern().compile(&plain).unwrap().relative_uri(),
        "Orders?$filter=OrderDetails/any(x:x/Quantity gt 50)"
    );
    assert_eq!(
        legacy().compile(&plain).unwrap().relative_uri(),
        "Orders?$filter=OrderDetails/any(x:x/Quantity gt 50)"
    );

    let expanded = CommandBuilder::new()
        .collection("Orders")
        .expand("OrderDetails")
        .filter(Expr::reference("OrderDetails/Quantity").gt(50))
        .build()
        .unwrap();
    assert_eq!(
        modern().compile(&expanded).unwrap().relative_uri(),
        "Orders?$expand=OrderDetails($filter=Quantity gt 50)"
    );
    assert_eq!(
        legacy().compile(&expanded).unwrap().relative_uri(),
        "Orders?$filter=OrderDetails/any(x:x/Quantity gt 50)&$expand=OrderDetails"
    );
}

#[test]
fn compound_text_filter_on_related_collection_stays_scoped() {
    let mut command = CommandBuilder::new()
        .collection("Orders")
        .expand("OrderDetails")
        .build()
        .unwrap();
    command.set_filter(
        "OrderDetails",
        "OrderDetails/Quantity gt 5 and OrderDetails/Discount gt 0",
    );
    assert_eq!(
        legacy().compile(&command).unwrap().relative_uri(),
        "Orders?$filter=OrderDetails/any(OrderDetails:OrderDetails/Quantity gt 5 \
         and OrderDetails/Discount gt 0)&$expand=OrderDetails"
    );
    assert_eq!(
        modern().compile(&command).unwrap().relative_uri(),
        "Orders?$expand=OrderDetails($filter=Quantity gt 5 and Discount gt 0)"
    );

    let mut plain = CommandBuilder::new().collection("Orders").build().unwrap();
    plain.set_filter(
        "OrderDetails",
        "OrderDetails/Quantity gt 5 or OrderDetails/Discount gt 0",
    );
    assert_eq!(
        modern().compile(&plain).unwrap().relative_uri(),
        "Orders?$filter=OrderDetails/any(OrderDetails:OrderDetails/Quantity gt 5 \
         or OrderDetails/Discount gt 0)"
    );
}

#[test]
fn clause_order_is_independent_of_call_order() {
    let first = CommandBuilder::new()
        .collection("Products")
        .filter(Expr::reference("Price").gt(10))
        .expand("Category")
        .select(["ProductName", "Price"])
        .order_by("ProductName")
        .skip(20)
        .top(10)
        .include_count()
        .build()
        .unwrap();
    let second = CommandBuilder::new()
        .collection("Products")
        .include_count()
        .top(10)
        .skip(20)
        .order_by("ProductName")
        .select(["ProductName", "Price"])
        .expand("Category")
        .filter(Expr::reference("Price").gt(10))
        .build()
        .unwrap();
    for adapter in [modern(), legacy()] {
        let a = adapter.compile(&first).unwrap();
        let b = adapter.compile(&second).unwrap();
        assert_eq!(a.query_string(), b.query_string());
    }
    assert_eq!(
        modern().compile(&first).unwrap().query_string(),
        "$filter=Price gt 10&$expand=Category&$select=ProductName,Price&$orderby=ProductName&$skip=20&$top=10&$count=true"
    );
    assert_eq!(
        legacy().compile(&first).unwrap().query_string(),
        "$filter=Price gt 10&$expand=Category&$select=ProductName,Price&$orderby=ProductName&$skip=20&$top=10&$inlinecount=allpages"
    );
}

#[test]
fn composite_positional_keys_use_key_names() {
    let command = CommandBuilder::new()
        .collection("OrderDetails")
        .key([10248, 11])
        .build()
        .unwrap();
    let request = modern().compile(&command).unwrap();
    assert_eq!(request.path, "OrderDetails(OrderID=10248,ProductID=11)");

    let short = CommandBuilder::new()
        .collection("OrderDetails")
        .key([10248])
        .navigate("Product")
        .build()
        .unwrap();
    assert_eq!(
        modern().compile(&short).unwrap().path,
        "OrderDetails(10248)/Product"
    );
}

#[test]
fn modifications_pick_methods() {
    let mut entry = Entry::new();
    entry.insert("ProductName".into(), Value::from("Chai"));

    let insert = CommandBuilder::new()
        .collection("Products")
        .insert(entry.clone())
        .build()
        .unwrap();
    let request = modern().compile(&insert).unwrap();
    assert_eq!(request.method, HttpMethod::Post);
    assert_eq!(request.payload, Some(entry.clone()));

    let update = CommandBuilder::new()
        .collection("Products")
        .key([1])
        .update(entry)
        .build()
        .unwrap();
    assert_eq!(modern().compile(&update).unwrap().method, HttpMethod::Patch);

    let keyless = CommandBuilder::new()
        .collection("Products")
        .delete()
        .build()
        .unwrap();
    assert_eq!(
        modern().compile(&keyless).unwrap_err().code(),
        "InvalidCommand"
    );
}

#[test]
fn batch_reference_addresses_content_id() {
    let batch = BatchEntries::new();
    batch.register("customer");
    let command = CommandBuilder::new()
        .in_batch(&batch)
        .batch_ref("customer")
        .navigate("Orders")
        .build()
        .unwrap();
    let request = modern().compile(&command).unwrap();
    assert_eq!(request.path, "$1/Orders");
    assert_eq!(request.method, HttpMethod::Get);
}

#[test]
fn custom_query_options() {
    let command = CommandBuilder::new()
        .collection("Products")
        .query_options("a=1&trace")
        .query_options_expr(Expr::reference("debug").eq(true))
        .build()
        .unwrap();
    let request = modern().compile(&command).unwrap();
    assert_eq!(request.query_string(), "a=1&trace&debug=true");

    let invalid = CommandBuilder::new()
        .collection("Products")
        .query_options_expr(Expr::reference("debug").gt(1))
        .build()
        .unwrap();
    assert_eq!(
        modern().compile(&invalid).unwrap_err().code(),
        "InvalidQueryOption"
    );
}

#[test]
fn strict_targets_reject_ambiguous_fragments() {
    let command = CommandBuilder::new()
        .collection("Products")
        .filter(
            Expr::reference("Category/Name").eq("x") | Expr::reference("OrderDetails/Quantity").gt(1),
        )
        .build()
        .unwrap();
    assert_eq!(
        modern().compile(&command).unwrap().clause("$filter"),
        Some("(Category/Name eq 'x' or OrderDetails/Quantity gt 1)")
    );

    let strict = adapter(
        ProtocolVersion::V4,
        AdapterOptions {
            strict_filter_targets: true,
            ..AdapterOptions::default()
        },
    );
    assert_eq!(strict.compile(&command).unwrap_err().code(), "AmbiguousTarget");
}

#[test]
fn unknown_names_surface_resolution_errors() {
    let unknown = CommandBuilder::new().collection("Widgets").build().unwrap();
    assert_eq!(modern().compile(&unknown).unwrap_err().code(), "UnknownEntity");

    let bad_nav = CommandBuilder::new()
        .collection("Products")
        .navigate("Widgets")
        .build()
        .unwrap();
    assert_eq!(
        modern().compile(&bad_nav).unwrap_err().code(),
        "UnknownNavigation"
    );
}

#[test]
fn unbound_function_compiles_without_collection() {
    let command = CommandBuilder::new()
        .function("TopSellers", [("year", 1997)])
        .build()
        .unwrap();
    assert_eq!(
        modern().compile(&command).unwrap().relative_uri(),
        "TopSellers(year=1997)"
    );
    assert_eq!(
        legacy().compile(&command).unwrap().relative_uri(),
        "TopSellers?year=1997"
    );
}
