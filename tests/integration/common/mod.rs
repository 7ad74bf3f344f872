//! Fixtures shared by the integration test targets.
#![allow(dead_code)]

use odata_query::query::EntityModel;

/// Northwind-shaped model used across the integration tests.
pub fn northwind(version: &str) -> EntityModel {
    EntityModel::new()
        .with_version(version)
        .with_collection("Products", "NorthwindModel.Product", ["ProductID"])
        .with_collection("Categories", "NorthwindModel.Category", ["CategoryID"])
        .with_collection("Suppliers", "NorthwindModel.Supplier", ["SupplierID"])
        .with_collection("Orders", "NorthwindModel.Order", ["OrderID"])
        .with_collection(
            "OrderDetails",
            "NorthwindModel.OrderDetail",
            ["OrderID", "ProductID"],
        )
        .with_collection("Customers", "NorthwindModel.Customer", ["CustomerID"])
        .with_reference("Products", "Category", "Categories")
        .with_reference("Products", "Supplier", "Suppliers")
        .with_many("Products", "OrderDetails", "OrderDetails")
        .with_many("Categories", "Products", "Products")
        .with_many("Suppliers", "Products", "Products")
        .with_many("Orders", "OrderDetails", "OrderDetails")
        .with_reference("Orders", "Customer", "Customers")
        .with_reference("OrderDetails", "Product", "Products")
        .with_reference("OrderDetails", "Order", "Orders")
        .with_many("Customers", "Orders", "Orders")
}

/// JSON encoding of [`northwind`].
pub fn northwind_json(version: &str) -> String {
    northwind(version).to_json().expect("model serializes")
}
