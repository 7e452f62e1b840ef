//! Core domain model + order-to-row transformation for possync.

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "possync-core";

/// Classification tag stamped on every row this pipeline produces.
pub const REVENUE_CENTER: &str = "Food Truck";

/// Sentinel stored when the remote omits an identifier or display name.
pub const MISSING_VALUE: &str = "unknown";

/// A point-of-sale site as listed by the commerce API. Fetched fresh each
/// run, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: String,
    pub name: Option<String>,
}

/// Monetary amount in minor currency units (cents).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub amount: i64,
    pub currency: Option<String>,
}

/// One line item nested within a remote order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub uid: Option<String>,
    pub catalog_object_id: Option<String>,
    pub name: Option<String>,
    pub quantity: f64,
    pub gross_sales_money: Option<Money>,
    pub total_money: Option<Money>,
}

/// A remote order. `created_at` is kept as the verbatim ISO-8601 string the
/// API returned; it is never reparsed or reformatted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub location_id: Option<String>,
    pub created_at: String,
    pub total_tip_money: Option<Money>,
    pub line_items: Vec<LineItem>,
}

/// Flat persisted sales row. Natural key is `(uid, item_order_time)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalesRecord {
    pub revenue_center_desc: String,
    pub order_id: String,
    pub item_order_time: String,
    pub item_number: String,
    pub item_name: String,
    pub item_quantity: f64,
    pub item_gross_sales: f64,
    pub item_net_sales: f64,
    pub tip_amount: f64,
    pub store_id: String,
    pub uid: String,
}

/// Half-open fetch window `[start, end)` over order creation time, carried
/// as the timestamp strings handed to the remote API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncWindow {
    pub start: String,
    pub end: String,
}

/// Flatten one order into candidate sales rows, one per line item.
///
/// The order's tip is carried identically on every row; it is not split
/// across items. Missing money fields become 0.0, missing identifiers
/// become [`MISSING_VALUE`]. Total over any well-formed order.
pub fn order_to_records(order: &Order) -> Vec<SalesRecord> {
    let tip_amount = minor_to_currency(order.total_tip_money.as_ref());
    let store_id = order
        .location_id
        .clone()
        .unwrap_or_else(|| MISSING_VALUE.to_string());

    order
        .line_items
        .iter()
        .map(|item| SalesRecord {
            revenue_center_desc: REVENUE_CENTER.to_string(),
            order_id: order.id.clone(),
            item_order_time: order.created_at.clone(),
            item_number: item
                .catalog_object_id
                .clone()
                .unwrap_or_else(|| MISSING_VALUE.to_string()),
            item_name: item.name.clone().unwrap_or_else(|| MISSING_VALUE.to_string()),
            item_quantity: item.quantity,
            item_gross_sales: minor_to_currency(item.gross_sales_money.as_ref()),
            item_net_sales: minor_to_currency(item.total_money.as_ref()),
            tip_amount,
            store_id: store_id.clone(),
            uid: item.uid.clone().unwrap_or_else(|| MISSING_VALUE.to_string()),
        })
        .collect()
}

fn minor_to_currency(money: Option<&Money>) -> f64 {
    money.map(|m| m.amount as f64 / 100.0).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn money(amount: i64) -> Option<Money> {
        Some(Money {
            amount,
            currency: Some("USD".to_string()),
        })
    }

    fn taco_order() -> Order {
        Order {
            id: "O1".to_string(),
            location_id: Some("L-MAIN".to_string()),
            created_at: "2024-07-01T10:00:00Z".to_string(),
            total_tip_money: money(150),
            line_items: vec![LineItem {
                uid: Some("L1".to_string()),
                catalog_object_id: Some("C1".to_string()),
                name: Some("Taco".to_string()),
                quantity: 2.0,
                gross_sales_money: money(500),
                total_money: money(480),
            }],
        }
    }

    #[test]
    fn taco_order_flattens_to_one_row() {
        let records = order_to_records(&taco_order());
        assert_eq!(records.len(), 1);

        let record = &records[0];
        assert_eq!(record.revenue_center_desc, "Food Truck");
        assert_eq!(record.order_id, "O1");
        assert_eq!(record.item_order_time, "2024-07-01T10:00:00Z");
        assert_eq!(record.item_number, "C1");
        assert_eq!(record.item_name, "Taco");
        assert_eq!(record.item_quantity, 2.0);
        assert_eq!(record.item_gross_sales, 5.00);
        assert_eq!(record.item_net_sales, 4.80);
        assert_eq!(record.tip_amount, 1.50);
        assert_eq!(record.store_id, "L-MAIN");
        assert_eq!(record.uid, "L1");
    }

    #[test]
    fn tip_is_shared_unsplit_across_line_items() {
        let mut order = taco_order();
        order.line_items.push(LineItem {
            uid: Some("L2".to_string()),
            catalog_object_id: Some("C2".to_string()),
            name: Some("Horchata".to_string()),
            quantity: 1.0,
            gross_sales_money: money(300),
            total_money: money(300),
        });

        let records = order_to_records(&order);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].tip_amount, 1.50);
        assert_eq!(records[1].tip_amount, 1.50);
    }

    #[test]
    fn order_without_line_items_yields_no_rows() {
        let mut order = taco_order();
        order.line_items.clear();
        assert!(order_to_records(&order).is_empty());
    }

    #[test]
    fn missing_optional_fields_default_instead_of_failing() {
        let order = Order {
            id: "O2".to_string(),
            location_id: None,
            created_at: "2024-07-02T09:30:00Z".to_string(),
            total_tip_money: None,
            line_items: vec![LineItem {
                uid: None,
                catalog_object_id: None,
                name: None,
                quantity: 1.0,
                gross_sales_money: None,
                total_money: None,
            }],
        };

        let records = order_to_records(&order);
        assert_eq!(records.len(), 1);

        let record = &records[0];
        assert_eq!(record.item_number, MISSING_VALUE);
        assert_eq!(record.item_name, MISSING_VALUE);
        assert_eq!(record.uid, MISSING_VALUE);
        assert_eq!(record.store_id, MISSING_VALUE);
        assert_eq!(record.tip_amount, 0.0);
        assert_eq!(record.item_gross_sales, 0.0);
        assert_eq!(record.item_net_sales, 0.0);
    }

    #[test]
    fn transformation_is_deterministic() {
        let order = taco_order();
        assert_eq!(order_to_records(&order), order_to_records(&order));
    }

    #[test]
    fn line_item_order_is_preserved() {
        let mut order = taco_order();
        for n in 2..=5 {
            order.line_items.push(LineItem {
                uid: Some(format!("L{n}")),
                catalog_object_id: Some(format!("C{n}")),
                name: Some(format!("Item {n}")),
                quantity: 1.0,
                gross_sales_money: money(100),
                total_money: money(100),
            });
        }

        let uids = order_to_records(&order)
            .iter()
            .map(|r| r.uid.clone())
            .collect::<Vec<_>>();
        assert_eq!(uids, vec!["L1", "L2", "L3", "L4", "L5"]);
    }
}
