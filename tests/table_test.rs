//! Table operations against a real SQLite file.

mod common;

use common::{seed_company, settings_table, stocks_table, TestFixture};
use rowgate::{Condition, Error, Item, Join, OrderBy, Row, Select, Value, Where};
use tokio_stream::StreamExt;
use tokio_test::{assert_err, assert_ok};

fn company_join() -> Join {
    Join::on("positions", "employees.position_id", "positions.id").and_on(
        "departments",
        "positions.department_id",
        "departments.id",
    )
}

#[tokio::test]
async fn test_join_selects_directors() {
    let fixture = TestFixture::new();
    let db = fixture.open().await;
    let (_, _, employees) = seed_company(&db).await;

    let rows = employees
        .select(
            Select::all()
                .join(company_join())
                .filter(Where::eq("positions.name", "Director")),
        )
        .await
        .unwrap();

    assert_eq!(rows.len(), 4);
    for row in &rows {
        assert_eq!(row["positions.name"], Value::from("Director"));
        assert!(row.contains_key("departments.name"));
        assert!(row.contains_key("employees.name"));
    }
    db.close().await;
}

#[tokio::test]
async fn test_not_in_condition() {
    let fixture = TestFixture::new();
    let db = fixture.open().await;
    let (_, _, employees) = seed_company(&db).await;

    let condition = Condition::new("positions.name", "not in", vec!["Manager", "Intern", "Rep"]).unwrap();
    let rows = employees
        .select(Select::all().join(company_join()).filter(vec![condition]))
        .await
        .unwrap();

    assert_eq!(rows.len(), 4);
    assert!(rows.iter().all(|row| row["positions.name"] == Value::from("Director")));
    db.close().await;
}

#[tokio::test]
async fn test_foreign_key_join_and_ordering() {
    let fixture = TestFixture::new();
    let db = fixture.open().await;
    let (_, positions, _) = seed_company(&db).await;

    let rows = positions
        .select(
            Select::columns(["positions.name", "departments.name"])
                .join(Join::foreign_key("departments"))
                .filter(Where::eq("departments.name", "HR"))
                .order_by("positions.name"),
        )
        .await
        .unwrap();

    let names: Vec<_> = rows.iter().map(|row| row["positions.name"].clone()).collect();
    assert_eq!(
        names,
        ["Director", "Intern", "Manager", "Rep"].map(Value::from).to_vec()
    );
    assert!(rows.iter().all(|row| row.len() == 2));

    let newest = positions
        .select(Select::columns(["id"]).order_by(OrderBy::desc("id")))
        .await
        .unwrap();
    assert_eq!(newest[0]["id"], Value::Int(16));
    db.close().await;
}

#[tokio::test]
async fn test_like_and_comparison_conditions() {
    let fixture = TestFixture::new();
    let db = fixture.open().await;
    let (_, _, employees) = seed_company(&db).await;

    let wildcard = employees
        .select(Select::all().filter(vec![Condition::new("name", "like", "HR Director*").unwrap()]))
        .await
        .unwrap();
    assert_eq!(wildcard.len(), 1);

    let substring = employees
        .select(Select::all().filter(vec![Condition::new("name", "like", "Intern").unwrap()]))
        .await
        .unwrap();
    assert_eq!(substring.len(), 32);

    let range = employees
        .select(Select::all().filter(vec![
            Condition::new("id", ">", 10).unwrap(),
            Condition::new("id", "<=", 12).unwrap(),
        ]))
        .await
        .unwrap();
    assert_eq!(range.len(), 2);

    assert!(Condition::new("id", "~", 1).unwrap_err().is_input_error());
    db.close().await;
}

#[tokio::test]
async fn test_unknown_references_are_rejected() {
    let fixture = TestFixture::new();
    let db = fixture.open().await;
    let (_, _, employees) = seed_company(&db).await;

    let err = assert_err!(employees.select(Select::all().filter(Where::eq("salary", 1))).await);
    assert!(err.is_input_error());

    let err = assert_err!(employees.select(Select::all().join(Join::foreign_key("departments"))).await);
    assert!(err.is_input_error());
    db.close().await;
}

#[tokio::test]
async fn test_insert_then_select_by_key() {
    let fixture = TestFixture::new();
    let db = fixture.open().await;
    let stocks = stocks_table(&db).await;

    let written = stocks
        .insert([
            ("order_num", Value::from(7)),
            ("date", Value::from("2006-01-05")),
            ("trans", Value::from("BUY")),
            ("symbol", Value::from("RHAT")),
            ("qty", Value::from(100.0)),
            ("price", Value::from(35.14)),
            ("after_hours", Value::from(true)),
        ])
        .await
        .unwrap();

    let rows = stocks
        .select(Select::all().filter(Where::eq("order_num", 7)))
        .await
        .unwrap();
    assert_eq!(rows, vec![written]);
    db.close().await;
}

#[tokio::test]
async fn test_insert_drops_unrepresentable_values() {
    let fixture = TestFixture::new();
    let db = fixture.open().await;
    let stocks = stocks_table(&db).await;

    let written = stocks
        .insert([
            ("symbol", Value::from("IBM")),
            ("qty", Value::from("lots")),
            ("price", Value::from("45.5")),
        ])
        .await
        .unwrap();
    assert!(!written.contains_key("qty"));
    assert_eq!(written["price"], Value::Float(45.5));

    let rows = stocks
        .select(Select::all().filter(Where::eq("symbol", "IBM")))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["qty"], Value::Null);
    assert_eq!(rows[0]["order_num"], Value::Int(1));

    let err = assert_err!(stocks.insert([("volume", 1)]).await);
    assert!(matches!(err, Error::InvalidInput { .. }));
    db.close().await;
}

#[tokio::test]
async fn test_key_access_on_two_column_table() {
    let fixture = TestFixture::new();
    let db = fixture.open().await;
    let settings = settings_table(&db).await;

    assert_ok!(settings.set("theme", "dark").await);
    assert_ok!(settings.set("font", "mono").await);
    assert_eq!(settings.get("theme").await.unwrap(), Some(Item::from("dark")));

    assert_ok!(settings.set("theme", "light").await);
    assert_eq!(settings.get("theme").await.unwrap(), Some(Item::from("light")));

    assert!(settings.contains_key("font").await.unwrap());
    assert!(settings.remove("font").await.unwrap());
    assert!(!settings.contains_key("font").await.unwrap());
    assert!(!settings.remove("font").await.unwrap());
    assert_eq!(settings.get("font").await.unwrap(), None);

    let all: Vec<Row> = settings.rows().await.unwrap().collect().await;
    assert_eq!(all.len(), 1);
    db.close().await;
}

#[tokio::test]
async fn test_key_access_on_wide_table() {
    let fixture = TestFixture::new();
    let db = fixture.open().await;
    let stocks = stocks_table(&db).await;

    let row = Row::from([
        ("symbol".to_string(), Value::from("MSFT")),
        ("qty".to_string(), Value::from(75.0)),
    ]);
    assert_ok!(stocks.set(3, Item::Row(row)).await);

    let Some(Item::Row(stored)) = stocks.get(3).await.unwrap() else {
        panic!("expected a row");
    };
    assert_eq!(stored["symbol"], Value::from("MSFT"));
    assert_eq!(stored["order_num"], Value::Int(3));

    let err = assert_err!(stocks.set(3, "MSFT").await);
    assert!(err.is_input_error());
    db.close().await;
}

#[tokio::test]
async fn test_row_cache_matches_backend() {
    let fixture = TestFixture::new();
    let db = fixture.open().await;
    let settings = settings_table(&db).await;

    for (key, value) in [("a", "1"), ("b", "2"), ("c", "3"), ("d", "4")] {
        settings.set(key, value).await.unwrap();
    }
    for key in ["a", "b", "c", "d"] {
        settings.get(key).await.unwrap();
    }
    settings
        .update([("value", "changed")], Some(Where::eq("value", "2")))
        .await
        .unwrap();
    settings.delete(Some(Where::eq("key", "c")), false).await.unwrap();
    db.run("UPDATE settings SET value = 'raw' WHERE key = 'd'").await.unwrap();

    let mut cached = Vec::new();
    for key in ["a", "b", "c", "d"] {
        cached.push(settings.get(key).await.unwrap());
    }
    db.disable_cache();
    let mut fresh = Vec::new();
    for key in ["a", "b", "c", "d"] {
        fresh.push(settings.get(key).await.unwrap());
    }
    assert_eq!(cached, fresh);
    assert_eq!(fresh[1], Some(Item::from("changed")));
    assert_eq!(fresh[2], None);
    assert_eq!(fresh[3], Some(Item::from("raw")));
    db.close().await;
}

#[tokio::test]
async fn test_row_cache_is_bounded() {
    let fixture = TestFixture::new();
    let mut config = fixture.config();
    config.max_cache_entries = 2;
    let db = fixture.open_with(config).await;
    let settings = settings_table(&db).await;

    for key in ["a", "b", "c"] {
        settings.set(key, "x").await.unwrap();
        settings.get(key).await.unwrap();
    }
    assert_eq!(settings.cached_rows(), 2);
    db.close().await;
}

#[tokio::test]
async fn test_cascade_delete_clears_dependent_cache() {
    let fixture = TestFixture::new();
    let db = fixture.open().await;
    let (_, positions, employees) = seed_company(&db).await;

    assert!(employees.get(1).await.unwrap().is_some());
    assert_eq!(positions.delete(Some(Where::eq("id", 1)), false).await.unwrap(), 1);
    assert_eq!(employees.get(1).await.unwrap(), None);
    db.close().await;
}

#[tokio::test]
async fn test_delete_without_filter_needs_all_rows() {
    let fixture = TestFixture::new();
    let db = fixture.open().await;
    let settings = settings_table(&db).await;
    settings.set("a", "1").await.unwrap();

    let err = assert_err!(settings.delete(None, false).await);
    assert!(err.is_input_error());
    assert_eq!(settings.delete(None, true).await.unwrap(), 1);
    assert_eq!(settings.cached_rows(), 0);
    db.close().await;
}
