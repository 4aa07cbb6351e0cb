use comanda_types::{ChangePayload, RecordKey, RecordKind};
use serde_json::json;

#[test]
fn record_key_display_includes_kind() {
    let key = RecordKey::new(RecordKind::Table, "T-02");
    assert_eq!(key.to_string(), "table/T-02");

    let key = RecordKey::new(RecordKind::OrderDetail, "42");
    assert_eq!(key.to_string(), "order_detail/42");
}

#[test]
fn payload_roundtrips() {
    let payload = ChangePayload::new("T-02", json!({"status": "OCCUPIED", "seats": 4}));
    let wire = payload.to_wire();
    let back = ChangePayload::from_wire(&wire).unwrap();
    assert_eq!(payload, back);
}

#[test]
fn payload_data_stays_opaque() {
    // Arbitrary nested structure the sync layer never interprets.
    let payload = ChangePayload::new(
        "order-9",
        json!({"lines": [{"sku": "espresso", "qty": 2}], "note": null}),
    );
    let back = ChangePayload::from_wire(&payload.to_wire()).unwrap();
    assert_eq!(back.record, "order-9");
    assert_eq!(back.data["lines"][0]["qty"], 2);
}

#[test]
fn malformed_payload_is_rejected() {
    assert!(ChangePayload::from_wire("{not json").is_err());
    assert!(ChangePayload::from_wire("").is_err());
}
