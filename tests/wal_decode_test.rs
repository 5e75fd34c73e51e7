// tests/wal_decode_test.rs
//
// Decoding a realistic sequence of pgoutput messages as they'd arrive in one
// transaction's worth of `Write` frames, plus the tuple-to-JSON projection
// that feeds the Replication Connection's row parsing.

use perimeterd::core::wal::{decode_cell, decode_message, zip_tuple, Cell, ColumnDef, DecodedValue, RelationDef, ReplicaIdentity, WalMessage};

fn resources_relation() -> RelationDef {
    RelationDef {
        id: 100,
        namespace: "public".into(),
        name: "resources".into(),
        replica_identity: ReplicaIdentity::Default,
        columns: vec![
            ColumnDef {
                is_key: true,
                name: "id".into(),
                type_oid: 2950,
                type_name: "uuid",
                type_modifier: -1,
            },
            ColumnDef {
                is_key: false,
                name: "name".into(),
                type_oid: 25,
                type_name: "text",
                type_modifier: -1,
            },
            ColumnDef {
                is_key: false,
                name: "filters".into(),
                type_oid: 3802,
                type_name: "jsonb",
                type_modifier: -1,
            },
        ],
    }
}

fn text_column(bytes: &[u8]) -> Vec<u8> {
    let mut buf = vec![b't'];
    buf.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
    buf.extend_from_slice(bytes);
    buf
}

fn insert_message(relation_id: u32, cols: &[Vec<u8>]) -> Vec<u8> {
    let mut buf = vec![b'I'];
    buf.extend_from_slice(&relation_id.to_be_bytes());
    buf.push(b'N');
    buf.extend_from_slice(&(cols.len() as i16).to_be_bytes());
    for col in cols {
        buf.extend_from_slice(col);
    }
    buf
}

#[test]
fn one_transaction_decodes_begin_relation_insert_commit_in_order() {
    let mut begin = vec![b'B'];
    begin.extend_from_slice(&500u64.to_be_bytes());
    begin.extend_from_slice(&1_000_000i64.to_be_bytes());
    begin.extend_from_slice(&42u32.to_be_bytes());
    assert!(matches!(
        decode_message(&begin).unwrap(),
        WalMessage::Begin { final_lsn: 500, xid: 42, .. }
    ));

    let relation = resources_relation();
    let mut rel_buf = vec![b'R'];
    rel_buf.extend_from_slice(&relation.id.to_be_bytes());
    rel_buf.extend_from_slice(b"public\0");
    rel_buf.extend_from_slice(b"resources\0");
    rel_buf.push(b'd');
    rel_buf.extend_from_slice(&(relation.columns.len() as i16).to_be_bytes());
    for col in &relation.columns {
        rel_buf.push(if col.is_key { 1 } else { 0 });
        rel_buf.extend_from_slice(col.name.as_bytes());
        rel_buf.push(0);
        rel_buf.extend_from_slice(&col.type_oid.to_be_bytes());
        rel_buf.extend_from_slice(&col.type_modifier.to_be_bytes());
    }
    let decoded_relation = match decode_message(&rel_buf).unwrap() {
        WalMessage::Relation(def) => def,
        other => panic!("expected Relation, got {other:?}"),
    };
    assert_eq!(decoded_relation, relation);

    let uuid_text = "11111111-1111-1111-1111-111111111111";
    let insert_buf = insert_message(
        relation.id,
        &[
            text_column(uuid_text.as_bytes()),
            text_column(b"db"),
            text_column(br#"{"cidr": "10.0.0.0/24"}"#),
        ],
    );
    let insert = decode_message(&insert_buf).unwrap();
    let tuple = match insert {
        WalMessage::Insert { relation_id, tuple } => {
            assert_eq!(relation_id, relation.id);
            tuple
        }
        other => panic!("expected Insert, got {other:?}"),
    };

    let row = zip_tuple(&relation, &tuple);
    assert_eq!(row["id"], serde_json::json!(uuid_text));
    assert_eq!(row["name"], serde_json::json!("db"));
    assert_eq!(row["filters"], serde_json::json!({"cidr": "10.0.0.0/24"}));

    let mut commit = vec![b'C'];
    commit.push(0);
    commit.extend_from_slice(&501u64.to_be_bytes());
    commit.extend_from_slice(&502u64.to_be_bytes());
    commit.extend_from_slice(&1_000_100i64.to_be_bytes());
    assert!(matches!(decode_message(&commit).unwrap(), WalMessage::Commit { lsn: 501, .. }));
}

#[test]
fn update_with_key_only_prior_exposes_just_the_key_columns() {
    let relation = resources_relation();
    let mut buf = vec![b'U'];
    buf.extend_from_slice(&relation.id.to_be_bytes());
    buf.push(b'K');
    buf.extend_from_slice(&1i16.to_be_bytes());
    buf.extend_from_slice(&text_column(b"old-id"));
    buf.push(b'N');
    buf.extend_from_slice(&3i16.to_be_bytes());
    buf.extend_from_slice(&text_column(b"new-id"));
    buf.extend_from_slice(&text_column(b"renamed"));
    buf.push(b'n'); // filters went null

    let msg = decode_message(&buf).unwrap();
    match msg {
        WalMessage::Update { prior, new_tuple, .. } => {
            let prior = prior.expect("key-only prior should be present");
            match prior {
                perimeterd::core::wal::PriorTuple::Key(tuple) => {
                    assert_eq!(tuple.cells[0].as_str(), Some("old-id"));
                }
                other => panic!("expected PriorTuple::Key, got {other:?}"),
            }
            assert_eq!(new_tuple.cells[1].as_str(), Some("renamed"));
            assert_eq!(new_tuple.cells[2], Cell::Null);
        }
        other => panic!("expected Update, got {other:?}"),
    }
}

#[test]
fn json_array_cell_double_decodes_each_element() {
    let cell = Cell::Text(br#"{"{\"a\":1}","{\"a\":2}"}"#.to_vec());
    match decode_cell(&cell, 3807) {
        DecodedValue::Json(serde_json::Value::Array(items)) => {
            assert_eq!(items, vec![serde_json::json!({"a": 1}), serde_json::json!({"a": 2})]);
        }
        other => panic!("expected a decoded JSON array, got {other:?}"),
    }
}

#[test]
fn truncated_insert_payload_is_a_malformed_error_not_a_panic() {
    let mut buf = vec![b'I'];
    buf.extend_from_slice(&7u32.to_be_bytes());
    // Missing the tuple marker and column data entirely.
    assert!(decode_message(&buf).is_err());
}

#[test]
fn truncate_message_decodes_relation_ids_and_flags() {
    let mut buf = vec![b'T'];
    buf.extend_from_slice(&2u32.to_be_bytes());
    buf.push(0x3); // cascade + restart_identity
    buf.extend_from_slice(&10u32.to_be_bytes());
    buf.extend_from_slice(&20u32.to_be_bytes());

    match decode_message(&buf).unwrap() {
        WalMessage::Truncate { relation_ids, options } => {
            assert_eq!(relation_ids, vec![10, 20]);
            assert!(options.cascade);
            assert!(options.restart_identity);
        }
        other => panic!("expected Truncate, got {other:?}"),
    }
}
