// src/core/wal/oid.rs

//! Table-driven lookup from a Postgres built-in type OID to its name, used to
//! decide which cells the decoder should attempt JSON decoding on.

/// Well-known built-in type OIDs relevant to tuple decoding. Only the types
/// the decoder treats specially are listed here; everything else falls back
/// to the raw text representation.
pub const OID_JSON: u32 = 114;
pub const OID_JSONB: u32 = 3802;
pub const OID_JSON_ARRAY: u32 = 199;
pub const OID_JSONB_ARRAY: u32 = 3807;

pub fn type_name(oid: u32) -> &'static str {
    match oid {
        16 => "bool",
        18 => "char",
        20 => "int8",
        21 => "int2",
        23 => "int4",
        25 => "text",
        114 => "json",
        199 => "json[]",
        700 => "float4",
        701 => "float8",
        1042 => "bpchar",
        1043 => "varchar",
        1082 => "date",
        1114 => "timestamp",
        1184 => "timestamptz",
        1700 => "numeric",
        2950 => "uuid",
        3802 => "jsonb",
        3807 => "jsonb[]",
        _ => "unknown",
    }
}

pub fn is_json_scalar(oid: u32) -> bool {
    matches!(oid, OID_JSON | OID_JSONB)
}

pub fn is_json_array(oid: u32) -> bool {
    matches!(oid, OID_JSON_ARRAY | OID_JSONB_ARRAY)
}
