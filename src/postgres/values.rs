//! Conversion of tuple columns into typed values.
//!
//! Text-format columns are parsed with a decoder looked up by type OID in a
//! [`TypeRegistry`]. Types without a decoder, and values a decoder rejects,
//! are kept as the raw text the server sent ([`Cell::Raw`]) so that an
//! unfamiliar column never stops replication.
//!
//! Only types whose native value converts back to the exact same datum get a
//! decoder. `json`, `jsonb` and `numeric` stay raw and are cast on the target.

use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use std::collections::HashMap;
use std::error::Error as StdError;
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, PgLsn, ToSql, Type};
use tracing::{trace, warn};
use uuid::Uuid;

use super::types::{Oid, TupleColumn, TypeBody};

type BoxError = Box<dyn StdError + Sync + Send>;
pub type TextDecoder = fn(&str) -> Result<Cell, BoxError>;
pub type BinaryDecoder = fn(&[u8]) -> Result<Cell, BoxError>;

/// A non-null column value in its native representation.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    Oid(u32),
    F32(f32),
    F64(f64),
    String(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Uuid(Uuid),
    Lsn(PgLsn),
    /// Text representation of a value whose type has no decoder.
    Raw(String),
}

impl ToSql for Cell {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self {
            Cell::Bool(v) => v.to_sql_checked(ty, out),
            Cell::I16(v) => v.to_sql_checked(ty, out),
            Cell::I32(v) => v.to_sql_checked(ty, out),
            Cell::I64(v) => v.to_sql_checked(ty, out),
            Cell::Oid(v) => v.to_sql_checked(ty, out),
            Cell::F32(v) => v.to_sql_checked(ty, out),
            Cell::F64(v) => v.to_sql_checked(ty, out),
            Cell::String(v) | Cell::Raw(v) => v.to_sql_checked(ty, out),
            Cell::Bytes(v) => v.to_sql_checked(ty, out),
            Cell::Date(v) => v.to_sql_checked(ty, out),
            Cell::Time(v) => v.to_sql_checked(ty, out),
            Cell::Timestamp(v) => v.to_sql_checked(ty, out),
            Cell::TimestampTz(v) => v.to_sql_checked(ty, out),
            Cell::Uuid(v) => v.to_sql_checked(ty, out),
            Cell::Lsn(v) => v.to_sql_checked(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// A decoded column of a row change.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    /// The column is not part of this change and must not be written.
    UnchangedToast,
    Value(Cell),
}

impl ColumnValue {
    pub fn is_unchanged(&self) -> bool {
        matches!(self, ColumnValue::UnchangedToast)
    }

    /// The statement parameter for this column, `None` for unchanged values.
    pub fn to_param(&self) -> Option<Option<Cell>> {
        match self {
            ColumnValue::Null => Some(None),
            ColumnValue::UnchangedToast => None,
            ColumnValue::Value(cell) => Some(Some(cell.clone())),
        }
    }
}

#[derive(Clone, Copy)]
struct Codec {
    text: TextDecoder,
    binary: Option<BinaryDecoder>,
}

/// Type OID to decoder mapping, plus names of custom types announced on the
/// stream.
pub struct TypeRegistry {
    codecs: HashMap<Oid, Codec>,
    custom_names: HashMap<Oid, String>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        let mut registry = Self {
            codecs: HashMap::new(),
            custom_names: HashMap::new(),
        };
        registry.register_builtins();
        registry
    }
}

macro_rules! binary {
    ($ty:expr, $rust:ty, $variant:path) => {
        Some(|raw: &[u8]| <$rust as FromSql>::from_sql(&$ty, raw).map($variant))
    };
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with no decoders; every text value stays raw.
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
            custom_names: HashMap::new(),
        }
    }

    fn register_builtins(&mut self) {
        self.register_codec(Type::BOOL.oid(), parse_bool, binary!(Type::BOOL, bool, Cell::Bool));
        self.register_codec(
            Type::INT2.oid(),
            |s| s.parse().map(Cell::I16).map_err(Into::into),
            binary!(Type::INT2, i16, Cell::I16),
        );
        self.register_codec(
            Type::INT4.oid(),
            |s| s.parse().map(Cell::I32).map_err(Into::into),
            binary!(Type::INT4, i32, Cell::I32),
        );
        self.register_codec(
            Type::INT8.oid(),
            |s| s.parse().map(Cell::I64).map_err(Into::into),
            binary!(Type::INT8, i64, Cell::I64),
        );
        self.register_codec(
            Type::OID.oid(),
            |s| s.parse().map(Cell::Oid).map_err(Into::into),
            binary!(Type::OID, u32, Cell::Oid),
        );
        self.register_codec(
            Type::FLOAT4.oid(),
            |s| s.parse().map(Cell::F32).map_err(Into::into),
            binary!(Type::FLOAT4, f32, Cell::F32),
        );
        self.register_codec(
            Type::FLOAT8.oid(),
            |s| s.parse().map(Cell::F64).map_err(Into::into),
            binary!(Type::FLOAT8, f64, Cell::F64),
        );
        for ty in [Type::TEXT, Type::VARCHAR, Type::BPCHAR, Type::NAME] {
            self.register_codec(
                ty.oid(),
                |s| Ok(Cell::String(s.to_owned())),
                Some(|raw: &[u8]| <String as FromSql>::from_sql(&Type::TEXT, raw).map(Cell::String)),
            );
        }
        self.register_codec(Type::BYTEA.oid(), parse_bytea, binary!(Type::BYTEA, Vec<u8>, Cell::Bytes));
        self.register_codec(
            Type::DATE.oid(),
            |s| NaiveDate::parse_from_str(s, "%Y-%m-%d").map(Cell::Date).map_err(Into::into),
            binary!(Type::DATE, NaiveDate, Cell::Date),
        );
        self.register_codec(
            Type::TIME.oid(),
            |s| NaiveTime::parse_from_str(s, "%H:%M:%S%.f").map(Cell::Time).map_err(Into::into),
            binary!(Type::TIME, NaiveTime, Cell::Time),
        );
        self.register_codec(
            Type::TIMESTAMP.oid(),
            |s| {
                NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                    .map(Cell::Timestamp)
                    .map_err(Into::into)
            },
            binary!(Type::TIMESTAMP, NaiveDateTime, Cell::Timestamp),
        );
        self.register_codec(
            Type::TIMESTAMPTZ.oid(),
            |s| {
                DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z")
                    .map(|ts| Cell::TimestampTz(ts.with_timezone(&Utc)))
                    .map_err(Into::into)
            },
            binary!(Type::TIMESTAMPTZ, DateTime<Utc>, Cell::TimestampTz),
        );
        self.register_codec(
            Type::UUID.oid(),
            |s| Uuid::parse_str(s).map(Cell::Uuid).map_err(Into::into),
            binary!(Type::UUID, Uuid, Cell::Uuid),
        );
        self.register_codec(
            Type::PG_LSN.oid(),
            |s| {
                s.parse::<PgLsn>()
                    .map(Cell::Lsn)
                    .map_err(|_| format!("invalid pg_lsn: {}", s).into())
            },
            binary!(Type::PG_LSN, PgLsn, Cell::Lsn),
        );
    }

    /// Registers (or replaces) the text decoder for `type_id`.
    pub fn register(&mut self, type_id: Oid, decoder: TextDecoder) {
        self.register_codec(type_id, decoder, None);
    }

    fn register_codec(&mut self, type_id: Oid, text: TextDecoder, binary: Option<BinaryDecoder>) {
        self.codecs.insert(type_id, Codec { text, binary });
    }

    /// Records the name of a custom type announced by a type message.
    pub fn register_type(&mut self, body: &TypeBody) {
        let name = if body.namespace.is_empty() {
            pg_escape::quote_identifier(&body.name).into_owned()
        } else {
            format!(
                "{}.{}",
                pg_escape::quote_identifier(&body.namespace),
                pg_escape::quote_identifier(&body.name)
            )
        };
        trace!(type_id = body.type_id, %name, "registered custom type");
        self.custom_names.insert(body.type_id, name);
    }

    /// The SQL type name a raw text value of `type_id` has to be cast to,
    /// or `None` when the value can be bound as text directly or the type is
    /// not known by name.
    pub fn cast_target(&self, type_id: Oid) -> Option<String> {
        if let Some(name) = self.custom_names.get(&type_id) {
            return Some(name.clone());
        }
        let ty = Type::from_oid(type_id)?;
        if matches!(ty, Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN) {
            return None;
        }
        Some(format!(
            "{}.{}",
            pg_escape::quote_identifier(ty.schema()),
            pg_escape::quote_identifier(ty.name())
        ))
    }

    pub fn decode_text(&self, type_id: Oid, raw: &[u8]) -> Cell {
        let text = String::from_utf8_lossy(raw);
        match self.codecs.get(&type_id) {
            Some(codec) => match (codec.text)(&text) {
                Ok(cell) => cell,
                Err(e) => {
                    warn!(type_id, error = %e, "Failed to decode text value, keeping raw text");
                    Cell::Raw(text.into_owned())
                }
            },
            None => Cell::Raw(text.into_owned()),
        }
    }

    pub fn decode_binary(&self, type_id: Oid, raw: &[u8]) -> Cell {
        let decoded = self
            .codecs
            .get(&type_id)
            .and_then(|codec| codec.binary)
            .map(|decode| decode(raw));
        match decoded {
            Some(Ok(cell)) => cell,
            Some(Err(e)) => {
                warn!(type_id, error = %e, "Failed to decode binary value, keeping raw bytes");
                Cell::Bytes(raw.to_vec())
            }
            None => Cell::Bytes(raw.to_vec()),
        }
    }

    pub fn decode_column(&self, column: &TupleColumn, type_id: Oid) -> ColumnValue {
        match column {
            TupleColumn::Null => ColumnValue::Null,
            TupleColumn::UnchangedToast => ColumnValue::UnchangedToast,
            TupleColumn::Text(raw) => ColumnValue::Value(self.decode_text(type_id, raw)),
            TupleColumn::Binary(raw) => ColumnValue::Value(self.decode_binary(type_id, raw)),
        }
    }
}

fn parse_bool(text: &str) -> Result<Cell, BoxError> {
    match text {
        "t" | "true" => Ok(Cell::Bool(true)),
        "f" | "false" => Ok(Cell::Bool(false)),
        _ => Err(format!("invalid boolean: {}", text).into()),
    }
}

fn parse_bytea(text: &str) -> Result<Cell, BoxError> {
    // Only the hex output format; escape-format values stay raw.
    let hex_digits = text
        .strip_prefix("\\x")
        .ok_or_else(|| format!("bytea value is not hex encoded: {}", text))?;
    Ok(Cell::Bytes(hex::decode(hex_digits)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::TimeZone;

    fn text(registry: &TypeRegistry, value: &str, type_id: Oid) -> Cell {
        registry.decode_text(type_id, value.as_bytes())
    }

    #[test]
    fn test_bool_parsing() {
        let registry = TypeRegistry::new();
        assert_eq!(text(&registry, "t", 16), Cell::Bool(true));
        assert_eq!(text(&registry, "f", 16), Cell::Bool(false));
        assert_eq!(text(&registry, "invalid", 16), Cell::Raw("invalid".to_string()));
    }

    #[test]
    fn test_integer_parsing() {
        let registry = TypeRegistry::new();
        assert_eq!(text(&registry, "123", 21), Cell::I16(123));
        assert_eq!(text(&registry, "456789", 23), Cell::I32(456789));
        assert_eq!(text(&registry, "9876543210", 20), Cell::I64(9876543210));
        assert_eq!(text(&registry, "invalid", 21), Cell::Raw("invalid".to_string()));
    }

    #[test]
    fn test_float_parsing() {
        let registry = TypeRegistry::new();
        match text(&registry, "3.14", 700) {
            Cell::F32(v) => assert!((v - 3.14).abs() < 0.001),
            other => panic!("unexpected cell: {:?}", other),
        }
        assert_eq!(text(&registry, "2.718281828", 701), Cell::F64(2.718281828));
    }

    #[test]
    fn test_string_types() {
        let registry = TypeRegistry::new();
        assert_eq!(
            text(&registry, "Hello, World!", 25),
            Cell::String("Hello, World!".to_string())
        );
        assert_eq!(
            text(&registry, "Variable length", 1043),
            Cell::String("Variable length".to_string())
        );
    }

    #[test]
    fn test_datetime_types() {
        let registry = TypeRegistry::new();
        assert_eq!(
            text(&registry, "2023-10-15", 1082),
            Cell::Date(NaiveDate::from_ymd_opt(2023, 10, 15).unwrap())
        );
        assert_eq!(
            text(&registry, "2023-10-15 10:30:00.5", 1114),
            Cell::Timestamp(
                NaiveDate::from_ymd_opt(2023, 10, 15)
                    .unwrap()
                    .and_hms_milli_opt(10, 30, 0, 500)
                    .unwrap()
            )
        );
        assert_eq!(
            text(&registry, "2023-10-15 12:30:00+02", 1184),
            Cell::TimestampTz(Utc.with_ymd_and_hms(2023, 10, 15, 10, 30, 0).unwrap())
        );
        assert_eq!(
            text(&registry, "infinity", 1082),
            Cell::Raw("infinity".to_string())
        );
    }

    #[test]
    fn test_uuid_and_bytea() {
        let registry = TypeRegistry::new();
        assert_eq!(
            text(&registry, "550e8400-e29b-41d4-a716-446655440000", 2950),
            Cell::Uuid(Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap())
        );
        assert_eq!(text(&registry, "\\xdeadbeef", 17), Cell::Bytes(vec![0xde, 0xad, 0xbe, 0xef]));
    }

    #[test]
    fn test_unknown_type_falls_back_to_raw_text() {
        let registry = TypeRegistry::new();
        assert!(!registry.codecs.contains_key(&1700));
        assert_eq!(text(&registry, "12345.6789", 1700), Cell::Raw("12345.6789".to_string()));
        assert_eq!(text(&registry, "anything", 99999), Cell::Raw("anything".to_string()));
    }

    /// The text form Postgres prints for a decoded value, where the native
    /// type renders identically.
    fn rendered(cell: &Cell) -> Option<String> {
        match cell {
            Cell::I16(v) => Some(v.to_string()),
            Cell::I32(v) => Some(v.to_string()),
            Cell::I64(v) => Some(v.to_string()),
            Cell::Oid(v) => Some(v.to_string()),
            Cell::F32(v) => Some(v.to_string()),
            Cell::F64(v) => Some(v.to_string()),
            Cell::String(v) => Some(v.clone()),
            Cell::Date(v) => Some(v.to_string()),
            Cell::Time(v) => Some(v.to_string()),
            Cell::Timestamp(v) => Some(v.to_string()),
            Cell::Uuid(v) => Some(v.to_string()),
            Cell::Lsn(v) => Some(v.to_string()),
            _ => None,
        }
    }

    #[test]
    fn test_decoded_values_bind_unchanged() {
        let registry = TypeRegistry::new();
        let samples = [
            (Type::BOOL, "t"),
            (Type::INT2, "-123"),
            (Type::INT4, "456789"),
            (Type::INT8, "9223372036854775807"),
            (Type::OID, "16384"),
            (Type::FLOAT4, "3.25"),
            (Type::FLOAT8, "2.718281828459045"),
            (Type::TEXT, "h\u{e9}llo"),
            (Type::VARCHAR, "Variable length"),
            (Type::BPCHAR, "ab  "),
            (Type::NAME, "users"),
            (Type::BYTEA, "\\xdeadbeef"),
            (Type::DATE, "2023-10-15"),
            (Type::TIME, "10:30:00.123456"),
            (Type::TIMESTAMP, "2023-10-15 10:30:00.123456"),
            (Type::TIMESTAMPTZ, "2023-10-15 12:30:00.5+02"),
            (Type::UUID, "550e8400-e29b-41d4-a716-446655440000"),
            (Type::PG_LSN, "16/B374D848"),
        ];

        for (ty, source) in samples {
            let cell = registry.decode_text(ty.oid(), source.as_bytes());
            assert!(!matches!(cell, Cell::Raw(_)), "{} was not decoded", ty);

            let mut bound = BytesMut::new();
            cell.to_sql_checked(&ty, &mut bound).unwrap();
            let rebound = registry.decode_binary(ty.oid(), &bound);
            assert_eq!(rebound, cell, "{} changed when bound", ty);
            if let Some(rendered) = rendered(&rebound) {
                assert_eq!(rendered, source, "{} differs from the source text", ty);
            }
        }
    }

    #[test]
    fn test_json_text_binds_verbatim() {
        let registry = TypeRegistry::new();
        let document = r#"{"b": 1, "a": 12345678901234567890123, "p": 0.10000000000000000001}"#;

        for ty in [Type::JSON, Type::JSONB] {
            let cell = registry.decode_text(ty.oid(), document.as_bytes());
            assert_eq!(cell, Cell::Raw(document.to_string()));

            // Raw text is bound as text and cast on the server.
            let mut bound = BytesMut::new();
            cell.to_sql_checked(&Type::TEXT, &mut bound).unwrap();
            assert_eq!(&bound[..], document.as_bytes());
            assert_eq!(
                registry.cast_target(ty.oid()),
                Some(format!("pg_catalog.{}", ty.name()))
            );
        }
    }

    #[test]
    fn test_custom_decoder_registration() {
        let mut registry = TypeRegistry::empty();
        assert_eq!(text(&registry, "42", 23), Cell::Raw("42".to_string()));

        registry.register(23, |s| s.parse().map(Cell::I64).map_err(Into::into));
        assert_eq!(text(&registry, "42", 23), Cell::I64(42));
    }

    #[test]
    fn test_binary_values() {
        let registry = TypeRegistry::new();
        assert_eq!(registry.decode_binary(16, &[1]), Cell::Bool(true));
        assert_eq!(registry.decode_binary(23, &456789i32.to_be_bytes()), Cell::I32(456789));
        assert_eq!(registry.decode_binary(9999, &[1, 2, 3]), Cell::Bytes(vec![1, 2, 3]));
    }

    #[test]
    fn test_decode_column_kinds() {
        let registry = TypeRegistry::new();
        assert_eq!(registry.decode_column(&TupleColumn::Null, 23), ColumnValue::Null);
        assert_eq!(
            registry.decode_column(&TupleColumn::UnchangedToast, 25),
            ColumnValue::UnchangedToast
        );
        assert_eq!(
            registry.decode_column(&TupleColumn::Text(Bytes::from_static(b"7")), 23),
            ColumnValue::Value(Cell::I32(7))
        );
        assert_eq!(ColumnValue::UnchangedToast.to_param(), None);
        assert_eq!(ColumnValue::Null.to_param(), Some(None));
    }

    #[test]
    fn test_cast_targets() {
        let mut registry = TypeRegistry::new();
        assert_eq!(registry.cast_target(25), None);
        assert_eq!(registry.cast_target(23).as_deref(), Some("pg_catalog.int4"));
        assert!(registry.cast_target(1700).is_some());
        assert_eq!(registry.cast_target(70000), None);

        registry.register_type(&TypeBody {
            xid: None,
            type_id: 70000,
            namespace: "public".to_string(),
            name: "Mood".to_string(),
        });
        assert_eq!(registry.cast_target(70000).as_deref(), Some("public.\"Mood\""));
    }
}
