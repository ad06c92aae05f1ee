//! Typed schema layer for the relational family.
//!
//! A [`Table`] is an ordered set of uniquely named [`Column`]s with one
//! designated key column. Each column's [`DataType`] converts between the
//! primitive [`Value`] model and SQLite values; every conversion is lossless
//! or fails with [`StorageError::TypeMismatch`].
//!
//! [`Predicate`]s are conjunctions of [`ColumnPredicate`]s. They are evaluated
//! in memory by the document backends ([`Predicate::matches`]) and compiled to
//! a `WHERE` clause by the relational backend ([`Predicate::to_sql`]).

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, TimeZone, Timelike, Utc};
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde::{Deserialize, Serialize};

use crate::decomposed::DecomposedObject;
use crate::decomposer::{FieldKind, Stored};
use crate::error::{StorageError, StorageResult};
use crate::value::Value;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S%.f";
const DEFAULT_VARCHAR_WIDTH: u32 = 255;

// ═══════════════════════════════════════════════════════════════════════
//  Data types
// ═══════════════════════════════════════════════════════════════════════

/// Storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Double,
    String,
    /// Calendar date, stored as `YYYY-MM-DD` text. Values must fall on midnight UTC.
    Date,
    /// Time of day, stored as `HH:MM:SS[.fff]` text. Values must fall on 1970-01-01.
    Time,
    /// Full instant, stored as RFC 3339 text.
    DateTime,
    /// Full instant, stored as integer epoch milliseconds.
    Timestamp,
    Blob,
}

/// SQLite column affinity, per <https://www.sqlite.org/datatype3.html>.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    Integer,
    Text,
    Blob,
    Real,
    Numeric,
}

impl Affinity {
    /// Affinity of a declared column type, using SQLite's substring rules.
    pub fn of_declared(declared: &str) -> Self {
        let upper = declared.to_ascii_uppercase();
        if upper.contains("INT") {
            Self::Integer
        } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            Self::Text
        } else if upper.is_empty() || upper.contains("BLOB") {
            Self::Blob
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            Self::Real
        } else {
            Self::Numeric
        }
    }

    /// Integer and numeric affinities store the same values.
    fn compatible(self, other: Self) -> bool {
        use Affinity::{Integer, Numeric};
        self == other || matches!((self, other), (Integer, Numeric) | (Numeric, Integer))
    }
}

impl DataType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Byte => "byte",
            Self::Char => "char",
            Self::Short => "short",
            Self::Int => "int",
            Self::Long => "long",
            Self::Double => "double",
            Self::String => "string",
            Self::Date => "date",
            Self::Time => "time",
            Self::DateTime => "datetime",
            Self::Timestamp => "timestamp",
            Self::Blob => "blob",
        }
    }

    /// Declared SQL type, including width where the type has one.
    pub fn sql_type(self, width: Option<u32>) -> String {
        match self {
            Self::Boolean => "BOOLEAN".into(),
            Self::Byte => "TINYINT".into(),
            Self::Char => "CHAR(1)".into(),
            Self::Short => "SMALLINT".into(),
            Self::Int => "INTEGER".into(),
            Self::Long => "BIGINT".into(),
            Self::Double => "DOUBLE".into(),
            Self::String => format!("VARCHAR({})", width.unwrap_or(DEFAULT_VARCHAR_WIDTH)),
            Self::Date => "DATE".into(),
            Self::Time => "TIME".into(),
            Self::DateTime => "DATETIME".into(),
            Self::Timestamp => "TIMESTAMP".into(),
            Self::Blob => "BLOB".into(),
        }
    }

    pub fn affinity(self) -> Affinity {
        Affinity::of_declared(&self.sql_type(None))
    }

    /// The column type that holds a field of the given kind, if any.
    pub fn for_kind(kind: &FieldKind) -> Option<Self> {
        Some(match kind {
            FieldKind::Bool => Self::Boolean,
            FieldKind::Byte => Self::Byte,
            FieldKind::Short => Self::Short,
            FieldKind::Int => Self::Int,
            FieldKind::Long => Self::Long,
            FieldKind::Float | FieldKind::Double => Self::Double,
            FieldKind::Char => Self::Char,
            FieldKind::Str => Self::String,
            FieldKind::Bytes => Self::Blob,
            FieldKind::Timestamp => Self::Timestamp,
            FieldKind::List(_) | FieldKind::Composite { .. } => return None,
        })
    }

    /// Encode a primitive for this column. `path` names the field in errors.
    pub fn encode(self, value: &Value, path: &str) -> StorageResult<SqlValue> {
        let ranged = |min: i64, max: i64| -> StorageResult<SqlValue> {
            let i = value.as_i64(path)?;
            if (min..=max).contains(&i) {
                Ok(SqlValue::Integer(i))
            } else {
                Err(StorageError::mismatch(path, self, format!("out-of-range {i}")))
            }
        };

        match self {
            Self::Boolean => Ok(SqlValue::Integer(i64::from(value.as_bool(path)?))),
            Self::Byte => ranged(i64::from(i8::MIN), i64::from(i8::MAX)),
            Self::Short => ranged(i64::from(i16::MIN), i64::from(i16::MAX)),
            Self::Int => ranged(i64::from(i32::MIN), i64::from(i32::MAX)),
            Self::Long => Ok(SqlValue::Integer(value.as_i64(path)?)),
            Self::Double => Ok(SqlValue::Real(value.as_f64(path)?)),
            Self::Char => {
                let s = value.as_str(path)?;
                if s.chars().count() == 1 {
                    Ok(SqlValue::Text(s.to_string()))
                } else {
                    Err(StorageError::mismatch(path, self, format!("{}-char string", s.chars().count())))
                }
            }
            Self::String => Ok(SqlValue::Text(value.as_str(path)?.to_string())),
            Self::Date => {
                let ts = value.as_timestamp(path)?;
                if ts.num_seconds_from_midnight() != 0 || ts.nanosecond() != 0 {
                    return Err(StorageError::mismatch(path, self, "timestamp with a time of day"));
                }
                Ok(SqlValue::Text(ts.format(DATE_FORMAT).to_string()))
            }
            Self::Time => {
                let ts = value.as_timestamp(path)?;
                if ts.date_naive() != DateTime::<Utc>::UNIX_EPOCH.date_naive() {
                    return Err(StorageError::mismatch(path, self, "timestamp with a date"));
                }
                Ok(SqlValue::Text(ts.format(TIME_FORMAT).to_string()))
            }
            Self::DateTime => {
                let ts = value.as_timestamp(path)?;
                Ok(SqlValue::Text(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)))
            }
            Self::Timestamp => {
                let ts = value.as_timestamp(path)?;
                if ts.timestamp_subsec_nanos() % 1_000_000 != 0 {
                    return Err(StorageError::mismatch(path, self, "sub-millisecond timestamp"));
                }
                Ok(SqlValue::Integer(ts.timestamp_millis()))
            }
            Self::Blob => Ok(SqlValue::Blob(value.as_bytes(path)?)),
        }
    }

    /// Decode a column value. SQL `NULL` is an absent field.
    pub fn decode(self, raw: ValueRef<'_>, path: &str) -> StorageResult<Option<Value>> {
        let unexpected = || StorageError::mismatch(path, self, raw.data_type());
        let text = |bytes: &[u8]| -> StorageResult<String> {
            std::str::from_utf8(bytes)
                .map(str::to_string)
                .map_err(|_| StorageError::mismatch(path, self, "non-UTF-8 text"))
        };

        let value = match (self, raw) {
            (_, ValueRef::Null) => return Ok(None),
            (Self::Boolean, ValueRef::Integer(i)) => Value::Bool(i != 0),
            (Self::Byte | Self::Short | Self::Int | Self::Long, ValueRef::Integer(i)) => Value::Int(i),
            (Self::Double, ValueRef::Real(f)) => Value::Float(f),
            (Self::Double, ValueRef::Integer(i)) => Value::Float(i as f64),
            (Self::Char | Self::String, ValueRef::Text(bytes)) => Value::Str(text(bytes)?),
            (Self::Date, ValueRef::Text(bytes)) => {
                let date = NaiveDate::parse_from_str(&text(bytes)?, DATE_FORMAT)
                    .map_err(|_| unexpected())?;
                Value::Timestamp(date.and_time(NaiveTime::MIN).and_utc())
            }
            (Self::Time, ValueRef::Text(bytes)) => {
                let time = NaiveTime::parse_from_str(&text(bytes)?, TIME_FORMAT)
                    .map_err(|_| unexpected())?;
                Value::Timestamp(DateTime::<Utc>::UNIX_EPOCH.date_naive().and_time(time).and_utc())
            }
            (Self::DateTime, ValueRef::Text(bytes)) => {
                Value::Str(text(bytes)?).as_timestamp(path).map(Value::Timestamp)?
            }
            (Self::Timestamp, ValueRef::Integer(millis)) => Utc
                .timestamp_millis_opt(millis)
                .single()
                .map(Value::Timestamp)
                .ok_or_else(unexpected)?,
            (Self::Blob, ValueRef::Blob(bytes)) => Value::Bytes(bytes.to_vec()),
            _ => return Err(unexpected()),
        };
        Ok(Some(value))
    }

    /// Encode a string key for a key column of this type.
    pub fn encode_key(self, key: &str) -> StorageResult<SqlValue> {
        let bad_key = || StorageError::InvalidArgument(format!("key `{key}` is not a valid {self}"));
        let value = match self {
            Self::Byte | Self::Short | Self::Int | Self::Long => {
                Value::Int(key.parse().map_err(|_| bad_key())?)
            }
            Self::Double => Value::Float(key.parse().map_err(|_| bad_key())?),
            Self::Boolean => Value::Bool(key.parse().map_err(|_| bad_key())?),
            Self::Timestamp => match key.parse::<i64>() {
                Ok(millis) => Value::Int(millis),
                Err(_) => Value::Str(key.to_string()),
            },
            _ => Value::Str(key.to_string()),
        };
        self.encode(&value, key).map_err(|_| bad_key())
    }

    /// Render a key column value back to the string key it was stored under.
    pub fn decode_key(self, raw: ValueRef<'_>) -> StorageResult<String> {
        match (self, raw) {
            (Self::Boolean, ValueRef::Integer(i)) => Ok((i != 0).to_string()),
            (_, ValueRef::Integer(i)) => Ok(i.to_string()),
            (_, ValueRef::Real(f)) => Ok(f.to_string()),
            (_, ValueRef::Text(bytes)) => std::str::from_utf8(bytes)
                .map(str::to_string)
                .map_err(|_| StorageError::mismatch("<key>", self, "non-UTF-8 text")),
            (_, ValueRef::Blob(bytes)) => Ok(BASE64.encode(bytes)),
            (_, ValueRef::Null) => Err(StorageError::missing("<key>")),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Columns and tables
// ═══════════════════════════════════════════════════════════════════════

/// One column of a [`Table`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    #[serde(default)]
    pub nullable: bool,
    /// Declared width, used by `string` columns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
}

impl Column {
    /// A non-nullable column.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: false,
            width: None,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn with_width(mut self, width: u32) -> Self {
        self.width = Some(width);
        self
    }

    fn definition(&self, is_key: bool) -> String {
        let mut def = format!("{} {}", quote_ident(&self.name), self.data_type.sql_type(self.width));
        if is_key {
            def.push_str(" NOT NULL PRIMARY KEY");
        } else if !self.nullable {
            def.push_str(" NOT NULL");
        }
        def
    }

    /// `ALTER TABLE ... ADD COLUMN` definition. Added columns are always
    /// nullable because existing rows have no value for them.
    pub(crate) fn added_definition(&self) -> String {
        format!("{} {}", quote_ident(&self.name), self.data_type.sql_type(self.width))
    }

    fn encode(&self, value: &Value) -> StorageResult<SqlValue> {
        let encoded = self.data_type.encode(value, &self.name)?;
        if let (Some(width), SqlValue::Text(text)) = (self.width, &encoded) {
            let len = text.chars().count();
            if len > width as usize {
                return Err(StorageError::mismatch(
                    &self.name,
                    format!("{}({width})", self.data_type),
                    format!("{len}-char string"),
                ));
            }
        }
        Ok(encoded)
    }
}

/// Serialized form of a [`Table`]; `key` defaults to the first column.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableDef {
    name: String,
    key: Option<String>,
    #[serde(default)]
    key_in_object: bool,
    columns: Vec<Column>,
}

/// A relational table layout.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "TableDef")]
pub struct Table {
    name: String,
    columns: Vec<Column>,
    key: usize,
    key_in_object: bool,
}

impl TryFrom<TableDef> for Table {
    type Error = StorageError;

    fn try_from(def: TableDef) -> StorageResult<Self> {
        let table = Self::new(def.name, def.columns)?;
        let table = match def.key {
            Some(key) => table.with_key(&key)?,
            None => table,
        };
        Ok(table.with_key_in_object(def.key_in_object))
    }
}

impl Table {
    /// Build a table. Column names must be unique; the first column is the key.
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> StorageResult<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(StorageError::Config("table name must not be empty".into()));
        }
        if columns.is_empty() {
            return Err(StorageError::Config(format!("table `{name}` has no columns")));
        }
        let mut seen = HashSet::new();
        for column in &columns {
            if column.name.is_empty() {
                return Err(StorageError::Config(format!("table `{name}` has an unnamed column")));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(StorageError::Config(format!(
                    "table `{name}` declares column `{}` twice",
                    column.name
                )));
            }
        }
        let mut table = Self {
            name,
            columns,
            key: 0,
            key_in_object: false,
        };
        table.columns[0].nullable = false;
        Ok(table)
    }

    /// Designate `column` as the key column.
    pub fn with_key(mut self, column: &str) -> StorageResult<Self> {
        self.key = self.index_of(column).ok_or_else(|| {
            StorageError::Config(format!("table `{}` has no key column `{column}`", self.name))
        })?;
        self.columns[self.key].nullable = false;
        Ok(self)
    }

    /// Whether the key column is also a field of stored objects. When set,
    /// retrieved objects carry the key column as a field.
    pub fn with_key_in_object(mut self, yes: bool) -> Self {
        self.key_in_object = yes;
        self
    }

    /// Derive a table from a type's flattened field layout.
    ///
    /// If the type has a field named `key` it becomes the key column,
    /// otherwise a `string` key column is prepended. List fields have no
    /// column mapping and are rejected.
    pub fn for_type<T: Stored>(name: impl Into<String>, key: &str) -> StorageResult<Self> {
        let name = name.into();
        let mut columns = Vec::new();
        for leaf in T::descriptor().schema() {
            let data_type = DataType::for_kind(&leaf.kind).ok_or_else(|| {
                StorageError::IncompatibleSchema {
                    table: name.clone(),
                    reason: format!("field `{}` of kind {} has no column mapping", leaf.path, leaf.kind),
                }
            })?;
            let mut column = Column::new(leaf.path, data_type);
            column.nullable = leaf.optional;
            columns.push(column);
        }

        let key_in_object = columns.iter().any(|c| c.name == key);
        if !key_in_object {
            columns.insert(0, Column::new(key, DataType::String));
        }
        Ok(Self::new(name, columns)?
            .with_key(key)?
            .with_key_in_object(key_in_object))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn key_column(&self) -> &Column {
        &self.columns[self.key]
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub(crate) fn quoted_name(&self) -> String {
        quote_ident(&self.name)
    }

    /// Comma-separated quoted column names, in declaration order.
    pub(crate) fn column_list(&self) -> String {
        self.columns
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// `CREATE TABLE IF NOT EXISTS` statement for this layout.
    pub fn create_sql(&self) -> String {
        let defs = self
            .columns
            .iter()
            .enumerate()
            .map(|(idx, c)| c.definition(idx == self.key))
            .collect::<Vec<_>>()
            .join(", ");
        format!("CREATE TABLE IF NOT EXISTS {} ({defs})", self.quoted_name())
    }

    /// Upsert statement with one positional parameter per column.
    pub(crate) fn upsert_sql(&self) -> String {
        let placeholders = (1..=self.columns.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let key = quote_ident(&self.key_column().name);
        let updates = self
            .columns
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx != self.key)
            .map(|(_, c)| {
                let col = quote_ident(&c.name);
                format!("{col} = excluded.{col}")
            })
            .collect::<Vec<_>>();
        let conflict = if updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", updates.join(", "))
        };
        format!(
            "INSERT INTO {} ({}) VALUES ({placeholders}) ON CONFLICT({key}) {conflict}",
            self.quoted_name(),
            self.column_list(),
        )
    }

    /// Map an object's leaves onto this table's columns, in column order.
    pub fn encode_row(&self, key: &str, object: &DecomposedObject) -> StorageResult<Vec<SqlValue>> {
        let mut leaves: HashMap<String, Value> = object.flatten().into_iter().collect();

        let key_value = self.key_column().data_type.encode_key(key)?;
        if let Some(field) = leaves.remove(&self.key_column().name) {
            let encoded = self.key_column().encode(&field)?;
            if encoded != key_value {
                return Err(StorageError::InvalidArgument(format!(
                    "field `{}` disagrees with key `{key}`",
                    self.key_column().name
                )));
            }
        }

        let mut row = Vec::with_capacity(self.columns.len());
        for (idx, column) in self.columns.iter().enumerate() {
            if idx == self.key {
                row.push(key_value.clone());
                continue;
            }
            match leaves.remove(&column.name).filter(|v| *v != Value::Null) {
                Some(value) => row.push(column.encode(&value)?),
                None if column.nullable => row.push(SqlValue::Null),
                None => return Err(StorageError::missing(column.name.clone())),
            }
        }

        if let Some(extra) = leaves.keys().min() {
            return Err(StorageError::IncompatibleSchema {
                table: self.name.clone(),
                reason: format!("no column for field `{extra}`"),
            });
        }
        Ok(row)
    }

    /// Rebuild `(key, object)` from a row selected with [`Table::column_list`].
    pub fn decode_row(&self, row: &rusqlite::Row<'_>) -> StorageResult<(String, DecomposedObject)> {
        let mut key = None;
        let mut leaves = Vec::with_capacity(self.columns.len());
        for (idx, column) in self.columns.iter().enumerate() {
            let raw = row.get_ref(idx)?;
            if idx == self.key {
                key = Some(column.data_type.decode_key(raw)?);
                if !self.key_in_object {
                    continue;
                }
            }
            if let Some(value) = column.data_type.decode(raw, &column.name)? {
                leaves.push((column.name.clone(), value));
            }
        }
        let key = key.ok_or_else(|| StorageError::missing(self.key_column().name.clone()))?;
        Ok((key, DecomposedObject::from_flat(leaves)))
    }

    /// Check an existing table's declared columns against this layout.
    ///
    /// `actual` is `(name, declared type)` as reported by `PRAGMA table_info`.
    /// Returns the declared columns missing from the backend.
    pub(crate) fn reconcile(&self, actual: &[(String, String)]) -> StorageResult<Vec<&Column>> {
        let mut missing = Vec::new();
        for column in &self.columns {
            match actual.iter().find(|(name, _)| *name == column.name) {
                Some((_, declared)) => {
                    let found = Affinity::of_declared(declared);
                    if !column.data_type.affinity().compatible(found) {
                        return Err(StorageError::IncompatibleSchema {
                            table: self.name.clone(),
                            reason: format!(
                                "column `{}` is declared {declared} but {} needs {:?} affinity",
                                column.name,
                                column.data_type,
                                column.data_type.affinity()
                            ),
                        });
                    }
                }
                None => missing.push(column),
            }
        }
        if missing.iter().any(|c| c.name == self.key_column().name) {
            return Err(StorageError::IncompatibleSchema {
                table: self.name.clone(),
                reason: format!("key column `{}` does not exist", self.key_column().name),
            });
        }
        Ok(missing)
    }
}

/// Quote an SQL identifier.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

// ═══════════════════════════════════════════════════════════════════════
//  Predicates
// ═══════════════════════════════════════════════════════════════════════

/// Comparison operator of a [`ColumnPredicate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }

    fn holds(self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering == Ordering::Equal,
            Self::Ne => ordering != Ordering::Equal,
            Self::Lt => ordering == Ordering::Less,
            Self::Le => ordering != Ordering::Greater,
            Self::Gt => ordering == Ordering::Greater,
            Self::Ge => ordering != Ordering::Less,
        }
    }
}

/// A comparison of one field (or column) against a constant.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnPredicate {
    pub column: String,
    pub op: CompareOp,
    pub value: Value,
}

impl ColumnPredicate {
    pub fn new(column: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, CompareOp::Eq, value)
    }

    pub fn ne(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, CompareOp::Ne, value)
    }

    pub fn lt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, CompareOp::Lt, value)
    }

    pub fn le(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, CompareOp::Le, value)
    }

    pub fn gt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, CompareOp::Gt, value)
    }

    pub fn ge(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, CompareOp::Ge, value)
    }

    /// Evaluate against a decomposed object. An absent field, or a value of
    /// an incomparable kind, never matches (SQL `NULL` semantics).
    pub fn matches(&self, object: &DecomposedObject) -> bool {
        object
            .get_path(&self.column)
            .and_then(|found| found.compare(&self.value))
            .is_some_and(|ordering| self.op.holds(ordering))
    }
}

/// A conjunction of [`ColumnPredicate`]s. The empty predicate matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Predicate {
    clauses: Vec<ColumnPredicate>,
}

impl Predicate {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn and(mut self, clause: ColumnPredicate) -> Self {
        self.clauses.push(clause);
        self
    }

    pub fn clauses(&self) -> &[ColumnPredicate] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn matches(&self, object: &DecomposedObject) -> bool {
        self.clauses.iter().all(|c| c.matches(object))
    }

    /// Compile to a `WHERE` body with positional parameters. The body is
    /// empty for the empty predicate.
    pub fn to_sql(&self, table: &Table) -> StorageResult<(String, Vec<SqlValue>)> {
        let mut terms = Vec::with_capacity(self.clauses.len());
        let mut params = Vec::with_capacity(self.clauses.len());
        for clause in &self.clauses {
            let column = table.column(&clause.column).ok_or_else(|| {
                StorageError::IncompatibleSchema {
                    table: table.name.clone(),
                    reason: format!("predicate names unknown column `{}`", clause.column),
                }
            })?;
            params.push(column.data_type.encode(&clause.value, &clause.column)?);
            terms.push(format!(
                "{} {} ?{}",
                quote_ident(&column.name),
                clause.op.sql(),
                params.len()
            ));
        }
        Ok((terms.join(" AND "), params))
    }
}

impl From<ColumnPredicate> for Predicate {
    fn from(clause: ColumnPredicate) -> Self {
        Self::all().and(clause)
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Blob;

    fn scores() -> Table {
        Table::new(
            "scores",
            vec![
                Column::new("id", DataType::Int),
                Column::new("score", DataType::Double),
            ],
        )
        .unwrap()
    }

    #[test]
    fn duplicate_columns_are_rejected() {
        let err = Table::new(
            "t",
            vec![Column::new("a", DataType::Int), Column::new("a", DataType::String)],
        )
        .unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
    }

    #[test]
    fn string_into_double_column_is_a_mismatch() {
        let object = DecomposedObject::new().with("score", "high");
        let err = scores().encode_row("1", &object).unwrap_err();
        assert!(matches!(err, StorageError::TypeMismatch { ref path, .. } if path == "score"));
    }

    #[test]
    fn unknown_fields_are_incompatible() {
        let object = DecomposedObject::new().with("score", 1.5).with("rank", 3);
        let err = scores().encode_row("1", &object).unwrap_err();
        assert!(matches!(err, StorageError::IncompatibleSchema { .. }));
    }

    #[test]
    fn missing_non_nullable_column() {
        let err = scores().encode_row("1", &DecomposedObject::new()).unwrap_err();
        assert!(matches!(err, StorageError::MissingField { ref path } if path == "score"));
    }

    #[test]
    fn rows_encode_in_column_order() {
        let object = DecomposedObject::new().with("score", 2.5);
        let row = scores().encode_row("7", &object).unwrap();
        assert_eq!(row, vec![SqlValue::Integer(7), SqlValue::Real(2.5)]);

        assert!(matches!(
            scores().encode_row("seven", &object),
            Err(StorageError::InvalidArgument(_))
        ));
    }

    #[test]
    fn key_field_must_agree_with_key() {
        let object = DecomposedObject::new().with("id", 8).with("score", 2.5);
        assert!(scores().encode_row("8", &object).is_ok());
        assert!(matches!(
            scores().encode_row("9", &object),
            Err(StorageError::InvalidArgument(_))
        ));
    }

    #[test]
    fn narrow_integer_columns_range_check() {
        assert!(DataType::Byte.encode(&Value::Int(127), "b").is_ok());
        assert!(DataType::Byte.encode(&Value::Int(128), "b").is_err());
        assert!(DataType::Short.encode(&Value::Int(-40_000), "s").is_err());
        assert!(DataType::Int.encode(&Value::Float(3.0), "i").is_ok());
        assert!(DataType::Int.encode(&Value::Float(3.5), "i").is_err());
    }

    #[test]
    fn char_and_width_checks() {
        assert!(DataType::Char.encode(&Value::from("x"), "c").is_ok());
        assert!(DataType::Char.encode(&Value::from("xy"), "c").is_err());

        let column = Column::new("name", DataType::String).with_width(3);
        assert!(column.encode(&Value::from("abc")).is_ok());
        assert!(column.encode(&Value::from("abcd")).is_err());
    }

    #[test]
    fn temporal_types_round_trip() {
        let midnight = Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap();
        let encoded = DataType::Date.encode(&Value::Timestamp(midnight), "d").unwrap();
        assert_eq!(encoded, SqlValue::Text("2024-02-29".into()));
        let decoded = DataType::Date.decode(ValueRef::Text(b"2024-02-29"), "d").unwrap();
        assert_eq!(decoded, Some(Value::Timestamp(midnight)));

        let noon = Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap();
        assert!(DataType::Date.encode(&Value::Timestamp(noon), "d").is_err());

        let time = Utc.with_ymd_and_hms(1970, 1, 1, 8, 30, 15).unwrap();
        let encoded = DataType::Time.encode(&Value::Timestamp(time), "t").unwrap();
        let SqlValue::Text(text) = encoded else {
            panic!("time should encode as text");
        };
        let decoded = DataType::Time.decode(ValueRef::Text(text.as_bytes()), "t").unwrap();
        assert_eq!(decoded, Some(Value::Timestamp(time)));
        assert!(DataType::Time.encode(&Value::Timestamp(noon), "t").is_err());

        let instant = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let encoded = DataType::Timestamp.encode(&Value::Timestamp(instant), "ts").unwrap();
        assert_eq!(encoded, SqlValue::Integer(1_700_000_000_123));
        let decoded = DataType::Timestamp
            .decode(ValueRef::Integer(1_700_000_000_123), "ts")
            .unwrap();
        assert_eq!(decoded, Some(Value::Timestamp(instant)));
    }

    #[test]
    fn null_decodes_to_absent() {
        assert_eq!(DataType::String.decode(ValueRef::Null, "s").unwrap(), None);
        assert!(DataType::Boolean.decode(ValueRef::Text(b"yes"), "b").is_err());
    }

    #[test]
    fn affinity_follows_sqlite_rules() {
        assert_eq!(Affinity::of_declared("VARCHAR(40)"), Affinity::Text);
        assert_eq!(Affinity::of_declared("BIGINT"), Affinity::Integer);
        assert_eq!(Affinity::of_declared("DOUBLE"), Affinity::Real);
        assert_eq!(Affinity::of_declared(""), Affinity::Blob);
        assert_eq!(Affinity::of_declared("BOOLEAN"), Affinity::Numeric);
    }

    #[test]
    fn reconcile_reports_missing_and_incompatible() {
        let table = scores();
        let missing = table
            .reconcile(&[("id".into(), "INTEGER".into())])
            .unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].name, "score");

        let err = table
            .reconcile(&[("id".into(), "INTEGER".into()), ("score".into(), "TEXT".into())])
            .unwrap_err();
        assert!(matches!(err, StorageError::IncompatibleSchema { .. }));
    }

    #[test]
    fn upsert_updates_every_non_key_column() {
        let sql = scores().upsert_sql();
        assert!(sql.contains("ON CONFLICT(\"id\") DO UPDATE SET \"score\" = excluded.\"score\""));
    }

    #[test]
    fn predicates_match_in_memory() {
        let object = DecomposedObject::new()
            .with("age", 30)
            .with("address.city", "Lisbon");
        let adults = Predicate::all()
            .and(ColumnPredicate::ge("age", 18))
            .and(ColumnPredicate::eq("address.city", "Lisbon"));
        assert!(adults.matches(&object));
        assert!(!Predicate::from(ColumnPredicate::lt("age", 30)).matches(&object));
        assert!(!Predicate::from(ColumnPredicate::ne("missing", 1)).matches(&object));
        assert!(Predicate::all().matches(&object));
    }

    #[test]
    fn predicates_compile_to_sql() {
        let predicate = Predicate::from(ColumnPredicate::gt("score", 1.5));
        let (body, params) = predicate.to_sql(&scores()).unwrap();
        assert_eq!(body, "\"score\" > ?1");
        assert_eq!(params, vec![SqlValue::Real(1.5)]);

        let unknown = Predicate::from(ColumnPredicate::eq("nope", 1));
        assert!(unknown.to_sql(&scores()).is_err());
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Profile {
        id: i64,
        name: String,
        avatar: Option<Blob>,
    }

    crate::stored!(Profile { id: i64, name: String, avatar: Option<Blob> });

    #[test]
    fn table_for_type_uses_field_layout() {
        let table = Table::for_type::<Profile>("profiles", "id").unwrap();
        assert_eq!(table.key_column().name, "id");
        assert_eq!(table.key_column().data_type, DataType::Long);
        assert!(table.column("avatar").unwrap().nullable);
        assert!(!table.column("name").unwrap().nullable);

        let table = Table::for_type::<Profile>("profiles", "handle").unwrap();
        assert_eq!(table.columns()[0].name, "handle");
        assert_eq!(table.key_column().data_type, DataType::String);
    }

    #[test]
    fn table_deserializes_from_config() {
        let table: Table = toml::from_str(
            r#"
            name = "users"
            key = "id"
            keyInObject = true
            columns = [
                { name = "name", type = "string", width = 64 },
                { name = "id", type = "long" },
                { name = "nick", type = "string", nullable = true },
            ]
            "#,
        )
        .unwrap();
        assert_eq!(table.key_column().name, "id");
        assert_eq!(table.column("name").unwrap().width, Some(64));
        assert!(table.create_sql().contains("\"id\" BIGINT NOT NULL PRIMARY KEY"));
    }
}
