//! Turning typed objects into [`DecomposedObject`]s and back.
//!
//! There is no runtime reflection. A type opts in by implementing
//! [`Stored`], normally through the [`stored!`](crate::stored) macro, which
//! builds a [`TypeDescriptor`] once per type: an ordered table of field name,
//! [`FieldKind`], optionality and accessor, plus a constructor used by
//! recomposition.
//!
//! ```ignore
//! use stowage_store::stored;
//!
//! struct Address { city: String, zip: Option<String> }
//! struct User { name: String, age: i64, address: Address, tags: Vec<String> }
//!
//! stored!(Address { city: String, zip: Option<String> });
//! stored!(User { name: String, #[optional] age: i64, address: Address, tags: Vec<String> });
//! ```
//!
//! Types that want full control override [`Stored::decompose_with`] and
//! [`Stored::recompose_with`] instead of walking fields, or register a codec
//! pair on a [`Decomposer`]. A registered pair takes precedence over the
//! type's own impl wherever the type appears, including as a nested field.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};

use crate::decomposed::{DecomposedObject, PATH_SEPARATOR};
use crate::error::{StorageError, StorageResult};
use crate::value::{Blob, Value};

// ═══════════════════════════════════════════════════════════════════════
//  Field kinds and per-field codecs
// ═══════════════════════════════════════════════════════════════════════

/// Declared kind of a field, as recorded in a [`TypeDescriptor`].
#[derive(Debug, Clone)]
pub enum FieldKind {
    Bool,
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    Char,
    Str,
    Bytes,
    Timestamp,
    List(Box<FieldKind>),
    Composite {
        type_name: &'static str,
        schema: fn() -> Vec<FieldSchema>,
    },
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool => f.write_str("bool"),
            Self::Byte => f.write_str("byte"),
            Self::Short => f.write_str("short"),
            Self::Int => f.write_str("int"),
            Self::Long => f.write_str("long"),
            Self::Float => f.write_str("float"),
            Self::Double => f.write_str("double"),
            Self::Char => f.write_str("char"),
            Self::Str => f.write_str("string"),
            Self::Bytes => f.write_str("bytes"),
            Self::Timestamp => f.write_str("timestamp"),
            Self::List(inner) => write!(f, "list<{inner}>"),
            Self::Composite { type_name, .. } => f.write_str(type_name),
        }
    }
}

/// One leaf of a type's flattened layout.
#[derive(Debug, Clone)]
pub struct FieldSchema {
    /// Dotted path of the leaf.
    pub path: String,
    pub kind: FieldKind,
    /// Whether the leaf may be absent.
    pub optional: bool,
}

/// Codec between one Rust field type and a [`Value`].
///
/// `codecs` is the registry in effect for the whole object; composite fields
/// consult it so a registered pair also applies below the top level.
pub trait FieldValue: Sized {
    /// Whether absence is a valid state for this type (true for `Option`).
    const IMPLICITLY_OPTIONAL: bool = false;

    fn kind() -> FieldKind;

    /// Encode the field. `None` means the field is absent.
    fn to_field(&self, codecs: &Decomposer) -> Option<Value>;

    /// Decode a stored value found at `path`.
    fn from_field(value: &Value, path: &str, codecs: &Decomposer) -> StorageResult<Self>;

    /// The value to use when the field is absent, or `None` if it is required.
    fn when_absent(_codecs: &Decomposer) -> Option<Self> {
        None
    }
}

macro_rules! int_field {
    ($($ty:ty => $kind:ident),* $(,)?) => {$(
        impl FieldValue for $ty {
            fn kind() -> FieldKind {
                FieldKind::$kind
            }

            fn to_field(&self, _: &Decomposer) -> Option<Value> {
                Some(Value::Int(i64::from(*self)))
            }

            fn from_field(value: &Value, path: &str, _: &Decomposer) -> StorageResult<Self> {
                let wide = value.as_i64(path)?;
                <$ty>::try_from(wide).map_err(|_| {
                    StorageError::mismatch(path, stringify!($ty), format!("out-of-range {wide}"))
                })
            }
        }
    )*};
}

int_field!(i8 => Byte, i16 => Short, i32 => Int, i64 => Long, u16 => Int, u32 => Long);

impl FieldValue for bool {
    fn kind() -> FieldKind {
        FieldKind::Bool
    }

    fn to_field(&self, _: &Decomposer) -> Option<Value> {
        Some(Value::Bool(*self))
    }

    fn from_field(value: &Value, path: &str, _: &Decomposer) -> StorageResult<Self> {
        value.as_bool(path)
    }
}

impl FieldValue for f64 {
    fn kind() -> FieldKind {
        FieldKind::Double
    }

    fn to_field(&self, _: &Decomposer) -> Option<Value> {
        Some(Value::Float(*self))
    }

    fn from_field(value: &Value, path: &str, _: &Decomposer) -> StorageResult<Self> {
        value.as_f64(path)
    }
}

impl FieldValue for f32 {
    fn kind() -> FieldKind {
        FieldKind::Float
    }

    fn to_field(&self, _: &Decomposer) -> Option<Value> {
        Some(Value::Float(f64::from(*self)))
    }

    fn from_field(value: &Value, path: &str, _: &Decomposer) -> StorageResult<Self> {
        let wide = value.as_f64(path)?;
        let narrow = wide as f32;
        if wide.is_finite() && f64::from(narrow) != wide {
            return Err(StorageError::mismatch(path, "f32", format!("inexact {wide}")));
        }
        Ok(narrow)
    }
}

impl FieldValue for char {
    fn kind() -> FieldKind {
        FieldKind::Char
    }

    fn to_field(&self, _: &Decomposer) -> Option<Value> {
        Some(Value::Str(self.to_string()))
    }

    fn from_field(value: &Value, path: &str, _: &Decomposer) -> StorageResult<Self> {
        let s = value.as_str(path)?;
        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Ok(c),
            _ => Err(StorageError::mismatch(path, "char", format!("{}-char string", s.chars().count()))),
        }
    }
}

impl FieldValue for String {
    fn kind() -> FieldKind {
        FieldKind::Str
    }

    fn to_field(&self, _: &Decomposer) -> Option<Value> {
        Some(Value::Str(self.clone()))
    }

    fn from_field(value: &Value, path: &str, _: &Decomposer) -> StorageResult<Self> {
        value.as_str(path).map(str::to_string)
    }
}

impl FieldValue for Blob {
    fn kind() -> FieldKind {
        FieldKind::Bytes
    }

    fn to_field(&self, _: &Decomposer) -> Option<Value> {
        Some(Value::Bytes(self.0.clone()))
    }

    fn from_field(value: &Value, path: &str, _: &Decomposer) -> StorageResult<Self> {
        value.as_bytes(path).map(Blob)
    }
}

impl FieldValue for DateTime<Utc> {
    fn kind() -> FieldKind {
        FieldKind::Timestamp
    }

    fn to_field(&self, _: &Decomposer) -> Option<Value> {
        Some(Value::Timestamp(*self))
    }

    fn from_field(value: &Value, path: &str, _: &Decomposer) -> StorageResult<Self> {
        value.as_timestamp(path)
    }
}

impl<T: FieldValue> FieldValue for Option<T> {
    const IMPLICITLY_OPTIONAL: bool = true;

    fn kind() -> FieldKind {
        T::kind()
    }

    fn to_field(&self, codecs: &Decomposer) -> Option<Value> {
        self.as_ref().and_then(|inner| inner.to_field(codecs))
    }

    fn from_field(value: &Value, path: &str, codecs: &Decomposer) -> StorageResult<Self> {
        match value {
            Value::Null => Ok(None),
            present => T::from_field(present, path, codecs).map(Some),
        }
    }

    fn when_absent(_: &Decomposer) -> Option<Self> {
        Some(None)
    }
}

/// Collections are stored as indexed elements. An element that encodes to
/// nothing (a `None` in a `Vec<Option<T>>`) keeps its index as [`Value::Null`].
impl<T: FieldValue> FieldValue for Vec<T> {
    fn kind() -> FieldKind {
        FieldKind::List(Box::new(T::kind()))
    }

    fn to_field(&self, codecs: &Decomposer) -> Option<Value> {
        Some(Value::List(
            self.iter()
                .map(|item| item.to_field(codecs).unwrap_or(Value::Null))
                .collect(),
        ))
    }

    fn from_field(value: &Value, path: &str, codecs: &Decomposer) -> StorageResult<Self> {
        match value {
            Value::List(items) => items
                .iter()
                .enumerate()
                .map(|(idx, item)| {
                    T::from_field(item, &format!("{path}{PATH_SEPARATOR}{idx}"), codecs)
                })
                .collect(),
            other => Err(StorageError::mismatch(path, "list", other.kind())),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Type descriptors
// ═══════════════════════════════════════════════════════════════════════

/// Reads named fields out of a decomposed object during recomposition.
pub struct FieldSource<'a> {
    object: &'a DecomposedObject,
    codecs: &'a Decomposer,
}

impl<'a> FieldSource<'a> {
    pub fn new(object: &'a DecomposedObject, codecs: &'a Decomposer) -> Self {
        Self { object, codecs }
    }

    /// Read a field, failing with `MissingField` if it is absent and the
    /// field type has no absent state.
    pub fn required<F: FieldValue>(&self, name: &str) -> StorageResult<F> {
        match self.object.get(name) {
            Some(value) => F::from_field(value, name, self.codecs),
            None => F::when_absent(self.codecs).ok_or_else(|| StorageError::missing(name)),
        }
    }

    /// Read a field, defaulting to `F::default()` when absent.
    pub fn optional<F: FieldValue + Default>(&self, name: &str) -> StorageResult<F> {
        match self.object.get(name) {
            Some(value) => F::from_field(value, name, self.codecs),
            None => Ok(F::default()),
        }
    }
}

/// Reads one field of `T` for decomposition.
pub type FieldReader<T> = fn(&T, &Decomposer) -> Option<Value>;

/// One entry of a [`TypeDescriptor`].
pub struct FieldDescriptor<T> {
    name: &'static str,
    kind: FieldKind,
    optional: bool,
    read: FieldReader<T>,
}

impl<T> FieldDescriptor<T> {
    pub fn new(
        name: &'static str,
        kind: FieldKind,
        optional: bool,
        read: FieldReader<T>,
    ) -> Self {
        Self {
            name,
            kind,
            optional,
            read,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }
}

/// Constructor used by [`TypeDescriptor::recompose`].
pub type Constructor<T> = fn(&FieldSource<'_>) -> StorageResult<T>;

/// The registered field table for one type.
pub struct TypeDescriptor<T> {
    name: &'static str,
    fields: Vec<FieldDescriptor<T>>,
    construct: Option<Constructor<T>>,
}

impl<T> TypeDescriptor<T> {
    pub fn new(name: &'static str, fields: Vec<FieldDescriptor<T>>, construct: Constructor<T>) -> Self {
        Self {
            name,
            fields,
            construct: Some(construct),
        }
    }

    /// A descriptor with no field table, for types that hand-write
    /// [`Stored::decompose`] and [`Stored::recompose`].
    pub fn opaque(name: &'static str) -> Self {
        Self {
            name,
            fields: Vec::new(),
            construct: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn fields(&self) -> &[FieldDescriptor<T>] {
        &self.fields
    }

    /// Walk the field table, emitting one entry per present field.
    pub fn decompose(&self, object: &T, codecs: &Decomposer) -> DecomposedObject {
        let mut out = DecomposedObject::new();
        for field in &self.fields {
            if let Some(value) = (field.read)(object, codecs) {
                out.insert(field.name, value);
            }
        }
        out
    }

    /// Rebuild a `T` from its decomposed form.
    pub fn recompose(&self, object: &DecomposedObject, codecs: &Decomposer) -> StorageResult<T> {
        let construct = self.construct.ok_or_else(|| {
            StorageError::InvalidArgument(format!(
                "type `{}` has no field table to recompose from",
                self.name
            ))
        })?;
        construct(&FieldSource::new(object, codecs))
    }

    /// Flattened leaf layout: composites are expanded into dotted paths, a
    /// leaf is optional if it or any enclosing composite is.
    pub fn schema(&self) -> Vec<FieldSchema> {
        let mut out = Vec::new();
        for field in &self.fields {
            push_schema(&mut out, field.name.to_string(), &field.kind, field.optional);
        }
        out
    }
}

fn push_schema(out: &mut Vec<FieldSchema>, path: String, kind: &FieldKind, optional: bool) {
    match kind {
        FieldKind::Composite { schema, .. } => {
            for leaf in schema() {
                out.push(FieldSchema {
                    path: format!("{path}{PATH_SEPARATOR}{}", leaf.path),
                    kind: leaf.kind,
                    optional: optional || leaf.optional,
                });
            }
        }
        other => out.push(FieldSchema {
            path,
            kind: other.clone(),
            optional,
        }),
    }
}

impl<T> fmt::Debug for TypeDescriptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("name", &self.name)
            .field(
                "fields",
                &self.fields.iter().map(|d| d.name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  The Stored capability
// ═══════════════════════════════════════════════════════════════════════

/// A type the persistence layer can decompose and rebuild.
///
/// Hand-written impls override the `_with` methods; `decompose` and
/// `recompose` are shorthands with no registered codecs.
pub trait Stored: Sized + Send + Sync + 'static {
    /// The type's registered field table.
    fn descriptor() -> &'static TypeDescriptor<Self>;

    /// Decompose, encoding nested composites through `codecs`.
    fn decompose_with(&self, codecs: &Decomposer) -> DecomposedObject {
        Self::descriptor().decompose(self, codecs)
    }

    /// Recompose, decoding nested composites through `codecs`.
    fn recompose_with(object: &DecomposedObject, codecs: &Decomposer) -> StorageResult<Self> {
        Self::descriptor().recompose(object, codecs)
    }

    fn decompose(&self) -> DecomposedObject {
        self.decompose_with(Decomposer::empty())
    }

    fn recompose(object: &DecomposedObject) -> StorageResult<Self> {
        Self::recompose_with(object, Decomposer::empty())
    }
}

/// Decompose with the type's own [`Stored`] impl.
pub fn decompose<T: Stored>(object: &T) -> DecomposedObject {
    object.decompose()
}

/// Recompose with the type's own [`Stored`] impl.
pub fn recompose<T: Stored>(object: &DecomposedObject) -> StorageResult<T> {
    T::recompose(object)
}

/// Implements [`FieldValue`] for a [`Stored`] type so it can be nested as a
/// composite field. [`stored!`](crate::stored) calls this for you; use it
/// directly for hand-written `Stored` impls.
#[macro_export]
macro_rules! composite_field {
    ($ty:ty) => {
        impl $crate::decomposer::FieldValue for $ty {
            fn kind() -> $crate::decomposer::FieldKind {
                $crate::decomposer::FieldKind::Composite {
                    type_name: <$ty as $crate::decomposer::Stored>::descriptor().name(),
                    schema: || <$ty as $crate::decomposer::Stored>::descriptor().schema(),
                }
            }

            fn to_field(
                &self,
                codecs: &$crate::decomposer::Decomposer,
            ) -> ::std::option::Option<$crate::value::Value> {
                ::std::option::Option::Some($crate::value::Value::Nested(
                    codecs.decompose::<$ty>(self),
                ))
            }

            fn from_field(
                value: &$crate::value::Value,
                path: &str,
                codecs: &$crate::decomposer::Decomposer,
            ) -> $crate::error::StorageResult<Self> {
                match value {
                    $crate::value::Value::Nested(object) => {
                        codecs.recompose::<$ty>(object).map_err(|e| e.under(path))
                    }
                    other => ::std::result::Result::Err($crate::error::StorageError::mismatch(
                        path,
                        "composite",
                        other.kind(),
                    )),
                }
            }

            fn when_absent(
                codecs: &$crate::decomposer::Decomposer,
            ) -> ::std::option::Option<Self> {
                // A composite whose fields are all optional is rebuilt from nothing.
                codecs
                    .recompose::<$ty>(&$crate::decomposed::DecomposedObject::new())
                    .ok()
            }
        }
    };
}

/// Registers a field table for an existing struct.
///
/// List every field with its type; prefix a field with `#[optional]` to
/// default it on absence instead of failing with `MissingField`.
#[macro_export]
macro_rules! stored {
    (@read $source:ident, $name:expr, optional) => {
        $source.optional($name)?
    };
    (@read $source:ident, $name:expr, ) => {
        $source.required($name)?
    };
    (@optional optional) => {
        true
    };
    (@optional) => {
        false
    };
    ($ty:ident { $( $(#[$flag:ident])? $field:ident : $fty:ty ),* $(,)? }) => {
        impl $crate::decomposer::Stored for $ty {
            fn descriptor() -> &'static $crate::decomposer::TypeDescriptor<Self> {
                static DESCRIPTOR: ::std::sync::OnceLock<$crate::decomposer::TypeDescriptor<$ty>> =
                    ::std::sync::OnceLock::new();
                DESCRIPTOR.get_or_init(|| {
                    $crate::decomposer::TypeDescriptor::new(
                        stringify!($ty),
                        vec![$(
                            $crate::decomposer::FieldDescriptor::new(
                                stringify!($field),
                                <$fty as $crate::decomposer::FieldValue>::kind(),
                                $crate::stored!(@optional $($flag)?)
                                    || <$fty as $crate::decomposer::FieldValue>::IMPLICITLY_OPTIONAL,
                                |object: &$ty, codecs: &$crate::decomposer::Decomposer| {
                                    $crate::decomposer::FieldValue::to_field(&object.$field, codecs)
                                },
                            ),
                        )*],
                        |source| {
                            ::std::result::Result::Ok($ty {
                                $( $field: $crate::stored!(@read source, stringify!($field), $($flag)?), )*
                            })
                        },
                    )
                })
            }
        }

        $crate::composite_field!($ty);
    };
}

// ═══════════════════════════════════════════════════════════════════════
//  Custom codec registry
// ═══════════════════════════════════════════════════════════════════════

type DecomposeFn<T> = dyn Fn(&T) -> DecomposedObject + Send + Sync;
type RecomposeFn<T> = dyn Fn(&DecomposedObject) -> StorageResult<T> + Send + Sync;

struct CustomCodec<T> {
    decompose: Box<DecomposeFn<T>>,
    recompose: Box<RecomposeFn<T>>,
}

/// Registry of explicit decompose/recompose pairs.
///
/// A registered pair bypasses the type's field walking entirely, at the top
/// level and wherever the type is nested inside another stored type. Types
/// without a registered pair fall back to their [`Stored`] impl.
#[derive(Default)]
pub struct Decomposer {
    custom: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

static NO_CODECS: LazyLock<Decomposer> = LazyLock::new(Decomposer::default);

impl Decomposer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A shared registry with nothing registered.
    pub fn empty() -> &'static Decomposer {
        &NO_CODECS
    }

    /// Register a codec pair for `T`, replacing any earlier registration.
    pub fn register<T, D, R>(&mut self, decompose: D, recompose: R) -> &mut Self
    where
        T: Stored,
        D: Fn(&T) -> DecomposedObject + Send + Sync + 'static,
        R: Fn(&DecomposedObject) -> StorageResult<T> + Send + Sync + 'static,
    {
        let codec = CustomCodec::<T> {
            decompose: Box::new(decompose),
            recompose: Box::new(recompose),
        };
        self.custom.insert(TypeId::of::<T>(), Box::new(codec));
        self
    }

    /// Whether a custom pair is registered for `T`.
    pub fn has_custom<T: Stored>(&self) -> bool {
        self.custom.contains_key(&TypeId::of::<T>())
    }

    pub fn decompose<T: Stored>(&self, object: &T) -> DecomposedObject {
        match self.codec::<T>() {
            Some(codec) => (codec.decompose)(object),
            None => object.decompose_with(self),
        }
    }

    pub fn recompose<T: Stored>(&self, object: &DecomposedObject) -> StorageResult<T> {
        match self.codec::<T>() {
            Some(codec) => (codec.recompose)(object),
            None => T::recompose_with(object, self),
        }
    }

    fn codec<T: Stored>(&self) -> Option<&CustomCodec<T>> {
        self.custom
            .get(&TypeId::of::<T>())
            .and_then(|codec| codec.downcast_ref::<CustomCodec<T>>())
    }
}

impl fmt::Debug for Decomposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decomposer")
            .field("custom_codecs", &self.custom.len())
            .finish()
    }
}

// ── tests ────────────────────────────────────────────────────────────
