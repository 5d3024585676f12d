use std::fmt::Display;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use entmap_types::{Blob, Key, Node, RawKey, Record, Value};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::TranslateConfig;
use crate::context::{CreateContext, LoadContext, SaveContext};
use crate::error::{TranslateError, TranslateResult};
use crate::path::Path;
use crate::translator::{Persist, Shape, Translator};
use crate::type_key::TypeKey;

// ---------------------------------------------------------------------------
// ValueCodec / LeafTranslator
// ---------------------------------------------------------------------------

/// Symmetric conversion between a value and one scalar representation.
///
/// Codecs never see null; [`LeafTranslator`] handles it for all of them.
pub trait ValueCodec<P>: Send + Sync {
    fn load_value(&self, value: &Value, path: &Path, config: &TranslateConfig)
        -> TranslateResult<P>;

    fn save_value(&self, pojo: &P, path: &Path, config: &TranslateConfig)
        -> TranslateResult<Value>;
}

/// Wraps a [`ValueCodec`] with null handling and size rules.
///
/// A null leaf loads as the skip signal. Strings longer than the indexed
/// limit, blobs and raw records are stored unindexed; strings and blobs
/// above the blob limit are rejected.
pub struct LeafTranslator<P, C> {
    codec: C,
    _marker: PhantomData<fn() -> P>,
}

impl<P, C> LeafTranslator<P, C> {
    pub fn new(codec: C) -> Self {
        Self {
            codec,
            _marker: PhantomData,
        }
    }
}

impl<P, C: ValueCodec<P>> Translator<P> for LeafTranslator<P, C> {
    fn load(
        &self,
        node: &Node,
        ctx: &mut LoadContext<'_>,
        path: &Path,
    ) -> TranslateResult<Option<P>> {
        match node {
            Node::Leaf {
                value: Value::Null, ..
            } => Ok(None),
            Node::Leaf { value, .. } => self.codec.load_value(value, path, ctx.config()).map(Some),
            other => Err(TranslateError::UnexpectedNode {
                path: path.to_string(),
                expected: "scalar",
                found: other.describe(),
            }),
        }
    }

    fn save(
        &self,
        pojo: &P,
        index: bool,
        ctx: &mut SaveContext<'_>,
        path: &Path,
    ) -> TranslateResult<Option<Node>> {
        let config = ctx.config();
        let value = self.codec.save_value(pojo, path, config)?;
        let indexed = index && indexable(&value, path, config)?;
        Ok(Some(Node::Leaf { value, indexed }))
    }
}

fn indexable(value: &Value, path: &Path, config: &TranslateConfig) -> TranslateResult<bool> {
    let too_large = |size: usize| TranslateError::ValueTooLarge {
        path: path.to_string(),
        detail: format!("{size} bytes exceeds {}", config.max_blob_bytes),
    };
    match value {
        Value::String(s) if s.len() > config.max_blob_bytes => Err(too_large(s.len())),
        Value::String(s) => Ok(s.len() <= config.max_indexed_string_bytes),
        Value::Blob(b) if b.len() > config.max_blob_bytes => Err(too_large(b.len())),
        Value::Blob(_) | Value::Record(_) => Ok(false),
        _ => Ok(true),
    }
}

fn mismatch(path: &Path, expected: &'static str, found: &Value) -> TranslateError {
    TranslateError::UnexpectedNode {
        path: path.to_string(),
        expected,
        found: found.type_name(),
    }
}

fn invalid(path: &Path, detail: impl Into<String>) -> TranslateError {
    TranslateError::InvalidValue {
        path: path.to_string(),
        detail: detail.into(),
    }
}

fn parse_text<T: FromStr>(
    text: &str,
    expected: &'static str,
    path: &Path,
    config: &TranslateConfig,
) -> TranslateResult<T> {
    if !config.parse_strings {
        return Err(TranslateError::UnexpectedNode {
            path: path.to_string(),
            expected,
            found: "string",
        });
    }
    text.trim()
        .parse()
        .map_err(|_| invalid(path, format!("cannot parse {text:?} as {expected}")))
}

// ---------------------------------------------------------------------------
// Codecs
// ---------------------------------------------------------------------------

/// Strings. Loads any bool or number as its text.
pub struct StringCodec;

impl ValueCodec<String> for StringCodec {
    fn load_value(&self, value: &Value, path: &Path, _: &TranslateConfig) -> TranslateResult<String> {
        match value {
            Value::String(s) => Ok(s.clone()),
            Value::Integer(i) => Ok(i.to_string()),
            Value::Double(d) => Ok(d.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            other => Err(mismatch(path, "string", other)),
        }
    }

    fn save_value(&self, pojo: &String, _: &Path, _: &TranslateConfig) -> TranslateResult<Value> {
        Ok(Value::String(pojo.clone()))
    }
}

pub struct BoolCodec;

impl ValueCodec<bool> for BoolCodec {
    fn load_value(&self, value: &Value, path: &Path, config: &TranslateConfig) -> TranslateResult<bool> {
        match value {
            Value::Bool(b) => Ok(*b),
            Value::String(s) => parse_text(s, "bool", path, config),
            other => Err(mismatch(path, "bool", other)),
        }
    }

    fn save_value(&self, pojo: &bool, _: &Path, _: &TranslateConfig) -> TranslateResult<Value> {
        Ok(Value::Bool(*pojo))
    }
}

// -2^63 is exact as a double; 2^63 is the first double past i64::MAX.
const I64_LOWER: f64 = -9_223_372_036_854_775_808.0;
const I64_UPPER: f64 = 9_223_372_036_854_775_808.0;

/// Integers of any width, stored as `i64`.
///
/// Loading narrows losslessly or fails; whole doubles and (optionally)
/// numeric text are accepted.
pub struct IntegerCodec<T>(PhantomData<fn() -> T>);

impl<T> IntegerCodec<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for IntegerCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ValueCodec<T> for IntegerCodec<T>
where
    T: Copy + TryFrom<i64> + FromStr + Display,
    i64: TryFrom<T>,
{
    fn load_value(&self, value: &Value, path: &Path, config: &TranslateConfig) -> TranslateResult<T> {
        let wide = match value {
            Value::Integer(i) => *i,
            Value::Double(d) if d.fract() == 0.0 && (I64_LOWER..I64_UPPER).contains(d) => *d as i64,
            Value::Double(d) => return Err(invalid(path, format!("{d} is not a whole number"))),
            Value::String(s) => return parse_text(s, "integer", path, config),
            other => return Err(mismatch(path, "integer", other)),
        };
        T::try_from(wide).map_err(|_| {
            invalid(
                path,
                format!("{wide} is out of range for {}", std::any::type_name::<T>()),
            )
        })
    }

    fn save_value(&self, pojo: &T, path: &Path, _: &TranslateConfig) -> TranslateResult<Value> {
        i64::try_from(*pojo)
            .map(Value::Integer)
            .map_err(|_| TranslateError::ValueTooLarge {
                path: path.to_string(),
                detail: format!("{pojo} does not fit in a 64-bit signed integer"),
            })
    }
}

pub struct F64Codec;

/// Largest integer magnitude every `f64` can hold exactly.
const F64_EXACT: u64 = 1 << 53;

impl ValueCodec<f64> for F64Codec {
    fn load_value(&self, value: &Value, path: &Path, config: &TranslateConfig) -> TranslateResult<f64> {
        match value {
            Value::Double(d) => Ok(*d),
            Value::Integer(i) if i.unsigned_abs() <= F64_EXACT => Ok(*i as f64),
            Value::Integer(i) => Err(invalid(path, format!("{i} has no exact double representation"))),
            Value::String(s) => parse_text(s, "double", path, config),
            other => Err(mismatch(path, "double", other)),
        }
    }

    fn save_value(&self, pojo: &f64, _: &Path, _: &TranslateConfig) -> TranslateResult<Value> {
        Ok(Value::Double(*pojo))
    }
}

pub struct F32Codec;

impl ValueCodec<f32> for F32Codec {
    fn load_value(&self, value: &Value, path: &Path, config: &TranslateConfig) -> TranslateResult<f32> {
        let wide = F64Codec.load_value(value, path, config)?;
        if wide.is_finite() && wide.abs() > f64::from(f32::MAX) {
            return Err(invalid(path, format!("{wide} is out of range for f32")));
        }
        Ok(wide as f32)
    }

    fn save_value(&self, pojo: &f32, _: &Path, _: &TranslateConfig) -> TranslateResult<Value> {
        Ok(Value::Double(f64::from(*pojo)))
    }
}

/// Timestamps. Integers load as epoch milliseconds.
pub struct TimestampCodec;

impl ValueCodec<DateTime<Utc>> for TimestampCodec {
    fn load_value(
        &self,
        value: &Value,
        path: &Path,
        config: &TranslateConfig,
    ) -> TranslateResult<DateTime<Utc>> {
        match value {
            Value::Timestamp(t) => Ok(*t),
            Value::Integer(ms) => DateTime::from_timestamp_millis(*ms)
                .ok_or_else(|| invalid(path, format!("{ms} ms is out of range"))),
            Value::String(s) => parse_text(s, "timestamp", path, config),
            other => Err(mismatch(path, "timestamp", other)),
        }
    }

    fn save_value(&self, pojo: &DateTime<Utc>, _: &Path, _: &TranslateConfig) -> TranslateResult<Value> {
        Ok(Value::Timestamp(*pojo))
    }
}

pub struct BlobCodec;

impl ValueCodec<Blob> for BlobCodec {
    fn load_value(&self, value: &Value, path: &Path, _: &TranslateConfig) -> TranslateResult<Blob> {
        match value {
            Value::Blob(b) => Ok(b.clone()),
            other => Err(mismatch(path, "blob", other)),
        }
    }

    fn save_value(&self, pojo: &Blob, _: &Path, _: &TranslateConfig) -> TranslateResult<Value> {
        Ok(Value::Blob(pojo.clone()))
    }
}

pub struct RawKeyCodec;

impl ValueCodec<RawKey> for RawKeyCodec {
    fn load_value(&self, value: &Value, path: &Path, _: &TranslateConfig) -> TranslateResult<RawKey> {
        match value {
            Value::Key(k) => Ok(k.clone()),
            other => Err(mismatch(path, "key", other)),
        }
    }

    fn save_value(&self, pojo: &RawKey, _: &Path, _: &TranslateConfig) -> TranslateResult<Value> {
        Ok(Value::Key(pojo.clone()))
    }
}

impl<T> ValueCodec<Key<T>> for RawKeyCodec {
    fn load_value(&self, value: &Value, path: &Path, config: &TranslateConfig) -> TranslateResult<Key<T>> {
        let raw = <Self as ValueCodec<RawKey>>::load_value(self, value, path, config)?;
        Ok(Key::from_raw(raw))
    }

    fn save_value(&self, pojo: &Key<T>, _: &Path, _: &TranslateConfig) -> TranslateResult<Value> {
        Ok(Value::Key(pojo.raw().clone()))
    }
}

/// Raw sub-records, carried as opaque values.
pub struct RecordCodec;

impl ValueCodec<Record> for RecordCodec {
    fn load_value(&self, value: &Value, path: &Path, _: &TranslateConfig) -> TranslateResult<Record> {
        match value {
            Value::Record(r) => Ok(r.as_ref().clone()),
            other => Err(mismatch(path, "record", other)),
        }
    }

    fn save_value(&self, pojo: &Record, _: &Path, _: &TranslateConfig) -> TranslateResult<Value> {
        Ok(Value::Record(Box::new(pojo.clone())))
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// A fieldless enum stored by symbolic name.
pub trait EnumName: Sized + Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn from_name(name: &str) -> Option<Self>;
}

pub struct EnumCodec<E>(PhantomData<fn() -> E>);

impl<E> EnumCodec<E> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<E> Default for EnumCodec<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: EnumName> ValueCodec<E> for EnumCodec<E> {
    fn load_value(&self, value: &Value, path: &Path, _: &TranslateConfig) -> TranslateResult<E> {
        match value {
            Value::String(name) => {
                E::from_name(name).ok_or_else(|| TranslateError::UnknownEnumName {
                    path: path.to_string(),
                    name: name.clone(),
                })
            }
            other => Err(mismatch(path, "enum name", other)),
        }
    }

    fn save_value(&self, pojo: &E, _: &Path, _: &TranslateConfig) -> TranslateResult<Value> {
        Ok(Value::String(pojo.name().to_string()))
    }
}

/// Built-in translator for an [`EnumName`] type. Used by `persist!(enum T)`.
pub fn enum_translator<E: EnumName>() -> TranslateResult<Arc<dyn Translator<E>>> {
    Ok(Arc::new(LeafTranslator::<E, _>::new(EnumCodec::<E>::new())))
}

// ---------------------------------------------------------------------------
// Serialized fields
// ---------------------------------------------------------------------------

/// Any serde type stored as a JSON blob. Blobs are never indexed.
pub struct SerializedCodec<F>(PhantomData<fn() -> F>);

impl<F> SerializedCodec<F> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<F> Default for SerializedCodec<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F> ValueCodec<F> for SerializedCodec<F>
where
    F: Serialize + DeserializeOwned,
{
    fn load_value(&self, value: &Value, path: &Path, _: &TranslateConfig) -> TranslateResult<F> {
        match value {
            Value::Blob(blob) => serde_json::from_slice(blob.as_bytes())
                .map_err(|e| invalid(path, format!("corrupt serialized value: {e}"))),
            other => Err(mismatch(path, "blob", other)),
        }
    }

    fn save_value(&self, pojo: &F, path: &Path, _: &TranslateConfig) -> TranslateResult<Value> {
        serde_json::to_vec(pojo)
            .map(|bytes| Value::Blob(Blob::new(bytes)))
            .map_err(|e| TranslateError::Serialization {
                path: path.to_string(),
                message: e.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Built-in scalar types
// ---------------------------------------------------------------------------

macro_rules! scalar {
    ($ty:ty => $codec:expr) => {
        impl Persist for $ty {
            const SHAPE: Shape = Shape::Scalar;

            fn create(
                _cx: &mut CreateContext<'_>,
                _key: &TypeKey,
                _path: &Path,
            ) -> TranslateResult<Arc<dyn Translator<Self>>> {
                Ok(Arc::new(LeafTranslator::<Self, _>::new($codec)))
            }
        }
    };
}

scalar!(String => StringCodec);
scalar!(bool => BoolCodec);
scalar!(i8 => IntegerCodec::<i8>::new());
scalar!(i16 => IntegerCodec::<i16>::new());
scalar!(i32 => IntegerCodec::<i32>::new());
scalar!(i64 => IntegerCodec::<i64>::new());
scalar!(u8 => IntegerCodec::<u8>::new());
scalar!(u16 => IntegerCodec::<u16>::new());
scalar!(u32 => IntegerCodec::<u32>::new());
scalar!(u64 => IntegerCodec::<u64>::new());
scalar!(f32 => F32Codec);
scalar!(f64 => F64Codec);
scalar!(DateTime<Utc> => TimestampCodec);
scalar!(Blob => BlobCodec);
scalar!(RawKey => RawKeyCodec);
scalar!(Record => RecordCodec);

impl<T: 'static> Persist for Key<T> {
    const SHAPE: Shape = Shape::Scalar;

    fn create(
        _cx: &mut CreateContext<'_>,
        _key: &TypeKey,
        _path: &Path,
    ) -> TranslateResult<Arc<dyn Translator<Self>>> {
        Ok(Arc::new(LeafTranslator::<Self, _>::new(RawKeyCodec)))
    }
}
