//! Value factory
//!
//! Host → guest: [`HostValue`] trees are checked for cycles before anything
//! is allocated in the guest, then built in one pass.
//!
//! Guest → host: [`FromGuest`] conversions run against a [`Conversion`] that
//! owns every intermediate handle created while descending into arrays and
//! objects. The result comes back as a [`Converted`] box that releases those
//! handles when it is dropped.

use crate::callbacks::HostFunction;
use crate::context::ExecutionContext;
use crate::error::{BridgeError, Result};
use crate::exception::{self, GuestResultExt};
use crate::handle::{ValueHandle, ValueType};
use rquickjs::{Ctx, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Shared, mutable host array. Sharing is what makes cycles possible.
pub type HostList = Rc<RefCell<Vec<HostValue>>>;

/// Shared, mutable host dictionary with insertion-ordered keys.
pub type HostMap = Rc<RefCell<Vec<(String, HostValue)>>>;

/// Deepest structure either direction will walk.
const MAX_DEPTH: usize = 64;

/// Host-native value that can be marshaled into the guest.
#[derive(Clone)]
pub enum HostValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    BigInt(i64),
    String(String),
    /// Becomes an `ArrayBuffer`.
    Bytes(Vec<u8>),
    Array(HostList),
    Object(HostMap),
    /// Milliseconds since the epoch.
    Date(f64),
    Function(HostFunction),
    Error {
        name: String,
        message: String,
    },
    /// A value that already lives in the guest.
    Handle(Rc<ValueHandle>),
}

impl HostValue {
    pub fn list(items: impl IntoIterator<Item = HostValue>) -> Self {
        HostValue::Array(Rc::new(RefCell::new(items.into_iter().collect())))
    }

    pub fn object<K: Into<String>>(entries: impl IntoIterator<Item = (K, HostValue)>) -> Self {
        HostValue::Object(Rc::new(RefCell::new(
            entries.into_iter().map(|(key, value)| (key.into(), value)).collect(),
        )))
    }

    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        HostValue::Error {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn function<F>(callback: F) -> Self
    where
        F: Fn(&crate::CallFrame<'_>) -> std::result::Result<ValueHandle, crate::HostError> + 'static,
    {
        HostValue::Function(Rc::new(callback))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, HostValue::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, HostValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HostValue::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(value) => Some(value),
            _ => None,
        }
    }

    /// Value stored under `key` of an `Object`.
    pub fn field(&self, key: &str) -> Option<HostValue> {
        match self {
            HostValue::Object(map) => map
                .borrow()
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, value)| value.clone()),
            _ => None,
        }
    }

    /// Element `index` of an `Array`.
    pub fn item(&self, index: usize) -> Option<HostValue> {
        match self {
            HostValue::Array(list) => list.borrow().get(index).cloned(),
            _ => None,
        }
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Undefined => write!(f, "Undefined"),
            HostValue::Null => write!(f, "Null"),
            HostValue::Bool(value) => f.debug_tuple("Bool").field(value).finish(),
            HostValue::Number(value) => f.debug_tuple("Number").field(value).finish(),
            HostValue::BigInt(value) => f.debug_tuple("BigInt").field(value).finish(),
            HostValue::String(value) => f.debug_tuple("String").field(value).finish(),
            HostValue::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            HostValue::Array(list) => match list.try_borrow() {
                Ok(items) => write!(f, "Array({} items)", items.len()),
                Err(_) => write!(f, "Array(<borrowed>)"),
            },
            HostValue::Object(map) => match map.try_borrow() {
                Ok(entries) => f
                    .debug_tuple("Object")
                    .field(&entries.iter().map(|(key, _)| key.as_str()).collect::<Vec<_>>())
                    .finish(),
                Err(_) => write!(f, "Object(<borrowed>)"),
            },
            HostValue::Date(millis) => f.debug_tuple("Date").field(millis).finish(),
            HostValue::Function(_) => write!(f, "Function"),
            HostValue::Error { name, message } => write!(f, "Error({name}: {message})"),
            HostValue::Handle(handle) => f.debug_tuple("Handle").field(&handle.raw()).finish(),
        }
    }
}

impl From<bool> for HostValue {
    fn from(value: bool) -> Self {
        HostValue::Bool(value)
    }
}

macro_rules! number_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for HostValue {
                fn from(value: $ty) -> Self {
                    HostValue::Number(value as f64)
                }
            }
        )*
    };
}

number_from!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64);

impl From<&str> for HostValue {
    fn from(value: &str) -> Self {
        HostValue::String(value.to_string())
    }
}

impl From<String> for HostValue {
    fn from(value: String) -> Self {
        HostValue::String(value)
    }
}

impl From<Vec<u8>> for HostValue {
    fn from(bytes: Vec<u8>) -> Self {
        HostValue::Bytes(bytes)
    }
}

impl From<Vec<HostValue>> for HostValue {
    fn from(items: Vec<HostValue>) -> Self {
        HostValue::list(items)
    }
}

impl From<ValueHandle> for HostValue {
    fn from(handle: ValueHandle) -> Self {
        HostValue::Handle(Rc::new(handle))
    }
}

impl From<SystemTime> for HostValue {
    fn from(time: SystemTime) -> Self {
        let millis = match time.duration_since(UNIX_EPOCH) {
            Ok(after) => after.as_secs_f64() * 1000.0,
            Err(before) => -before.duration().as_secs_f64() * 1000.0,
        };
        HostValue::Date(millis)
    }
}

impl<T: Into<HostValue>> From<Option<T>> for HostValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(HostValue::Null, Into::into)
    }
}

impl From<serde_json::Value> for HostValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => HostValue::Null,
            serde_json::Value::Bool(flag) => HostValue::Bool(flag),
            serde_json::Value::Number(number) => HostValue::Number(number.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(text) => HostValue::String(text),
            serde_json::Value::Array(items) => HostValue::list(items.into_iter().map(HostValue::from)),
            serde_json::Value::Object(entries) => {
                HostValue::object(entries.into_iter().map(|(key, value)| (key, HostValue::from(value))))
            }
        }
    }
}

/// Fail fast on self-referencing arrays and objects. Only the current path
/// is tracked, so shared but acyclic substructures are fine.
fn check_cycles(value: &HostValue, path: &mut Vec<*const ()>) -> Result<()> {
    let (identity, children): (*const (), Vec<HostValue>) = match value {
        HostValue::Array(list) => (Rc::as_ptr(list).cast(), list.borrow().clone()),
        HostValue::Object(map) => (
            Rc::as_ptr(map).cast(),
            map.borrow().iter().map(|(_, value)| value.clone()).collect(),
        ),
        _ => return Ok(()),
    };

    if path.contains(&identity) {
        return Err(BridgeError::marshaling(format!(
            "host value contains a cycle at depth {}",
            path.len()
        )));
    }
    if path.len() >= MAX_DEPTH {
        return Err(BridgeError::marshaling(format!(
            "host value nests deeper than {MAX_DEPTH} levels"
        )));
    }

    path.push(identity);
    for child in &children {
        check_cycles(child, path)?;
    }
    path.pop();
    Ok(())
}

impl ExecutionContext {
    /// Marshal a host value into the guest.
    ///
    /// A `HostValue::Handle` that is not shared elsewhere is returned as is;
    /// a shared one is duplicated.
    pub fn to_guest(&self, value: HostValue) -> Result<ValueHandle> {
        if let HostValue::Handle(handle) = value {
            self.same_context(&handle)?;
            return match Rc::try_unwrap(handle) {
                Ok(handle) => Ok(handle),
                Err(shared) => shared.dup(),
            };
        }

        check_cycles(&value, &mut Vec::new())?;
        self.enter(|ctx| {
            let built = self.build(ctx, &value)?;
            self.adopt(ctx, built)
        })
    }

    fn build<'js>(&self, ctx: &Ctx<'js>, value: &HostValue) -> Result<Value<'js>> {
        Ok(match value {
            HostValue::Undefined => Value::new_undefined(ctx.clone()),
            HostValue::Null => Value::new_null(ctx.clone()),
            HostValue::Bool(flag) => Value::new_bool(ctx.clone(), *flag),
            HostValue::Number(number) => Value::new_number(ctx.clone(), *number),
            HostValue::BigInt(number) => rquickjs::BigInt::from_i64(ctx.clone(), *number)?.into_value(),
            HostValue::String(text) => rquickjs::String::from_str(ctx.clone(), text)?.into_value(),
            HostValue::Bytes(bytes) => {
                rquickjs::ArrayBuffer::new_copy(ctx.clone(), bytes.as_slice())?.into_value()
            }
            HostValue::Array(list) => {
                let array = rquickjs::Array::new(ctx.clone())?;
                for (index, item) in list.borrow().iter().enumerate() {
                    array.set(index, self.build(ctx, item)?)?;
                }
                array.into_value()
            }
            HostValue::Object(map) => {
                let object = rquickjs::Object::new(ctx.clone())?;
                for (key, item) in map.borrow().iter() {
                    object.set(key.as_str(), self.build(ctx, item)?)?;
                }
                object.into_value()
            }
            HostValue::Date(millis) => {
                let make = self.intrinsic(ctx, "makeDate")?;
                make.call::<_, Value>((*millis,)).or_guest(self, ctx)?
            }
            HostValue::Function(callback) => self.function_value(ctx, "", callback.clone())?,
            HostValue::Error { name, message } => exception::new_error(self, ctx, name, message)?,
            HostValue::Handle(handle) => {
                self.same_context(handle)?;
                handle.value(ctx)?
            }
        })
    }

    /// Convert a guest value into a host type.
    pub fn convert<T: FromGuest>(&self, handle: &ValueHandle) -> Result<Converted<T>> {
        self.same_context(handle)?;
        let mut conversion = Conversion::default();
        let value = T::from_guest(handle, &mut conversion)?;
        Ok(Converted {
            value,
            intermediates: conversion.intermediates,
        })
    }
}

/// Bookkeeping for one guest → host conversion.
#[derive(Default)]
pub struct Conversion {
    intermediates: Vec<ValueHandle>,
    depth: usize,
}

impl Conversion {
    /// Keep an intermediate handle alive until the conversion result is
    /// dropped.
    pub fn hold(&mut self, handle: ValueHandle) {
        self.intermediates.push(handle);
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    fn descend<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.depth >= MAX_DEPTH {
            return Err(BridgeError::marshaling(format!(
                "guest value nests deeper than {MAX_DEPTH} levels"
            )));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn child<T: FromGuest>(&mut self, child: ValueHandle) -> Result<T> {
        let value = self.descend(|conversion| T::from_guest(&child, conversion))?;
        self.hold(child);
        Ok(value)
    }
}

/// Conversion result owning the intermediate handles it needed.
pub struct Converted<T> {
    value: T,
    intermediates: Vec<ValueHandle>,
}

impl<T> Converted<T> {
    /// Release the intermediates and keep the value.
    pub fn into_inner(self) -> T {
        drop(self.intermediates);
        self.value
    }

    pub fn intermediate_count(&self) -> usize {
        self.intermediates.len()
    }
}

impl<T> Deref for Converted<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: fmt::Debug> fmt::Debug for Converted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Converted")
            .field("value", &self.value)
            .field("intermediates", &self.intermediates.len())
            .finish()
    }
}

/// Host types that can be read out of a guest value.
pub trait FromGuest: Sized {
    fn from_guest(handle: &ValueHandle, conversion: &mut Conversion) -> Result<Self>;
}

fn expect_type(handle: &ValueHandle, expected: ValueType) -> Result<()> {
    let actual = handle.value_type()?;
    if actual == expected {
        Ok(())
    } else {
        Err(BridgeError::marshaling(format!(
            "expected {expected:?}, found {actual:?}"
        )))
    }
}

impl FromGuest for bool {
    fn from_guest(handle: &ValueHandle, _: &mut Conversion) -> Result<Self> {
        expect_type(handle, ValueType::Boolean)?;
        handle.to_boolean()
    }
}

impl FromGuest for f64 {
    fn from_guest(handle: &ValueHandle, _: &mut Conversion) -> Result<Self> {
        expect_type(handle, ValueType::Number)?;
        handle.to_number()
    }
}

impl FromGuest for f32 {
    fn from_guest(handle: &ValueHandle, conversion: &mut Conversion) -> Result<Self> {
        Ok(f64::from_guest(handle, conversion)? as f32)
    }
}

macro_rules! integer_from_guest {
    ($($ty:ty),*) => {
        $(
            impl FromGuest for $ty {
                fn from_guest(handle: &ValueHandle, conversion: &mut Conversion) -> Result<Self> {
                    let number = f64::from_guest(handle, conversion)?;
                    // `MAX as f64` rounds up to 2^63 or 2^64 for the wide
                    // types, so the upper bound is exclusive of `MAX + 1`.
                    if number.is_finite()
                        && number.fract() == 0.0
                        && number >= <$ty>::MIN as f64
                        && number < <$ty>::MAX as f64 + 1.0
                    {
                        Ok(number as $ty)
                    } else {
                        Err(BridgeError::marshaling(format!(
                            "{number} does not fit in {}",
                            stringify!($ty)
                        )))
                    }
                }
            }
        )*
    };
}

integer_from_guest!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

impl FromGuest for String {
    fn from_guest(handle: &ValueHandle, _: &mut Conversion) -> Result<Self> {
        expect_type(handle, ValueType::String)?;
        handle.to_string()
    }
}

impl<T: FromGuest> FromGuest for Option<T> {
    fn from_guest(handle: &ValueHandle, conversion: &mut Conversion) -> Result<Self> {
        if handle.is_undefined()? || handle.is_null()? {
            Ok(None)
        } else {
            T::from_guest(handle, conversion).map(Some)
        }
    }
}

impl<T: FromGuest> FromGuest for Vec<T> {
    fn from_guest(handle: &ValueHandle, conversion: &mut Conversion) -> Result<Self> {
        if !handle.is_array()? {
            return Err(BridgeError::marshaling("expected an array"));
        }
        let length = handle.length()?;
        let mut items = Vec::with_capacity(length);
        for index in 0..length {
            let child = handle.get(index as u32)?;
            items.push(conversion.child(child)?);
        }
        Ok(items)
    }
}

impl<T: FromGuest> FromGuest for HashMap<String, T> {
    fn from_guest(handle: &ValueHandle, conversion: &mut Conversion) -> Result<Self> {
        if !handle.is_object()? {
            return Err(BridgeError::marshaling("expected an object"));
        }
        let mut entries = HashMap::new();
        for key in handle.keys()? {
            let child = handle.get(&key)?;
            entries.insert(key, conversion.child(child)?);
        }
        Ok(entries)
    }
}

impl FromGuest for ValueHandle {
    fn from_guest(handle: &ValueHandle, _: &mut Conversion) -> Result<Self> {
        handle.dup()
    }
}

impl FromGuest for serde_json::Value {
    fn from_guest(handle: &ValueHandle, _: &mut Conversion) -> Result<Self> {
        let json = handle.to_json(None)?;
        serde_json::from_str(&json).map_err(|error| BridgeError::marshaling(error.to_string()))
    }
}

impl FromGuest for HostValue {
    fn from_guest(handle: &ValueHandle, conversion: &mut Conversion) -> Result<Self> {
        Ok(match handle.value_type()? {
            ValueType::Undefined => HostValue::Undefined,
            ValueType::Boolean => HostValue::Bool(handle.to_boolean()?),
            ValueType::Number => HostValue::Number(handle.to_number()?),
            ValueType::String => HostValue::String(handle.to_string()?),
            ValueType::BigInt => HostValue::BigInt(handle.to_bigint()?),
            ValueType::Symbol | ValueType::Function => HostValue::from(handle.dup()?),
            ValueType::Object if handle.is_null()? => HostValue::Null,
            ValueType::Object if handle.is_array()? => {
                HostValue::list(Vec::<HostValue>::from_guest(handle, conversion)?)
            }
            ValueType::Object if handle.is_date()? => HostValue::Date(handle.date_value()?),
            ValueType::Object if handle.is_buffer()? => HostValue::Bytes(handle.bytes()?),
            ValueType::Object if handle.is_error()? => {
                let details = handle.context().error_details(handle)?;
                HostValue::Error {
                    name: details.name,
                    message: details.message,
                }
            }
            ValueType::Object if handle.is_promise()? => HostValue::from(handle.dup()?),
            ValueType::Object => {
                let mut entries = Vec::new();
                for key in handle.keys()? {
                    let child = handle.get(&key)?;
                    let value: HostValue = conversion.child(child)?;
                    entries.push((key, value));
                }
                HostValue::object(entries)
            }
        })
    }
}

/// Raw bytes of an `ArrayBuffer` or typed array.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bytes(pub Vec<u8>);

impl Deref for Bytes {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.0
    }
}

impl FromGuest for Bytes {
    fn from_guest(handle: &ValueHandle, _: &mut Conversion) -> Result<Self> {
        handle.bytes().map(Bytes)
    }
}

/// Host-side delegate for a guest function.
#[derive(Debug)]
pub struct GuestFunction {
    function: ValueHandle,
}

impl GuestFunction {
    pub fn handle(&self) -> &ValueHandle {
        &self.function
    }

    /// Box `args`, call the function with an undefined `this` and return the
    /// result. Argument handles are released before returning, whether or
    /// not the call succeeded.
    pub fn call(&self, args: impl IntoIterator<Item = HostValue>) -> Result<ValueHandle> {
        let context = self.function.context();
        let boxed = args
            .into_iter()
            .map(|arg| context.to_guest(arg))
            .collect::<Result<Vec<_>>>()?;
        let refs: Vec<&ValueHandle> = boxed.iter().collect();
        context.invoke(&self.function, None, &refs)
    }

    /// Call and unbox the result.
    pub fn call_as<T: FromGuest>(&self, args: impl IntoIterator<Item = HostValue>) -> Result<T> {
        let result = self.call(args)?;
        let converted = self.function.context().convert::<T>(&result)?;
        Ok(converted.into_inner())
    }
}

impl FromGuest for GuestFunction {
    fn from_guest(handle: &ValueHandle, _: &mut Conversion) -> Result<Self> {
        if !handle.is_function()? {
            return Err(BridgeError::marshaling("expected a function"));
        }
        Ok(GuestFunction {
            function: handle.dup()?,
        })
    }
}
