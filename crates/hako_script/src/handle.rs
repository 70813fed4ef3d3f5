//! Lifecycle-tagged handles over guest values
//!
//! A `ValueHandle` pairs a raw reference with its owning context. Owned
//! handles hold one engine reference and release it exactly once, either
//! through `dispose` or on drop. Borrowed handles alias a value owned
//! elsewhere (or a guest singleton) and never release anything.

use crate::context::ExecutionContext;
use crate::error::{BridgeError, Result};
use crate::exception::GuestResultExt;
use crate::factory::{Converted, FromGuest};
use crate::ffi::RawRef;
use hako_memory::Address;
use rquickjs::{BigInt, Coerced, Ctx, Function, Object, Value};
use std::cell::Cell;
use std::fmt;

/// Whether disposal releases the guest reference.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    Owned,
    Borrowed,
}

/// Guest `typeof` categories. `null` is reported as `Object`; use
/// [`ValueHandle::is_null`] to tell it apart.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ValueType {
    Undefined,
    Object,
    Boolean,
    Number,
    String,
    Symbol,
    Function,
    BigInt,
}

/// Equality flavours. They differ only in how `NaN` and `±0` compare.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EqualityOp {
    /// `===`: `NaN != NaN`, `+0 == -0`
    Strict,
    /// `Object.is`: `NaN == NaN`, `+0 != -0`
    SameValue,
    /// `NaN == NaN`, `+0 == -0`
    SameValueZero,
}

impl EqualityOp {
    fn intrinsic(self) -> &'static str {
        match self {
            EqualityOp::Strict => "strictEq",
            EqualityOp::SameValue => "sameValue",
            EqualityOp::SameValueZero => "sameValueZero",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TypedArrayKind {
    Int8,
    Uint8,
    Uint8Clamped,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Float64,
    BigInt64,
    BigUint64,
}

impl TypedArrayKind {
    fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "Int8Array" => TypedArrayKind::Int8,
            "Uint8Array" => TypedArrayKind::Uint8,
            "Uint8ClampedArray" => TypedArrayKind::Uint8Clamped,
            "Int16Array" => TypedArrayKind::Int16,
            "Uint16Array" => TypedArrayKind::Uint16,
            "Int32Array" => TypedArrayKind::Int32,
            "Uint32Array" => TypedArrayKind::Uint32,
            "Float32Array" => TypedArrayKind::Float32,
            "Float64Array" => TypedArrayKind::Float64,
            "BigInt64Array" => TypedArrayKind::BigInt64,
            "BigUint64Array" => TypedArrayKind::BigUint64,
            _ => return None,
        })
    }

    pub fn element_size(self) -> usize {
        match self {
            TypedArrayKind::Int8 | TypedArrayKind::Uint8 | TypedArrayKind::Uint8Clamped => 1,
            TypedArrayKind::Int16 | TypedArrayKind::Uint16 => 2,
            TypedArrayKind::Int32 | TypedArrayKind::Uint32 | TypedArrayKind::Float32 => 4,
            TypedArrayKind::Float64 | TypedArrayKind::BigInt64 | TypedArrayKind::BigUint64 => 8,
        }
    }
}

/// Property key: a string name, an integer index, or another guest value
/// (typically a symbol).
#[derive(Copy, Clone)]
pub enum PropertyKey<'a> {
    Name(&'a str),
    Index(u32),
    Value(&'a ValueHandle),
}

impl<'a> From<&'a str> for PropertyKey<'a> {
    fn from(name: &'a str) -> Self {
        PropertyKey::Name(name)
    }
}

impl<'a> From<&'a String> for PropertyKey<'a> {
    fn from(name: &'a String) -> Self {
        PropertyKey::Name(name.as_str())
    }
}

impl From<u32> for PropertyKey<'_> {
    fn from(index: u32) -> Self {
        PropertyKey::Index(index)
    }
}

impl<'a> From<&'a ValueHandle> for PropertyKey<'a> {
    fn from(handle: &'a ValueHandle) -> Self {
        PropertyKey::Value(handle)
    }
}

impl PropertyKey<'_> {
    fn to_value<'js>(self, context: &ExecutionContext, ctx: &Ctx<'js>) -> Result<Value<'js>> {
        Ok(match self {
            PropertyKey::Name(name) => rquickjs::String::from_str(ctx.clone(), name)?.into_value(),
            PropertyKey::Index(index) => Value::new_number(ctx.clone(), index as f64),
            PropertyKey::Value(handle) => {
                context.same_context(handle)?;
                handle.value(ctx)?
            }
        })
    }
}

/// Property definition for [`ValueHandle::define_property`].
#[derive(Clone, Copy, Default)]
pub struct PropertyDescriptor<'a> {
    value: Option<&'a ValueHandle>,
    getter: Option<&'a ValueHandle>,
    setter: Option<&'a ValueHandle>,
    writable: bool,
    enumerable: bool,
    configurable: bool,
}

impl<'a> PropertyDescriptor<'a> {
    pub fn value(value: &'a ValueHandle) -> Self {
        Self {
            value: Some(value),
            ..Self::default()
        }
    }

    pub fn accessor(getter: Option<&'a ValueHandle>, setter: Option<&'a ValueHandle>) -> Self {
        Self {
            getter,
            setter,
            ..Self::default()
        }
    }

    pub fn writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    pub fn enumerable(mut self, enumerable: bool) -> Self {
        self.enumerable = enumerable;
        self
    }

    pub fn configurable(mut self, configurable: bool) -> Self {
        self.configurable = configurable;
        self
    }

    fn is_accessor(&self) -> bool {
        self.getter.is_some() || self.setter.is_some()
    }

    pub(crate) fn to_object<'js>(&self, context: &ExecutionContext, ctx: &Ctx<'js>) -> Result<Object<'js>> {
        let object = Object::new(ctx.clone())?;
        if self.is_accessor() {
            if let Some(getter) = self.getter {
                object.set("get", context.value_of(ctx, getter.raw())?)?;
            }
            if let Some(setter) = self.setter {
                object.set("set", context.value_of(ctx, setter.raw())?)?;
            }
        } else {
            if let Some(value) = self.value {
                object.set("value", context.value_of(ctx, value.raw())?)?;
            }
            object.set("writable", self.writable)?;
        }
        object.set("enumerable", self.enumerable)?;
        object.set("configurable", self.configurable)?;
        Ok(object)
    }
}

pub struct ValueHandle {
    context: ExecutionContext,
    raw: RawRef,
    lifecycle: Lifecycle,
    alive: Cell<bool>,
}

impl ValueHandle {
    pub(crate) fn owned(context: ExecutionContext, raw: RawRef) -> Self {
        Self {
            context,
            raw,
            lifecycle: Lifecycle::Owned,
            alive: Cell::new(true),
        }
    }

    pub(crate) fn borrowed(context: ExecutionContext, raw: RawRef) -> Self {
        Self {
            context,
            raw,
            lifecycle: Lifecycle::Borrowed,
            alive: Cell::new(true),
        }
    }

    pub fn raw(&self) -> RawRef {
        self.raw
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn is_alive(&self) -> bool {
        self.alive.get()
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.alive.get() {
            Ok(())
        } else {
            tracing::error!(raw = ?self.raw, "use of a released handle");
            Err(BridgeError::UseAfterRelease { raw: self.raw })
        }
    }

    /// Restore the guest value inside an entered scope.
    pub(crate) fn value<'js>(&self, ctx: &Ctx<'js>) -> Result<Value<'js>> {
        self.ensure_alive()?;
        self.context.value_of(ctx, self.raw)
    }

    /// Run `f` with the guest value inside an entered scope.
    pub(crate) fn with<R>(&self, f: impl for<'js> FnOnce(&Ctx<'js>, Value<'js>) -> Result<R>) -> Result<R> {
        self.ensure_alive()?;
        self.context.enter(|ctx| {
            let value = self.context.value_of(ctx, self.raw)?;
            f(ctx, value)
        })
    }

    fn call_intrinsic<R>(
        &self,
        name: &'static str,
        f: impl for<'js> FnOnce(&Ctx<'js>, Function<'js>, Value<'js>) -> rquickjs::Result<R>,
    ) -> Result<R> {
        self.with(|ctx, value| {
            let helper = self.context.intrinsic(ctx, name)?;
            f(ctx, helper, value).or_guest(&self.context, ctx)
        })
    }

    // ------------------------------------------------------------------
    // Classification
    // ------------------------------------------------------------------

    pub fn value_type(&self) -> Result<ValueType> {
        self.with(|_, value| {
            Ok(if value.is_undefined() {
                ValueType::Undefined
            } else if value.is_bool() {
                ValueType::Boolean
            } else if value.is_number() {
                ValueType::Number
            } else if value.is_string() {
                ValueType::String
            } else if value.is_symbol() {
                ValueType::Symbol
            } else if value.type_of() == rquickjs::Type::BigInt {
                ValueType::BigInt
            } else if value.is_function() {
                ValueType::Function
            } else {
                ValueType::Object
            })
        })
    }

    /// Guest `typeof` string.
    pub fn type_of(&self) -> Result<String> {
        self.call_intrinsic("typeOf", |_, f, value| f.call((value,)))
    }

    pub fn is_undefined(&self) -> Result<bool> {
        Ok(self.value_type()? == ValueType::Undefined)
    }

    pub fn is_null(&self) -> Result<bool> {
        self.with(|_, value| Ok(value.is_null()))
    }

    pub fn is_boolean(&self) -> Result<bool> {
        Ok(self.value_type()? == ValueType::Boolean)
    }

    pub fn is_number(&self) -> Result<bool> {
        Ok(self.value_type()? == ValueType::Number)
    }

    pub fn is_string(&self) -> Result<bool> {
        Ok(self.value_type()? == ValueType::String)
    }

    pub fn is_symbol(&self) -> Result<bool> {
        Ok(self.value_type()? == ValueType::Symbol)
    }

    pub fn is_bigint(&self) -> Result<bool> {
        Ok(self.value_type()? == ValueType::BigInt)
    }

    pub fn is_function(&self) -> Result<bool> {
        Ok(self.value_type()? == ValueType::Function)
    }

    /// True for non-null objects, functions included.
    pub fn is_object(&self) -> Result<bool> {
        self.with(|_, value| Ok(value.is_object() || value.is_function()))
    }

    pub fn is_array(&self) -> Result<bool> {
        self.with(|_, value| Ok(value.is_array()))
    }

    pub fn is_promise(&self) -> Result<bool> {
        self.call_intrinsic("isPromise", |_, f, value| f.call((value,)))
    }

    /// `ArrayBuffer` or any view over one.
    pub fn is_buffer(&self) -> Result<bool> {
        self.call_intrinsic("isBuffer", |_, f, value| f.call((value,)))
    }

    pub fn is_error(&self) -> Result<bool> {
        self.call_intrinsic("isError", |_, f, value| f.call((value,)))
    }

    pub fn is_date(&self) -> Result<bool> {
        self.call_intrinsic("isDate", |_, f, value| f.call((value,)))
    }

    pub fn typed_array_kind(&self) -> Result<Option<TypedArrayKind>> {
        let tag: Option<String> = self.call_intrinsic("typedKind", |_, f, value| f.call((value,)))?;
        Ok(tag.as_deref().and_then(TypedArrayKind::from_tag))
    }

    pub fn is_instance_of(&self, constructor: &ValueHandle) -> Result<bool> {
        self.context.same_context(constructor)?;
        self.with(|ctx, value| {
            let ctor = constructor.value(ctx)?;
            let helper = self.context.intrinsic(ctx, "instanceOf")?;
            helper.call((value, ctor)).or_guest(&self.context, ctx)
        })
    }

    // ------------------------------------------------------------------
    // Coercion
    // ------------------------------------------------------------------

    /// Guest `ToNumber`.
    pub fn to_number(&self) -> Result<f64> {
        self.with(|ctx, value| {
            let Coerced(number) = value.get::<Coerced<f64>>().or_guest(&self.context, ctx)?;
            Ok(number)
        })
    }

    /// Guest `ToBoolean`: falsy for undefined, null, false, ±0, NaN and "".
    pub fn to_boolean(&self) -> Result<bool> {
        self.with(|ctx, value| {
            let Coerced(truthy) = value.get::<Coerced<bool>>().or_guest(&self.context, ctx)?;
            Ok(truthy)
        })
    }

    /// Guest `ToString`.
    pub fn to_string(&self) -> Result<String> {
        self.with(|ctx, value| {
            let Coerced(text) = value.get::<Coerced<String>>().or_guest(&self.context, ctx)?;
            Ok(text)
        })
    }

    /// The value as a signed 64-bit integer. BigInts outside that range are
    /// refused rather than truncated.
    pub fn to_bigint(&self) -> Result<i64> {
        self.with(|ctx, value| {
            let bigint = value.get::<BigInt>().or_guest(&self.context, ctx)?;
            let fits = self.context.intrinsic(ctx, "fitsInt64")?;
            let fits: bool = fits.call((value.clone(),)).or_guest(&self.context, ctx)?;
            if !fits {
                return Err(BridgeError::marshaling("BigInt does not fit in 64 bits"));
            }
            bigint.to_i64().or_guest(&self.context, ctx)
        })
    }

    pub fn to_json(&self, indent: Option<u32>) -> Result<String> {
        let json: Option<String> =
            self.call_intrinsic("toJson", |_, f, value| f.call((value, indent.unwrap_or(0))))?;
        json.ok_or_else(|| BridgeError::marshaling("value has no JSON representation"))
    }

    /// Milliseconds since the epoch of a guest `Date`.
    pub fn date_value(&self) -> Result<f64> {
        self.call_intrinsic("dateValue", |_, f, value| f.call((value,)))
    }

    /// Copy the bytes out of an `ArrayBuffer` or typed array.
    pub fn bytes(&self) -> Result<Vec<u8>> {
        if !self.is_buffer()? {
            return Err(BridgeError::marshaling("value is not an ArrayBuffer or typed array"));
        }
        self.with(|ctx, value| {
            let helper = self.context.intrinsic(ctx, "bytes")?;
            let copy: rquickjs::ArrayBuffer = helper.call((value,)).or_guest(&self.context, ctx)?;
            copy.as_bytes()
                .map(<[u8]>::to_vec)
                .ok_or_else(|| BridgeError::marshaling("array buffer is detached"))
        })
    }

    /// Copy the bytes of an `ArrayBuffer` or typed array into a fresh block
    /// of linear memory. The caller owns the block and frees it through
    /// [`Runtime::with_memory`](crate::Runtime::with_memory).
    pub fn copy_bytes_to_memory(&self) -> Result<(Address, usize)> {
        let bytes = self.bytes()?;
        let addr = self.context.with_memory(|memory| memory.allocate_bytes(&bytes))?;
        Ok((addr, bytes.len()))
    }

    pub fn symbol_description(&self) -> Result<Option<String>> {
        if !self.is_symbol()? {
            return Err(BridgeError::marshaling("value is not a symbol"));
        }
        self.call_intrinsic("symbolDescription", |_, f, value| f.call((value,)))
    }

    pub fn is_global_symbol(&self) -> Result<bool> {
        if !self.is_symbol()? {
            return Ok(false);
        }
        self.call_intrinsic("isGlobalSymbol", |_, f, value| f.call((value,)))
    }

    // ------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------

    pub fn get<'k>(&self, key: impl Into<PropertyKey<'k>>) -> Result<ValueHandle> {
        let key = key.into();
        self.with(|ctx, value| {
            let key = key.to_value(&self.context, ctx)?;
            let helper = self.context.intrinsic(ctx, "getProp")?;
            let result: Value = helper.call((value, key)).or_guest(&self.context, ctx)?;
            self.context.adopt(ctx, result)
        })
    }

    pub fn set<'k>(&self, key: impl Into<PropertyKey<'k>>, item: &ValueHandle) -> Result<()> {
        self.context.same_context(item)?;
        let key = key.into();
        self.with(|ctx, value| {
            let key = key.to_value(&self.context, ctx)?;
            let item = item.value(ctx)?;
            let helper = self.context.intrinsic(ctx, "setProp")?;
            helper.call::<_, ()>((value, key, item)).or_guest(&self.context, ctx)
        })
    }

    pub fn has_property<'k>(&self, key: impl Into<PropertyKey<'k>>) -> Result<bool> {
        let key = key.into();
        self.with(|ctx, value| {
            let key = key.to_value(&self.context, ctx)?;
            let helper = self.context.intrinsic(ctx, "hasProp")?;
            helper.call((value, key)).or_guest(&self.context, ctx)
        })
    }

    pub fn delete_property<'k>(&self, key: impl Into<PropertyKey<'k>>) -> Result<bool> {
        let key = key.into();
        self.with(|ctx, value| {
            let key = key.to_value(&self.context, ctx)?;
            let helper = self.context.intrinsic(ctx, "deleteProp")?;
            helper.call((value, key)).or_guest(&self.context, ctx)
        })
    }

    pub fn define_property<'k>(
        &self,
        key: impl Into<PropertyKey<'k>>,
        descriptor: PropertyDescriptor<'_>,
    ) -> Result<()> {
        let key = key.into();
        self.with(|ctx, value| {
            let key = key.to_value(&self.context, ctx)?;
            let descriptor = descriptor.to_object(&self.context, ctx)?;
            let helper = self.context.intrinsic(ctx, "defineProp")?;
            helper
                .call::<_, ()>((value, key, descriptor))
                .or_guest(&self.context, ctx)
        })
    }

    /// Own string-keyed property names, enumerable or not.
    pub fn own_property_names(&self) -> Result<Vec<String>> {
        self.call_intrinsic("ownNames", |_, f, value| f.call((value,)))
    }

    /// Own enumerable string keys (`Object.keys`).
    pub fn keys(&self) -> Result<Vec<String>> {
        self.call_intrinsic("ownKeys", |_, f, value| f.call((value,)))
    }

    /// The `length` property coerced to an integer.
    pub fn length(&self) -> Result<usize> {
        let length = self.get("length")?.to_number()?;
        if length.is_finite() && length >= 0.0 {
            Ok(length as usize)
        } else {
            Ok(0)
        }
    }

    // ------------------------------------------------------------------
    // Identity and lifecycle
    // ------------------------------------------------------------------

    pub fn equals(&self, other: &ValueHandle, op: EqualityOp) -> Result<bool> {
        self.context.same_context(other)?;
        self.with(|ctx, value| {
            let other = other.value(ctx)?;
            let helper = self.context.intrinsic(ctx, op.intrinsic())?;
            helper.call((value, other)).or_guest(&self.context, ctx)
        })
    }

    /// New Owned handle to the same value, or a borrowed copy of a singleton.
    pub fn dup(&self) -> Result<ValueHandle> {
        self.ensure_alive()?;
        if self.raw.is_singleton() {
            return Ok(ValueHandle::borrowed(self.context.clone(), self.raw));
        }
        self.context.duplicate(self.raw)
    }

    /// Non-owning alias. It stays valid only while the value it aliases is
    /// held by some Owned handle.
    pub fn borrow(&self) -> Result<ValueHandle> {
        self.ensure_alive()?;
        Ok(ValueHandle::borrowed(self.context.clone(), self.raw))
    }

    pub fn convert<T: FromGuest>(&self) -> Result<Converted<T>> {
        self.context.convert(self)
    }

    /// Release the guest reference. Idempotent; Borrowed handles never
    /// release.
    pub fn dispose(&self) {
        if !self.alive.replace(false) {
            return;
        }
        if self.lifecycle == Lifecycle::Owned {
            self.context.release(self.raw);
        }
    }
}

impl Drop for ValueHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for ValueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueHandle")
            .field("context", &self.context.id())
            .field("raw", &self.raw)
            .field("lifecycle", &self.lifecycle)
            .field("alive", &self.alive.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Runtime;

    #[test]
    fn singletons_are_borrowed() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let before = context.live_handle_count();

        let undefined = context.undefined();
        let truthy = context.boolean(true);
        assert_eq!(undefined.lifecycle(), Lifecycle::Borrowed);
        assert_eq!(truthy.raw(), RawRef::TRUE);
        assert_eq!(context.live_handle_count(), before);

        undefined.dispose();
        assert_eq!(context.live_handle_count(), before);
    }

    #[test]
    fn null_is_an_object_with_its_own_predicate() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let null = context.null();
        assert_eq!(null.value_type().unwrap(), ValueType::Object);
        assert!(null.is_null().unwrap());
        assert!(!null.is_object().unwrap());
    }

    #[test]
    fn falsy_set_follows_guest_rules() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        for source in ["undefined", "null", "false", "0", "-0", "NaN", "''"] {
            let value = context.eval(source).unwrap();
            assert!(!value.to_boolean().unwrap(), "{source} should be falsy");
        }
        for source in ["'0'", "[]", "({})", "1n", "-1"] {
            let value = context.eval(source).unwrap();
            assert!(value.to_boolean().unwrap(), "{source} should be truthy");
        }
    }

    #[test]
    fn equality_flavours_differ_on_nan_and_signed_zero() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let nan = context.new_number(f64::NAN).unwrap();
        let other_nan = context.new_number(f64::NAN).unwrap();
        let zero = context.new_number(0.0).unwrap();
        let negative_zero = context.new_number(-0.0).unwrap();

        assert!(!nan.equals(&other_nan, EqualityOp::Strict).unwrap());
        assert!(nan.equals(&other_nan, EqualityOp::SameValue).unwrap());
        assert!(nan.equals(&other_nan, EqualityOp::SameValueZero).unwrap());

        assert!(zero.equals(&negative_zero, EqualityOp::Strict).unwrap());
        assert!(!zero.equals(&negative_zero, EqualityOp::SameValue).unwrap());
        assert!(zero.equals(&negative_zero, EqualityOp::SameValueZero).unwrap());
    }

    #[test]
    fn property_access_by_name_index_and_symbol() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let object = context
            .eval("const s = Symbol('tag'); globalThis.tag = s; ({ a: 1, [s]: 'sym', 0: 'zero' })")
            .unwrap();
        let symbol = context.get_global("tag").unwrap();

        assert_eq!(object.get("a").unwrap().to_number().unwrap(), 1.0);
        assert_eq!(object.get(0u32).unwrap().to_string().unwrap(), "zero");
        assert_eq!(object.get(&symbol).unwrap().to_string().unwrap(), "sym");
        assert_eq!(symbol.symbol_description().unwrap().as_deref(), Some("tag"));

        let two = context.new_number(2.0).unwrap();
        object.set("b", &two).unwrap();
        assert!(object.has_property("b").unwrap());
        assert!(object.delete_property("b").unwrap());
        assert!(!object.has_property("b").unwrap());
    }

    #[test]
    fn accessor_properties_reenter_host_code() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let object = context.new_object().unwrap();
        let getter = context
            .new_function("get", |frame| frame.returning("computed"))
            .unwrap();
        object
            .define_property("lazy", PropertyDescriptor::accessor(Some(&getter), None).enumerable(true))
            .unwrap();
        assert_eq!(object.get("lazy").unwrap().to_string().unwrap(), "computed");
        assert_eq!(object.keys().unwrap(), vec!["lazy".to_string()]);
    }

    #[test]
    fn dup_adds_a_slot_and_dispose_removes_it_once() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let object = context.new_object().unwrap();
        let base = context.live_handle_count();

        let copy = object.dup().unwrap();
        assert_eq!(context.live_handle_count(), base + 1);
        copy.dispose();
        copy.dispose();
        assert_eq!(context.live_handle_count(), base);

        let alias = object.borrow().unwrap();
        alias.dispose();
        assert_eq!(context.live_handle_count(), base);
        assert!(object.is_alive());
    }

    #[test]
    fn released_handles_fail_deterministically() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let value = context.new_string("gone").unwrap();
        value.dispose();
        assert!(matches!(value.to_string(), Err(BridgeError::UseAfterRelease { .. })));
        assert!(matches!(value.dup(), Err(BridgeError::UseAfterRelease { .. })));
        assert!(matches!(value.get("length"), Err(BridgeError::UseAfterRelease { .. })));
    }

    #[test]
    fn bigint_extraction_is_range_checked() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        assert_eq!(context.eval("2n ** 63n - 1n").unwrap().to_bigint().unwrap(), i64::MAX);
        assert_eq!(context.eval("-(2n ** 63n)").unwrap().to_bigint().unwrap(), i64::MIN);
        assert_eq!(context.eval("-42n").unwrap().to_bigint().unwrap(), -42);
        for source in ["2n ** 63n", "2n ** 64n + 5n", "-(2n ** 63n) - 1n"] {
            let value = context.eval(source).unwrap();
            assert!(
                matches!(value.to_bigint(), Err(BridgeError::Marshaling { .. })),
                "{source} should not fit"
            );
        }
    }

    #[test]
    fn typed_arrays_expose_kind_and_bytes() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let view = context.eval("new Uint16Array([1, 258])").unwrap();
        assert_eq!(view.typed_array_kind().unwrap(), Some(TypedArrayKind::Uint16));
        assert_eq!(view.bytes().unwrap(), vec![1, 0, 2, 1]);

        let plain = context.eval("[1, 2]").unwrap();
        assert_eq!(plain.typed_array_kind().unwrap(), None);
        assert!(plain.bytes().is_err());
    }
}
