//! Guest-side helper functions installed into every context
//!
//! The helpers are captured at context creation and never exposed on the
//! global object, so guest code that later patches `Object.is`,
//! `JSON.stringify` or `Symbol.iterator` lookups cannot change bridge
//! semantics.

pub(crate) const SOURCE: &str = r#"(() => {
  'use strict';
  const is = Object.is;
  const defineProperty = Object.defineProperty;
  const getOwnPropertyNames = Object.getOwnPropertyNames;
  const keys = Object.keys;
  const tag = Function.prototype.call.bind(Object.prototype.toString);
  const stringify = JSON.stringify;
  const isView = ArrayBuffer.isView;
  const iteratorSymbol = Symbol.iterator;
  const asyncIteratorSymbol = Symbol.asyncIterator;
  const keyFor = Symbol.keyFor;
  const symbolFor = Symbol.for;
  const NativeSymbol = Symbol;
  const NativePromise = Promise;
  const resolvePromise = Promise.resolve.bind(Promise);
  const then = Function.prototype.call.bind(Promise.prototype.then);
  const NativeError = Error;
  const NativeDate = Date;
  const NativeArrayBuffer = ArrayBuffer;
  const sliceBuffer = Function.prototype.call.bind(ArrayBuffer.prototype.slice);
  const nativeErrors = new Map([
    ['Error', Error], ['TypeError', TypeError], ['RangeError', RangeError],
    ['SyntaxError', SyntaxError], ['ReferenceError', ReferenceError],
    ['EvalError', EvalError], ['URIError', URIError],
  ]);
  if (typeof InternalError === 'function') nativeErrors.set('InternalError', InternalError);
  const apply = Reflect.apply;
  const asIntN = typeof BigInt === 'function' ? BigInt.asIntN : undefined;
  const construct = Reflect.construct;

  const describe = (value, seen) => {
    if (value !== null && (typeof value === 'object' || typeof value === 'function')) {
      if (seen.has(value)) return { name: 'Error', message: '[circular cause]', stack: null };
      seen.add(value);
      const out = {
        name: value.name === undefined ? 'Error' : String(value.name),
        message: value.message === undefined ? '' : String(value.message),
        stack: value.stack === undefined ? null : String(value.stack),
      };
      if ('cause' in value) out.cause = describe(value.cause, seen);
      return out;
    }
    return { name: 'Error', message: String(value), stack: null };
  };

  return {
    typeOf: (v) => typeof v,
    strictEq: (a, b) => a === b,
    sameValue: (a, b) => is(a, b),
    sameValueZero: (a, b) => a === b || (a !== a && b !== b),
    apply: (f, self, args) => apply(f, self, args),
    construct: (c, args) => construct(c, args),
    getProp: (o, k) => o[k],
    setProp: (o, k, v) => { o[k] = v; },
    hasProp: (o, k) => k in Object(o),
    deleteProp: (o, k) => delete o[k],
    defineProp: (o, k, d) => { defineProperty(o, k, d); },
    ownNames: (o) => getOwnPropertyNames(o),
    ownKeys: (o) => keys(o),
    instanceOf: (v, c) => v instanceof c,
    isPromise: (v) => v instanceof NativePromise,
    isBuffer: (v) => v instanceof NativeArrayBuffer || isView(v),
    isDate: (v) => tag(v) === '[object Date]',
    isError: (v) => v instanceof NativeError || tag(v) === '[object Error]',
    typedKind: (v) => isView(v) && tag(v) !== '[object DataView]' ? tag(v).slice(8, -1) : undefined,
    bytes: (v) => v instanceof NativeArrayBuffer
      ? sliceBuffer(v, 0)
      : sliceBuffer(v.buffer, v.byteOffset, v.byteOffset + v.byteLength),
    dateValue: (d) => NativeDate.prototype.getTime.call(d),
    fitsInt64: (v) => asIntN !== undefined && asIntN(64, v) === v,
    toJson: (v, indent) => stringify(v, null, indent),
    makeDate: (ms) => new NativeDate(ms),
    makeError: (name, message) => {
      const Native = nativeErrors.get(name);
      if (Native !== undefined) return new Native(message);
      const e = new NativeError(message);
      defineProperty(e, 'name', { value: name, writable: true, configurable: true });
      return e;
    },
    setName: (f, name) => { defineProperty(f, 'name', { value: name, configurable: true }); },
    symbol: (description, global) => global ? symbolFor(description) : NativeSymbol(description),
    symbolDescription: (s) => keyFor(s) ?? s.description,
    isGlobalSymbol: (s) => keyFor(s) !== undefined,
    dump: (e) => stringify(describe(e, new Set())),
    iterator: (o) => {
      if (o === null || o === undefined) return undefined;
      const f = o[iteratorSymbol];
      return typeof f === 'function' ? f.call(o) : undefined;
    },
    asyncIterator: (o) => {
      if (o === null || o === undefined) return undefined;
      const f = o[asyncIteratorSymbol];
      if (typeof f === 'function') return f.call(o);
      const g = o[iteratorSymbol];
      return typeof g === 'function' ? g.call(o) : undefined;
    },
    then: (p, onFulfilled, onRejected) => { then(resolvePromise(p), onFulfilled, onRejected); },
    deferred: () => {
      let resolve, reject;
      const promise = new NativePromise((a, b) => { resolve = a; reject = b; });
      return [promise, resolve, reject];
    },
    makeClass: (name, construct) => ({
      [name]: function (...args) {
        if (new.target === undefined) {
          throw new TypeError(`Class constructor ${name} cannot be invoked without 'new'`);
        }
        return construct(...args);
      },
    })[name],
  };
})()"#;
