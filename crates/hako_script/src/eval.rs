//! Evaluation and bytecode
//!
//! Source text and compiled bytecode go through the engine's raw entry points
//! so evaluation flags and bytecode serialization are available. Failures
//! follow the usual contract: a thrown value comes back as
//! `Err(BridgeError::Guest)`.

use crate::context::ExecutionContext;
use crate::error::{BridgeError, Result};
use crate::exception::GuestResultExt;
use crate::handle::ValueHandle;
use rquickjs::{qjs, Ctx, Value};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::ffi::{c_void, CString};

const EVAL_TYPE_GLOBAL: i32 = qjs::JS_EVAL_TYPE_GLOBAL as i32;
const EVAL_TYPE_MODULE: i32 = qjs::JS_EVAL_TYPE_MODULE as i32;
const EVAL_TYPE_INDIRECT: i32 = qjs::JS_EVAL_TYPE_INDIRECT as i32;
const EVAL_FLAG_STRICT: i32 = qjs::JS_EVAL_FLAG_STRICT as i32;
const EVAL_FLAG_COMPILE_ONLY: i32 = qjs::JS_EVAL_FLAG_COMPILE_ONLY as i32;
const EVAL_FLAG_BACKTRACE_BARRIER: i32 = qjs::JS_EVAL_FLAG_BACKTRACE_BARRIER as i32;
const EVAL_FLAG_ASYNC: i32 = qjs::JS_EVAL_FLAG_ASYNC as i32;
const WRITE_OBJ_BYTECODE: i32 = qjs::JS_WRITE_OBJ_BYTECODE as i32;
const READ_OBJ_BYTECODE: i32 = qjs::JS_READ_OBJ_BYTECODE as i32;

/// How source text is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalType {
    #[default]
    Global,
    Module,
    /// Direct eval needs a calling guest frame. The host never has one, so
    /// this runs with indirect (global scope) semantics.
    Direct,
    Indirect,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalOptions {
    pub eval_type: EvalType,
    /// Name reported in stack traces and used as the base for relative
    /// imports.
    pub file_name: Option<String>,
    pub strict: bool,
    /// `None` uses [`RuntimeConfig::strip_source_annotations`](crate::RuntimeConfig).
    pub strip_source_annotations: Option<bool>,
    /// Allow `await` at the top level of a global script. The result is
    /// then the promise produced by the engine.
    pub allow_top_level_await: bool,
    /// Hide frames below this evaluation from guest stack traces.
    pub backtrace_barrier: bool,
}

impl EvalOptions {
    pub fn module() -> Self {
        Self {
            eval_type: EvalType::Module,
            ..Self::default()
        }
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn strip_source_annotations(mut self, strip: bool) -> Self {
        self.strip_source_annotations = Some(strip);
        self
    }

    pub fn top_level_await(mut self) -> Self {
        self.allow_top_level_await = true;
        self
    }

    pub fn is_module(&self) -> bool {
        self.eval_type == EvalType::Module
    }

    fn file_name(&self) -> &str {
        match (&self.file_name, self.eval_type) {
            (Some(name), _) => name,
            (None, EvalType::Module) => "<module>",
            (None, _) => "<eval>",
        }
    }

    fn flags(&self) -> i32 {
        let mut flags = match self.eval_type {
            EvalType::Global => EVAL_TYPE_GLOBAL,
            EvalType::Module => EVAL_TYPE_MODULE,
            EvalType::Direct | EvalType::Indirect => EVAL_TYPE_INDIRECT,
        };
        if self.strict {
            flags |= EVAL_FLAG_STRICT;
        }
        if self.backtrace_barrier {
            flags |= EVAL_FLAG_BACKTRACE_BARRIER;
        }
        if self.allow_top_level_await && self.eval_type == EvalType::Global {
            flags |= EVAL_FLAG_ASYNC;
        }
        flags
    }
}

/// Remove a leading hashbang and source-map annotation comments.
///
/// Removed lines are left empty so guest line numbers stay put.
pub fn strip_source_annotations(code: &str) -> Cow<'_, str> {
    let hashbang = code.starts_with("#!");
    let annotated = |line: &str| {
        let line = line.trim_start();
        ["//# sourceMappingURL=", "//@ sourceMappingURL=", "//# sourceURL=", "//@ sourceURL="]
            .iter()
            .any(|prefix| line.starts_with(prefix))
    };

    if !hashbang && !code.lines().any(annotated) {
        return Cow::Borrowed(code);
    }

    let mut out = String::with_capacity(code.len());
    for (index, line) in code.split_inclusive('\n').enumerate() {
        let body = line.trim_end_matches(['\n', '\r']);
        if (index == 0 && hashbang) || annotated(body) {
            out.push_str(&line[body.len()..]);
        } else {
            out.push_str(line);
        }
    }
    Cow::Owned(out)
}

/// Serialized, engine-build-specific bytecode.
///
/// The engine's bytecode reader trusts its input, so a `Bytecode` can only be
/// obtained from [`ExecutionContext::compile`] or through the `unsafe`
/// [`from_bytes`](Self::from_bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bytecode {
    bytes: Vec<u8>,
    module: bool,
}

impl Bytecode {
    /// Rebuild bytecode from raw bytes, e.g. out of a cache.
    ///
    /// # Safety
    ///
    /// `bytes` must be exactly what [`into_bytes`](Self::into_bytes) or
    /// [`as_bytes`](Self::as_bytes) returned for bytecode compiled by this
    /// engine build, and `module` must match its original flag. The engine
    /// does not validate bytecode while reading it; malformed input is
    /// undefined behaviour.
    pub unsafe fn from_bytes(bytes: Vec<u8>, module: bool) -> Self {
        Self { bytes, module }
    }

    fn compiled(bytes: Vec<u8>, module: bool) -> Self {
        Self { bytes, module }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn is_module(&self) -> bool {
        self.module
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl ExecutionContext {
    /// Evaluate `code` as a global script with default options.
    pub fn eval(&self, code: &str) -> Result<ValueHandle> {
        self.evaluate(code, &EvalOptions::default())
    }

    pub fn evaluate(&self, code: &str, options: &EvalOptions) -> Result<ValueHandle> {
        let (source, file) = self.prepare(code, options)?;
        tracing::trace!(context = %self.id(), file = options.file_name(), "evaluating");
        self.enter(|ctx| {
            // SAFETY: both strings are NUL terminated and outlive the call.
            let value = unsafe { eval_raw(ctx, &source, &file, options.flags()) }.or_guest(self, ctx)?;
            self.adopt(ctx, value)
        })
    }

    /// Compile without running. Syntax errors are reported exactly like
    /// [`evaluate`](Self::evaluate) reports them.
    pub fn compile(&self, code: &str, options: &EvalOptions) -> Result<Bytecode> {
        let (source, file) = self.prepare(code, options)?;
        let flags = options.flags() | EVAL_FLAG_COMPILE_ONLY;
        let bytes = self.enter(|ctx| {
            // SAFETY: as in `evaluate`.
            let compiled = unsafe { eval_raw(ctx, &source, &file, flags) }.or_guest(self, ctx)?;
            // SAFETY: `compiled` belongs to `ctx`.
            unsafe { write_bytecode(ctx, &compiled) }.or_guest(self, ctx)
        })?;
        Ok(Bytecode::compiled(bytes, options.is_module()))
    }

    /// Replay bytecode produced by [`compile`](Self::compile) on a matching
    /// engine build.
    pub fn run_bytecode(&self, bytecode: &Bytecode) -> Result<ValueHandle> {
        if bytecode.is_empty() {
            return Err(BridgeError::marshaling("empty bytecode"));
        }
        self.enter(|ctx| {
            // SAFETY: a `Bytecode` holds either bytes written by `compile`
            // or bytes whose provenance the caller vouched for through
            // `Bytecode::from_bytes`.
            let value = unsafe { read_bytecode(ctx, bytecode) }.or_guest(self, ctx)?;
            self.adopt(ctx, value)
        })
    }

    fn prepare(&self, code: &str, options: &EvalOptions) -> Result<(CString, CString)> {
        let strip = match options.strip_source_annotations {
            Some(strip) => strip,
            None => self.runtime()?.config().strip_source_annotations,
        };
        let code = if strip {
            strip_source_annotations(code)
        } else {
            Cow::Borrowed(code)
        };
        let source = CString::new(code.as_ref())
            .map_err(|_| BridgeError::marshaling("source text contains a NUL byte"))?;
        let file = CString::new(options.file_name())
            .map_err(|_| BridgeError::marshaling("file name contains a NUL byte"))?;
        Ok((source, file))
    }
}

unsafe fn eval_raw<'js>(
    ctx: &Ctx<'js>,
    source: &CString,
    file: &CString,
    flags: i32,
) -> rquickjs::Result<Value<'js>> {
    let raw = qjs::JS_Eval(
        ctx.as_raw().as_ptr(),
        source.as_ptr(),
        source.as_bytes().len() as _,
        file.as_ptr(),
        flags,
    );
    checked(ctx, raw)
}

unsafe fn write_bytecode<'js>(ctx: &Ctx<'js>, compiled: &Value<'js>) -> rquickjs::Result<Vec<u8>> {
    let raw_ctx = ctx.as_raw().as_ptr();
    let mut len: usize = 0;
    let ptr = qjs::JS_WriteObject(raw_ctx, &mut len as *mut usize as *mut _, compiled.as_raw(), WRITE_OBJ_BYTECODE);
    if ptr.is_null() {
        return Err(rquickjs::Error::Exception);
    }
    let bytes = std::slice::from_raw_parts(ptr, len).to_vec();
    qjs::js_free(raw_ctx, ptr as *mut c_void);
    Ok(bytes)
}

unsafe fn read_bytecode<'js>(ctx: &Ctx<'js>, bytecode: &Bytecode) -> rquickjs::Result<Value<'js>> {
    let raw_ctx = ctx.as_raw().as_ptr();
    let bytes = bytecode.as_bytes();
    let object = qjs::JS_ReadObject(raw_ctx, bytes.as_ptr(), bytes.len() as _, READ_OBJ_BYTECODE);
    let object = checked(ctx, object)?;
    if bytecode.is_module() && qjs::JS_ResolveModule(raw_ctx, object.as_raw()) < 0 {
        return Err(rquickjs::Error::Exception);
    }
    // JS_EvalFunction takes ownership of the function object.
    let result = qjs::JS_EvalFunction(raw_ctx, {
        let raw = qjs::JS_DupValue(object.as_raw());
        drop(object);
        raw
    });
    checked(ctx, result)
}

unsafe fn checked<'js>(ctx: &Ctx<'js>, raw: qjs::JSValue) -> rquickjs::Result<Value<'js>> {
    let value = Value::from_raw(ctx.clone(), raw);
    if value.is_exception() {
        Err(rquickjs::Error::Exception)
    } else {
        Ok(value)
    }
}
