//! Class bridge
//!
//! Every host-defined class shares one engine class, [`HostInstance`], which
//! carries the bridge class id and the instance's opaque id. Class identity
//! is read from that internal record, never from the prototype chain, so
//! `is_instance` survives `Object.setPrototypeOf` and friends.
//!
//! Guest subclasses (`class Sub extends Base`) are not wired up: the
//! generated constructor ignores `new.target`, so `new Sub()` produces an
//! instance with `Base.prototype`.

use crate::callbacks::{CallFrame, HostFunction};
use crate::context::ExecutionContext;
use crate::error::{BridgeError, HostError, Result};
use crate::exception::GuestResultExt;
use crate::ffi::{ClassId, OpaqueId, RawRef};
use crate::handle::{PropertyDescriptor, ValueHandle};
use rquickjs::class::{Class, JsClass, Readable, Trace, Tracer};
use rquickjs::function::Constructor;
use rquickjs::{Ctx, Function, IntoJs, Object, Value};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Builds a class instance. Returning `Some` replaces the instance the
/// bridge created, which is then released.
pub type ClassConstructor =
    Rc<dyn Fn(&ConstructFrame<'_>) -> std::result::Result<Option<ValueHandle>, HostError>>;

/// Finalizer or gc-mark hook. Runs during guest collection and only sees
/// identifiers; it must not call back into the guest.
pub type ClassHook = Rc<dyn Fn(ClassId, Option<OpaqueId>)>;

struct ClassSlots {
    constructor: RefCell<Option<ClassConstructor>>,
    finalizer: Option<ClassHook>,
    gc_mark: Option<ClassHook>,
}

/// Engine-side record attached to every instance of a bridged class.
pub(crate) struct HostInstance {
    class: ClassId,
    opaque: Cell<Option<OpaqueId>>,
    slots: Rc<ClassSlots>,
}

impl<'js> Trace<'js> for HostInstance {
    fn trace<'a>(&self, _tracer: Tracer<'a, 'js>) {
        if let Some(mark) = &self.slots.gc_mark {
            mark(self.class, self.opaque.get());
        }
    }
}

impl<'js> JsClass<'js> for HostInstance {
    const NAME: &'static str = "HostInstance";

    type Mutable = Readable;

    fn class_id() -> &'static rquickjs::class::ClassId {
        static ID: rquickjs::class::ClassId = rquickjs::class::ClassId::new();
        &ID
    }

    fn prototype(ctx: &Ctx<'js>) -> rquickjs::Result<Option<Object<'js>>> {
        Object::new(ctx.clone()).map(Some)
    }

    fn constructor(_ctx: &Ctx<'js>) -> rquickjs::Result<Option<Constructor<'js>>> {
        Ok(None)
    }
}

impl Drop for HostInstance {
    fn drop(&mut self) {
        if let Some(finalize) = &self.slots.finalizer {
            finalize(self.class, self.opaque.get());
        }
    }
}

fn instance_record<'js>(value: Value<'js>) -> Option<Class<'js, HostInstance>> {
    let object = value.into_object()?;
    Class::<HostInstance>::from_object(&object)
}

/// Methods, accessors and hooks of a class definition.
#[derive(Default)]
pub struct ClassOptions {
    methods: Vec<(String, HostFunction)>,
    accessors: Vec<(String, Option<HostFunction>, Option<HostFunction>)>,
    static_methods: Vec<(String, HostFunction)>,
    static_accessors: Vec<(String, Option<HostFunction>, Option<HostFunction>)>,
    finalizer: Option<ClassHook>,
    gc_mark: Option<ClassHook>,
}

impl ClassOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prototype method; `this` is the instance.
    pub fn method<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&CallFrame<'_>) -> std::result::Result<ValueHandle, HostError> + 'static,
    {
        self.methods.push((name.into(), Rc::new(f)));
        self
    }

    pub fn accessor(
        mut self,
        name: impl Into<String>,
        getter: Option<HostFunction>,
        setter: Option<HostFunction>,
    ) -> Self {
        self.accessors.push((name.into(), getter, setter));
        self
    }

    pub fn static_method<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&CallFrame<'_>) -> std::result::Result<ValueHandle, HostError> + 'static,
    {
        self.static_methods.push((name.into(), Rc::new(f)));
        self
    }

    pub fn static_accessor(
        mut self,
        name: impl Into<String>,
        getter: Option<HostFunction>,
        setter: Option<HostFunction>,
    ) -> Self {
        self.static_accessors.push((name.into(), getter, setter));
        self
    }

    pub fn finalizer(mut self, f: impl Fn(ClassId, Option<OpaqueId>) + 'static) -> Self {
        self.finalizer = Some(Rc::new(f));
        self
    }

    pub fn gc_mark(mut self, f: impl Fn(ClassId, Option<OpaqueId>) + 'static) -> Self {
        self.gc_mark = Some(Rc::new(f));
        self
    }
}

/// Arguments of one guest `new` call.
pub struct ConstructFrame<'a> {
    context: &'a ExecutionContext,
    class: ClassId,
    instance: ValueHandle,
    args: &'a [ValueHandle],
}

impl<'a> ConstructFrame<'a> {
    pub fn context(&self) -> &'a ExecutionContext {
        self.context
    }

    pub fn class_id(&self) -> ClassId {
        self.class
    }

    /// The instance created for this call.
    pub fn instance(&self) -> &ValueHandle {
        &self.instance
    }

    pub fn args(&self) -> &[ValueHandle] {
        self.args
    }

    pub fn arg(&self, index: usize) -> Option<&ValueHandle> {
        self.args.get(index)
    }

    pub fn set_opaque(&self, opaque: OpaqueId) -> Result<()> {
        write_opaque(&self.instance, self.class, opaque)
    }
}

struct ClassShared {
    id: ClassId,
    name: String,
    slots: Rc<ClassSlots>,
    prototype: RefCell<Option<ValueHandle>>,
}

impl ClassShared {
    fn instantiate(&self, context: &ExecutionContext, opaque: Option<OpaqueId>) -> Result<ValueHandle> {
        let prototype = self.prototype.borrow();
        let prototype = prototype.as_ref().ok_or_else(|| {
            BridgeError::integrity(format!("class {} has no prototype", self.name))
        })?;
        context.enter(|ctx| {
            let proto = prototype.value(ctx)?.into_object().ok_or_else(|| {
                BridgeError::integrity(format!("prototype of class {} is not an object", self.name))
            })?;
            let record = HostInstance {
                class: self.id,
                opaque: Cell::new(opaque),
                slots: self.slots.clone(),
            };
            let instance = Class::instance_proto(record, proto)?;
            let value = instance.into_js(ctx)?;
            context.adopt(ctx, value)
        })
    }

    fn construct(&self, frame: &CallFrame<'_>) -> std::result::Result<ValueHandle, HostError> {
        let callback = self.slots.constructor.borrow().clone();
        let Some(callback) = callback else {
            return Err(HostError::type_error(format!(
                "class {} has been disposed",
                self.name
            )));
        };

        let instance = self.instantiate(frame.context(), None)?;
        let construct = ConstructFrame {
            context: frame.context(),
            class: self.id,
            instance,
            args: frame.args(),
        };
        match callback(&construct)? {
            Some(substitute) => Ok(substitute),
            None => Ok(construct.instance),
        }
    }
}

fn read_record<R>(
    handle: &ValueHandle,
    f: impl FnOnce(&HostInstance) -> R,
) -> Result<Option<R>> {
    handle.with(|_, value| {
        Ok(instance_record(value).map(|class| {
            let record = class.borrow();
            f(&record)
        }))
    })
}

fn write_opaque(handle: &ValueHandle, class: ClassId, opaque: OpaqueId) -> Result<()> {
    let written = read_record(handle, |record| {
        if record.class == class {
            record.opaque.set(Some(opaque));
            true
        } else {
            false
        }
    })?;
    match written {
        Some(true) => Ok(()),
        _ => Err(BridgeError::NotInstance { class }),
    }
}

/// A class defined by the host.
///
/// Disposing the descriptor stops further construction. Instances that
/// already exist keep their class id, opaque id and hooks.
pub struct ClassDescriptor {
    context: ExecutionContext,
    shared: Rc<ClassShared>,
    constructor: RefCell<Option<ValueHandle>>,
}

impl ClassDescriptor {
    pub fn id(&self) -> ClassId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_disposed(&self) -> bool {
        self.constructor.borrow().is_none()
    }

    /// The guest constructor function.
    pub fn constructor(&self) -> Result<ValueHandle> {
        match self.constructor.borrow().as_ref() {
            Some(constructor) => constructor.dup(),
            None => Err(BridgeError::UseAfterRelease { raw: RawRef::NONE }),
        }
    }

    pub fn prototype(&self) -> Result<ValueHandle> {
        if self.is_disposed() {
            return Err(BridgeError::UseAfterRelease { raw: RawRef::NONE });
        }
        match self.shared.prototype.borrow().as_ref() {
            Some(prototype) => prototype.dup(),
            None => Err(BridgeError::UseAfterRelease { raw: RawRef::NONE }),
        }
    }

    /// Mint an instance without running the host constructor.
    pub fn create_instance(&self, opaque: Option<OpaqueId>) -> Result<ValueHandle> {
        if self.is_disposed() {
            return Err(BridgeError::UseAfterRelease { raw: RawRef::NONE });
        }
        self.shared.instantiate(&self.context, opaque)
    }

    pub fn is_instance(&self, value: &ValueHandle) -> Result<bool> {
        self.context.same_context(value)?;
        let class = read_record(value, |record| record.class)?;
        Ok(class == Some(self.shared.id))
    }

    pub fn get_opaque(&self, value: &ValueHandle) -> Result<Option<OpaqueId>> {
        self.context.same_context(value)?;
        match read_record(value, |record| (record.class, record.opaque.get()))? {
            Some((class, opaque)) if class == self.shared.id => Ok(opaque),
            _ => Err(BridgeError::NotInstance {
                class: self.shared.id,
            }),
        }
    }

    pub fn set_opaque(&self, value: &ValueHandle, opaque: OpaqueId) -> Result<()> {
        self.context.same_context(value)?;
        write_opaque(value, self.shared.id, opaque)
    }

    /// Stop construction and release the constructor and prototype.
    pub fn dispose(&self) {
        let constructor = self.constructor.borrow_mut().take();
        if constructor.is_none() {
            return;
        }
        drop(self.shared.slots.constructor.borrow_mut().take());
        drop(self.shared.prototype.borrow_mut().take());
        drop(constructor);
        tracing::debug!(class = %self.shared.id, name = %self.shared.name, "class disposed");
    }
}

impl std::fmt::Debug for ClassDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassDescriptor")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl ValueHandle {
    /// Bridge class id of a host class instance.
    pub fn host_class(&self) -> Result<Option<ClassId>> {
        read_record(self, |record| record.class)
    }

    /// Opaque id of a host class instance, whatever its class.
    pub fn opaque(&self) -> Result<Option<OpaqueId>> {
        Ok(read_record(self, |record| record.opaque.get())?.flatten())
    }
}

impl ExecutionContext {
    /// Define a class whose guest constructor runs `constructor`.
    ///
    /// The constructor must be called with `new`. Methods and accessors go on
    /// the prototype, static ones on the constructor, all non-enumerable.
    pub fn define_class<F>(&self, name: &str, constructor: F, options: ClassOptions) -> Result<ClassDescriptor>
    where
        F: Fn(&ConstructFrame<'_>) -> std::result::Result<Option<ValueHandle>, HostError> + 'static,
    {
        let runtime = self.runtime()?;
        let id = runtime.next_class_id()?;
        drop(runtime);

        let ClassOptions {
            methods,
            accessors,
            static_methods,
            static_accessors,
            finalizer,
            gc_mark,
        } = options;

        let shared = Rc::new(ClassShared {
            id,
            name: name.to_string(),
            slots: Rc::new(ClassSlots {
                constructor: RefCell::new(Some(Rc::new(constructor))),
                finalizer,
                gc_mark,
            }),
            prototype: RefCell::new(Some(self.new_object()?)),
        });

        let construct = {
            let shared = shared.clone();
            self.new_function(name, move |frame| shared.construct(frame))?
        };
        let class_function = self.enter(|ctx| {
            let make: Function = self.intrinsic(ctx, "makeClass")?;
            let class_function: Value = make
                .call((name, construct.value(ctx)?))
                .or_guest(self, ctx)?;
            self.adopt(ctx, class_function)
        })?;
        drop(construct);

        let prototype = shared
            .prototype
            .borrow()
            .as_ref()
            .map(ValueHandle::dup)
            .ok_or_else(|| BridgeError::integrity(format!("class {name} lost its prototype")))??;

        class_function.define_property("prototype", PropertyDescriptor::value(&prototype))?;
        prototype.define_property(
            "constructor",
            PropertyDescriptor::value(&class_function)
                .writable(true)
                .configurable(true),
        )?;

        self.install_members(&prototype, methods, accessors)?;
        self.install_members(&class_function, static_methods, static_accessors)?;

        tracing::debug!(class = %id, name, "class defined");
        Ok(ClassDescriptor {
            context: self.clone(),
            shared,
            constructor: RefCell::new(Some(class_function)),
        })
    }

    fn install_members(
        &self,
        target: &ValueHandle,
        methods: Vec<(String, HostFunction)>,
        accessors: Vec<(String, Option<HostFunction>, Option<HostFunction>)>,
    ) -> Result<()> {
        for (name, method) in methods {
            let function = self.new_host_function(&name, method)?;
            target.define_property(
                name.as_str(),
                PropertyDescriptor::value(&function)
                    .writable(true)
                    .configurable(true),
            )?;
        }
        for (name, getter, setter) in accessors {
            let getter = getter
                .map(|f| self.new_host_function(&format!("get {name}"), f))
                .transpose()?;
            let setter = setter
                .map(|f| self.new_host_function(&format!("set {name}"), f))
                .transpose()?;
            target.define_property(
                name.as_str(),
                PropertyDescriptor::accessor(getter.as_ref(), setter.as_ref()).configurable(true),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Runtime;

    fn counter_class(context: &ExecutionContext) -> ClassDescriptor {
        let options = ClassOptions::new()
            .method("id", |frame| {
                let opaque = frame.this().opaque()?.unwrap_or(-1);
                frame.returning(opaque)
            })
            .static_method("kind", |frame| frame.returning("counter"))
            .accessor(
                "double",
                Some(Rc::new(|frame: &CallFrame<'_>| -> std::result::Result<ValueHandle, HostError> {
                    let opaque = frame.this().opaque()?.unwrap_or(0);
                    frame.returning(opaque * 2)
                })),
                None,
            );
        context
            .define_class(
                "Counter",
                |frame| {
                    let start = match frame.arg(0) {
                        Some(arg) => arg.to_number()? as OpaqueId,
                        None => 42,
                    };
                    frame.set_opaque(start)?;
                    Ok(None)
                },
                options,
            )
            .unwrap()
    }

    #[test]
    fn constructor_stores_the_opaque_id() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let class = counter_class(&context);
        context.set_global("Counter", &class.constructor().unwrap()).unwrap();

        let instance = context.eval("new Counter()").unwrap();
        assert!(class.is_instance(&instance).unwrap());
        assert_eq!(class.get_opaque(&instance).unwrap(), Some(42));

        let seven = context.eval("new Counter(7)").unwrap();
        assert_eq!(class.get_opaque(&seven).unwrap(), Some(7));
    }

    #[test]
    fn members_are_installed_on_prototype_and_constructor() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let class = counter_class(&context);
        context.set_global("Counter", &class.constructor().unwrap()).unwrap();

        let result = context
            .eval("const c = new Counter(5); [c.id(), c.double, Counter.kind(), c instanceof Counter, c.constructor === Counter, Object.keys(c).length].join()")
            .unwrap();
        assert_eq!(result.to_string().unwrap(), "5,10,counter,true,true,0");
    }

    #[test]
    fn calling_without_new_throws() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let class = counter_class(&context);
        context.set_global("Counter", &class.constructor().unwrap()).unwrap();
        let error = context.eval("Counter()").unwrap_err();
        assert_eq!(error.as_guest().unwrap().name(), "TypeError");
    }

    #[test]
    fn identity_survives_prototype_mutation() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let class = counter_class(&context);
        context.set_global("Counter", &class.constructor().unwrap()).unwrap();

        let detached = context
            .eval("const d = new Counter(); Object.setPrototypeOf(d, null); d")
            .unwrap();
        assert!(class.is_instance(&detached).unwrap());

        let impostor = context.eval("Object.create(Counter.prototype)").unwrap();
        assert!(!class.is_instance(&impostor).unwrap());
        assert!(matches!(
            class.get_opaque(&impostor),
            Err(BridgeError::NotInstance { .. })
        ));
        let number = context.new_number(1.0).unwrap();
        assert!(!class.is_instance(&number).unwrap());
    }

    #[test]
    fn instances_of_other_classes_are_rejected() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let first = counter_class(&context);
        let second = context
            .define_class("Other", |_| Ok(None), ClassOptions::new())
            .unwrap();
        assert_ne!(first.id(), second.id());

        let instance = second.create_instance(Some(3)).unwrap();
        assert!(!first.is_instance(&instance).unwrap());
        assert!(first.set_opaque(&instance, 9).is_err());
        second.set_opaque(&instance, 9).unwrap();
        assert_eq!(second.get_opaque(&instance).unwrap(), Some(9));
        assert_eq!(instance.host_class().unwrap(), Some(second.id()));
    }

    #[test]
    fn constructors_can_substitute_the_instance() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let class = context
            .define_class(
                "Factory",
                |frame| {
                    let product = frame.context().eval("({ made: true })")?;
                    Ok(Some(product))
                },
                ClassOptions::new(),
            )
            .unwrap();
        context.set_global("Factory", &class.constructor().unwrap()).unwrap();

        let product = context.eval("new Factory()").unwrap();
        assert!(!class.is_instance(&product).unwrap());
        assert!(product.get("made").unwrap().to_boolean().unwrap());
    }

    #[test]
    fn disposal_stops_construction_but_keeps_instances() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let class = counter_class(&context);
        context.set_global("Counter", &class.constructor().unwrap()).unwrap();
        let survivor = context.eval("new Counter(3)").unwrap();

        class.dispose();
        class.dispose();
        assert!(class.is_disposed());
        assert!(class.create_instance(None).is_err());
        assert!(class.constructor().is_err());

        let error = context.eval("new Counter()").unwrap_err();
        assert_eq!(error.as_guest().unwrap().name(), "TypeError");
        assert!(class.is_instance(&survivor).unwrap());
        assert_eq!(class.get_opaque(&survivor).unwrap(), Some(3));
    }

    #[test]
    fn finalizers_see_the_opaque_id() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let finalized = Rc::new(RefCell::new(Vec::new()));
        let options = {
            let finalized = finalized.clone();
            ClassOptions::new().finalizer(move |_, opaque| finalized.borrow_mut().push(opaque))
        };
        let class = context.define_class("Resource", |_| Ok(None), options).unwrap();

        let instance = class.create_instance(Some(11)).unwrap();
        assert!(finalized.borrow().is_empty());
        instance.dispose();
        runtime.run_gc();
        assert_eq!(*finalized.borrow(), vec![Some(11)]);
    }

    #[test]
    fn gc_mark_runs_for_live_instances() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let marks = Rc::new(Cell::new(0));
        let options = {
            let marks = marks.clone();
            ClassOptions::new().gc_mark(move |_, _| marks.set(marks.get() + 1))
        };
        let class = context.define_class("Tracked", |_| Ok(None), options).unwrap();
        let _instance = class.create_instance(None).unwrap();
        runtime.run_gc();
        assert!(marks.get() > 0);
    }

    #[test]
    fn subclass_instances_use_the_base_prototype() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let class = counter_class(&context);
        context.set_global("Counter", &class.constructor().unwrap()).unwrap();
        let instance = context
            .eval("class Sub extends Counter { extra() { return 1; } } new Sub(4)")
            .unwrap();
        assert!(class.is_instance(&instance).unwrap());
        assert!(instance.get("extra").unwrap().is_undefined().unwrap());
    }
}
