// Copyright 2025 the Gantry authors. MIT license.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use parking_lot::RwLock;
use url::Url;

use crate::error::throw_error;

mod bundle;
mod map;
mod registry;

#[cfg(test)]
mod tests;

pub use bundle::BuiltinBundleBuilder;
pub use bundle::BuiltinBundleType;
pub use bundle::BundleBuilder;
pub use bundle::ModuleBundle;
pub use bundle::ModuleBundleBuilder;
pub use bundle::ModuleFactory;
pub use bundle::Resolved;
pub use bundle::new_fallback_bundle;
pub use map::IsolateModuleRegistry;
pub use map::MODULE_REGISTRY_SLOT_INDEX;
pub use map::RequireOption;
pub(crate) use map::script_origin;
pub use registry::CompatOptions;
pub use registry::IsolateRegistryHandle;
pub use registry::ModuleRegistry;
pub use registry::RegistryBuilder;
pub use registry::RegistryOptions;

/// The trust tier a module belongs to. The tier of the module performing an
/// import decides which tiers resolution is allowed to search.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ModuleType {
  Bundle,
  Builtin,
  BuiltinOnly,
  Fallback,
}

/// The tier a resolution request is performed under.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ResolveContextType {
  Bundle,
  Builtin,
  BuiltinOnly,
}

/// How a resolution request entered the registry. Informational only; it
/// never changes the result.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ResolveSource {
  StaticImport,
  DynamicImport,
  Require,
  Internal,
}

pub(crate) fn resolve_context_type_for(ty: ModuleType) -> ResolveContextType {
  match ty {
    ModuleType::Bundle => ResolveContextType::Bundle,
    ModuleType::Builtin => ResolveContextType::Builtin,
    ModuleType::BuiltinOnly => ResolveContextType::BuiltinOnly,
    ModuleType::Fallback => ResolveContextType::Bundle,
  }
}

/// Bitmask of per-module flags.
///
/// ESM modules always carry EVAL. Synthetic modules never carry ESM or MAIN.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ModuleFlags(u8);

impl ModuleFlags {
  pub const NONE: ModuleFlags = ModuleFlags(0);
  /// Source-text module, parsed by the engine.
  pub const ESM: ModuleFlags = ModuleFlags(1 << 0);
  /// Designated entrypoint; surfaces as `import.meta.main`.
  pub const MAIN: ModuleFlags = ModuleFlags(1 << 1);
  /// Evaluation may be routed through the registry's EvalCallback.
  pub const EVAL: ModuleFlags = ModuleFlags(1 << 2);

  pub fn contains(self, other: ModuleFlags) -> bool {
    self.0 & other.0 == other.0
  }
}

impl std::ops::BitOr for ModuleFlags {
  type Output = ModuleFlags;
  fn bitor(self, rhs: ModuleFlags) -> ModuleFlags {
    ModuleFlags(self.0 | rhs.0)
  }
}

impl std::ops::BitOrAssign for ModuleFlags {
  fn bitor_assign(&mut self, rhs: ModuleFlags) {
    self.0 |= rhs.0;
  }
}

/// Module source text. Bundles hand the same backing storage to every
/// isolate; it is never copied per resolution.
#[derive(Clone, Debug)]
pub enum ModuleCode {
  Static(&'static str),
  Owned(Arc<str>),
}

impl ModuleCode {
  pub fn as_str(&self) -> &str {
    match self {
      ModuleCode::Static(s) => s,
      ModuleCode::Owned(s) => s,
    }
  }
}

impl From<&'static str> for ModuleCode {
  fn from(value: &'static str) -> Self {
    ModuleCode::Static(value)
  }
}

impl From<String> for ModuleCode {
  fn from(value: String) -> Self {
    ModuleCode::Owned(value.into())
  }
}

impl From<Arc<str>> for ModuleCode {
  fn from(value: Arc<str>) -> Self {
    ModuleCode::Owned(value)
  }
}

/// Binary module payload (data and Wasm modules).
#[derive(Clone, Debug)]
pub enum ModuleBytes {
  Static(&'static [u8]),
  Owned(Arc<[u8]>),
}

impl ModuleBytes {
  pub fn as_bytes(&self) -> &[u8] {
    match self {
      ModuleBytes::Static(b) => b,
      ModuleBytes::Owned(b) => b,
    }
  }
}

impl From<&'static [u8]> for ModuleBytes {
  fn from(value: &'static [u8]) -> Self {
    ModuleBytes::Static(value)
  }
}

impl From<Vec<u8>> for ModuleBytes {
  fn from(value: Vec<u8>) -> Self {
    ModuleBytes::Owned(value.into())
  }
}

impl From<Arc<[u8]>> for ModuleBytes {
  fn from(value: Arc<[u8]>) -> Self {
    ModuleBytes::Owned(value)
  }
}

const BOM_CHAR: &[u8] = &[0xef, 0xbb, 0xbf];

/// Strips the byte order mark from the provided text if it exists.
fn strip_bom(source: &[u8]) -> &[u8] {
  if source.starts_with(BOM_CHAR) {
    &source[BOM_CHAR.len()..]
  } else {
    source
  }
}

/// A single resolution request.
#[derive(Clone, Debug)]
pub struct ResolveContext {
  pub ty: ResolveContextType,
  pub source: ResolveSource,
  pub specifier: Url,
  pub referrer: Url,
  pub raw_specifier: Option<String>,
  /// Import attributes are currently rejected at the engine boundary; they
  /// are carried opaquely and resolution never varies on them.
  pub attributes: HashMap<String, String>,
}

/// Which kind of catalog an ESM compilation was requested for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompilationTier {
  Bundle,
  Builtin,
}

/// Telemetry sink for compile-level events. Implementations must be
/// thread-safe and must not touch registry state.
pub trait CompilationObserver: Send + Sync {
  fn on_esm_compilation_start(&self, _specifier: &Url, _tier: CompilationTier) {
  }
  fn on_compile_cache_found(&self) {}
  fn on_compile_cache_rejected(&self) {}
  fn on_compile_cache_generated(&self) {}
  fn on_compile_cache_generation_failed(&self) {}
  fn on_json_compilation_start(&self, _len: usize) {}
  fn on_wasm_compilation_start(&self, _len: usize) {}
  fn on_wasm_compilation_from_cache(&self) {}
  fn on_script_compilation_start(&self, _name: &str) {}
}

#[derive(Debug, Default)]
pub struct NoopCompilationObserver;

impl CompilationObserver for NoopCompilationObserver {}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResolveOutcome {
  Found,
  NotFound,
}

/// Telemetry sink for registry-level resolution. Called once per top-level
/// resolve; delegation to a parent registry reports through the parent's
/// own observer instead.
pub trait ResolveObserver: Send + Sync {
  fn on_resolve_module(
    &self,
    _specifier: &Url,
    _ty: ResolveContextType,
    _source: ResolveSource,
    _outcome: ResolveOutcome,
  ) {
  }
}

#[derive(Debug, Default)]
pub struct NoopResolveObserver;

impl ResolveObserver for NoopResolveObserver {}

/// Populates a synthetic module's exports. Returns false iff an exception
/// has been scheduled on the isolate.
///
/// Callbacks may run concurrently on multiple isolates and more than once
/// per isolate; they must be idempotent and thread-safe, and their side
/// effects must be confined to the provided [`ModuleNamespace`].
pub type EvaluateCallback = Arc<
  dyn for<'s> Fn(
      &mut v8::PinScope<'s, 's>,
      &Url,
      &ModuleNamespace<'_, '_>,
      &dyn CompilationObserver,
    ) -> bool
    + Send
    + Sync,
>;

/// Registry-level evaluation hook. When configured, evaluation of ESM
/// modules and of EVAL-flagged synthetic modules is delegated here; the
/// callback returns the evaluation promise, or None with an exception
/// scheduled.
pub type EvalCallback = Arc<
  dyn for<'s> Fn(
      &mut v8::PinScope<'s, '_>,
      &Module,
      v8::Local<'s, v8::Module>,
      &dyn CompilationObserver,
    ) -> Option<v8::Local<'s, v8::Promise>>
    + Send
    + Sync,
>;

/// Short-lived view over a synthetic module's export surface, handed to the
/// module's [`EvaluateCallback`]. `"default"` is always settable; any other
/// name must have been declared up front.
pub struct ModuleNamespace<'a, 's> {
  module: v8::Local<'s, v8::Module>,
  named_exports: &'a [String],
}

impl<'a, 's> ModuleNamespace<'a, 's> {
  pub(crate) fn new(
    module: v8::Local<'s, v8::Module>,
    named_exports: &'a [String],
  ) -> Self {
    ModuleNamespace {
      module,
      named_exports,
    }
  }

  pub fn set<'b>(
    &self,
    scope: &mut v8::PinScope<'b, 'b>,
    name: &str,
    value: v8::Local<'b, v8::Value>,
  ) -> bool {
    if name != "default" && !self.named_exports.iter().any(|n| n == name) {
      throw_error(scope, format!("Module does not export {name}"));
      return false;
    }
    let key = v8::String::new(scope, name).unwrap();
    match self.module.set_synthetic_module_export(scope, key, value) {
      Some(true) => true,
      Some(false) => {
        throw_error(
          scope,
          format!("Failed to set synthetic module export {name}"),
        );
        false
      }
      None => false,
    }
  }

  pub fn set_default<'b>(
    &self,
    scope: &mut v8::PinScope<'b, 'b>,
    value: v8::Local<'b, v8::Value>,
  ) -> bool {
    self.set(scope, "default", value)
  }

  /// Declared export names, not including the implicit `"default"`.
  pub fn named_exports(&self) -> &[String] {
    self.named_exports
  }
}

enum ModuleKind {
  Es {
    code: ModuleCode,
    /// Engine bytecode from the first successful compile. Readers borrow it
    /// concurrently; the slot is only replaced under the write guard.
    cached_data: RwLock<Option<Box<[u8]>>>,
  },
  Synthetic {
    evaluate: EvaluateCallback,
    named_exports: Vec<String>,
  },
}

/// A unit of loaded code: either source text the engine parses, or a
/// host-synthesized module whose exports are installed by a callback.
///
/// Modules are immutable once constructed and shared read-only across
/// isolates behind `Arc`.
pub struct Module {
  specifier: Url,
  ty: ModuleType,
  flags: ModuleFlags,
  kind: ModuleKind,
}

impl std::fmt::Debug for Module {
  fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
    let kind = match self.kind {
      ModuleKind::Es { .. } => "es",
      ModuleKind::Synthetic { .. } => "synthetic",
    };
    f.debug_struct("Module")
      .field("specifier", &self.specifier.as_str())
      .field("ty", &self.ty)
      .field("flags", &self.flags)
      .field("kind", &kind)
      .finish()
  }
}

impl Module {
  pub fn new_esm(
    specifier: Url,
    ty: ModuleType,
    code: impl Into<ModuleCode>,
  ) -> Module {
    Self::new_esm_with_flags(specifier, ty, code, ModuleFlags::NONE)
  }

  pub fn new_esm_with_flags(
    specifier: Url,
    ty: ModuleType,
    code: impl Into<ModuleCode>,
    flags: ModuleFlags,
  ) -> Module {
    Module {
      specifier,
      ty,
      flags: flags | ModuleFlags::ESM | ModuleFlags::EVAL,
      kind: ModuleKind::Es {
        code: code.into(),
        cached_data: RwLock::new(None),
      },
    }
  }

  pub fn new_synthetic(
    specifier: Url,
    ty: ModuleType,
    evaluate: EvaluateCallback,
    named_exports: Vec<String>,
  ) -> Module {
    Self::new_synthetic_with_flags(
      specifier,
      ty,
      evaluate,
      named_exports,
      ModuleFlags::NONE,
    )
  }

  pub fn new_synthetic_with_flags(
    specifier: Url,
    ty: ModuleType,
    evaluate: EvaluateCallback,
    mut named_exports: Vec<String>,
    flags: ModuleFlags,
  ) -> Module {
    debug_assert!(!flags.contains(ModuleFlags::ESM));
    debug_assert!(!flags.contains(ModuleFlags::MAIN));
    // "default" is implicit.
    named_exports.retain(|name| name != "default");
    Module {
      specifier,
      ty,
      flags,
      kind: ModuleKind::Synthetic {
        evaluate,
        named_exports,
      },
    }
  }

  pub fn specifier(&self) -> &Url {
    &self.specifier
  }

  pub fn module_type(&self) -> ModuleType {
    self.ty
  }

  pub fn flags(&self) -> ModuleFlags {
    self.flags
  }

  pub fn is_esm(&self) -> bool {
    self.flags.contains(ModuleFlags::ESM)
  }

  pub fn is_main(&self) -> bool {
    self.flags.contains(ModuleFlags::MAIN)
  }

  pub fn is_eval(&self) -> bool {
    self.flags.contains(ModuleFlags::EVAL)
  }

  /// Late check that this module is willing to serve the given context.
  pub fn evaluate_context(&self, context: &ResolveContext) -> bool {
    context.specifier == self.specifier
  }

  /// Produces the engine's representation of this module. For ESM this
  /// compiles the source, consuming cached bytecode when present and
  /// generating it after the first cold compile. Returns None with an
  /// exception scheduled on failure.
  pub(crate) fn get_descriptor<'s, 'i>(
    &self,
    scope: &mut v8::PinScope<'s, 'i>,
    observer: &dyn CompilationObserver,
  ) -> Option<v8::Local<'s, v8::Module>> {
    match &self.kind {
      ModuleKind::Es { code, cached_data } => {
        observer.on_esm_compilation_start(
          &self.specifier,
          match self.ty {
            ModuleType::Bundle => CompilationTier::Bundle,
            _ => CompilationTier::Builtin,
          },
        );

        let name_str = v8::String::new(scope, self.specifier.as_str())?;
        let source_str = v8::String::new(scope, code.as_str())?;
        let origin = script_origin(scope, name_str, true);

        // Multiple isolates may read the cached bytecode at once; using it
        // does not modify it.
        let guard = cached_data.read();
        let (maybe_module, cache_rejected) = match guard.as_deref() {
          Some(cache) => {
            let mut source = v8::script_compiler::Source::new_with_cached_data(
              source_str,
              Some(&origin),
              v8::CachedData::new(cache),
            );
            let maybe_module = v8::script_compiler::compile_module2(
              scope,
              &mut source,
              v8::script_compiler::CompileOptions::ConsumeCodeCache,
              v8::script_compiler::NoCacheReason::NoReason,
            );
            // The engine flags incompatible cached data and silently falls
            // back to a full compile.
            let rejected = match source.get_cached_data() {
              Some(cached) => cached.rejected(),
              None => true,
            };
            if rejected {
              log::warn!(
                "cached data for module {} was rejected",
                self.specifier
              );
              observer.on_compile_cache_rejected();
            } else {
              observer.on_compile_cache_found();
            }
            (maybe_module, Some(rejected))
          }
          None => {
            let mut source =
              v8::script_compiler::Source::new(source_str, Some(&origin));
            (v8::script_compiler::compile_module(scope, &mut source), None)
          }
        };
        drop(guard);

        let module = maybe_module?;

        // The compile ran without consuming a cache; try generating one.
        // Threads can line up here, so re-check the slot under the write
        // guard and store at most once. A rejected cache left stale
        // bytecode in the slot; drop it so a compatible copy replaces it.
        if cache_rejected != Some(false) {
          let mut slot = cached_data.write();
          if cache_rejected == Some(true) {
            *slot = None;
          }
          if slot.is_none() {
            match module.get_unbound_module_script(scope).create_code_cache()
            {
              Some(cache) => {
                *slot = Some(cache.to_vec().into_boxed_slice());
                observer.on_compile_cache_generated();
              }
              None => observer.on_compile_cache_generation_failed(),
            }
          }
        }

        Some(module)
      }
      ModuleKind::Synthetic { named_exports, .. } => {
        let name_str = v8::String::new(scope, self.specifier.as_str())?;
        let mut export_names = Vec::with_capacity(named_exports.len() + 1);
        export_names.push(v8::String::new(scope, "default")?);
        for name in named_exports {
          export_names.push(v8::String::new(scope, name)?);
        }
        Some(v8::Module::create_synthetic_module(
          scope,
          name_str,
          &export_names,
          map::synthetic_module_evaluation_steps,
        ))
      }
    }
  }

  /// Instantiates the engine module unless a prior instantiation already
  /// moved its status forward. Returns false with an exception scheduled on
  /// engine failure.
  pub(crate) fn instantiate(
    &self,
    scope: &mut v8::PinScope,
    module: v8::Local<v8::Module>,
  ) -> bool {
    if module.get_status() != v8::ModuleStatus::Uninstantiated {
      return true;
    }
    module
      .instantiate_module(scope, map::module_resolve_callback)
      .is_some()
  }

  fn ensure_instantiated(
    &self,
    scope: &mut v8::PinScope,
    module: v8::Local<v8::Module>,
  ) -> bool {
    module.get_status() != v8::ModuleStatus::Uninstantiated
      || self.instantiate(scope, module)
  }

  /// Evaluates the module, yielding the engine's evaluation promise.
  ///
  /// ESM and EVAL-flagged synthetic modules are routed through the
  /// registry's EvalCallback when one is configured; everything else goes
  /// through the engine, which drives synthetic modules into
  /// [`Module::evaluate_steps`] via the evaluation-steps trampoline.
  pub(crate) fn evaluate<'s, 'i>(
    &self,
    scope: &mut v8::PinScope<'s, 'i>,
    module: v8::Local<'s, v8::Module>,
    observer: &dyn CompilationObserver,
    eval_callback: Option<&EvalCallback>,
  ) -> Option<v8::Local<'s, v8::Value>> {
    if !self.ensure_instantiated(scope, module) {
      return None;
    }

    match &self.kind {
      ModuleKind::Es { .. } => {
        // ESM is always EVAL.
        if let Some(eval_callback) = eval_callback {
          return eval_callback(scope, self, module, observer)
            .map(|promise| promise.into());
        }
        module.evaluate(scope)
      }
      ModuleKind::Synthetic { .. } => {
        if self.is_eval() {
          if let Some(eval_callback) = eval_callback {
            return eval_callback(scope, self, module, observer)
              .map(|promise| promise.into());
          }
        }
        module.evaluate(scope)
      }
    }
  }

  /// The synthetic evaluation steps, dispatched from the engine trampoline
  /// while the module's status is "evaluating".
  pub(crate) fn evaluate_steps<'s: 'i, 'i>(
    &self,
    scope: &mut v8::PinScope<'s, 'i>,
    module: v8::Local<'s, v8::Module>,
    observer: &dyn CompilationObserver,
    eval_callback: Option<&EvalCallback>,
  ) -> Option<v8::Local<'s, v8::Value>> {
    let ModuleKind::Synthetic {
      evaluate,
      named_exports,
    } = &self.kind
    else {
      log::error!(
        "evaluation steps invoked for a source-text module: {}",
        self.specifier
      );
      throw_error(scope, "Requested module does not exist");
      return None;
    };

    if self.is_eval() {
      if let Some(eval_callback) = eval_callback {
        return eval_callback(scope, self, module, observer)
          .map(|promise| promise.into());
      }
    }

    // The return value is a promise that is already resolved; top-level
    // await makes every module evaluation promise-shaped.
    let resolver = v8::PromiseResolver::new(scope)?;
    let namespace = ModuleNamespace::new(module, named_exports);
    if !(evaluate)(scope, &self.specifier, &namespace, observer) {
      // An exception is already scheduled on the isolate.
      return None;
    }
    let undefined = v8::undefined(scope);
    resolver.resolve(scope, undefined.into())?;
    Some(resolver.get_promise(scope).into())
  }
}

// Evaluation callbacks for the common synthetic module shapes. These can be
// invoked multiple times and from multiple threads; each returned callback
// is thread-safe and idempotent.

/// Synthetic module whose default export is the source text as a string.
pub fn text_module_handler(code: impl Into<ModuleCode>) -> EvaluateCallback {
  let code = code.into();
  Arc::new(move |scope, _specifier, namespace, _observer| {
    let text = v8::String::new(scope, code.as_str()).unwrap();
    namespace.set_default(scope, text.into())
  })
}

/// Synthetic module whose default export is the bytes copied into an
/// engine-owned ArrayBuffer.
pub fn data_module_handler(bytes: impl Into<ModuleBytes>) -> EvaluateCallback {
  let bytes = bytes.into();
  Arc::new(move |scope, _specifier, namespace, _observer| {
    let backing =
      v8::ArrayBuffer::new_backing_store_from_vec(bytes.as_bytes().to_vec())
        .make_shared();
    let buffer = v8::ArrayBuffer::with_backing_store(scope, &backing);
    namespace.set_default(scope, buffer.into())
  })
}

/// Synthetic module whose default export is the parsed JSON value.
pub fn json_module_handler(code: impl Into<ModuleCode>) -> EvaluateCallback {
  let code = code.into();
  Arc::new(move |scope, _specifier, namespace, observer| {
    observer.on_json_compilation_start(code.as_str().len());
    let source = v8::String::new_from_utf8(
      scope,
      strip_bom(code.as_str().as_bytes()),
      v8::NewStringType::Normal,
    )
    .unwrap();
    match v8::json::parse(scope, source) {
      Some(parsed) => namespace.set_default(scope, parsed),
      None => false,
    }
  })
}

/// Synthetic module whose default export is a compiled Wasm module object.
/// The compiled artifact is cached per handler so later isolates skip
/// recompilation.
pub fn wasm_module_handler(bytes: impl Into<ModuleBytes>) -> EvaluateCallback {
  let bytes = bytes.into();
  let cache: Arc<Mutex<Option<v8::CompiledWasmModule>>> =
    Arc::new(Mutex::new(None));
  Arc::new(move |scope, specifier, namespace, observer| {
    {
      let guard = cache.lock();
      if let Some(compiled) = guard.as_ref() {
        observer.on_wasm_compilation_from_cache();
        let Some(module) =
          v8::WasmModuleObject::from_compiled_module(scope, compiled)
        else {
          return false;
        };
        return namespace.set_default(scope, module.into());
      }
    }

    observer.on_wasm_compilation_start(bytes.as_bytes().len());
    let Some(module) = v8::WasmModuleObject::compile(scope, bytes.as_bytes())
    else {
      throw_error(scope, format!("Failed to compile Wasm module '{specifier}'"));
      return false;
    };
    *cache.lock() = Some(module.get_compiled_module());
    namespace.set_default(scope, module.into())
  })
}

/// Compiles a bare function from source, optionally against an extension
/// object whose properties are visible in the function scope. Returns None
/// with an exception scheduled on failure.
pub fn compile_eval_function<'s, 'i>(
  scope: &mut v8::PinScope<'s, 'i>,
  code: &str,
  name: &str,
  extension: Option<v8::Local<'s, v8::Object>>,
  observer: &dyn CompilationObserver,
) -> Option<v8::Local<'s, v8::Function>> {
  observer.on_script_compilation_start(name);
  let name_str = v8::String::new(scope, name)?;
  let source_str = v8::String::new(scope, code)?;
  let origin = script_origin(scope, name_str, false);
  let mut source =
    v8::script_compiler::Source::new(source_str, Some(&origin));
  match extension {
    Some(extension) => v8::script_compiler::compile_function(
      scope,
      &mut source,
      &[],
      &[extension],
      v8::script_compiler::CompileOptions::NoCompileOptions,
      v8::script_compiler::NoCacheReason::NoReason,
    ),
    None => v8::script_compiler::compile_function(
      scope,
      &mut source,
      &[],
      &[],
      v8::script_compiler::CompileOptions::NoCompileOptions,
      v8::script_compiler::NoCacheReason::NoReason,
    ),
  }
}
