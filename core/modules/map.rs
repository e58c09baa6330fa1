// Copyright 2025 the Gantry authors. MIT license.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::c_void;
use std::rc::Rc;
use std::sync::Arc;

use url::Url;

use super::CompatOptions;
use super::CompilationObserver;
use super::EvalCallback;
use super::Module;
use super::ModuleRegistry;
use super::ResolveContext;
use super::ResolveContextType;
use super::ResolveSource;
use super::resolve_context_type_for;
use crate::error::throw_error;
use crate::error::throw_type_error;
use crate::module_specifier::normalize_path;
use crate::module_specifier::resolve_import;
use crate::module_specifier::without_search_and_fragment;

/// The context embedder data slot holding the back-pointer to the
/// [`IsolateModuleRegistry`].
pub const MODULE_REGISTRY_SLOT_INDEX: i32 = 2;

unsafe fn clone_rc_raw<T>(raw: *const T) -> Rc<T> {
  unsafe {
    Rc::increment_strong_count(raw);
    Rc::from_raw(raw)
  }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequireOption {
  Default,
  /// Convert the "module not found" failure into an empty result. All
  /// other errors still propagate.
  ReturnEmpty,
}

/// A resolved module pinned into an isolate: the engine module handle, the
/// context it was resolved under, and the backing catalog module.
///
/// The specifier is the pre-normalization URL (query and fragment
/// preserved) as seen by the engine, because the same underlying module may
/// be exposed under multiple URL variants.
#[derive(Clone)]
pub(crate) struct Entry {
  pub handle: v8::Global<v8::Module>,
  pub ty: ResolveContextType,
  pub specifier: Url,
  pub module: Arc<Module>,
}

#[derive(Default)]
struct LookupCache {
  entries: Vec<Entry>,
  by_handle: HashMap<v8::Global<v8::Module>, usize>,
  by_context: HashMap<(ResolveContextType, Url), usize>,
  by_url: HashMap<Url, usize>,
}

enum ResolveMiss {
  /// Resolution exhausted every tier; no exception is scheduled.
  NotFound,
  /// Descriptor creation failed; the exception is already scheduled.
  Failed,
}

/// Binds a [`ModuleRegistry`] to an isolate context.
///
/// Lives behind the context's embedder data slot and serves the engine
/// callbacks (static resolve, dynamic import, import.meta, synthetic
/// evaluation steps) as well as the host's synchronous `require` entry
/// point. Single-threaded; only touched under the isolate lock.
pub struct IsolateModuleRegistry {
  inner: Arc<ModuleRegistry>,
  observer: Arc<dyn CompilationObserver>,
  compat: CompatOptions,
  cache: RefCell<LookupCache>,
}

impl IsolateModuleRegistry {
  pub(crate) fn new(
    inner: Arc<ModuleRegistry>,
    observer: Arc<dyn CompilationObserver>,
    compat: CompatOptions,
  ) -> Self {
    IsolateModuleRegistry {
      inner,
      observer,
      compat,
      cache: RefCell::new(LookupCache::default()),
    }
  }

  /// Recovers the binding for the current context from embedder data.
  pub fn from_scope(
    scope: &mut v8::PinScope,
  ) -> Option<Rc<IsolateModuleRegistry>> {
    let context = scope.get_current_context();
    // SAFETY: the slot is set by attach_to_isolate and cleared on dispose
    let ptr = unsafe {
      context.get_aligned_pointer_from_embedder_data(MODULE_REGISTRY_SLOT_INDEX)
    };
    if ptr.is_null() {
      return None;
    }
    Some(unsafe { clone_rc_raw(ptr as *const IsolateModuleRegistry) })
  }

  pub fn bundle_base(&self) -> &Url {
    self.inner.bundle_base()
  }

  pub(crate) fn compat(&self) -> CompatOptions {
    self.compat
  }

  pub(crate) fn observer(&self) -> &dyn CompilationObserver {
    self.observer.as_ref()
  }

  pub(crate) fn eval_callback(&self) -> Option<&EvalCallback> {
    self.inner.eval_callback()
  }

  /// Looks up a previously resolved module by its engine handle.
  pub(crate) fn lookup(
    &self,
    scope: &mut v8::PinScope,
    module: v8::Local<v8::Module>,
  ) -> Option<Entry> {
    let handle = v8::Global::new(scope, module);
    let cache = self.cache.borrow();
    cache
      .by_handle
      .get(&handle)
      .map(|&index| cache.entries[index].clone())
  }

  fn lookup_by_url(&self, url: &Url) -> Option<Entry> {
    let cache = self.cache.borrow();
    cache
      .by_url
      .get(url)
      .map(|&index| cache.entries[index].clone())
  }

  fn lookup_context(&self, context: &ResolveContext) -> Option<Entry> {
    let cache = self.cache.borrow();
    cache
      .by_context
      .get(&(context.ty, context.specifier.clone()))
      .map(|&index| cache.entries[index].clone())
  }

  fn insert(
    &self,
    handle: v8::Global<v8::Module>,
    context: &ResolveContext,
    module: Arc<Module>,
  ) -> Entry {
    let entry = Entry {
      handle,
      ty: context.ty,
      specifier: context.specifier.clone(),
      module,
    };
    let mut cache = self.cache.borrow_mut();
    let index = cache.entries.len();
    cache.by_handle.entry(entry.handle.clone()).or_insert(index);
    cache
      .by_context
      .entry((entry.ty, entry.specifier.clone()))
      .or_insert(index);
    cache.by_url.entry(entry.specifier.clone()).or_insert(index);
    cache.entries.push(entry.clone());
    entry
  }

  /// Consults the lookup cache, then the shared registry. New entries are
  /// keyed by the original specifier so URL variants with query or fragment
  /// keep their user-visible identity, while the inner registry is queried
  /// with both stripped.
  fn cached_or_resolve(
    &self,
    scope: &mut v8::PinScope,
    context: &ResolveContext,
  ) -> Result<Entry, ResolveMiss> {
    if let Some(entry) = self.lookup_context(context) {
      return Ok(entry);
    }

    let inner_context = ResolveContext {
      ty: context.ty,
      source: context.source,
      specifier: without_search_and_fragment(&context.specifier),
      referrer: context.referrer.clone(),
      raw_specifier: context.raw_specifier.clone(),
      attributes: context.attributes.clone(),
    };
    let Some(module) = self.inner.resolve(&inner_context) else {
      return Err(ResolveMiss::NotFound);
    };
    let Some(descriptor) = module.get_descriptor(scope, self.observer.as_ref())
    else {
      return Err(ResolveMiss::Failed);
    };
    let handle = v8::Global::new(scope, descriptor);
    Ok(self.insert(handle, context, module))
  }

  /// Resolves a static import to its engine module. On failure an exception
  /// has been scheduled.
  pub fn resolve<'s, 'i>(
    &self,
    scope: &mut v8::PinScope<'s, 'i>,
    context: &ResolveContext,
  ) -> Option<v8::Local<'s, v8::Module>> {
    match self.cached_or_resolve(scope, context) {
      Ok(entry) => Some(v8::Local::new(scope, &entry.handle)),
      Err(ResolveMiss::Failed) => None,
      Err(ResolveMiss::NotFound) => {
        throw_error(scope, format!("Module not found: {}", context.specifier));
        None
      }
    }
  }

  /// Resolves and evaluates a module for `import(...)`, settling `resolver`
  /// with the module namespace. Synchronous errors reject the resolver; no
  /// exception escapes to the engine.
  pub(crate) fn dynamic_resolve(
    &self,
    scope: &mut v8::PinScope,
    specifier: Url,
    referrer: Url,
    raw_specifier: String,
    forced_type: Option<ResolveContextType>,
    resolver: v8::Local<v8::PromiseResolver>,
  ) {
    v8::tc_scope!(let tc_scope, scope);
    let settled = self.dynamic_resolve_inner(
      tc_scope,
      specifier,
      referrer,
      raw_specifier,
      forced_type,
      resolver,
    );
    if settled.is_none() && tc_scope.has_caught() {
      let exception = tc_scope.exception().unwrap();
      resolver.reject(tc_scope, exception);
    }
  }

  fn dynamic_resolve_inner(
    &self,
    scope: &mut v8::PinScope,
    specifier: Url,
    referrer: Url,
    raw_specifier: String,
    forced_type: Option<ResolveContextType>,
    resolver: v8::Local<v8::PromiseResolver>,
  ) -> Option<()> {
    // The referrer must have been resolved previously or something is off.
    let Some(referring) = self.lookup_by_url(&referrer) else {
      throw_type_error(
        scope,
        format!("Referring module not found in the registry: {referrer}"),
      );
      return None;
    };

    // The tier comes from the referring module, unless process redirection
    // already pinned it to the builtin-only tier.
    let ty = forced_type
      .unwrap_or_else(|| resolve_context_type_for(referring.module.module_type()));
    let context = ResolveContext {
      ty,
      source: ResolveSource::DynamicImport,
      specifier,
      referrer,
      raw_specifier: Some(raw_specifier),
      attributes: HashMap::new(),
    };

    let entry = match self.cached_or_resolve(scope, &context) {
      Ok(entry) => entry,
      Err(ResolveMiss::Failed) => return None,
      Err(ResolveMiss::NotFound) => {
        throw_error(scope, format!("Module not found: {}", context.specifier));
        return None;
      }
    };

    let module = v8::Local::new(scope, &entry.handle);
    let value = entry.module.evaluate(
      scope,
      module,
      self.observer.as_ref(),
      self.inner.eval_callback(),
    )?;
    let eval_promise = v8::Local::<v8::Promise>::try_from(value)
      .expect("Expected to get promise as module evaluation result");

    // The outer promise adopts the module namespace once the evaluation
    // promise settles; the reactions share one boxed state and only one of
    // them ever runs.
    let state = Box::new(DynImportEvaluation {
      resolver: v8::Global::new(scope, resolver),
      module: v8::Global::new(scope, module),
    });
    let external =
      v8::External::new(scope, Box::into_raw(state) as *mut c_void);
    let on_fulfilled = v8::Function::builder(dynamic_import_fulfilled)
      .data(external.into())
      .build(scope)?;
    let on_rejected = v8::Function::builder(dynamic_import_rejected)
      .data(external.into())
      .build(scope)?;
    eval_promise.then2(scope, on_fulfilled, on_rejected)?;
    Some(())
  }

  /// Synchronous resolve-instantiate-evaluate in support of APIs like the
  /// CommonJS require. Returns the module namespace object; in CommonJS the
  /// `require()` function then picks the default export off of it.
  pub fn require<'s, 'i>(
    &self,
    scope: &mut v8::PinScope<'s, 'i>,
    context: &ResolveContext,
    option: RequireOption,
  ) -> Option<v8::Local<'s, v8::Object>> {
    let entry = match self.cached_or_resolve(scope, context) {
      Ok(entry) => entry,
      Err(ResolveMiss::Failed) => return None,
      Err(ResolveMiss::NotFound) => {
        if option == RequireOption::ReturnEmpty {
          return None;
        }
        throw_error(scope, format!("Module not found: {}", context.specifier));
        return None;
      }
    };

    let module = v8::Local::new(scope, &entry.handle);
    let status = module.get_status();

    // A prior evaluation failed; propagate the same error.
    if status == v8::ModuleStatus::Errored {
      let exception = module.get_exception();
      scope.throw_exception(exception);
      return None;
    }

    // The engine will not hand out exports of a source-text module that is
    // still evaluating.
    if entry.module.is_esm() && status == v8::ModuleStatus::Evaluating {
      throw_error(
        scope,
        format!(
          "Circular dependency when resolving module: {}",
          context.specifier
        ),
      );
      return None;
    }

    // A synthetic module mid-evaluation hands out its namespace as-is. The
    // view may still be partial; CommonJS-style cycles depend on exactly
    // that, with the same caveats as in Node.js.
    if status == v8::ModuleStatus::Evaluated
      || status == v8::ModuleStatus::Evaluating
    {
      let namespace = module.get_module_namespace();
      return Some(namespace.try_into().unwrap());
    }

    let value = entry.module.evaluate(
      scope,
      module,
      self.observer.as_ref(),
      self.inner.eval_callback(),
    )?;
    let promise = v8::Local::<v8::Promise>::try_from(value)
      .expect("Expected to get promise as module evaluation result");

    // Run the microtasks once so promises settled during top-level
    // evaluation have a chance to resolve.
    scope.perform_microtask_checkpoint();

    match promise.state() {
      v8::PromiseState::Fulfilled => {
        let namespace = module.get_module_namespace();
        Some(namespace.try_into().unwrap())
      }
      v8::PromiseState::Rejected => {
        let exception = promise.result(scope);
        scope.throw_exception(exception);
        None
      }
      v8::PromiseState::Pending => {
        throw_error(
          scope,
          format!(
            "Use of top-level await in a synchronously required module is \
             restricted to promises that are resolved synchronously. \
             Specifier: \"{}\".",
            context.specifier
          ),
        );
        None
      }
    }
  }
}

struct DynImportEvaluation {
  resolver: v8::Global<v8::PromiseResolver>,
  module: v8::Global<v8::Module>,
}

fn dynamic_import_evaluation_from(
  arg: v8::Local<v8::Value>,
) -> Box<DynImportEvaluation> {
  let external = v8::Local::<v8::External>::try_from(arg).unwrap();
  // SAFETY: the pointer was produced by Box::into_raw in
  // dynamic_resolve_inner and only one promise reaction ever runs.
  unsafe { Box::from_raw(external.value() as *mut DynImportEvaluation) }
}

fn dynamic_import_fulfilled(
  scope: &mut v8::PinScope,
  args: v8::FunctionCallbackArguments,
  _rv: v8::ReturnValue,
) {
  let state = dynamic_import_evaluation_from(args.data());
  let module = v8::Local::new(scope, &state.module);
  let namespace = module.get_module_namespace();
  let resolver = v8::Local::new(scope, &state.resolver);
  resolver.resolve(scope, namespace);
}

fn dynamic_import_rejected(
  scope: &mut v8::PinScope,
  args: v8::FunctionCallbackArguments,
  _rv: v8::ReturnValue,
) {
  let state = dynamic_import_evaluation_from(args.data());
  let resolver = v8::Local::new(scope, &state.resolver);
  resolver.reject(scope, args.get(0));
}

// Bare specifiers recognized as Node built-ins under node-compat.
static NODE_BUILTINS: &[&str] = &[
  "assert",
  "async_hooks",
  "buffer",
  "crypto",
  "diagnostics_channel",
  "dns",
  "events",
  "fs",
  "net",
  "os",
  "path",
  "process",
  "querystring",
  "stream",
  "string_decoder",
  "timers",
  "url",
  "util",
  "zlib",
];

fn check_node_specifier(specifier: &str) -> Option<String> {
  if NODE_BUILTINS.contains(&specifier) {
    Some(format!("node:{specifier}"))
  } else {
    None
  }
}

fn node_process_specifier(process_v2: bool) -> &'static str {
  if process_v2 {
    "node-internal:public_process"
  } else {
    "node-internal:legacy_process"
  }
}

/// Applies node-compat rewriting to a raw specifier. `node:process` is
/// additionally redirected to the flag-selected implementation and forced
/// into the builtin-only tier.
fn rewrite_specifier(
  compat: CompatOptions,
  raw_specifier: &str,
) -> (String, Option<ResolveContextType>) {
  let mut specifier = raw_specifier.to_string();
  if compat.node_compat {
    if let Some(rewritten) = check_node_specifier(&specifier) {
      specifier = rewritten;
    }
  }
  if specifier == "node:process" {
    return (
      node_process_specifier(compat.node_process_v2).to_string(),
      Some(ResolveContextType::BuiltinOnly),
    );
  }
  (specifier, None)
}

/// Called by the engine for every static import during instantiation.
pub(crate) fn module_resolve_callback<'s>(
  context: v8::Local<'s, v8::Context>,
  specifier: v8::Local<'s, v8::String>,
  import_attributes: v8::Local<'s, v8::FixedArray>,
  referrer: v8::Local<'s, v8::Module>,
) -> Option<v8::Local<'s, v8::Module>> {
  // SAFETY: `CallbackScope` can be safely constructed from `Local<Context>`
  v8::callback_scope!(unsafe scope, context);

  let Some(registry) = IsolateModuleRegistry::from_scope(scope) else {
    throw_error(scope, "No module registry attached to the current context");
    return None;
  };

  // Import attributes can alter how a module is interpreted; reject
  // anything we do not implement.
  if import_attributes.length() > 0 {
    throw_type_error(scope, "Import attributes are not supported");
    return None;
  }

  let raw_specifier = specifier.to_rust_string_lossy(scope);

  let (mut ty, referrer_url) = match registry.lookup(scope, referrer) {
    Some(entry) => (
      resolve_context_type_for(entry.module.module_type()),
      entry.specifier,
    ),
    None => (ResolveContextType::Bundle, registry.bundle_base().clone()),
  };

  let (effective_specifier, forced_type) =
    rewrite_specifier(registry.compat(), &raw_specifier);
  if let Some(forced) = forced_type {
    ty = forced;
  }

  let Ok(url) = resolve_import(&effective_specifier, &referrer_url) else {
    throw_type_error(
      scope,
      format!("Invalid module specifier: {raw_specifier}"),
    );
    return None;
  };

  let resolve_context = ResolveContext {
    ty,
    source: ResolveSource::StaticImport,
    // Percent-encoding in the path is normalized so lookups match.
    specifier: normalize_path(&url),
    referrer: referrer_url,
    raw_specifier: Some(effective_specifier),
    attributes: HashMap::new(),
  };
  registry.resolve(scope, &resolve_context)
}

/// Called by the engine when `import(...)` is used. Always produces a
/// promise; synchronous errors become rejections.
pub(crate) fn host_import_module_dynamically_callback<'s, 'i>(
  scope: &mut v8::PinScope<'s, 'i>,
  _host_defined_options: v8::Local<'s, v8::Data>,
  resource_name: v8::Local<'s, v8::Value>,
  specifier: v8::Local<'s, v8::String>,
  import_attributes: v8::Local<'s, v8::FixedArray>,
) -> Option<v8::Local<'s, v8::Promise>> {
  let resolver = v8::PromiseResolver::new(scope)?;
  let promise = resolver.get_promise(scope);

  let Some(registry) = IsolateModuleRegistry::from_scope(scope) else {
    reject_with_error(
      scope,
      resolver,
      "No module registry attached to the current context",
    );
    return Some(promise);
  };

  if import_attributes.length() > 0 {
    reject_with_type_error(
      scope,
      resolver,
      "Import attributes are not supported",
    );
    return Some(promise);
  }

  let raw_specifier = specifier.to_rust_string_lossy(scope);
  let referrer = resource_name
    .to_string(scope)
    .and_then(|name| Url::parse(&name.to_rust_string_lossy(scope)).ok())
    .unwrap_or_else(|| registry.bundle_base().clone());

  let (effective_specifier, forced_type) =
    rewrite_specifier(registry.compat(), &raw_specifier);

  let Ok(url) = resolve_import(&effective_specifier, &referrer) else {
    reject_with_type_error(
      scope,
      resolver,
      format!("Invalid module specifier: {raw_specifier}"),
    );
    return Some(promise);
  };

  registry.dynamic_resolve(
    scope,
    normalize_path(&url),
    referrer,
    effective_specifier,
    forced_type,
    resolver,
  );
  Some(promise)
}

fn reject_with_error(
  scope: &mut v8::PinScope,
  resolver: v8::Local<v8::PromiseResolver>,
  message: impl AsRef<str>,
) {
  let message = v8::String::new(scope, message.as_ref()).unwrap();
  let exception = v8::Exception::error(scope, message);
  resolver.reject(scope, exception);
}

fn reject_with_type_error(
  scope: &mut v8::PinScope,
  resolver: v8::Local<v8::PromiseResolver>,
  message: impl AsRef<str>,
) {
  let message = v8::String::new(scope, message.as_ref()).unwrap();
  let exception = v8::Exception::type_error(scope, message);
  resolver.reject(scope, exception);
}

/// Sets up `import.meta` for a module: `main`, `url`, and `resolve`.
pub(crate) extern "C" fn host_initialize_import_meta_object_callback(
  context: v8::Local<v8::Context>,
  module: v8::Local<v8::Module>,
  meta: v8::Local<v8::Object>,
) {
  // SAFETY: `CallbackScope` can be safely constructed from `Local<Context>`
  v8::callback_scope!(unsafe scope, context);

  let Some(registry) = IsolateModuleRegistry::from_scope(scope) else {
    return;
  };
  let Some(entry) = registry.lookup(scope, module) else {
    return;
  };

  let main_key = v8::String::new(scope, "main").unwrap();
  let main_val = v8::Boolean::new(scope, entry.module.is_main());
  if meta
    .create_data_property(scope, main_key.into(), main_val.into())
    .is_none()
  {
    // An exception is scheduled with the isolate; let it take over.
    return;
  }

  let url_key = v8::String::new(scope, "url").unwrap();
  let url_val = v8::String::new(scope, entry.specifier.as_str()).unwrap();
  if meta
    .create_data_property(scope, url_key.into(), url_val.into())
    .is_none()
  {
    return;
  }

  // import.meta.resolve(...) is effectively a shortcut for
  // new URL(specifier, import.meta.url).href plus path normalization. The
  // resolved URL is not checked against the registry.
  let builder =
    v8::FunctionBuilder::new(import_meta_resolve).data(url_val.into());
  let Some(resolve_val) =
    v8::FunctionBuilder::<v8::Function>::build(builder, scope)
  else {
    return;
  };
  let resolve_key = v8::String::new(scope, "resolve").unwrap();
  meta.create_data_property(scope, resolve_key.into(), resolve_val.into());
}

fn import_meta_resolve(
  scope: &mut v8::PinScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let referrer = args.data().to_rust_string_lossy(scope);
  // ToString coerces the argument; a coercion failure leaves its exception
  // scheduled.
  let Some(specifier) = args.get(0).to_string(scope) else {
    return;
  };
  let specifier = specifier.to_rust_string_lossy(scope);
  let resolved = Url::parse(&referrer)
    .ok()
    .and_then(|base| resolve_import(&specifier, &base).ok());
  match resolved {
    Some(url) => {
      let normalized = normalize_path(&url);
      rv.set(v8::String::new(scope, normalized.as_str()).unwrap().into());
    }
    // Unresolvable specifiers yield null.
    None => rv.set(v8::null(scope).into()),
  }
}

/// Trampoline installed as the evaluation steps of every synthetic module.
/// Recovers the registry from embedder data and dispatches to the module's
/// evaluation steps.
pub(crate) fn synthetic_module_evaluation_steps<'s>(
  context: v8::Local<'s, v8::Context>,
  module: v8::Local<'s, v8::Module>,
) -> Option<v8::Local<'s, v8::Value>> {
  // SAFETY: `CallbackScope` can be safely constructed from `Local<Context>`
  v8::callback_scope!(unsafe scope, context);

  let Some(registry) = IsolateModuleRegistry::from_scope(scope) else {
    log::error!("synthetic module evaluated without an attached registry");
    throw_error(scope, "Requested module does not exist");
    return None;
  };

  match registry.lookup(scope, module) {
    Some(entry) => entry.module.evaluate_steps(
      scope,
      module,
      registry.observer(),
      registry.eval_callback(),
    ),
    None => {
      // This should never actually happen but handle it anyway.
      log::error!("synthetic module not found in registry for evaluation");
      throw_error(scope, "Requested module does not exist");
      None
    }
  }
}

pub(crate) fn script_origin<'s, 'i>(
  s: &mut v8::PinScope<'s, 'i>,
  resource_name: v8::Local<'s, v8::String>,
  is_module: bool,
) -> v8::ScriptOrigin<'s> {
  v8::ScriptOrigin::new(
    s,
    resource_name.into(),
    0,
    0,
    false,
    0,
    None,
    false,
    false,
    is_module,
    None,
  )
}
