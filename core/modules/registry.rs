// Copyright 2025 the Gantry authors. MIT license.

use std::collections::HashMap;
use std::collections::HashSet;
use std::ffi::c_void;
use std::rc::Rc;
use std::sync::Arc;

use url::Url;

use super::CompilationObserver;
use super::EvalCallback;
use super::IsolateModuleRegistry;
use super::MODULE_REGISTRY_SLOT_INDEX;
use super::Module;
use super::ModuleBundle;
use super::ModuleType;
use super::RequireOption;
use super::ResolveContext;
use super::ResolveContextType;
use super::ResolveObserver;
use super::ResolveOutcome;
use super::ResolveSource;
use super::Resolved;
use super::map;
use crate::error::throw_error;
use crate::error::throw_type_error;
use crate::module_specifier::normalize_path;
use crate::module_specifier::resolve_import;

/// Host feature flags consumed by the isolate binding.
#[derive(Clone, Copy, Debug, Default)]
pub struct CompatOptions {
  /// Rewrite bare specifiers of recognized Node built-ins to `node:` URLs.
  pub node_compat: bool,
  /// Redirect `node:process` to the v2 (`public_process`) implementation.
  pub node_process_v2: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RegistryOptions {
  pub allow_fallback: bool,
}

fn tier_index(ty: ModuleType) -> usize {
  match ty {
    ModuleType::Bundle => 0,
    ModuleType::Builtin => 1,
    ModuleType::BuiltinOnly => 2,
    ModuleType::Fallback => 3,
  }
}

/// Composes bundles grouped by type, with optional parent chaining.
///
/// Registries are immutable once built, thread-safe, and may be shared
/// across isolates. Per-isolate state lives in [`IsolateModuleRegistry`],
/// created by [`ModuleRegistry::attach_to_isolate`].
pub struct ModuleRegistry {
  observer: Arc<dyn ResolveObserver>,
  bundle_base: Url,
  parent: Option<Arc<ModuleRegistry>>,
  bundles: [Vec<Box<dyn ModuleBundle>>; 4],
  eval_callback: Option<EvalCallback>,
}

impl ModuleRegistry {
  pub fn builder(
    observer: Arc<dyn ResolveObserver>,
    bundle_base: &Url,
    options: RegistryOptions,
  ) -> RegistryBuilder {
    RegistryBuilder::new(observer, bundle_base, options)
  }

  pub fn bundle_base(&self) -> &Url {
    &self.bundle_base
  }

  pub(crate) fn eval_callback(&self) -> Option<&EvalCallback> {
    self.eval_callback.as_ref()
  }

  /// Resolves a context against this registry's tiers, then the parent
  /// chain. User-tier requests see user bundles first, then shared
  /// built-ins, then open-ended fallbacks; built-in code can never reach
  /// user bundles.
  pub fn resolve(&self, context: &ResolveContext) -> Option<Arc<Module>> {
    match self.resolve_in_tiers(context) {
      Some(module) => {
        self.observer.on_resolve_module(
          &context.specifier,
          context.ty,
          context.source,
          ResolveOutcome::Found,
        );
        Some(module)
      }
      None => match &self.parent {
        Some(parent) => parent.resolve(context),
        None => {
          self.observer.on_resolve_module(
            &context.specifier,
            context.ty,
            context.source,
            ResolveOutcome::NotFound,
          );
          None
        }
      },
    }
  }

  fn resolve_in_tiers(&self, context: &ResolveContext) -> Option<Arc<Module>> {
    let tiers: &[ModuleType] = match context.ty {
      ResolveContextType::Bundle => {
        &[ModuleType::Bundle, ModuleType::Builtin, ModuleType::Fallback]
      }
      ResolveContextType::Builtin => {
        &[ModuleType::Builtin, ModuleType::BuiltinOnly]
      }
      ResolveContextType::BuiltinOnly => &[ModuleType::BuiltinOnly],
    };

    let mut current = context.clone();
    let mut visited: HashSet<Url> = HashSet::new();
    visited.insert(current.specifier.clone());

    // A redirect restarts resolution from the first tier with the new
    // specifier; the visited set bounds redirect chains.
    'restart: loop {
      for ty in tiers {
        for bundle in &self.bundles[tier_index(*ty)] {
          match bundle.resolve(&current) {
            None => {}
            Some(Resolved::Module(module)) => return Some(module),
            Some(Resolved::Redirect(redirect)) => {
              let Ok(specifier) = Url::parse(&redirect) else {
                return None;
              };
              if !visited.insert(specifier.clone()) {
                log::warn!(
                  "redirect cycle detected resolving {}",
                  context.specifier
                );
                return None;
              }
              current.specifier = specifier;
              continue 'restart;
            }
          }
        }
      }
      return None;
    }
  }

  /// Binds this registry to the current context. The binding is stored in
  /// the context's embedder data and the engine callbacks for dynamic
  /// import and import.meta are installed on the isolate. Call
  /// [`IsolateRegistryHandle::dispose`] before tearing the context down.
  pub fn attach_to_isolate(
    self: &Arc<Self>,
    scope: &mut v8::PinScope,
    observer: Arc<dyn CompilationObserver>,
    compat: CompatOptions,
  ) -> IsolateRegistryHandle {
    let binding =
      Rc::new(IsolateModuleRegistry::new(self.clone(), observer, compat));
    let context = scope.get_current_context();
    unsafe {
      context.set_aligned_pointer_in_embedder_data(
        MODULE_REGISTRY_SLOT_INDEX,
        Rc::into_raw(binding.clone()) as *mut c_void,
      );
    }
    scope.set_host_import_module_dynamically_callback(
      map::host_import_module_dynamically_callback,
    );
    scope.set_host_initialize_import_meta_object_callback(
      map::host_initialize_import_meta_object_callback,
    );
    IsolateRegistryHandle {
      binding,
      context: v8::Global::new(scope, context),
    }
  }

  /// Synchronously resolves, instantiates, and evaluates a module, yielding
  /// its namespace object. Returns None without an exception when the
  /// module does not exist; all other failures leave an exception
  /// scheduled.
  pub fn try_resolve_module_namespace<'s, 'i>(
    scope: &mut v8::PinScope<'s, 'i>,
    specifier: &str,
    ty: ResolveContextType,
    source: ResolveSource,
    maybe_referrer: Option<&Url>,
  ) -> Option<v8::Local<'s, v8::Object>> {
    let Some(bound) = IsolateModuleRegistry::from_scope(scope) else {
      throw_error(scope, "No module registry attached to the current context");
      return None;
    };
    let referrer = maybe_referrer
      .cloned()
      .unwrap_or_else(|| bound.bundle_base().clone());
    let url = match resolve_import(specifier, &referrer) {
      Ok(url) => url,
      Err(_) => {
        throw_type_error(scope, format!("Invalid module specifier: {specifier}"));
        return None;
      }
    };
    let context = ResolveContext {
      ty,
      source,
      specifier: normalize_path(&url),
      referrer,
      raw_specifier: Some(specifier.to_string()),
      attributes: HashMap::new(),
    };
    bound.require(scope, &context, RequireOption::ReturnEmpty)
  }

  /// Convenience over [`ModuleRegistry::try_resolve_module_namespace`] that
  /// returns a named export, throwing when the module cannot be found.
  pub fn resolve_export<'s, 'i>(
    scope: &mut v8::PinScope<'s, 'i>,
    specifier: &str,
    export_name: &str,
    ty: ResolveContextType,
    source: ResolveSource,
    maybe_referrer: Option<&Url>,
  ) -> Option<v8::Local<'s, v8::Value>> {
    let mut caught: Option<v8::Global<v8::Value>> = None;
    let mut namespace: Option<v8::Global<v8::Object>> = None;
    {
      v8::tc_scope!(let tc_scope, scope);
      let resolved = Self::try_resolve_module_namespace(
        tc_scope,
        specifier,
        ty,
        source,
        maybe_referrer,
      );
      if tc_scope.has_caught() {
        let exception = tc_scope.exception().unwrap();
        caught = Some(v8::Global::new(tc_scope, exception));
      } else if let Some(resolved) = resolved {
        namespace = Some(v8::Global::new(tc_scope, resolved));
      }
    }
    if let Some(exception) = caught {
      let exception = v8::Local::new(scope, exception);
      scope.throw_exception(exception);
      return None;
    }
    let Some(namespace) = namespace else {
      throw_error(scope, format!("Module not found: {specifier}"));
      return None;
    };
    let namespace = v8::Local::new(scope, namespace);
    let key = v8::String::new(scope, export_name)?;
    namespace.get(scope, key.into())
  }
}

/// Keeps the per-context binding alive. Dropping the handle without calling
/// [`IsolateRegistryHandle::dispose`] leaks the binding into the context's
/// lifetime.
pub struct IsolateRegistryHandle {
  binding: Rc<IsolateModuleRegistry>,
  context: v8::Global<v8::Context>,
}

impl IsolateRegistryHandle {
  pub fn binding(&self) -> &Rc<IsolateModuleRegistry> {
    &self.binding
  }

  /// Detaches the binding from the context and releases its engine module
  /// handles.
  pub fn dispose(self, scope: &mut v8::PinScope) {
    let context = v8::Local::new(scope, &self.context);
    unsafe {
      let ptr = context
        .get_aligned_pointer_from_embedder_data(MODULE_REGISTRY_SLOT_INDEX);
      if !ptr.is_null() {
        drop(Rc::from_raw(ptr as *const IsolateModuleRegistry));
        context.set_aligned_pointer_in_embedder_data(
          MODULE_REGISTRY_SLOT_INDEX,
          std::ptr::null_mut(),
        );
      }
    }
  }
}

pub struct RegistryBuilder {
  observer: Arc<dyn ResolveObserver>,
  bundle_base: Url,
  options: RegistryOptions,
  parent: Option<Arc<ModuleRegistry>>,
  eval_callback: Option<EvalCallback>,
  bundles: [Vec<Box<dyn ModuleBundle>>; 4],
}

impl RegistryBuilder {
  pub fn new(
    observer: Arc<dyn ResolveObserver>,
    bundle_base: &Url,
    options: RegistryOptions,
  ) -> Self {
    RegistryBuilder {
      observer,
      bundle_base: bundle_base.clone(),
      options,
      parent: None,
      eval_callback: None,
      bundles: std::array::from_fn(|_| Vec::new()),
    }
  }

  pub fn add(mut self, bundle: Box<dyn ModuleBundle>) -> Self {
    if !self.options.allow_fallback
      && bundle.bundle_type() == ModuleType::Fallback
    {
      panic!("Fallback bundle types are not allowed for this registry");
    }
    self.bundles[tier_index(bundle.bundle_type())].push(bundle);
    self
  }

  pub fn set_parent(mut self, parent: Arc<ModuleRegistry>) -> Self {
    self.parent = Some(parent);
    self
  }

  pub fn set_eval_callback(mut self, callback: EvalCallback) -> Self {
    self.eval_callback = Some(callback);
    self
  }

  pub fn build(self) -> Arc<ModuleRegistry> {
    Arc::new(ModuleRegistry {
      observer: self.observer,
      bundle_base: self.bundle_base,
      parent: self.parent,
      bundles: self.bundles,
      eval_callback: self.eval_callback,
    })
  }
}
