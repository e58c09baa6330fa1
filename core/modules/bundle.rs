// Copyright 2025 the Gantry authors. MIT license.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use parking_lot::RwLock;
use url::Url;

use super::EvaluateCallback;
use super::Module;
use super::ModuleCode;
use super::ModuleFlags;
use super::ModuleType;
use super::ResolveContext;
use crate::module_specifier::normalize_path;
use crate::module_specifier::resolve_import;

/// The outcome of a bundle resolution: either a module, or a redirect to
/// another specifier that restarts resolution from the top of the registry.
pub enum Resolved {
  Module(Arc<Module>),
  Redirect(String),
}

/// Produces a module (or redirect) for a specifier on first resolution.
/// Factories can run concurrently from multiple isolates.
pub type ModuleFactory =
  Box<dyn Fn(&ResolveContext) -> Option<Resolved> + Send + Sync>;

/// A named collection of modules sharing a resolution policy. Bundles are
/// consulted by the registry in tier order and must be thread-safe.
pub trait ModuleBundle: Send + Sync {
  fn bundle_type(&self) -> ModuleType;
  fn resolve(&self, context: &ResolveContext) -> Option<Resolved>;
}

/// Fixed table of specifier to factory, plus aliases, with a cache so each
/// factory runs at most once per bundle.
struct StaticModuleBundle {
  ty: ModuleType,
  modules: HashMap<Url, ModuleFactory>,
  aliases: HashMap<Url, Url>,
  cache: Mutex<HashMap<Url, Arc<Module>>>,
}

impl StaticModuleBundle {
  /// Follows the alias table to the final specifier. Aliases are expected
  /// to form a DAG; a cycle resolves to None rather than recursing.
  fn resolve_aliases(&self, specifier: &Url) -> Option<Url> {
    let mut current = specifier.clone();
    let mut visited: HashSet<Url> = HashSet::new();
    visited.insert(current.clone());
    while let Some(target) = self.aliases.get(&current) {
      if !visited.insert(target.clone()) {
        log::warn!("alias cycle detected resolving {specifier}");
        return None;
      }
      current = target.clone();
    }
    Some(current)
  }
}

impl ModuleBundle for StaticModuleBundle {
  fn bundle_type(&self) -> ModuleType {
    self.ty
  }

  fn resolve(&self, context: &ResolveContext) -> Option<Resolved> {
    let specifier = self.resolve_aliases(&context.specifier)?;
    let context = ResolveContext {
      specifier: specifier.clone(),
      ..context.clone()
    };

    let mut cache = self.cache.lock();
    if let Some(cached) = cache.get(&specifier) {
      if !cached.evaluate_context(&context) {
        return None;
      }
      return Some(Resolved::Module(cached.clone()));
    }

    // Not cached; try to resolve it.
    let factory = self.modules.get(&specifier)?;
    match factory(&context)? {
      Resolved::Redirect(redirect) => Some(Resolved::Redirect(redirect)),
      Resolved::Module(module) => {
        cache.insert(specifier, module.clone());
        if !module.evaluate_context(&context) {
          return None;
        }
        Some(Resolved::Module(module))
      }
    }
  }
}

struct FallbackCache {
  /// Owned modules, keyed by their own (resolved) specifier.
  storage: HashMap<Url, Arc<Module>>,
  /// Alias pointers, keyed by the originally requested specifier.
  aliases: HashMap<Url, Arc<Module>>,
}

/// Open-ended resolver consulted after the static tiers, typically backed
/// by a virtual file system.
struct FallbackModuleBundle {
  callback: ModuleFactory,
  cache: RwLock<FallbackCache>,
}

impl ModuleBundle for FallbackModuleBundle {
  fn bundle_type(&self) -> ModuleType {
    ModuleType::Fallback
  }

  fn resolve(&self, context: &ResolveContext) -> Option<Resolved> {
    {
      let cache = self.cache.read();
      if let Some(module) = cache.storage.get(&context.specifier) {
        return Some(Resolved::Module(module.clone()));
      }
      if let Some(module) = cache.aliases.get(&context.specifier) {
        return Some(Resolved::Module(module.clone()));
      }
    }

    let mut cache = self.cache.write();
    // Another thread may have raced us here; re-check before invoking the
    // callback so it runs at most once per specifier.
    if let Some(module) = cache.storage.get(&context.specifier) {
      return Some(Resolved::Module(module.clone()));
    }
    if let Some(module) = cache.aliases.get(&context.specifier) {
      return Some(Resolved::Module(module.clone()));
    }

    match (self.callback)(context)? {
      Resolved::Redirect(redirect) => Some(Resolved::Redirect(redirect)),
      Resolved::Module(module) => {
        cache
          .storage
          .insert(module.specifier().clone(), module.clone());
        if *module.specifier() != context.specifier {
          cache
            .aliases
            .insert(context.specifier.clone(), module.clone());
        }
        Some(Resolved::Module(module))
      }
    }
  }
}

/// Creates a fallback bundle around a single open-ended resolve callback.
pub fn new_fallback_bundle(callback: ModuleFactory) -> Box<dyn ModuleBundle> {
  Box::new(FallbackModuleBundle {
    callback,
    cache: RwLock::new(FallbackCache {
      storage: HashMap::new(),
      aliases: HashMap::new(),
    }),
  })
}

/// Builds a static bundle from raw specifier/factory pairs. Most callers
/// want [`BundleBuilder`] or [`BuiltinBundleBuilder`] instead.
pub struct ModuleBundleBuilder {
  ty: ModuleType,
  modules: HashMap<Url, ModuleFactory>,
  aliases: HashMap<Url, Url>,
}

impl ModuleBundleBuilder {
  pub fn new(ty: ModuleType) -> Self {
    ModuleBundleBuilder {
      ty,
      modules: HashMap::new(),
      aliases: HashMap::new(),
    }
  }

  pub fn module_type(&self) -> ModuleType {
    self.ty
  }

  fn check_not_added(&self, specifier: &Url) {
    if self.modules.contains_key(specifier)
      || self.aliases.contains_key(specifier)
    {
      panic!("Module \"{specifier}\" already added to bundle");
    }
  }

  /// Registers a factory for a specifier. A specifier added once cannot be
  /// re-added, including via alias; a duplicate is fatal at build time.
  pub fn add(mut self, specifier: &Url, factory: ModuleFactory) -> Self {
    self.check_not_added(specifier);
    self.modules.insert(specifier.clone(), factory);
    self
  }

  pub fn alias(mut self, alias: &Url, specifier: &Url) -> Self {
    let alias = normalize_path(alias);
    self.check_not_added(&alias);
    self.aliases.insert(alias, normalize_path(specifier));
    self
  }

  pub fn finish(self) -> Box<dyn ModuleBundle> {
    Box::new(StaticModuleBundle {
      ty: self.ty,
      modules: self.modules,
      aliases: self.aliases,
      cache: Mutex::new(HashMap::new()),
    })
  }
}

/// Builds a bundle of user modules. String specifiers are resolved against
/// the bundle base and path-normalized at add time.
pub struct BundleBuilder {
  bundle_base: Url,
  inner: ModuleBundleBuilder,
}

impl BundleBuilder {
  pub fn new(bundle_base: &Url) -> Self {
    BundleBuilder {
      bundle_base: bundle_base.clone(),
      inner: ModuleBundleBuilder::new(ModuleType::Bundle),
    }
  }

  fn resolve_specifier(&self, specifier: &str) -> Url {
    let url = resolve_import(specifier, &self.bundle_base)
      .unwrap_or_else(|err| panic!("invalid specifier \"{specifier}\": {err}"));
    normalize_path(&url)
  }

  pub fn add_esm_module(
    self,
    specifier: &str,
    code: impl Into<ModuleCode>,
  ) -> Self {
    self.add_esm_module_with_flags(specifier, code, ModuleFlags::NONE)
  }

  pub fn add_esm_module_with_flags(
    mut self,
    specifier: &str,
    code: impl Into<ModuleCode>,
    flags: ModuleFlags,
  ) -> Self {
    let url = self.resolve_specifier(specifier);
    let code = code.into();
    let ty = self.inner.module_type();
    let factory_url = url.clone();
    self.inner = self.inner.add(
      &url,
      Box::new(move |_context| {
        Some(Resolved::Module(Arc::new(Module::new_esm_with_flags(
          factory_url.clone(),
          ty,
          code.clone(),
          flags,
        ))))
      }),
    );
    self
  }

  pub fn add_synthetic_module(
    self,
    specifier: &str,
    evaluate: EvaluateCallback,
    named_exports: Vec<String>,
  ) -> Self {
    self.add_synthetic_module_with_flags(
      specifier,
      evaluate,
      named_exports,
      ModuleFlags::NONE,
    )
  }

  pub fn add_synthetic_module_with_flags(
    mut self,
    specifier: &str,
    evaluate: EvaluateCallback,
    named_exports: Vec<String>,
    flags: ModuleFlags,
  ) -> Self {
    let url = self.resolve_specifier(specifier);
    let ty = self.inner.module_type();
    let factory_url = url.clone();
    self.inner = self.inner.add(
      &url,
      Box::new(move |_context| {
        Some(Resolved::Module(Arc::new(Module::new_synthetic_with_flags(
          factory_url.clone(),
          ty,
          evaluate.clone(),
          named_exports.clone(),
          flags,
        ))))
      }),
    );
    self
  }

  pub fn alias(mut self, alias: &str, specifier: &str) -> Self {
    let alias = self.resolve_specifier(alias);
    let specifier = self.resolve_specifier(specifier);
    self.inner = self.inner.alias(&alias, &specifier);
    self
  }

  pub fn finish(self) -> Box<dyn ModuleBundle> {
    self.inner.finish()
  }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BuiltinBundleType {
  Builtin,
  BuiltinOnly,
}

/// Builds a bundle of built-in modules, addressed by absolute URL. The
/// `file:` scheme is reserved for bundle-type modules and is rejected.
pub struct BuiltinBundleBuilder {
  inner: ModuleBundleBuilder,
}

impl BuiltinBundleBuilder {
  pub fn new(ty: BuiltinBundleType) -> Self {
    let ty = match ty {
      BuiltinBundleType::Builtin => ModuleType::Builtin,
      BuiltinBundleType::BuiltinOnly => ModuleType::BuiltinOnly,
    };
    BuiltinBundleBuilder {
      inner: ModuleBundleBuilder::new(ty),
    }
  }

  fn ensure_is_not_bundle_specifier(specifier: &Url) {
    if specifier.scheme() == "file" {
      panic!("The file: scheme is reserved for bundle type modules");
    }
  }

  pub fn add_esm(
    mut self,
    specifier: &Url,
    code: impl Into<ModuleCode>,
  ) -> Self {
    Self::ensure_is_not_bundle_specifier(specifier);
    let code = code.into();
    let ty = self.inner.module_type();
    let factory_url = specifier.clone();
    self.inner = self.inner.add(
      specifier,
      Box::new(move |_context| {
        Some(Resolved::Module(Arc::new(Module::new_esm(
          factory_url.clone(),
          ty,
          code.clone(),
        ))))
      }),
    );
    self
  }

  pub fn add_synthetic(
    mut self,
    specifier: &Url,
    evaluate: EvaluateCallback,
  ) -> Self {
    Self::ensure_is_not_bundle_specifier(specifier);
    let ty = self.inner.module_type();
    let factory_url = specifier.clone();
    self.inner = self.inner.add(
      specifier,
      Box::new(move |_context| {
        Some(Resolved::Module(Arc::new(Module::new_synthetic(
          factory_url.clone(),
          ty,
          evaluate.clone(),
          Vec::new(),
        ))))
      }),
    );
    self
  }

  pub fn alias(mut self, alias: &Url, specifier: &Url) -> Self {
    Self::ensure_is_not_bundle_specifier(alias);
    self.inner = self.inner.alias(alias, specifier);
    self
  }

  pub fn finish(self) -> Box<dyn ModuleBundle> {
    self.inner.finish()
  }
}
