// Copyright 2025 the Gantry authors. MIT license.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use url::Url;

use super::*;
use crate::module_specifier::resolve_import;

fn initialize_v8() {
  static V8_INIT: Once = Once::new();
  V8_INIT.call_once(|| {
    let platform = v8::new_default_platform(0, false).make_shared();
    v8::V8::initialize_platform(platform);
    v8::V8::initialize();
  });
}

fn setup_isolate() -> v8::OwnedIsolate {
  initialize_v8();
  let mut isolate = v8::Isolate::new(Default::default());
  // The synchronous require drains the microtask queue explicitly.
  isolate.set_microtasks_policy(v8::MicrotasksPolicy::Explicit);
  isolate
}

fn bundle_base() -> Url {
  Url::parse("file:///").unwrap()
}

fn bundle_context(specifier: &str) -> ResolveContext {
  ResolveContext {
    ty: ResolveContextType::Bundle,
    source: ResolveSource::Internal,
    specifier: Url::parse(specifier).unwrap(),
    referrer: bundle_base(),
    raw_specifier: None,
    attributes: HashMap::new(),
  }
}

fn registry_with(
  bundles: Vec<Box<dyn ModuleBundle>>,
  options: RegistryOptions,
) -> Arc<ModuleRegistry> {
  let mut builder = ModuleRegistry::builder(
    Arc::new(NoopResolveObserver),
    &bundle_base(),
    options,
  );
  for bundle in bundles {
    builder = builder.add(bundle);
  }
  builder.build()
}

fn require<'s, 'i>(
  scope: &mut v8::PinScope<'s, 'i>,
  specifier: &str,
) -> Option<v8::Local<'s, v8::Object>> {
  ModuleRegistry::try_resolve_module_namespace(
    scope,
    specifier,
    ResolveContextType::Bundle,
    ResolveSource::Require,
    None,
  )
}

fn get<'s, 'i>(
  scope: &mut v8::PinScope<'s, 'i>,
  object: v8::Local<v8::Object>,
  key: &str,
) -> v8::Local<'s, v8::Value> {
  let key = v8::String::new(scope, key).unwrap();
  object.get(scope, key.into()).unwrap()
}

fn eval_callback<F>(f: F) -> EvalCallback
where
  F: for<'s> Fn(
      &mut v8::PinScope<'s, '_>,
      &Module,
      v8::Local<'s, v8::Module>,
      &dyn CompilationObserver,
    ) -> Option<v8::Local<'s, v8::Promise>>
    + Send
    + Sync
    + 'static,
{
  Arc::new(f)
}

#[derive(Default)]
struct CountingResolveObserver {
  found: AtomicUsize,
  not_found: AtomicUsize,
}

impl ResolveObserver for CountingResolveObserver {
  fn on_resolve_module(
    &self,
    _specifier: &Url,
    _ty: ResolveContextType,
    _source: ResolveSource,
    outcome: ResolveOutcome,
  ) {
    match outcome {
      ResolveOutcome::Found => self.found.fetch_add(1, Ordering::SeqCst),
      ResolveOutcome::NotFound => {
        self.not_found.fetch_add(1, Ordering::SeqCst)
      }
    };
  }
}

#[derive(Default)]
struct CountingCompilationObserver {
  esm_starts: AtomicUsize,
  cache_found: AtomicUsize,
  cache_rejected: AtomicUsize,
  cache_generated: AtomicUsize,
}

impl CompilationObserver for CountingCompilationObserver {
  fn on_esm_compilation_start(&self, _specifier: &Url, _tier: CompilationTier) {
    self.esm_starts.fetch_add(1, Ordering::SeqCst);
  }
  fn on_compile_cache_found(&self) {
    self.cache_found.fetch_add(1, Ordering::SeqCst);
  }
  fn on_compile_cache_rejected(&self) {
    self.cache_rejected.fetch_add(1, Ordering::SeqCst);
  }
  fn on_compile_cache_generated(&self) {
    self.cache_generated.fetch_add(1, Ordering::SeqCst);
  }
}

// Registry-level behavior, no engine involved.

#[test]
fn bundle_cache_returns_same_instance() {
  let registry = registry_with(
    vec![
      BundleBuilder::new(&bundle_base())
        .add_esm_module("a.js", "export const x = 1;")
        .finish(),
    ],
    RegistryOptions::default(),
  );

  let context = bundle_context("file:///a.js");
  let first = registry.resolve(&context).unwrap();
  let second = registry.resolve(&context).unwrap();
  assert!(Arc::ptr_eq(&first, &second));
}

#[test]
fn static_alias_resolves_to_target() {
  let registry = registry_with(
    vec![
      BundleBuilder::new(&bundle_base())
        .add_esm_module("real.js", "export const x = 1;")
        .alias("alias.js", "real.js")
        .finish(),
    ],
    RegistryOptions::default(),
  );

  let module = registry.resolve(&bundle_context("file:///alias.js")).unwrap();
  assert_eq!(module.specifier().as_str(), "file:///real.js");
}

#[test]
fn alias_cycle_resolves_to_none() {
  let a = Url::parse("file:///a.js").unwrap();
  let b = Url::parse("file:///b.js").unwrap();
  let registry = registry_with(
    vec![
      ModuleBundleBuilder::new(ModuleType::Bundle)
        .alias(&a, &b)
        .alias(&b, &a)
        .finish(),
    ],
    RegistryOptions::default(),
  );

  assert!(registry.resolve(&bundle_context("file:///a.js")).is_none());
}

#[test]
fn redirect_restarts_resolution() {
  let moved = Url::parse("file:///moved.js").unwrap();
  let registry = registry_with(
    vec![
      ModuleBundleBuilder::new(ModuleType::Bundle)
        .add(
          &moved,
          Box::new(|_context| {
            Some(Resolved::Redirect("file:///real.js".to_string()))
          }),
        )
        .finish(),
      BundleBuilder::new(&bundle_base())
        .add_esm_module("real.js", "export const x = 1;")
        .finish(),
    ],
    RegistryOptions::default(),
  );

  let module = registry.resolve(&bundle_context("file:///moved.js")).unwrap();
  assert_eq!(module.specifier().as_str(), "file:///real.js");
}

#[test]
fn redirect_cycle_resolves_to_none() {
  let a = Url::parse("file:///a.js").unwrap();
  let b = Url::parse("file:///b.js").unwrap();
  let registry = registry_with(
    vec![
      ModuleBundleBuilder::new(ModuleType::Bundle)
        .add(
          &a,
          Box::new(|_context| {
            Some(Resolved::Redirect("file:///b.js".to_string()))
          }),
        )
        .add(
          &b,
          Box::new(|_context| {
            Some(Resolved::Redirect("file:///a.js".to_string()))
          }),
        )
        .finish(),
    ],
    RegistryOptions::default(),
  );

  assert!(registry.resolve(&bundle_context("file:///a.js")).is_none());
}

#[test]
fn fallback_alias_caches_canonical_module() {
  let calls = Arc::new(AtomicUsize::new(0));
  let callback_calls = calls.clone();
  let fallback = new_fallback_bundle(Box::new(move |context| {
    callback_calls.fetch_add(1, Ordering::SeqCst);
    assert_eq!(context.specifier.as_str(), "file:///requested.js");
    Some(Resolved::Module(Arc::new(Module::new_esm(
      Url::parse("file:///canonical.js").unwrap(),
      ModuleType::Fallback,
      "export const x = 1;",
    ))))
  }));

  let registry = registry_with(
    vec![fallback],
    RegistryOptions {
      allow_fallback: true,
    },
  );

  let first = registry
    .resolve(&bundle_context("file:///requested.js"))
    .unwrap();
  assert_eq!(first.specifier().as_str(), "file:///canonical.js");

  // The second request hits the alias cache without re-invoking the
  // callback, and the canonical specifier finds the owned module directly.
  let second = registry
    .resolve(&bundle_context("file:///requested.js"))
    .unwrap();
  assert!(Arc::ptr_eq(&first, &second));
  let canonical = registry
    .resolve(&bundle_context("file:///canonical.js"))
    .unwrap();
  assert!(Arc::ptr_eq(&first, &canonical));
  assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn tier_policy_isolates_builtin_only() {
  let registry = registry_with(
    vec![
      BundleBuilder::new(&bundle_base())
        .add_esm_module("shared.js", "export const x = 1;")
        .finish(),
      BuiltinBundleBuilder::new(BuiltinBundleType::BuiltinOnly)
        .add_esm(
          &Url::parse("node-internal:shared").unwrap(),
          "export const x = 2;",
        )
        .finish(),
    ],
    RegistryOptions::default(),
  );

  // Builtin-only resolution never reaches the user bundle tier.
  let mut context = bundle_context("file:///shared.js");
  context.ty = ResolveContextType::BuiltinOnly;
  assert!(registry.resolve(&context).is_none());

  // And user code cannot see builtin-only modules.
  let context = bundle_context("node-internal:shared");
  assert!(registry.resolve(&context).is_none());

  // Builtin-tier requests can.
  let mut context = bundle_context("node-internal:shared");
  context.ty = ResolveContextType::Builtin;
  assert!(registry.resolve(&context).is_some());
}

#[test]
fn parent_registry_is_consulted_on_miss() {
  let parent_observer = Arc::new(CountingResolveObserver::default());
  let parent = ModuleRegistry::builder(
    parent_observer.clone(),
    &bundle_base(),
    RegistryOptions::default(),
  )
  .add(
    BuiltinBundleBuilder::new(BuiltinBundleType::Builtin)
      .add_esm(&Url::parse("builtin:shared").unwrap(), "export const x = 1;")
      .finish(),
  )
  .build();

  let child_observer = Arc::new(CountingResolveObserver::default());
  let child = ModuleRegistry::builder(
    child_observer.clone(),
    &bundle_base(),
    RegistryOptions::default(),
  )
  .set_parent(parent)
  .build();

  assert!(child.resolve(&bundle_context("builtin:shared")).is_some());
  assert_eq!(child_observer.found.load(Ordering::SeqCst), 0);
  assert_eq!(parent_observer.found.load(Ordering::SeqCst), 1);

  assert!(child.resolve(&bundle_context("builtin:missing")).is_none());
  assert_eq!(parent_observer.not_found.load(Ordering::SeqCst), 1);
}

#[test]
fn resolve_observer_reports_outcomes() {
  let observer = Arc::new(CountingResolveObserver::default());
  let registry = ModuleRegistry::builder(
    observer.clone(),
    &bundle_base(),
    RegistryOptions::default(),
  )
  .add(
    BundleBuilder::new(&bundle_base())
      .add_esm_module("a.js", "export const x = 1;")
      .finish(),
  )
  .build();

  registry.resolve(&bundle_context("file:///a.js")).unwrap();
  assert!(registry.resolve(&bundle_context("file:///b.js")).is_none());
  assert_eq!(observer.found.load(Ordering::SeqCst), 1);
  assert_eq!(observer.not_found.load(Ordering::SeqCst), 1);
}

#[test]
#[should_panic(expected = "already added to bundle")]
fn duplicate_add_panics() {
  let _bundle = BundleBuilder::new(&bundle_base())
    .add_esm_module("a.js", "export const x = 1;")
    .add_esm_module("a.js", "export const x = 2;");
}

#[test]
#[should_panic(expected = "already added to bundle")]
fn duplicate_add_after_percent_normalization_panics() {
  let _bundle = BundleBuilder::new(&bundle_base())
    .add_esm_module("a/%2fb", "export const x = 1;")
    .add_esm_module("a/%2Fb", "export const x = 2;");
}

#[test]
#[should_panic(expected = "reserved for bundle type modules")]
fn builtin_rejects_file_scheme() {
  let _bundle = BuiltinBundleBuilder::new(BuiltinBundleType::Builtin)
    .add_esm(&Url::parse("file:///nope.js").unwrap(), "export const x = 1;");
}

#[test]
#[should_panic(expected = "Fallback bundle types are not allowed")]
fn fallback_requires_opt_in() {
  let fallback = new_fallback_bundle(Box::new(|_context| None));
  let _registry = registry_with(vec![fallback], RegistryOptions::default());
}

// Engine-backed scenarios.

#[test]
fn static_esm_import_resolves_namespace() {
  let registry = registry_with(
    vec![
      BundleBuilder::new(&bundle_base())
        .add_esm_module("a.js", "export const x = 1;")
        .finish(),
    ],
    RegistryOptions::default(),
  );

  let mut isolate = setup_isolate();
  v8::scope!(scope, &mut isolate);
  let context = v8::Context::new(scope, Default::default());
  let scope = &mut v8::ContextScope::new(scope, context);
  let handle = registry.attach_to_isolate(
    scope,
    Arc::new(NoopCompilationObserver),
    CompatOptions::default(),
  );

  let binding = IsolateModuleRegistry::from_scope(scope).unwrap();
  let context_a = ResolveContext {
    ty: ResolveContextType::Bundle,
    source: ResolveSource::StaticImport,
    specifier: Url::parse("file:///a.js").unwrap(),
    referrer: bundle_base(),
    raw_specifier: Some("a.js".to_string()),
    attributes: HashMap::new(),
  };

  // Resolving the same specifier twice yields the same engine handle.
  let first = binding.resolve(scope, &context_a).unwrap();
  let second = binding.resolve(scope, &context_a).unwrap();
  let first = v8::Global::new(scope, first);
  let second = v8::Global::new(scope, second);
  assert!(first == second);

  let namespace = require(scope, "a.js").unwrap();
  let x = get(scope, namespace, "x");
  assert_eq!(x.integer_value(scope).unwrap(), 1);

  handle.dispose(scope);
}

#[test]
fn esm_imports_and_import_meta() {
  let registry = registry_with(
    vec![
      BundleBuilder::new(&bundle_base())
        .add_esm_module_with_flags(
          "a.js",
          r#"
import { b } from "./b.js";
if (b() != 'b') throw Error();
if (import.meta.url != 'file:///a.js') throw Error(import.meta.url);
if (!import.meta.main) throw Error("expected main");
if (import.meta.resolve("./x/%7Ey.js") != 'file:///x/~y.js') {
  throw Error(import.meta.resolve("./x/%7Ey.js"));
}
if (import.meta.resolve("http://[") !== null) throw Error();
export const ok = true;
"#,
          ModuleFlags::MAIN,
        )
        .add_esm_module(
          "b.js",
          r#"
if (import.meta.main) throw Error("b is not main");
export function b() { return 'b'; }
"#,
        )
        .finish(),
    ],
    RegistryOptions::default(),
  );

  let mut isolate = setup_isolate();
  v8::scope!(scope, &mut isolate);
  let context = v8::Context::new(scope, Default::default());
  let scope = &mut v8::ContextScope::new(scope, context);
  let handle = registry.attach_to_isolate(
    scope,
    Arc::new(NoopCompilationObserver),
    CompatOptions::default(),
  );

  let namespace = require(scope, "a.js").unwrap();
  let ok = get(scope, namespace, "ok");
  assert!(ok.is_true());

  handle.dispose(scope);
}

#[test]
fn synthetic_cycle_supports_partial_namespaces() {
  let partial_seen = Arc::new(AtomicBool::new(false));
  let partial = partial_seen.clone();

  let a_callback: EvaluateCallback =
    Arc::new(|scope, _specifier, namespace, _observer| {
      let Some(b_namespace) = ModuleRegistry::try_resolve_module_namespace(
        scope,
        "b",
        ResolveContextType::Bundle,
        ResolveSource::Require,
        None,
      ) else {
        return false;
      };
      let key = v8::String::new(scope, "default").unwrap();
      let value = b_namespace.get(scope, key.into()).unwrap();
      namespace.set_default(scope, value)
    });

  let b_callback: EvaluateCallback =
    Arc::new(move |scope, _specifier, namespace, _observer| {
      // "a" is still evaluating; its namespace is visible but incomplete.
      let Some(a_namespace) = ModuleRegistry::try_resolve_module_namespace(
        scope,
        "a",
        ResolveContextType::Bundle,
        ResolveSource::Require,
        None,
      ) else {
        return false;
      };
      let key = v8::String::new(scope, "default").unwrap();
      let a_default = a_namespace.get(scope, key.into()).unwrap();
      partial.store(a_default.is_undefined(), Ordering::SeqCst);
      let value = v8::Integer::new(scope, 42);
      namespace.set_default(scope, value.into())
    });

  let registry = registry_with(
    vec![
      BundleBuilder::new(&bundle_base())
        .add_synthetic_module("a", a_callback, Vec::new())
        .add_synthetic_module("b", b_callback, Vec::new())
        .finish(),
    ],
    RegistryOptions::default(),
  );

  let mut isolate = setup_isolate();
  v8::scope!(scope, &mut isolate);
  let context = v8::Context::new(scope, Default::default());
  let scope = &mut v8::ContextScope::new(scope, context);
  let handle = registry.attach_to_isolate(
    scope,
    Arc::new(NoopCompilationObserver),
    CompatOptions::default(),
  );

  let namespace = require(scope, "a").unwrap();
  let value = get(scope, namespace, "default");
  assert_eq!(value.integer_value(scope).unwrap(), 42);
  assert!(partial_seen.load(Ordering::SeqCst));

  handle.dispose(scope);
}

#[test]
fn top_level_await_restricted_in_require() {
  let registry = registry_with(
    vec![
      BundleBuilder::new(&bundle_base())
        .add_esm_module("x.js", "await new Promise(() => {});")
        .finish(),
    ],
    RegistryOptions::default(),
  );

  let mut isolate = setup_isolate();
  v8::scope!(scope, &mut isolate);
  let context = v8::Context::new(scope, Default::default());
  let scope = &mut v8::ContextScope::new(scope, context);
  let handle = registry.attach_to_isolate(
    scope,
    Arc::new(NoopCompilationObserver),
    CompatOptions::default(),
  );

  {
    v8::tc_scope!(let tc_scope, scope);
    let result = require(tc_scope, "x.js");
    assert!(result.is_none());
    assert!(tc_scope.has_caught());
    let exception = tc_scope.exception().unwrap();
    let message = exception.to_rust_string_lossy(tc_scope);
    assert!(message.contains("top-level await"), "{message}");
    assert!(message.contains("file:///x.js"), "{message}");
  }

  handle.dispose(scope);
}

#[test]
fn import_attributes_are_rejected() {
  let registry = registry_with(
    vec![
      BundleBuilder::new(&bundle_base())
        .add_esm_module(
          "main.js",
          r#"import data from "./data.json" with { type: "json" };"#,
        )
        .add_synthetic_module(
          "data.json",
          json_module_handler(r#"{"a": 1}"#),
          Vec::new(),
        )
        .finish(),
    ],
    RegistryOptions::default(),
  );

  let mut isolate = setup_isolate();
  v8::scope!(scope, &mut isolate);
  let context = v8::Context::new(scope, Default::default());
  let scope = &mut v8::ContextScope::new(scope, context);
  let handle = registry.attach_to_isolate(
    scope,
    Arc::new(NoopCompilationObserver),
    CompatOptions::default(),
  );

  {
    v8::tc_scope!(let tc_scope, scope);
    let result = require(tc_scope, "main.js");
    assert!(result.is_none());
    assert!(tc_scope.has_caught());
    let exception = tc_scope.exception().unwrap();
    let message = exception.to_rust_string_lossy(tc_scope);
    assert!(
      message.contains("Import attributes are not supported"),
      "{message}"
    );
  }

  handle.dispose(scope);
}

fn process_registry() -> Arc<ModuleRegistry> {
  registry_with(
    vec![
      BundleBuilder::new(&bundle_base())
        .add_esm_module("main.js", r#"export const p = import("node:process");"#)
        .add_esm_module("bare.js", r#"export const p = import("process");"#)
        .finish(),
      BuiltinBundleBuilder::new(BuiltinBundleType::BuiltinOnly)
        .add_synthetic(
          &Url::parse("node-internal:public_process").unwrap(),
          text_module_handler("public"),
        )
        .add_synthetic(
          &Url::parse("node-internal:legacy_process").unwrap(),
          text_module_handler("legacy"),
        )
        .finish(),
    ],
    RegistryOptions::default(),
  )
}

fn dynamic_import_default(
  compat: CompatOptions,
  entrypoint: &str,
) -> String {
  let registry = process_registry();

  let mut isolate = setup_isolate();
  v8::scope!(scope, &mut isolate);
  let context = v8::Context::new(scope, Default::default());
  let scope = &mut v8::ContextScope::new(scope, context);
  let handle = registry.attach_to_isolate(
    scope,
    Arc::new(NoopCompilationObserver),
    compat,
  );

  let namespace = require(scope, entrypoint).unwrap();
  let promise = get(scope, namespace, "p");
  let promise = v8::Local::<v8::Promise>::try_from(promise).unwrap();
  assert_eq!(promise.state(), v8::PromiseState::Fulfilled);
  let result = promise.result(scope);
  let result: v8::Local<v8::Object> = result.try_into().unwrap();
  let default = get(scope, result, "default");
  let value = default.to_rust_string_lossy(scope);

  handle.dispose(scope);
  value
}

#[test]
fn node_process_redirects_to_public_process() {
  let compat = CompatOptions {
    node_compat: false,
    node_process_v2: true,
  };
  // The module only exists in the builtin-only tier, so a successful
  // resolution proves the redirected context type.
  assert_eq!(dynamic_import_default(compat, "main.js"), "public");
}

#[test]
fn node_process_redirects_to_legacy_process() {
  let compat = CompatOptions {
    node_compat: false,
    node_process_v2: false,
  };
  assert_eq!(dynamic_import_default(compat, "main.js"), "legacy");
}

#[test]
fn bare_process_rewritten_under_node_compat() {
  let compat = CompatOptions {
    node_compat: true,
    node_process_v2: true,
  };
  assert_eq!(dynamic_import_default(compat, "bare.js"), "public");
}

#[test]
fn compile_cache_is_shared_between_isolates() {
  let observer = Arc::new(CountingCompilationObserver::default());
  let registry = registry_with(
    vec![
      BundleBuilder::new(&bundle_base())
        .add_esm_module("a.js", "export const x = 1;")
        .finish(),
    ],
    RegistryOptions::default(),
  );

  for _ in 0..2 {
    let mut isolate = setup_isolate();
    v8::scope!(scope, &mut isolate);
    let context = v8::Context::new(scope, Default::default());
    let scope = &mut v8::ContextScope::new(scope, context);
    let handle = registry.attach_to_isolate(
      scope,
      observer.clone(),
      CompatOptions::default(),
    );
    let namespace = require(scope, "a.js").unwrap();
    let x = get(scope, namespace, "x");
    assert_eq!(x.integer_value(scope).unwrap(), 1);
    handle.dispose(scope);
  }

  assert_eq!(observer.esm_starts.load(Ordering::SeqCst), 2);
  let found = observer.cache_found.load(Ordering::SeqCst);
  let rejected = observer.cache_rejected.load(Ordering::SeqCst);
  let generated = observer.cache_generated.load(Ordering::SeqCst);
  // The second isolate either consumed the cached bytecode, or rejected it
  // as incompatible and regenerated.
  if rejected == 0 {
    assert_eq!(found, 1);
    assert_eq!(generated, 1);
  } else {
    assert_eq!(rejected, 1);
    assert_eq!(generated, 2);
  }
}

#[test]
fn synthetic_module_factories() {
  static BYTES: &[u8] = &[1, 2, 3];
  let registry = registry_with(
    vec![
      BundleBuilder::new(&bundle_base())
        .add_synthetic_module(
          "config.json",
          json_module_handler(r#"{"a": 1}"#),
          Vec::new(),
        )
        .add_synthetic_module(
          "note.txt",
          text_module_handler("hello"),
          Vec::new(),
        )
        .add_synthetic_module("blob.bin", data_module_handler(BYTES), Vec::new())
        .finish(),
    ],
    RegistryOptions::default(),
  );

  let mut isolate = setup_isolate();
  v8::scope!(scope, &mut isolate);
  let context = v8::Context::new(scope, Default::default());
  let scope = &mut v8::ContextScope::new(scope, context);
  let handle = registry.attach_to_isolate(
    scope,
    Arc::new(NoopCompilationObserver),
    CompatOptions::default(),
  );

  let namespace = require(scope, "config.json").unwrap();
  let default = get(scope, namespace, "default");
  let default: v8::Local<v8::Object> = default.try_into().unwrap();
  let a = get(scope, default, "a");
  assert_eq!(a.integer_value(scope).unwrap(), 1);

  let namespace = require(scope, "note.txt").unwrap();
  let default = get(scope, namespace, "default");
  assert_eq!(default.to_rust_string_lossy(scope), "hello");

  let namespace = require(scope, "blob.bin").unwrap();
  let default = get(scope, namespace, "default");
  let buffer = v8::Local::<v8::ArrayBuffer>::try_from(default).unwrap();
  assert_eq!(buffer.byte_length(), 3);

  handle.dispose(scope);
}

#[test]
fn synthetic_named_exports() {
  let callback: EvaluateCallback =
    Arc::new(|scope, _specifier, namespace, _observer| {
      let value = v8::Integer::new(scope, 7);
      if !namespace.set(scope, "foo", value.into()) {
        return false;
      }
      let value = v8::Integer::new(scope, 1);
      namespace.set_default(scope, value.into())
    });

  let undeclared: EvaluateCallback =
    Arc::new(|scope, _specifier, namespace, _observer| {
      let value = v8::Integer::new(scope, 7);
      namespace.set(scope, "bar", value.into())
    });

  let registry = registry_with(
    vec![
      BundleBuilder::new(&bundle_base())
        .add_synthetic_module("m", callback, vec!["foo".to_string()])
        .add_synthetic_module("broken", undeclared, Vec::new())
        .finish(),
    ],
    RegistryOptions::default(),
  );

  let mut isolate = setup_isolate();
  v8::scope!(scope, &mut isolate);
  let context = v8::Context::new(scope, Default::default());
  let scope = &mut v8::ContextScope::new(scope, context);
  let handle = registry.attach_to_isolate(
    scope,
    Arc::new(NoopCompilationObserver),
    CompatOptions::default(),
  );

  let namespace = require(scope, "m").unwrap();
  let foo = get(scope, namespace, "foo");
  assert_eq!(foo.integer_value(scope).unwrap(), 7);

  {
    v8::tc_scope!(let tc_scope, scope);
    let result = require(tc_scope, "broken");
    assert!(result.is_none());
    assert!(tc_scope.has_caught());
    let exception = tc_scope.exception().unwrap();
    let message = exception.to_rust_string_lossy(tc_scope);
    assert!(message.contains("does not export bar"), "{message}");
  }

  handle.dispose(scope);
}

#[test]
fn module_not_found_from_require() {
  let registry = registry_with(vec![], RegistryOptions::default());

  let mut isolate = setup_isolate();
  v8::scope!(scope, &mut isolate);
  let context = v8::Context::new(scope, Default::default());
  let scope = &mut v8::ContextScope::new(scope, context);
  let handle = registry.attach_to_isolate(
    scope,
    Arc::new(NoopCompilationObserver),
    CompatOptions::default(),
  );

  // try_resolve_module_namespace maps the miss to an empty result.
  {
    v8::tc_scope!(let tc_scope, scope);
    let result = require(tc_scope, "missing.js");
    assert!(result.is_none());
    assert!(!tc_scope.has_caught());
  }

  // The export-resolving wrapper converts it into an error.
  {
    v8::tc_scope!(let tc_scope, scope);
    let result = ModuleRegistry::resolve_export(
      tc_scope,
      "missing.js",
      "default",
      ResolveContextType::Bundle,
      ResolveSource::Require,
      None,
    );
    assert!(result.is_none());
    assert!(tc_scope.has_caught());
    let exception = tc_scope.exception().unwrap();
    let message = exception.to_rust_string_lossy(tc_scope);
    assert!(message.contains("Module not found"), "{message}");
  }

  handle.dispose(scope);
}

#[test]
fn errored_module_rethrows_original_exception() {
  let registry = registry_with(
    vec![
      BundleBuilder::new(&bundle_base())
        .add_esm_module("x.js", r#"throw new Error("boom");"#)
        .finish(),
    ],
    RegistryOptions::default(),
  );

  let mut isolate = setup_isolate();
  v8::scope!(scope, &mut isolate);
  let context = v8::Context::new(scope, Default::default());
  let scope = &mut v8::ContextScope::new(scope, context);
  let handle = registry.attach_to_isolate(
    scope,
    Arc::new(NoopCompilationObserver),
    CompatOptions::default(),
  );

  for _ in 0..2 {
    v8::tc_scope!(let tc_scope, scope);
    let result = require(tc_scope, "x.js");
    assert!(result.is_none());
    assert!(tc_scope.has_caught());
    let exception = tc_scope.exception().unwrap();
    let message = exception.to_rust_string_lossy(tc_scope);
    assert!(message.contains("boom"), "{message}");
  }

  handle.dispose(scope);
}

#[test]
fn circular_esm_require_is_rejected() {
  let circular_seen = Arc::new(AtomicBool::new(false));
  let seen = circular_seen.clone();

  let probe: EvaluateCallback =
    Arc::new(move |scope, _specifier, namespace, _observer| {
      {
        v8::tc_scope!(let tc_scope, scope);
        let result = ModuleRegistry::try_resolve_module_namespace(
          tc_scope,
          "main.js",
          ResolveContextType::Bundle,
          ResolveSource::Require,
          None,
        );
        if result.is_none() && tc_scope.has_caught() {
          let exception = tc_scope.exception().unwrap();
          let message = exception.to_rust_string_lossy(tc_scope);
          seen.store(message.contains("Circular dependency"), Ordering::SeqCst);
        }
      }
      let value = v8::Integer::new(scope, 1);
      namespace.set_default(scope, value.into())
    });

  let registry = registry_with(
    vec![
      BundleBuilder::new(&bundle_base())
        .add_esm_module("main.js", r#"import "./probe"; export const done = 1;"#)
        .add_synthetic_module("probe", probe, Vec::new())
        .finish(),
    ],
    RegistryOptions::default(),
  );

  let mut isolate = setup_isolate();
  v8::scope!(scope, &mut isolate);
  let context = v8::Context::new(scope, Default::default());
  let scope = &mut v8::ContextScope::new(scope, context);
  let handle = registry.attach_to_isolate(
    scope,
    Arc::new(NoopCompilationObserver),
    CompatOptions::default(),
  );

  let namespace = require(scope, "main.js").unwrap();
  let done = get(scope, namespace, "done");
  assert_eq!(done.integer_value(scope).unwrap(), 1);
  assert!(circular_seen.load(Ordering::SeqCst));

  handle.dispose(scope);
}

#[test]
fn eval_callback_routes_eval_flagged_synthetics() {
  let eval_calls = Arc::new(AtomicUsize::new(0));
  let synthetic_calls = Arc::new(AtomicUsize::new(0));

  let calls = eval_calls.clone();
  let callback = eval_callback(move |scope, module, _engine_module, _observer| {
    assert!(module.is_eval());
    calls.fetch_add(1, Ordering::SeqCst);
    let resolver = v8::PromiseResolver::new(scope)?;
    let undefined = v8::undefined(scope);
    resolver.resolve(scope, undefined.into());
    Some(resolver.get_promise(scope))
  });

  let synthetic = synthetic_calls.clone();
  let evaluate: EvaluateCallback =
    Arc::new(move |_scope, _specifier, _namespace, _observer| {
      synthetic.fetch_add(1, Ordering::SeqCst);
      true
    });

  let registry = ModuleRegistry::builder(
    Arc::new(NoopResolveObserver),
    &bundle_base(),
    RegistryOptions::default(),
  )
  .add(
    BundleBuilder::new(&bundle_base())
      .add_synthetic_module_with_flags(
        "cjs",
        evaluate,
        Vec::new(),
        ModuleFlags::EVAL,
      )
      .finish(),
  )
  .set_eval_callback(callback)
  .build();

  let mut isolate = setup_isolate();
  v8::scope!(scope, &mut isolate);
  let context = v8::Context::new(scope, Default::default());
  let scope = &mut v8::ContextScope::new(scope, context);
  let handle = registry.attach_to_isolate(
    scope,
    Arc::new(NoopCompilationObserver),
    CompatOptions::default(),
  );

  let namespace = require(scope, "cjs");
  assert!(namespace.is_some());
  assert_eq!(eval_calls.load(Ordering::SeqCst), 1);
  assert_eq!(synthetic_calls.load(Ordering::SeqCst), 0);

  handle.dispose(scope);
}

#[test]
fn url_variants_keep_their_identity() {
  let registry = registry_with(
    vec![
      BundleBuilder::new(&bundle_base())
        .add_esm_module("a.js", "export const url = import.meta.url;")
        .finish(),
    ],
    RegistryOptions::default(),
  );

  let mut isolate = setup_isolate();
  v8::scope!(scope, &mut isolate);
  let context = v8::Context::new(scope, Default::default());
  let scope = &mut v8::ContextScope::new(scope, context);
  let handle = registry.attach_to_isolate(
    scope,
    Arc::new(NoopCompilationObserver),
    CompatOptions::default(),
  );

  // Both variants resolve against the same catalog module, but each keeps
  // its pre-normalization URL as user-visible identity.
  let namespace = require(scope, "a.js?version=2").unwrap();
  let url = get(scope, namespace, "url");
  assert_eq!(url.to_rust_string_lossy(scope), "file:///a.js?version=2");

  let namespace = require(scope, "a.js").unwrap();
  let url = get(scope, namespace, "url");
  assert_eq!(url.to_rust_string_lossy(scope), "file:///a.js");

  handle.dispose(scope);
}

#[test]
fn compile_eval_function_with_extension() {
  initialize_v8();
  let mut isolate = setup_isolate();
  v8::scope!(scope, &mut isolate);
  let context = v8::Context::new(scope, Default::default());
  let scope = &mut v8::ContextScope::new(scope, context);

  let extension = v8::Object::new(scope);
  let key = v8::String::new(scope, "seven").unwrap();
  let value = v8::Integer::new(scope, 7);
  extension.set(scope, key.into(), value.into());

  let function = compile_eval_function(
    scope,
    "globalThis.result = seven;",
    "eval.js",
    Some(extension),
    &NoopCompilationObserver,
  )
  .unwrap();

  let receiver = v8::undefined(scope);
  function.call(scope, receiver.into(), &[]).unwrap();

  let global = context.global(scope);
  let result = get(scope, global, "result");
  assert_eq!(result.integer_value(scope).unwrap(), 7);
}

#[test]
fn resolve_import_joins_relative_specifiers() {
  let base = Url::parse("file:///bundle/main.js").unwrap();
  let resolved = resolve_import("./lib/util.js", &base).unwrap();
  assert_eq!(resolved.as_str(), "file:///bundle/lib/util.js");
}
