// Copyright 2025 the Gantry authors. MIT license.

//! Module registry and loader core for embedding V8.
//!
//! A [`ModuleRegistry`] is a thread-safe catalog of modules contributed by
//! one or more bundles. The registry itself holds no engine state and may be
//! shared across isolates; [`ModuleRegistry::attach_to_isolate`] binds it to
//! a context, installing the engine callbacks for static imports, dynamic
//! `import(...)`, and `import.meta`, and giving the host synchronous
//! (`require`-style) and asynchronous entry points with correct semantics
//! for cycles and top-level await.

#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]

pub mod error;
mod module_specifier;
mod modules;

pub use crate::module_specifier::ModuleResolutionError;
pub use crate::module_specifier::ModuleSpecifier;
pub use crate::module_specifier::normalize_path;
pub use crate::module_specifier::resolve_import;
pub use crate::module_specifier::without_search_and_fragment;
pub use crate::modules::BuiltinBundleBuilder;
pub use crate::modules::BuiltinBundleType;
pub use crate::modules::BundleBuilder;
pub use crate::modules::CompatOptions;
pub use crate::modules::CompilationObserver;
pub use crate::modules::CompilationTier;
pub use crate::modules::EvalCallback;
pub use crate::modules::EvaluateCallback;
pub use crate::modules::IsolateModuleRegistry;
pub use crate::modules::IsolateRegistryHandle;
pub use crate::modules::MODULE_REGISTRY_SLOT_INDEX;
pub use crate::modules::Module;
pub use crate::modules::ModuleBundle;
pub use crate::modules::ModuleBundleBuilder;
pub use crate::modules::ModuleBytes;
pub use crate::modules::ModuleCode;
pub use crate::modules::ModuleFactory;
pub use crate::modules::ModuleFlags;
pub use crate::modules::ModuleNamespace;
pub use crate::modules::ModuleRegistry;
pub use crate::modules::ModuleType;
pub use crate::modules::NoopCompilationObserver;
pub use crate::modules::NoopResolveObserver;
pub use crate::modules::RegistryBuilder;
pub use crate::modules::RegistryOptions;
pub use crate::modules::RequireOption;
pub use crate::modules::ResolveContext;
pub use crate::modules::ResolveContextType;
pub use crate::modules::ResolveObserver;
pub use crate::modules::ResolveOutcome;
pub use crate::modules::ResolveSource;
pub use crate::modules::Resolved;
pub use crate::modules::compile_eval_function;
pub use crate::modules::data_module_handler;
pub use crate::modules::json_module_handler;
pub use crate::modules::new_fallback_bundle;
pub use crate::modules::text_module_handler;
pub use crate::modules::wasm_module_handler;

// Re-exports
pub use parking_lot;
pub use url;
pub use v8;
