//! forgecss is an on-demand atomic CSS generator: it extracts class-like
//! tokens from source text, matches them against a configured rule set and
//! emits a deterministic stylesheet containing only the rules that were
//! referenced.
//!
//! The pipeline per token: preprocess hooks, variant peeling, then either
//! shortcut expansion (recursive, depth-capped) or rule matching (static map
//! first, dynamic rules scanned newest-first). Stringified utilities are
//! cached per raw token, grouped by parent at-rule and layer, sorted,
//! selector-merged and rendered.
//!
//! ```
//! use forgecss::{GenerateOptions, Generator, Rule, UserConfig};
//!
//! let generator = Generator::new(UserConfig {
//!     rules: vec![Rule::stat("m-2", &[("margin", "0.5rem")])],
//!     ..UserConfig::default()
//! });
//! let result = generator
//!     .generate("<div class=\"m-2\"></div>", &GenerateOptions::default())
//!     .unwrap();
//! assert!(result.css.contains(".m-2{margin:0.5rem}"));
//! ```

pub mod config;
pub mod escape;
pub mod extract;
pub mod generator;

pub use config::{
    resolve, BlocklistEntry, ConfigError, ConfigFile, CssEntry, Declarations, Preflight,
    PreflightContext, ResolvedConfig, Rule, RuleContext, RuleMeta, RuleOutput, Shortcut,
    ShortcutExpansion, Theme, UserConfig, UtilObject, Variant, VariantContext, VariantHandler,
    VariantMatch, VariantParent,
};
pub use escape::{escape_css_ident, to_escaped_selector};
pub use extract::{default_extractor, split_candidates, ExtractorContext, ScanError, ScanGlobOptions};
pub use generator::{
    expand_variant_group, GenerateError, GenerateOptions, GenerateResult, Generator,
    StringifiedUtil, NO_MERGE_MARKER, SCOPE_PLACEHOLDER,
};
