//! Configuration records and resolution.
//!
//! Rules, variants, shortcuts, preflights and hooks are capability records:
//! plain structs holding optional shared closures. `resolve` folds a user
//! config over optional defaults into an immutable [`ResolvedConfig`] the
//! engine reads for the lifetime of a generator.

use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::extract::{default_extractor, ExtractorContext};

/// A single CSS declaration as `(property, value)`.
pub type CssEntry = (String, String);

/// Declaration sets handed back by rule handlers: either an ordered list of
/// pairs or a mapping. Both normalize to an ordered entry list; a mapping
/// contributes its own iteration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Declarations {
    List(Vec<CssEntry>),
    Map(BTreeMap<String, String>),
}

impl Declarations {
    pub fn into_entries(self) -> Vec<CssEntry> {
        match self {
            Declarations::List(entries) => entries,
            Declarations::Map(map) => map.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Declarations::List(entries) => entries.is_empty(),
            Declarations::Map(map) => map.is_empty(),
        }
    }
}

/// Metadata shared by rules and shortcuts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleMeta {
    pub layer: Option<String>,
    pub internal: bool,
    pub no_merge: bool,
}

impl RuleMeta {
    pub fn layer(name: &str) -> Self {
        Self {
            layer: Some(name.to_string()),
            ..Self::default()
        }
    }
}

/// What a dynamic rule handler may produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOutput {
    /// A literal CSS body emitted as a raw utility, selector-less.
    Css(String),
    /// One declaration group.
    Entries(Declarations),
    /// Several declaration groups, one parsed utility each.
    Groups(Vec<Declarations>),
}

/// Context passed to rule handlers. `raw_selector` is the escaped selector
/// of the raw token, `current_selector` the residual after variant peeling.
pub struct RuleContext<'a> {
    pub raw_selector: String,
    pub current_selector: String,
    pub theme: &'a Theme,
    pub config: &'a ResolvedConfig,
    pub variant_handlers: &'a [VariantHandler],
}

/// Context passed to variant matchers and dynamic shortcut handlers.
pub struct VariantContext<'a> {
    pub raw: &'a str,
    pub theme: &'a Theme,
    pub config: &'a ResolvedConfig,
}

/// The mutable view postprocess hooks receive after variant application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtilObject {
    pub selector: String,
    pub entries: Vec<CssEntry>,
    pub parent: Option<String>,
    pub layer: Option<String>,
}

pub type DynamicRuleFn =
    Arc<dyn Fn(&regex::Captures<'_>, &RuleContext<'_>) -> Option<RuleOutput> + Send + Sync>;
pub type DynamicShortcutFn = Arc<
    dyn Fn(&regex::Captures<'_>, &VariantContext<'_>) -> Option<ShortcutExpansion> + Send + Sync,
>;
pub type VariantMatchFn =
    Arc<dyn Fn(&str, &VariantContext<'_>) -> Option<VariantMatch> + Send + Sync>;
pub type BodyRewriteFn = Arc<dyn Fn(Vec<CssEntry>) -> Vec<CssEntry> + Send + Sync>;
pub type SelectorRewriteFn = Arc<dyn Fn(&str, &[CssEntry]) -> Option<String> + Send + Sync>;
pub type ExtractorFn = Arc<dyn Fn(&ExtractorContext<'_>) -> BTreeSet<String> + Send + Sync>;
pub type PreflightFn = Arc<dyn Fn(&PreflightContext<'_>) -> Option<String> + Send + Sync>;
pub type PreprocessFn = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;
pub type PostprocessFn = Arc<dyn Fn(&mut UtilObject) + Send + Sync>;
pub type SortLayersFn = Arc<dyn Fn(Vec<String>) -> Vec<String> + Send + Sync>;

/// A rule maps a residual selector to declarations: static by exact key,
/// dynamic by regex. A static rule with a `None` body is a tombstone that
/// matches nothing.
#[derive(Clone)]
pub enum Rule {
    Static {
        key: String,
        entries: Option<Declarations>,
        meta: RuleMeta,
    },
    Dynamic {
        pattern: Regex,
        handler: DynamicRuleFn,
        meta: RuleMeta,
    },
}

impl Rule {
    pub fn stat(key: &str, entries: &[(&str, &str)]) -> Self {
        Rule::stat_meta(key, entries, RuleMeta::default())
    }

    pub fn stat_meta(key: &str, entries: &[(&str, &str)], meta: RuleMeta) -> Self {
        Rule::Static {
            key: key.to_string(),
            entries: Some(Declarations::List(owned_entries(entries))),
            meta,
        }
    }

    pub fn tombstone(key: &str) -> Self {
        Rule::Static {
            key: key.to_string(),
            entries: None,
            meta: RuleMeta::default(),
        }
    }

    pub fn dynamic<F>(pattern: Regex, handler: F) -> Self
    where
        F: Fn(&regex::Captures<'_>, &RuleContext<'_>) -> Option<RuleOutput> + Send + Sync + 'static,
    {
        Rule::dynamic_meta(pattern, handler, RuleMeta::default())
    }

    pub fn dynamic_meta<F>(pattern: Regex, handler: F, meta: RuleMeta) -> Self
    where
        F: Fn(&regex::Captures<'_>, &RuleContext<'_>) -> Option<RuleOutput> + Send + Sync + 'static,
    {
        Rule::Dynamic {
            pattern,
            handler: Arc::new(handler),
            meta,
        }
    }

    pub fn meta(&self) -> &RuleMeta {
        match self {
            Rule::Static { meta, .. } => meta,
            Rule::Dynamic { meta, .. } => meta,
        }
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::Static { key, .. } => f.debug_tuple("Rule::Static").field(key).finish(),
            Rule::Dynamic { pattern, .. } => f
                .debug_tuple("Rule::Dynamic")
                .field(&pattern.as_str())
                .finish(),
        }
    }
}

/// What a variant match produces: a bare residual string, or a full handler.
pub enum VariantMatch {
    Matcher(String),
    Handler(VariantHandler),
}

/// A variant peels part of a token and contributes selector, body, parent
/// and layer rewrites to the utilities it applies to.
#[derive(Clone)]
pub struct Variant {
    pub match_fn: VariantMatchFn,
    pub multi_pass: bool,
    pub order: i32,
}

impl Variant {
    pub fn new<F>(match_fn: F) -> Self
    where
        F: Fn(&str, &VariantContext<'_>) -> Option<VariantMatch> + Send + Sync + 'static,
    {
        Self {
            match_fn: Arc::new(match_fn),
            multi_pass: false,
            order: 0,
        }
    }

    pub fn multi_pass(mut self) -> Self {
        self.multi_pass = true;
        self
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }
}

impl fmt::Debug for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variant")
            .field("multi_pass", &self.multi_pass)
            .field("order", &self.order)
            .finish()
    }
}

/// A parent at-rule contributed by a variant, optionally registering an
/// ordering weight for the sheet assembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantParent {
    pub parent: String,
    pub order: Option<i32>,
}

/// The record a variant hit leaves behind: the residual `matcher` plus the
/// rewrites to fold in when the utility is stringified.
#[derive(Clone, Default)]
pub struct VariantHandler {
    pub matcher: String,
    pub order: i32,
    pub body: Option<BodyRewriteFn>,
    pub selector: Option<SelectorRewriteFn>,
    pub parent: Option<VariantParent>,
    pub layer: Option<String>,
}

impl VariantHandler {
    pub fn new(matcher: impl Into<String>) -> Self {
        Self {
            matcher: matcher.into(),
            ..Self::default()
        }
    }

    pub fn at_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn with_body<F>(mut self, body: F) -> Self
    where
        F: Fn(Vec<CssEntry>) -> Vec<CssEntry> + Send + Sync + 'static,
    {
        self.body = Some(Arc::new(body));
        self
    }

    pub fn with_selector<F>(mut self, selector: F) -> Self
    where
        F: Fn(&str, &[CssEntry]) -> Option<String> + Send + Sync + 'static,
    {
        self.selector = Some(Arc::new(selector));
        self
    }

    pub fn with_parent(mut self, parent: &str) -> Self {
        self.parent = Some(VariantParent {
            parent: parent.to_string(),
            order: None,
        });
        self
    }

    pub fn with_parent_order(mut self, parent: &str, order: i32) -> Self {
        self.parent = Some(VariantParent {
            parent: parent.to_string(),
            order: Some(order),
        });
        self
    }

    pub fn with_layer(mut self, layer: &str) -> Self {
        self.layer = Some(layer.to_string());
        self
    }
}

impl fmt::Debug for VariantHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VariantHandler")
            .field("matcher", &self.matcher)
            .field("order", &self.order)
            .field("parent", &self.parent)
            .field("layer", &self.layer)
            .finish()
    }
}

/// A shortcut expansion: a whitespace-separated string (variant-group syntax
/// allowed) or an explicit token list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShortcutExpansion {
    Inline(String),
    Tokens(Vec<String>),
}

/// A shortcut rewrites a residual selector into sub-tokens that re-enter the
/// pipeline under the shortcut's own class.
#[derive(Clone)]
pub enum Shortcut {
    Static {
        key: String,
        expansion: ShortcutExpansion,
        meta: RuleMeta,
    },
    Dynamic {
        pattern: Regex,
        handler: DynamicShortcutFn,
        meta: RuleMeta,
    },
}

impl Shortcut {
    pub fn stat(key: &str, expansion: &str) -> Self {
        Shortcut::stat_meta(key, expansion, RuleMeta::default())
    }

    pub fn stat_meta(key: &str, expansion: &str, meta: RuleMeta) -> Self {
        Shortcut::Static {
            key: key.to_string(),
            expansion: ShortcutExpansion::Inline(expansion.to_string()),
            meta,
        }
    }

    pub fn dynamic<F>(pattern: Regex, handler: F) -> Self
    where
        F: Fn(&regex::Captures<'_>, &VariantContext<'_>) -> Option<ShortcutExpansion>
            + Send
            + Sync
            + 'static,
    {
        Shortcut::dynamic_meta(pattern, handler, RuleMeta::default())
    }

    pub fn dynamic_meta<F>(pattern: Regex, handler: F, meta: RuleMeta) -> Self
    where
        F: Fn(&regex::Captures<'_>, &VariantContext<'_>) -> Option<ShortcutExpansion>
            + Send
            + Sync
            + 'static,
    {
        Shortcut::Dynamic {
            pattern,
            handler: Arc::new(handler),
            meta,
        }
    }

    pub fn meta(&self) -> &RuleMeta {
        match self {
            Shortcut::Static { meta, .. } => meta,
            Shortcut::Dynamic { meta, .. } => meta,
        }
    }
}

impl fmt::Debug for Shortcut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shortcut::Static { key, .. } => f.debug_tuple("Shortcut::Static").field(key).finish(),
            Shortcut::Dynamic { pattern, .. } => f
                .debug_tuple("Shortcut::Dynamic")
                .field(&pattern.as_str())
                .finish(),
        }
    }
}

pub struct PreflightContext<'a> {
    pub theme: &'a Theme,
}

/// A block of static CSS emitted before generated rules of its layer.
#[derive(Clone)]
pub struct Preflight {
    pub get_css: PreflightFn,
    pub layer: Option<String>,
}

impl Preflight {
    pub fn new<F>(get_css: F) -> Self
    where
        F: Fn(&PreflightContext<'_>) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            get_css: Arc::new(get_css),
            layer: None,
        }
    }

    pub fn with_layer(mut self, layer: &str) -> Self {
        self.layer = Some(layer.to_string());
        self
    }
}

impl fmt::Debug for Preflight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Preflight")
            .field("layer", &self.layer)
            .finish()
    }
}

/// Blocklist entry: exact token or pattern.
#[derive(Debug, Clone)]
pub enum BlocklistEntry {
    Exact(String),
    Pattern(Regex),
}

impl BlocklistEntry {
    pub fn matches(&self, raw: &str) -> bool {
        match self {
            BlocklistEntry::Exact(token) => token == raw,
            BlocklistEntry::Pattern(pattern) => pattern.is_match(raw),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Theme {
    #[serde(default = "default_theme_name")]
    pub name: String,
    #[serde(default)]
    pub colors: BTreeMap<String, BTreeMap<String, String>>,
}

fn default_theme_name() -> String {
    "default".to_string()
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            name: default_theme_name(),
            colors: BTreeMap::new(),
        }
    }
}

pub const LAYER_DEFAULT: &str = "default";
pub const LAYER_SHORTCUTS: &str = "shortcuts";
pub const LAYER_PREFLIGHTS: &str = "preflights";

fn builtin_layers() -> BTreeMap<String, i32> {
    BTreeMap::from([
        (LAYER_PREFLIGHTS.to_string(), -100),
        (LAYER_SHORTCUTS.to_string(), -10),
        (LAYER_DEFAULT.to_string(), 0),
    ])
}

/// User-facing configuration. All list fields append onto the defaults they
/// are resolved against; scalar fields override when set.
#[derive(Clone, Default)]
pub struct UserConfig {
    pub rules: Vec<Rule>,
    pub shortcuts: Vec<Shortcut>,
    pub variants: Vec<Variant>,
    pub extractors: Vec<ExtractorFn>,
    pub preflights: Vec<Preflight>,
    pub preprocess: Vec<PreprocessFn>,
    pub postprocess: Vec<PostprocessFn>,
    pub blocklist: Vec<BlocklistEntry>,
    pub safelist: Vec<String>,
    pub theme: Option<Theme>,
    pub layers: BTreeMap<String, i32>,
    pub sort_layers: Option<SortLayersFn>,
    pub shortcuts_layer: Option<String>,
    pub merge_selectors: Option<bool>,
}

impl fmt::Debug for UserConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserConfig")
            .field("rules", &self.rules.len())
            .field("shortcuts", &self.shortcuts.len())
            .field("variants", &self.variants.len())
            .field("safelist", &self.safelist)
            .field("layers", &self.layers)
            .finish()
    }
}

/// The immutable configuration the engine runs against.
#[derive(Clone)]
pub struct ResolvedConfig {
    pub rules: Vec<Rule>,
    pub rules_static_map: HashMap<String, usize>,
    pub rules_size: usize,
    pub shortcuts: Vec<Shortcut>,
    pub variants: Vec<Variant>,
    pub extractors: Vec<ExtractorFn>,
    pub preflights: Vec<Preflight>,
    pub preprocess: Vec<PreprocessFn>,
    pub postprocess: Vec<PostprocessFn>,
    pub blocklist: Vec<BlocklistEntry>,
    pub safelist: Vec<String>,
    pub theme: Theme,
    pub layers: BTreeMap<String, i32>,
    pub sort_layers: Option<SortLayersFn>,
    pub shortcuts_layer: String,
    pub merge_selectors: bool,
}

impl ResolvedConfig {
    pub fn is_blocked(&self, raw: &str) -> bool {
        raw.is_empty() || self.blocklist.iter().any(|entry| entry.matches(raw))
    }

    pub fn layer_weight(&self, layer: &str) -> i32 {
        self.layers.get(layer).copied().unwrap_or(0)
    }
}

impl fmt::Debug for ResolvedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedConfig")
            .field("rules", &self.rules.len())
            .field("shortcuts", &self.shortcuts.len())
            .field("variants", &self.variants.len())
            .field("layers", &self.layers)
            .field("shortcuts_layer", &self.shortcuts_layer)
            .field("merge_selectors", &self.merge_selectors)
            .finish()
    }
}

/// Folds `user` over `defaults` into a [`ResolvedConfig`]. Default-supplied
/// rules register first so user rules win the reverse scan; static rules are
/// indexed by key, last registration winning.
pub fn resolve(user: UserConfig, defaults: Option<UserConfig>) -> ResolvedConfig {
    let defaults = defaults.unwrap_or_default();

    let mut rules = defaults.rules;
    rules.extend(user.rules);
    let mut shortcuts = defaults.shortcuts;
    shortcuts.extend(user.shortcuts);
    let mut variants = defaults.variants;
    variants.extend(user.variants);
    variants.sort_by_key(|variant| variant.order);
    let mut extractors = defaults.extractors;
    extractors.extend(user.extractors);
    if extractors.is_empty() {
        extractors.push(default_extractor());
    }
    let mut preflights = defaults.preflights;
    preflights.extend(user.preflights);
    let mut preprocess = defaults.preprocess;
    preprocess.extend(user.preprocess);
    let mut postprocess = defaults.postprocess;
    postprocess.extend(user.postprocess);
    let mut blocklist = defaults.blocklist;
    blocklist.extend(user.blocklist);
    let mut safelist = defaults.safelist;
    safelist.extend(user.safelist);

    let mut layers = builtin_layers();
    layers.extend(defaults.layers);
    layers.extend(user.layers);

    let mut rules_static_map = HashMap::new();
    for (idx, rule) in rules.iter().enumerate() {
        if let Rule::Static { key, .. } = rule {
            rules_static_map.insert(key.clone(), idx);
        }
    }

    let rules_size = rules.len();

    ResolvedConfig {
        rules,
        rules_static_map,
        rules_size,
        shortcuts,
        variants,
        extractors,
        preflights,
        preprocess,
        postprocess,
        blocklist,
        safelist,
        theme: user.theme.or(defaults.theme).unwrap_or_default(),
        layers,
        sort_layers: user.sort_layers.or(defaults.sort_layers),
        shortcuts_layer: user
            .shortcuts_layer
            .or(defaults.shortcuts_layer)
            .unwrap_or_else(|| LAYER_SHORTCUTS.to_string()),
        merge_selectors: user
            .merge_selectors
            .or(defaults.merge_selectors)
            .unwrap_or(true),
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// The data-only half of a user config, loadable from a TOML file. Handlers
/// stay in code; this covers theme, safelist, blocklist strings, layer
/// weights and the merge flag.
#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub theme: Theme,
    #[serde(default)]
    pub safelist: Vec<String>,
    #[serde(default)]
    pub blocklist: Vec<String>,
    #[serde(default)]
    pub layers: BTreeMap<String, i32>,
    #[serde(default)]
    pub merge_selectors: Option<bool>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<ConfigFile, ConfigError> {
        let text = fs::read_to_string(path).map_err(|err| ConfigError::Read {
            path: path.display().to_string(),
            source: err,
        })?;
        toml::from_str(&text).map_err(|err| ConfigError::Parse {
            path: path.display().to_string(),
            source: err,
        })
    }

    pub fn into_user_config(self) -> UserConfig {
        UserConfig {
            safelist: self.safelist,
            blocklist: self
                .blocklist
                .into_iter()
                .map(BlocklistEntry::Exact)
                .collect(),
            theme: Some(self.theme),
            layers: self.layers,
            merge_selectors: self.merge_selectors,
            ..UserConfig::default()
        }
    }
}

fn owned_entries(entries: &[(&str, &str)]) -> Vec<CssEntry> {
    entries
        .iter()
        .map(|(property, value)| (property.to_string(), value.to_string()))
        .collect()
}
