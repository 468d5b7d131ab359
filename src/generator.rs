//! The generator engine: variant matching, rule matching, shortcut
//! expansion, utility stringification, the per-token cache and the sheet
//! assembler.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::sync::{Mutex, MutexGuard, OnceLock};
use thiserror::Error;

use crate::config::{
    resolve, CssEntry, PreflightContext, ResolvedConfig, Rule, RuleContext, RuleMeta, RuleOutput,
    Shortcut, ShortcutExpansion, UserConfig, UtilObject, VariantContext, VariantHandler,
    VariantMatch, LAYER_DEFAULT, LAYER_PREFLIGHTS,
};
use crate::escape::to_escaped_selector;
use crate::extract::{scan_globs, ExtractorContext, ScanError, ScanGlobOptions};

/// Literal placeholder a selector may carry to mark where the generate-time
/// scope string is substituted.
pub const SCOPE_PLACEHOLDER: &str = " $$ ";

/// Reserved declaration property. An entry list carrying it is emitted
/// without being merged with other entries of its shortcut bucket; the
/// marker itself never reaches the output.
pub const NO_MERGE_MARKER: &str = "--forgecss-no-merge";

const MAX_VARIANT_HANDLERS: usize = 500;
const SHORTCUT_MAX_DEPTH: usize = 3;

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("too many variant applications for token `{token}`")]
    VariantOverflow { token: String },
    #[error(transparent)]
    Scan(#[from] ScanError),
}

/// Terminal form of a utility. A missing selector means the body is emitted
/// bare at the top level of its parent group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringifiedUtil {
    pub order: i64,
    pub selector: Option<String>,
    pub body: String,
    pub parent: Option<String>,
    pub meta: RuleMeta,
}

struct ParsedUtil {
    order: i64,
    raw: String,
    entries: Vec<CssEntry>,
    meta: RuleMeta,
    handlers: Vec<VariantHandler>,
}

struct RawUtil {
    order: i64,
    css: String,
    meta: RuleMeta,
}

enum Util {
    Parsed(ParsedUtil),
    Raw(RawUtil),
}

struct VariantMatched {
    raw: String,
    processed: String,
    handlers: Vec<VariantHandler>,
}

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub id: Option<String>,
    pub scope: Option<String>,
    pub preflights: bool,
    pub safelist: bool,
    pub minify: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            id: None,
            scope: None,
            preflights: true,
            safelist: true,
            minify: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerateResult {
    pub css: String,
    pub layers: Vec<String>,
    pub matched: BTreeSet<String>,
    layer_css: BTreeMap<String, String>,
    minify: bool,
}

impl GenerateResult {
    pub fn get_layer(&self, name: &str) -> Option<&str> {
        self.layer_css.get(name).map(String::as_str)
    }

    pub fn get_layers(&self, includes: Option<&[&str]>, excludes: Option<&[&str]>) -> String {
        let separator = if self.minify { "" } else { "\n" };
        self.layers
            .iter()
            .filter(|layer| {
                includes
                    .map(|list| list.contains(&layer.as_str()))
                    .unwrap_or(true)
            })
            .filter(|layer| {
                !excludes
                    .map(|list| list.contains(&layer.as_str()))
                    .unwrap_or(false)
            })
            .filter_map(|layer| self.layer_css.get(layer))
            .filter(|css| !css.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join(separator)
    }
}

/// The engine. Holds the resolved config plus the token cache, the
/// blocklist-miss set and the parent at-rule orders; all three reset when
/// the config is replaced.
pub struct Generator {
    config: ResolvedConfig,
    cache: Mutex<HashMap<String, Option<Vec<StringifiedUtil>>>>,
    blocked: Mutex<HashSet<String>>,
    parent_orders: Mutex<BTreeMap<String, i32>>,
}

impl Generator {
    pub fn new(user: UserConfig) -> Self {
        Self::from_config(resolve(user, None))
    }

    pub fn with_defaults(user: UserConfig, defaults: UserConfig) -> Self {
        Self::from_config(resolve(user, Some(defaults)))
    }

    fn from_config(config: ResolvedConfig) -> Self {
        Self {
            config,
            cache: Mutex::new(HashMap::new()),
            blocked: Mutex::new(HashSet::new()),
            parent_orders: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    /// Replaces the config and resets all engine state. A missing `user`
    /// config is a no-op.
    pub fn set_config(&mut self, user: Option<UserConfig>, defaults: Option<UserConfig>) {
        let Some(user) = user else { return };
        self.config = resolve(user, defaults);
        lock(&self.cache).clear();
        lock(&self.blocked).clear();
        lock(&self.parent_orders).clear();
    }

    /// Runs every configured extractor over `code` and unions the candidate
    /// tokens into `acc`.
    pub fn apply_extractors(&self, code: &str, id: Option<&str>, acc: &mut BTreeSet<String>) {
        let ctx = ExtractorContext {
            original: code,
            code,
            id,
        };
        for extractor in &self.config.extractors {
            acc.extend(extractor(&ctx));
        }
    }

    /// Parses one raw token into its stringified utilities. `None` is the
    /// unmatched sentinel; both outcomes are cached per raw token.
    pub fn parse_token(&self, raw: &str) -> Result<Option<Vec<StringifiedUtil>>, GenerateError> {
        if let Some(hit) = lock(&self.cache).get(raw) {
            return Ok(hit.clone());
        }
        if lock(&self.blocked).contains(raw) {
            return Ok(None);
        }

        let mut current = raw.to_string();
        for hook in &self.config.preprocess {
            if let Some(next) = hook(&current) {
                current = next;
            }
        }
        if self.config.is_blocked(&current) {
            return Ok(self.block_token(raw));
        }

        let matched = self.match_variants(raw, Some(&current))?;
        if matched.handlers.is_empty() && self.config.is_blocked(&matched.processed) {
            return Ok(self.block_token(raw));
        }

        let utils = if let Some((tokens, meta)) =
            self.expand_shortcut(&matched.processed, SHORTCUT_MAX_DEPTH)
        {
            self.stringify_shortcuts(&matched, tokens, meta)?
        } else {
            self.match_rules(&matched, false)
                .into_iter()
                .filter_map(|util| self.stringify_util(util))
                .collect()
        };

        let value = if utils.is_empty() { None } else { Some(utils) };
        lock(&self.cache).insert(raw.to_string(), value.clone());
        Ok(value)
    }

    fn block_token(&self, raw: &str) -> Option<Vec<StringifiedUtil>> {
        lock(&self.blocked).insert(raw.to_string());
        lock(&self.cache).insert(raw.to_string(), None);
        None
    }

    /// Extracts tokens from `input` and generates the stylesheet.
    pub fn generate(
        &self,
        input: &str,
        opts: &GenerateOptions,
    ) -> Result<GenerateResult, GenerateError> {
        let mut tokens = BTreeSet::new();
        self.apply_extractors(input, opts.id.as_deref(), &mut tokens);
        self.generate_tokens(tokens, opts)
    }

    /// Reads every file matched by `patterns`, extracts tokens with the file
    /// path as id, and generates the stylesheet over the union.
    pub fn generate_files(
        &self,
        patterns: &[String],
        ignore: &[String],
        scan: &ScanGlobOptions,
        opts: &GenerateOptions,
    ) -> Result<GenerateResult, GenerateError> {
        let paths = scan_globs(patterns, ignore, scan)?;
        let mut tokens = BTreeSet::new();
        for path in paths {
            let code = fs::read_to_string(&path).map_err(|err| ScanError::Read {
                path: path.display().to_string(),
                source: err,
            })?;
            let id = path.display().to_string();
            self.apply_extractors(&code, Some(&id), &mut tokens);
        }
        self.generate_tokens(tokens, opts)
    }

    /// Generates the stylesheet for a pre-extracted token set.
    pub fn generate_tokens(
        &self,
        tokens: BTreeSet<String>,
        opts: &GenerateOptions,
    ) -> Result<GenerateResult, GenerateError> {
        let mut tokens = tokens;
        if opts.safelist {
            tokens.extend(self.config.safelist.iter().cloned());
        }

        let mut matched = BTreeSet::new();
        let mut sheet: BTreeMap<String, Vec<StringifiedUtil>> = BTreeMap::new();
        let mut layer_set: BTreeSet<String> = BTreeSet::new();
        layer_set.insert(LAYER_DEFAULT.to_string());

        for token in &tokens {
            let Some(utils) = self.parse_token(token)? else {
                continue;
            };
            matched.insert(token.clone());
            for util in utils {
                layer_set.insert(
                    util.meta
                        .layer
                        .clone()
                        .unwrap_or_else(|| LAYER_DEFAULT.to_string()),
                );
                sheet
                    .entry(util.parent.clone().unwrap_or_default())
                    .or_default()
                    .push(util);
            }
        }

        if opts.preflights {
            for preflight in &self.config.preflights {
                layer_set.insert(
                    preflight
                        .layer
                        .clone()
                        .unwrap_or_else(|| LAYER_PREFLIGHTS.to_string()),
                );
            }
        }

        let mut layers: Vec<String> = layer_set.into_iter().collect();
        layers.sort_by(|a, b| {
            self.config
                .layer_weight(a)
                .cmp(&self.config.layer_weight(b))
                .then_with(|| a.cmp(b))
        });
        if let Some(hook) = &self.config.sort_layers {
            layers = hook(layers);
        }

        let mut layer_css = BTreeMap::new();
        for layer in &layers {
            layer_css.insert(layer.clone(), self.assemble_layer(&sheet, layer, opts));
        }
        let separator = if opts.minify { "" } else { "\n" };
        let css = layers
            .iter()
            .filter_map(|layer| layer_css.get(layer))
            .filter(|css| !css.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join(separator);

        Ok(GenerateResult {
            css,
            layers,
            matched,
            layer_css,
            minify: opts.minify,
        })
    }

    /// Peels variant prefixes off `raw` until a full scan over the variant
    /// list stays quiet. Non-multi-pass variants apply at most once; a
    /// variant parent carrying an order registers it for the assembler.
    fn match_variants(
        &self,
        raw: &str,
        current: Option<&str>,
    ) -> Result<VariantMatched, GenerateError> {
        let mut processed = current.unwrap_or(raw).to_string();
        let mut handlers: Vec<VariantHandler> = Vec::new();
        let mut used: HashSet<usize> = HashSet::new();
        let ctx = VariantContext {
            raw,
            theme: &self.config.theme,
            config: &self.config,
        };

        loop {
            let mut applied = false;
            for (idx, variant) in self.config.variants.iter().enumerate() {
                if used.contains(&idx) && !variant.multi_pass {
                    continue;
                }
                let Some(hit) = (variant.match_fn)(&processed, &ctx) else {
                    continue;
                };
                let handler = match hit {
                    VariantMatch::Matcher(matcher) => VariantHandler::new(matcher),
                    VariantMatch::Handler(handler) => handler,
                };
                processed = handler.matcher.clone();
                if let Some(parent) = &handler.parent {
                    if let Some(order) = parent.order {
                        lock(&self.parent_orders).insert(parent.parent.clone(), order);
                    }
                }
                handlers.push(handler);
                used.insert(idx);
                applied = true;
                break;
            }
            if !applied {
                break;
            }
            if handlers.len() > MAX_VARIANT_HANDLERS {
                return Err(GenerateError::VariantOverflow {
                    token: raw.to_string(),
                });
            }
        }

        Ok(VariantMatched {
            raw: raw.to_string(),
            processed,
            handlers,
        })
    }

    /// Maps a residual selector to utilities: static lookup first, then the
    /// dynamic rules scanned from the highest registered index down. The
    /// first producing rule wins.
    fn match_rules(&self, matched: &VariantMatched, internal: bool) -> Vec<Util> {
        let residual = matched.processed.as_str();

        if let Some(&idx) = self.config.rules_static_map.get(residual) {
            if let Rule::Static {
                entries: Some(declarations),
                meta,
                ..
            } = &self.config.rules[idx]
            {
                if internal || !meta.internal {
                    return vec![Util::Parsed(ParsedUtil {
                        order: idx as i64,
                        raw: matched.raw.clone(),
                        entries: declarations.clone().into_entries(),
                        meta: meta.clone(),
                        handlers: matched.handlers.clone(),
                    })];
                }
            }
        }

        let ctx = RuleContext {
            raw_selector: to_escaped_selector(&matched.raw),
            current_selector: residual.to_string(),
            theme: &self.config.theme,
            config: &self.config,
            variant_handlers: &matched.handlers,
        };

        for idx in (0..self.config.rules.len()).rev() {
            let Rule::Dynamic {
                pattern,
                handler,
                meta,
            } = &self.config.rules[idx]
            else {
                continue;
            };
            if meta.internal && !internal {
                continue;
            }
            let Some(captures) = pattern.captures(residual) else {
                continue;
            };
            let Some(output) = handler(&captures, &ctx) else {
                continue;
            };
            match output {
                RuleOutput::Css(css) => {
                    return vec![Util::Raw(RawUtil {
                        order: idx as i64,
                        css,
                        meta: meta.clone(),
                    })];
                }
                RuleOutput::Entries(declarations) => {
                    let entries = declarations.into_entries();
                    if entries.is_empty() {
                        continue;
                    }
                    return vec![Util::Parsed(ParsedUtil {
                        order: idx as i64,
                        raw: matched.raw.clone(),
                        entries,
                        meta: meta.clone(),
                        handlers: matched.handlers.clone(),
                    })];
                }
                RuleOutput::Groups(groups) => {
                    let groups: Vec<Vec<CssEntry>> = groups
                        .into_iter()
                        .map(|group| group.into_entries())
                        .filter(|group| !group.is_empty())
                        .collect();
                    if groups.is_empty() {
                        continue;
                    }
                    return groups
                        .into_iter()
                        .map(|entries| {
                            Util::Parsed(ParsedUtil {
                                order: idx as i64,
                                raw: matched.raw.clone(),
                                entries,
                                meta: meta.clone(),
                                handlers: matched.handlers.clone(),
                            })
                        })
                        .collect();
                }
            }
        }

        Vec::new()
    }

    /// Expands a residual selector through the shortcut list, recursing into
    /// sub-tokens down to the depth cap. Sub-tokens that are not themselves
    /// shortcuts stay literal.
    fn expand_shortcut(&self, residual: &str, depth: usize) -> Option<(Vec<String>, RuleMeta)> {
        if depth == 0 {
            return None;
        }

        let mut hit: Option<(ShortcutExpansion, RuleMeta)> = None;
        for shortcut in &self.config.shortcuts {
            match shortcut {
                Shortcut::Static {
                    key,
                    expansion,
                    meta,
                } if key == residual => {
                    hit = Some((expansion.clone(), meta.clone()));
                    break;
                }
                Shortcut::Dynamic {
                    pattern,
                    handler,
                    meta,
                } => {
                    let Some(captures) = pattern.captures(residual) else {
                        continue;
                    };
                    let ctx = VariantContext {
                        raw: residual,
                        theme: &self.config.theme,
                        config: &self.config,
                    };
                    if let Some(expansion) = handler(&captures, &ctx) {
                        hit = Some((expansion, meta.clone()));
                        break;
                    }
                }
                _ => {}
            }
        }

        let (expansion, meta) = hit?;
        let tokens: Vec<String> = match expansion {
            ShortcutExpansion::Inline(text) => expand_variant_group(&text)
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            ShortcutExpansion::Tokens(tokens) => tokens,
        };

        let mut flattened = Vec::new();
        for token in tokens {
            if token.is_empty() {
                continue;
            }
            match self.expand_shortcut(&token, depth - 1) {
                Some((sub_tokens, _)) => flattened.extend(sub_tokens),
                None => flattened.push(token),
            }
        }
        Some((flattened, meta))
    }

    fn apply_variants(
        &self,
        raw: &str,
        entries: Vec<CssEntry>,
        handlers: &[VariantHandler],
    ) -> UtilObject {
        let (selector, entries, parent, layer) =
            apply_handlers(handlers, to_escaped_selector(raw), entries);
        let mut util = UtilObject {
            selector,
            entries,
            parent,
            layer,
        };
        for hook in &self.config.postprocess {
            hook(&mut util);
        }
        util
    }

    fn stringify_util(&self, util: Util) -> Option<StringifiedUtil> {
        match util {
            Util::Raw(raw) => {
                if raw.css.trim().is_empty() {
                    return None;
                }
                Some(StringifiedUtil {
                    order: raw.order,
                    selector: None,
                    body: raw.css,
                    parent: None,
                    meta: raw.meta,
                })
            }
            Util::Parsed(parsed) => {
                let util = self.apply_variants(&parsed.raw, parsed.entries, &parsed.handlers);
                let body = entries_to_css(&util.entries);
                if body.is_empty() {
                    return None;
                }
                let mut meta = parsed.meta;
                meta.layer = util.layer.or(meta.layer);
                Some(StringifiedUtil {
                    order: parsed.order,
                    selector: Some(util.selector),
                    body,
                    parent: util.parent,
                    meta,
                })
            }
        }
    }

    /// Stringifies a shortcut's expanded token list against the shortcut's
    /// own raw token. Variants compose outward: each sub-utility is applied
    /// with its own handlers followed by the shortcut's, so selectors target
    /// the shortcut class. Sub-utilities bucket by `(selector, parent)`; a
    /// bucket splits into no-merge and mergeable streams, and within each,
    /// entry lists carrying the no-merge marker stay separate while the rest
    /// collapse into one body.
    fn stringify_shortcuts(
        &self,
        parent: &VariantMatched,
        expanded: Vec<String>,
        shortcut_meta: RuleMeta,
    ) -> Result<Vec<StringifiedUtil>, GenerateError> {
        let mut seen = HashSet::new();
        let tokens: Vec<String> = expanded
            .into_iter()
            .filter(|token| seen.insert(token.clone()))
            .collect();

        let mut parsed: Vec<ParsedUtil> = Vec::new();
        for token in &tokens {
            let matched = self.match_variants(token, None)?;
            let utils = self.match_rules(&matched, true);
            if utils.is_empty() {
                warn_once(format!(
                    "unmatched utility `{}` in shortcut `{}`",
                    token, parent.raw
                ));
                continue;
            }
            for util in utils {
                if let Util::Parsed(util) = util {
                    parsed.push(util);
                }
            }
        }
        parsed.sort_by_key(|util| util.order);

        let fallback_layer = shortcut_meta
            .layer
            .clone()
            .unwrap_or_else(|| self.config.shortcuts_layer.clone());

        struct Bucket {
            selector: String,
            parent: Option<String>,
            min_order: i64,
            layer: Option<String>,
            entries: Vec<(Vec<CssEntry>, bool)>,
        }
        let mut buckets: Vec<Bucket> = Vec::new();
        for util in parsed {
            let mut handlers = util.handlers;
            handlers.extend(parent.handlers.iter().cloned());
            let applied = self.apply_variants(&parent.raw, util.entries, &handlers);
            let idx = match buckets
                .iter()
                .position(|b| b.selector == applied.selector && b.parent == applied.parent)
            {
                Some(idx) => idx,
                None => {
                    buckets.push(Bucket {
                        selector: applied.selector.clone(),
                        parent: applied.parent.clone(),
                        min_order: util.order,
                        layer: None,
                        entries: Vec::new(),
                    });
                    buckets.len() - 1
                }
            };
            let bucket = &mut buckets[idx];
            bucket.min_order = bucket.min_order.min(util.order);
            if let Some(layer) = applied.layer {
                bucket.layer = Some(layer);
            }
            bucket.entries.push((applied.entries, util.meta.no_merge));
        }

        let mut out = Vec::new();
        for bucket in buckets {
            let layer = bucket
                .layer
                .clone()
                .unwrap_or_else(|| fallback_layer.clone());
            for no_merge in [true, false] {
                let stream: Vec<&Vec<CssEntry>> = bucket
                    .entries
                    .iter()
                    .filter(|(_, flag)| *flag == no_merge)
                    .map(|(entries, _)| entries)
                    .collect();
                if stream.is_empty() {
                    continue;
                }
                let (marked, unmarked): (Vec<_>, Vec<_>) = stream
                    .into_iter()
                    .partition(|entries| has_no_merge_marker(entries));
                let mut emit = |entries: &[CssEntry]| {
                    let body = entries_to_css(entries);
                    if body.is_empty() {
                        return;
                    }
                    out.push(StringifiedUtil {
                        order: bucket.min_order,
                        selector: Some(bucket.selector.clone()),
                        body,
                        parent: bucket.parent.clone(),
                        meta: RuleMeta {
                            layer: Some(layer.clone()),
                            internal: shortcut_meta.internal,
                            no_merge,
                        },
                    });
                };
                for entries in marked {
                    emit(entries);
                }
                if !unmarked.is_empty() {
                    let merged: Vec<CssEntry> =
                        unmarked.into_iter().flatten().cloned().collect();
                    emit(&merged);
                }
            }
        }
        Ok(out)
    }

    /// Renders one layer of the sheet: parents sorted by registered order
    /// then name, utilities by `(order, selector)`, scope applied, identical
    /// bodies merged into comma-separated selector groups, preflights and
    /// the layer comment prepended.
    fn assemble_layer(
        &self,
        sheet: &BTreeMap<String, Vec<StringifiedUtil>>,
        layer: &str,
        opts: &GenerateOptions,
    ) -> String {
        let parent_orders = lock(&self.parent_orders).clone();
        let mut parents: Vec<&String> = sheet.keys().collect();
        parents.sort_by(|a, b| {
            let order_a = parent_orders.get(*a).copied().unwrap_or(0);
            let order_b = parent_orders.get(*b).copied().unwrap_or(0);
            order_a.cmp(&order_b).then_with(|| a.cmp(b))
        });

        struct Item {
            selectors: Option<Vec<String>>,
            body: String,
            no_merge: bool,
        }

        let mut blocks = Vec::new();
        for parent in parents {
            let mut utils: Vec<StringifiedUtil> = sheet[parent]
                .iter()
                .filter(|util| util.meta.layer.as_deref().unwrap_or(LAYER_DEFAULT) == layer)
                .cloned()
                .collect();
            if utils.is_empty() {
                continue;
            }
            utils.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.selector.cmp(&b.selector)));

            let mut items: Vec<Item> = utils
                .into_iter()
                .map(|util| Item {
                    selectors: util
                        .selector
                        .map(|selector| vec![apply_scope(selector, opts.scope.as_deref())]),
                    body: util.body,
                    no_merge: util.meta.no_merge,
                })
                .collect();

            // Reverse scan: an earlier utility with a body some later
            // utility repeats moves its selectors into that later group,
            // keeping the merged rule at the later cascade position.
            if self.config.merge_selectors {
                let mut i = items.len() as isize - 1;
                while i >= 0 {
                    let ii = i as usize;
                    if !items[ii].no_merge && items[ii].selectors.is_some() {
                        let target = (ii + 1..items.len()).find(|&j| {
                            !items[j].no_merge
                                && items[j].selectors.is_some()
                                && items[j].body == items[ii].body
                        });
                        if let Some(j) = target {
                            let moved = items[ii].selectors.take().unwrap_or_default();
                            if let Some(selectors) = items[j].selectors.as_mut() {
                                for (offset, selector) in moved.into_iter().enumerate() {
                                    selectors.insert(offset, selector);
                                }
                            }
                            items.remove(ii);
                        }
                    }
                    i -= 1;
                }
            }

            let mut lines = Vec::new();
            for item in items {
                match item.selectors {
                    Some(selectors) => {
                        let mut uniq: Vec<String> = Vec::new();
                        for selector in selectors {
                            if !uniq.contains(&selector) {
                                uniq.push(selector);
                            }
                        }
                        lines.push(format!("{}{{{}}}", uniq.join(","), item.body));
                    }
                    None => lines.push(item.body),
                }
            }
            if lines.is_empty() {
                continue;
            }
            let inner = lines.join(if opts.minify { "" } else { "\n" });
            if parent.is_empty() {
                blocks.push(inner);
            } else if opts.minify {
                blocks.push(format!("{}{{{}}}", parent, inner));
            } else {
                blocks.push(format!("{}{{\n{}\n}}", parent, inner));
            }
        }

        let mut parts = Vec::new();
        if opts.preflights {
            let ctx = PreflightContext {
                theme: &self.config.theme,
            };
            let preflight_css: Vec<String> = self
                .config
                .preflights
                .iter()
                .filter(|preflight| {
                    preflight.layer.as_deref().unwrap_or(LAYER_PREFLIGHTS) == layer
                })
                .filter_map(|preflight| (preflight.get_css)(&ctx))
                .collect();
            if !preflight_css.is_empty() {
                parts.push(preflight_css.join("\n"));
            }
        }
        parts.extend(blocks);
        if parts.is_empty() {
            return String::new();
        }
        let body = parts.join(if opts.minify { "" } else { "\n" });
        if opts.minify {
            body
        } else {
            format!("/* layer: {} */\n{}", layer, body)
        }
    }
}

impl RuleContext<'_> {
    /// Synthesizes a full CSS string for an ad-hoc body using the current
    /// variant stack, wrapped in the resolved parent at-rule if any.
    pub fn construct_css(
        &self,
        body: crate::config::Declarations,
        override_selector: Option<&str>,
    ) -> String {
        let base = override_selector
            .map(str::to_string)
            .unwrap_or_else(|| self.raw_selector.clone());
        let (selector, entries, parent, _) =
            apply_handlers(self.variant_handlers, base, body.into_entries());
        let rule = format!("{}{{{}}}", selector, entries_to_css(&entries));
        match parent {
            Some(parent) => format!("{}{{{}}}", parent, rule),
            None => rule,
        }
    }
}

/// Folds entries, selector, parent and layer through a handler stack sorted
/// by order ascending. Parent and layer reduce to the last non-null value.
fn apply_handlers(
    handlers: &[VariantHandler],
    base_selector: String,
    entries: Vec<CssEntry>,
) -> (String, Vec<CssEntry>, Option<String>, Option<String>) {
    let mut sorted: Vec<&VariantHandler> = handlers.iter().collect();
    sorted.sort_by_key(|handler| handler.order);

    let mut entries = entries;
    for handler in &sorted {
        if let Some(body) = &handler.body {
            entries = body(entries);
        }
    }
    let mut selector = base_selector;
    for handler in &sorted {
        if let Some(rewrite) = &handler.selector {
            if let Some(next) = rewrite(&selector, &entries) {
                selector = next;
            }
        }
    }
    let parent = sorted
        .iter()
        .rev()
        .find_map(|handler| handler.parent.as_ref().map(|p| p.parent.clone()));
    let layer = sorted
        .iter()
        .rev()
        .find_map(|handler| handler.layer.clone());
    (selector, entries, parent, layer)
}

fn entries_to_css(entries: &[CssEntry]) -> String {
    entries
        .iter()
        .filter(|(property, _)| property != NO_MERGE_MARKER)
        .map(|(property, value)| format!("{}:{}", property, value))
        .collect::<Vec<_>>()
        .join(";")
}

fn has_no_merge_marker(entries: &[CssEntry]) -> bool {
    entries.iter().any(|(property, _)| property == NO_MERGE_MARKER)
}

fn apply_scope(selector: String, scope: Option<&str>) -> String {
    if selector.contains(SCOPE_PLACEHOLDER) {
        let replacement = match scope {
            Some(scope) => format!(" {} ", scope),
            None => " ".to_string(),
        };
        return selector.replace(SCOPE_PLACEHOLDER, &replacement);
    }
    match scope {
        Some(scope) => format!("{} {}", scope, selector),
        None => selector,
    }
}

/// Expands variant-group syntax: `prefix:(a b c)` becomes
/// `prefix:a prefix:b prefix:c`, nesting allowed.
pub fn expand_variant_group(input: &str) -> String {
    let mut current = input.to_string();
    loop {
        let Some(open_idx) = current.find(":(").map(|idx| idx + 1) else {
            return current;
        };
        let Some(close_idx) = find_matching_paren(&current, open_idx) else {
            return current;
        };
        let prefix_start = current[..open_idx]
            .char_indices()
            .rev()
            .find(|(_, ch)| ch.is_whitespace())
            .map(|(idx, ch)| idx + ch.len_utf8())
            .unwrap_or(0);
        let prefix = current[prefix_start..open_idx].to_string();
        let inner = expand_variant_group(&current[open_idx + 1..close_idx]);
        let expanded = inner
            .split_whitespace()
            .map(|part| format!("{}{}", prefix, part))
            .collect::<Vec<_>>()
            .join(" ");
        current = format!(
            "{}{}{}",
            &current[..prefix_start],
            expanded,
            &current[close_idx + 1..]
        );
    }
}

fn find_matching_paren(input: &str, open_idx: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (idx, ch) in input[open_idx..].char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(open_idx + idx);
                }
            }
            _ => {}
        }
    }
    None
}

fn warn_once(message: String) {
    static SEEN: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    let seen = SEEN.get_or_init(|| Mutex::new(HashSet::new()));
    let mut seen = lock(seen);
    if seen.insert(message.clone()) {
        log::warn!("{}", message);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::{
        expand_variant_group, GenerateOptions, Generator, NO_MERGE_MARKER,
    };
    use crate::config::{
        BlocklistEntry, Declarations, Preflight, Rule, RuleMeta, RuleOutput, Shortcut, UserConfig,
        Variant, VariantHandler, VariantMatch,
    };
    use regex::Regex;
    use std::collections::{BTreeMap, BTreeSet};

    fn hover_variant() -> Variant {
        Variant::new(|input, _| {
            input.strip_prefix("hover:").map(|rest| {
                VariantMatch::Handler(
                    VariantHandler::new(rest)
                        .with_selector(|selector, _| Some(format!("{}:hover", selector))),
                )
            })
        })
    }

    fn sm_variant() -> Variant {
        Variant::new(|input, _| {
            input.strip_prefix("sm:").map(|rest| {
                VariantMatch::Handler(
                    VariantHandler::new(rest).with_parent_order("@media (min-width:640px)", 100),
                )
            })
        })
    }

    fn padding_rule() -> Rule {
        Rule::dynamic(Regex::new(r"^p-(\d+)$").unwrap(), |caps, _| {
            let n: f64 = caps[1].parse().ok()?;
            Some(RuleOutput::Entries(Declarations::List(vec![(
                "padding".to_string(),
                format!("{}rem", n * 0.25),
            )])))
        })
    }

    fn test_config() -> UserConfig {
        UserConfig {
            rules: vec![Rule::stat("m-2", &[("margin", "0.5rem")]), padding_rule()],
            variants: vec![sm_variant(), hover_variant()],
            shortcuts: vec![Shortcut::stat("btn", "m-2 p-4")],
            ..UserConfig::default()
        }
    }

    fn generate(config: UserConfig, input: &str) -> super::GenerateResult {
        Generator::new(config)
            .generate(input, &GenerateOptions::default())
            .unwrap()
    }

    #[test]
    fn generates_static_rule() {
        let result = generate(test_config(), "m-2");
        assert!(result.css.contains(".m-2{margin:0.5rem}"));
        assert_eq!(result.matched, BTreeSet::from(["m-2".to_string()]));
    }

    #[test]
    fn generates_dynamic_rule() {
        let result = generate(test_config(), "p-2");
        assert!(result.css.contains(".p-2{padding:0.5rem}"));
        let result = generate(test_config(), "p-4");
        assert!(result.css.contains(".p-4{padding:1rem}"));
    }

    #[test]
    fn variant_wraps_selector() {
        let result = generate(test_config(), "hover:m-2");
        assert!(result.css.contains(".hover\\:m-2:hover{margin:0.5rem}"));
    }

    #[test]
    fn duplicate_tokens_collapse() {
        let result = generate(test_config(), "p-2 p-2");
        assert_eq!(result.matched, BTreeSet::from(["p-2".to_string()]));
        assert_eq!(result.css.matches(".p-2{padding:0.5rem}").count(), 1);
    }

    #[test]
    fn unknown_token_is_silent() {
        let result = generate(test_config(), "unknown-xyz");
        assert!(result.matched.is_empty());
        assert!(result.css.is_empty());
    }

    #[test]
    fn scope_prefixes_selectors() {
        let generator = Generator::new(test_config());
        let opts = GenerateOptions {
            scope: Some(".app".to_string()),
            ..GenerateOptions::default()
        };
        let result = generator.generate("m-2", &opts).unwrap();
        assert!(result.css.contains(".app .m-2{margin:0.5rem}"));
    }

    #[test]
    fn scope_placeholder_is_substituted() {
        let group_variant = Variant::new(|input, _| {
            input.strip_prefix("group:").map(|rest| {
                VariantMatch::Handler(VariantHandler::new(rest).with_selector(|selector, _| {
                    Some(format!(".group $$ {}", selector))
                }))
            })
        });
        let config = UserConfig {
            variants: vec![group_variant],
            ..test_config()
        };
        let generator = Generator::new(config);

        let opts = GenerateOptions {
            scope: Some(".app".to_string()),
            ..GenerateOptions::default()
        };
        let result = generator.generate("group:m-2", &opts).unwrap();
        assert!(result.css.contains(".group .app .group\\:m-2{margin:0.5rem}"));

        let result = generator
            .generate("group:m-2", &GenerateOptions::default())
            .unwrap();
        assert!(result.css.contains(".group .group\\:m-2{margin:0.5rem}"));
    }

    #[test]
    fn shortcut_targets_its_own_class() {
        let result = generate(test_config(), "hover:btn");
        assert!(result
            .css
            .contains(".hover\\:btn:hover{margin:0.5rem;padding:1rem}"));
        assert!(!result.css.contains(".m-2"));
        assert!(result.css.contains("/* layer: shortcuts */"));
    }

    #[test]
    fn shortcut_body_merges_by_default() {
        let result = generate(test_config(), "btn");
        assert!(result.css.contains(".btn{margin:0.5rem;padding:1rem}"));
    }

    #[test]
    fn marker_keeps_shortcut_entries_mergeable_with_plain_utilities() {
        let config = UserConfig {
            rules: vec![
                Rule::stat("m-2", &[("margin", "0.5rem"), (NO_MERGE_MARKER, "")]),
                Rule::stat("p-4", &[("padding", "1rem"), (NO_MERGE_MARKER, "")]),
            ],
            shortcuts: vec![Shortcut::stat("btn", "m-2 p-4")],
            shortcuts_layer: Some("default".to_string()),
            merge_selectors: Some(true),
            ..UserConfig::default()
        };
        let result = generate(config, "m-2 p-4 btn");
        assert!(result.css.contains(".btn,.m-2{margin:0.5rem}"));
        assert!(result.css.contains(".btn,.p-4{padding:1rem}"));
        assert_eq!(result.matched.len(), 3);
    }

    #[test]
    fn identical_bodies_merge_into_one_group() {
        let config = UserConfig {
            rules: vec![
                Rule::stat("mx-0", &[("margin", "0")]),
                Rule::stat("m-none", &[("margin", "0")]),
            ],
            ..UserConfig::default()
        };
        let result = generate(config, "mx-0 m-none");
        assert!(result.css.contains(".mx-0,.m-none{margin:0}"));
        assert_eq!(result.css.matches("margin:0").count(), 1);
    }

    #[test]
    fn no_merge_meta_keeps_groups_apart() {
        let config = UserConfig {
            rules: vec![
                Rule::stat("mx-0", &[("margin", "0")]),
                Rule::stat_meta(
                    "m-none",
                    &[("margin", "0")],
                    RuleMeta {
                        no_merge: true,
                        ..RuleMeta::default()
                    },
                ),
            ],
            ..UserConfig::default()
        };
        let result = generate(config, "mx-0 m-none");
        assert!(result.css.contains(".mx-0{margin:0}"));
        assert!(result.css.contains(".m-none{margin:0}"));
        assert!(!result.css.contains(","));
    }

    #[test]
    fn blocklist_entries_are_unmatched() {
        let config = UserConfig {
            blocklist: vec![
                BlocklistEntry::Exact("m-2".to_string()),
                BlocklistEntry::Pattern(Regex::new("^p-").unwrap()),
            ],
            ..test_config()
        };
        let generator = Generator::new(config);
        assert!(generator.parse_token("m-2").unwrap().is_none());
        assert!(generator.parse_token("p-2").unwrap().is_none());
        let result = generator
            .generate("m-2 p-2 hover:m-2", &GenerateOptions::default())
            .unwrap();
        assert_eq!(result.matched, BTreeSet::from(["hover:m-2".to_string()]));
    }

    #[test]
    fn safelist_tokens_always_enter_matching() {
        let config = UserConfig {
            safelist: vec!["m-2".to_string(), "not-a-rule".to_string()],
            ..test_config()
        };
        let generator = Generator::new(config);
        let result = generator.generate("", &GenerateOptions::default()).unwrap();
        assert!(result.css.contains(".m-2{margin:0.5rem}"));
        assert_eq!(result.matched, BTreeSet::from(["m-2".to_string()]));

        let opts = GenerateOptions {
            safelist: false,
            ..GenerateOptions::default()
        };
        let result = generator.generate("", &opts).unwrap();
        assert!(result.css.is_empty());
    }

    #[test]
    fn parse_token_results_are_cached() {
        let generator = Generator::new(test_config());
        let first = generator.parse_token("hover:m-2").unwrap();
        let second = generator.parse_token("hover:m-2").unwrap();
        assert_eq!(first, second);
        assert!(first.is_some());

        assert!(generator.parse_token("nope").unwrap().is_none());
        assert!(generator.parse_token("nope").unwrap().is_none());
    }

    #[test]
    fn output_is_deterministic_across_runs_and_warm_caches() {
        let fresh = generate(test_config(), "btn hover:m-2 p-2 m-2");

        let generator = Generator::new(test_config());
        // Warm the cache in a scrambled order first.
        for token in ["p-2", "btn", "m-2", "hover:m-2"] {
            let _ = generator.parse_token(token).unwrap();
        }
        let warmed = generator
            .generate("btn hover:m-2 p-2 m-2", &GenerateOptions::default())
            .unwrap();
        assert_eq!(fresh.css, warmed.css);

        let again = generate(test_config(), "m-2 p-2 hover:m-2 btn");
        assert_eq!(fresh.css, again.css);
    }

    #[test]
    fn union_of_inputs_matches_union_of_outputs() {
        let combined = generate(test_config(), "m-2 p-2");
        let left = generate(test_config(), "m-2");
        let right = generate(test_config(), "p-2");
        let union: BTreeSet<String> = left.matched.union(&right.matched).cloned().collect();
        assert_eq!(combined.matched, union);
        for token_css in [".m-2{margin:0.5rem}", ".p-2{padding:0.5rem}"] {
            assert!(combined.css.contains(token_css));
        }
    }

    #[test]
    fn variants_compose_outward() {
        let result = generate(test_config(), "sm:hover:m-2");
        assert!(result.css.contains(
            "@media (min-width:640px){\n.sm\\:hover\\:m-2:hover{margin:0.5rem}\n}"
        ));
    }

    #[test]
    fn parent_orders_sort_at_rule_groups() {
        let lg_variant = Variant::new(|input, _| {
            input.strip_prefix("lg:").map(|rest| {
                VariantMatch::Handler(
                    VariantHandler::new(rest).with_parent_order("@media (min-width:1024px)", 200),
                )
            })
        });
        let config = UserConfig {
            variants: vec![lg_variant, sm_variant()],
            ..test_config()
        };
        let result = generate(config, "lg:m-2 sm:m-2");
        let sm_idx = result.css.find("min-width:640px").unwrap();
        let lg_idx = result.css.find("min-width:1024px").unwrap();
        assert!(sm_idx < lg_idx);
    }

    #[test]
    fn pathological_variant_overflows() {
        let config = UserConfig {
            variants: vec![
                Variant::new(|input, _| Some(VariantMatch::Matcher(input.to_string())))
                    .multi_pass(),
            ],
            ..UserConfig::default()
        };
        let generator = Generator::new(config);
        let err = generator.parse_token("m-2").unwrap_err();
        assert!(err.to_string().contains("m-2"));
    }

    #[test]
    fn non_multi_pass_variants_apply_once() {
        let once_variant = Variant::new(|input, _| {
            input
                .strip_prefix("once:")
                .map(|rest| VariantMatch::Matcher(rest.to_string()))
        });
        let config = UserConfig {
            variants: vec![once_variant],
            ..test_config()
        };
        let generator = Generator::new(config);
        assert!(generator.parse_token("once:m-2").unwrap().is_some());
        // The second prefix survives because the variant is spent.
        assert!(generator.parse_token("once:once:m-2").unwrap().is_none());
    }

    #[test]
    fn self_referential_shortcut_terminates() {
        let config = UserConfig {
            shortcuts: vec![Shortcut::stat("loop", "loop p-2")],
            ..test_config()
        };
        let result = generate(config, "loop");
        assert!(result.css.contains(".loop{padding:0.5rem}"));
        assert_eq!(result.matched, BTreeSet::from(["loop".to_string()]));
    }

    #[test]
    fn expands_variant_groups() {
        assert_eq!(
            expand_variant_group("hover:(m-2 p-4) x"),
            "hover:m-2 hover:p-4 x"
        );
        assert_eq!(
            expand_variant_group("a:(b c:(d e))"),
            "a:b a:c:d a:c:e"
        );
    }

    #[test]
    fn shortcut_expands_variant_groups() {
        let config = UserConfig {
            shortcuts: vec![Shortcut::stat("card", "hover:(m-2 p-4)")],
            ..test_config()
        };
        let result = generate(config, "card");
        assert!(result.css.contains(".card:hover{margin:0.5rem;padding:1rem}"));
    }

    #[test]
    fn dynamic_shortcut_expands_captures() {
        let config = UserConfig {
            shortcuts: vec![Shortcut::dynamic(
                Regex::new(r"^box-(\d+)$").unwrap(),
                |caps, _| {
                    Some(crate::config::ShortcutExpansion::Inline(format!(
                        "m-2 p-{}",
                        &caps[1]
                    )))
                },
            )],
            ..test_config()
        };
        let result = generate(config, "box-4");
        assert!(result.css.contains(".box-4{margin:0.5rem;padding:1rem}"));
    }

    #[test]
    fn tombstone_static_rule_matches_nothing() {
        let config = UserConfig {
            rules: vec![Rule::tombstone("m-2")],
            ..UserConfig::default()
        };
        let generator = Generator::new(config);
        assert!(generator.parse_token("m-2").unwrap().is_none());
    }

    #[test]
    fn css_rule_output_emits_raw_body() {
        let config = UserConfig {
            rules: vec![Rule::dynamic(Regex::new("^font-face$").unwrap(), |_, _| {
                Some(RuleOutput::Css(
                    "@font-face{font-family:x;src:url(x.woff2)}".to_string(),
                ))
            })],
            ..UserConfig::default()
        };
        let result = generate(config, "font-face");
        assert!(result
            .css
            .contains("@font-face{font-family:x;src:url(x.woff2)}"));
    }

    #[test]
    fn grouped_rule_output_emits_one_utility_per_group() {
        let config = UserConfig {
            rules: vec![Rule::dynamic(Regex::new("^multi$").unwrap(), |_, _| {
                Some(RuleOutput::Groups(vec![
                    Declarations::List(vec![("margin".to_string(), "0".to_string())]),
                    Declarations::List(vec![]),
                    Declarations::List(vec![("padding".to_string(), "0".to_string())]),
                ]))
            })],
            ..UserConfig::default()
        };
        let result = generate(config, "multi");
        assert!(result.css.contains(".multi{margin:0}"));
        assert!(result.css.contains(".multi{padding:0}"));
    }

    #[test]
    fn later_registered_rules_win() {
        let config = UserConfig {
            rules: vec![
                Rule::dynamic(Regex::new("^x$").unwrap(), |_, _| {
                    Some(RuleOutput::Entries(Declarations::List(vec![(
                        "color".to_string(),
                        "red".to_string(),
                    )])))
                }),
                Rule::dynamic(Regex::new("^x$").unwrap(), |_, _| {
                    Some(RuleOutput::Entries(Declarations::List(vec![(
                        "color".to_string(),
                        "blue".to_string(),
                    )])))
                }),
            ],
            ..UserConfig::default()
        };
        let result = generate(config, "x");
        assert!(result.css.contains(".x{color:blue}"));
        assert!(!result.css.contains("red"));
    }

    #[test]
    fn internal_rules_only_match_inside_shortcuts() {
        let config = UserConfig {
            rules: vec![Rule::stat_meta(
                "hidden-util",
                &[("display", "none")],
                RuleMeta {
                    internal: true,
                    ..RuleMeta::default()
                },
            )],
            shortcuts: vec![Shortcut::stat("gone", "hidden-util")],
            ..UserConfig::default()
        };
        let generator = Generator::new(config);
        assert!(generator.parse_token("hidden-util").unwrap().is_none());
        let result = generator
            .generate("gone", &GenerateOptions::default())
            .unwrap();
        assert!(result.css.contains(".gone{display:none}"));
    }

    #[test]
    fn preflights_prepend_per_layer() {
        let config = UserConfig {
            preflights: vec![Preflight::new(|_| {
                Some("*{box-sizing:border-box}".to_string())
            })],
            ..test_config()
        };
        let generator = Generator::new(config);
        let result = generator
            .generate("m-2", &GenerateOptions::default())
            .unwrap();
        let preflight_idx = result.css.find("box-sizing").unwrap();
        let utility_idx = result.css.find(".m-2").unwrap();
        assert!(preflight_idx < utility_idx);
        assert!(result.css.contains("/* layer: preflights */"));

        let opts = GenerateOptions {
            preflights: false,
            ..GenerateOptions::default()
        };
        let result = generator.generate("m-2", &opts).unwrap();
        assert!(!result.css.contains("box-sizing"));
    }

    #[test]
    fn preflight_theme_access() {
        let mut colors = BTreeMap::new();
        colors.insert(
            "gray".to_string(),
            BTreeMap::from([("500".to_string(), "#6b7280".to_string())]),
        );
        let config = UserConfig {
            theme: Some(crate::config::Theme {
                name: "default".to_string(),
                colors,
            }),
            preflights: vec![Preflight::new(|ctx| {
                let value = ctx.theme.colors.get("gray")?.get("500")?;
                Some(format!(":root{{--gray-500:{}}}", value))
            })],
            ..UserConfig::default()
        };
        let result = generate(config, "");
        assert!(result.css.contains(":root{--gray-500:#6b7280}"));
    }

    #[test]
    fn minify_strips_comments_and_newlines() {
        let generator = Generator::new(test_config());
        let opts = GenerateOptions {
            minify: true,
            ..GenerateOptions::default()
        };
        let result = generator.generate("m-2 p-2", &opts).unwrap();
        assert_eq!(result.css, ".m-2{margin:0.5rem}.p-2{padding:0.5rem}");
    }

    #[test]
    fn layer_getters_follow_weight_order() {
        let config = UserConfig {
            rules: vec![
                Rule::stat("m-2", &[("margin", "0.5rem")]),
                Rule::stat_meta(
                    "chip",
                    &[("border-radius", "9999px")],
                    RuleMeta::layer("components"),
                ),
            ],
            layers: BTreeMap::from([("components".to_string(), -50)]),
            ..UserConfig::default()
        };
        let generator = Generator::new(config);
        let result = generator
            .generate("m-2 chip", &GenerateOptions::default())
            .unwrap();
        assert_eq!(result.layers, vec!["components", "default"]);
        assert!(result
            .get_layer("components")
            .unwrap()
            .contains(".chip{border-radius:9999px}"));
        assert!(result.get_layer("default").unwrap().contains(".m-2"));
        assert!(result.get_layer("missing").is_none());

        let only_components = result.get_layers(Some(&["components"]), None);
        assert!(only_components.contains(".chip"));
        assert!(!only_components.contains(".m-2"));
        let without_components = result.get_layers(None, Some(&["components"]));
        assert!(without_components.contains(".m-2"));
        assert!(!without_components.contains(".chip"));
    }

    #[test]
    fn variant_layer_overrides_rule_layer() {
        let printed = Variant::new(|input, _| {
            input.strip_prefix("print:").map(|rest| {
                VariantMatch::Handler(
                    VariantHandler::new(rest)
                        .with_parent("@media print")
                        .with_layer("print"),
                )
            })
        });
        let config = UserConfig {
            variants: vec![printed],
            ..test_config()
        };
        let result = generate(config, "print:m-2");
        assert_eq!(result.layers, vec!["default", "print"]);
        assert!(result
            .get_layer("print")
            .unwrap()
            .contains("@media print{\n.print\\:m-2{margin:0.5rem}\n}"));
    }

    #[test]
    fn preprocess_hooks_chain() {
        let config = UserConfig {
            preprocess: vec![
                std::sync::Arc::new(|raw: &str| Some(raw.to_ascii_lowercase())),
                std::sync::Arc::new(|raw: &str| {
                    raw.strip_prefix("tw-").map(str::to_string)
                }),
            ],
            ..test_config()
        };
        let result = generate(config, "TW-M-2");
        assert_eq!(result.matched, BTreeSet::from(["TW-M-2".to_string()]));
        assert!(result.css.contains(".TW-M-2{margin:0.5rem}"));
    }

    #[test]
    fn postprocess_hooks_rewrite_utilities() {
        let config = UserConfig {
            postprocess: vec![std::sync::Arc::new(|util: &mut crate::config::UtilObject| {
                for entry in &mut util.entries {
                    entry.1.push_str(" !important");
                }
            })],
            ..test_config()
        };
        let result = generate(config, "m-2");
        assert!(result.css.contains(".m-2{margin:0.5rem !important}"));
    }

    #[test]
    fn construct_css_applies_the_variant_stack() {
        let config = UserConfig {
            rules: vec![Rule::dynamic(Regex::new("^badge$").unwrap(), |_, ctx| {
                Some(RuleOutput::Css(ctx.construct_css(
                    Declarations::List(vec![("color".to_string(), "red".to_string())]),
                    None,
                )))
            })],
            variants: vec![hover_variant()],
            ..UserConfig::default()
        };
        let result = generate(config, "hover:badge");
        assert!(result.css.contains(".hover\\:badge:hover{color:red}"));
    }

    #[test]
    fn set_config_resets_engine_state() {
        let mut generator = Generator::new(test_config());
        assert!(generator.parse_token("m-2").unwrap().is_some());

        generator.set_config(
            Some(UserConfig {
                rules: vec![Rule::stat("m-2", &[("margin", "2rem")])],
                ..UserConfig::default()
            }),
            None,
        );
        let utils = generator.parse_token("m-2").unwrap().unwrap();
        assert!(utils[0].body.contains("2rem"));

        // No-op without a user config.
        generator.set_config(None, None);
        assert!(generator.parse_token("m-2").unwrap().is_some());
    }

    #[test]
    fn extractors_receive_the_source_id() {
        fn from_page(ctx: &crate::extract::ExtractorContext<'_>) -> BTreeSet<String> {
            let mut out = BTreeSet::new();
            if ctx.id == Some("page.html") {
                out.insert("m-2".to_string());
            }
            out
        }
        let config = UserConfig {
            extractors: vec![std::sync::Arc::new(from_page)],
            ..test_config()
        };
        let generator = Generator::new(config);
        let mut acc = BTreeSet::new();
        generator.apply_extractors("<div></div>", Some("page.html"), &mut acc);
        assert_eq!(acc, BTreeSet::from(["m-2".to_string()]));

        let mut acc = BTreeSet::new();
        generator.apply_extractors("<div></div>", Some("other.html"), &mut acc);
        assert!(acc.is_empty());
    }

    #[test]
    fn generate_files_reads_and_extracts() {
        use std::fs;
        use std::time::{SystemTime, UNIX_EPOCH};
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("forgecss_generate_{}", nanos));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("page.html"), "<div class=\"m-2 p-2\"></div>").unwrap();

        let generator = Generator::new(test_config());
        let scan = crate::extract::ScanGlobOptions {
            base_path: dir.clone(),
            ..crate::extract::ScanGlobOptions::default()
        };
        let result = generator
            .generate_files(
                &["**/*.html".to_string()],
                &[],
                &scan,
                &GenerateOptions::default(),
            )
            .unwrap();
        assert!(result.css.contains(".m-2{margin:0.5rem}"));
        assert!(result.css.contains(".p-2{padding:0.5rem}"));
    }
}
