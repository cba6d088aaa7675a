//! Deterministic correction recipes: import-resolution and
//! debt-resolution. Unlike the planner-delegated path, these never call
//! out to an LLM — they are pure functions over the broken-import signal
//! or the tracked stub-debt ledger.
//!

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::types::Id;
use crate::verifier::interpreter::ImportSignal;

/// `_deepCorrection.phase` values for a deterministic recipe plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipePhase {
    ImportResolutionRecipe,
    DebtResolution,
}

/// The named/default/namespace/type-only bindings an importing declaration
/// requested, used to shape both the rewrite and the stub's exports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportBindings {
    pub default: bool,
    pub named: Vec<String>,
    pub namespace: bool,
    pub type_only: bool,
}

/// Parse a single `import... from '<specifier>'` declaration's bindings
/// from the line of source containing it. Best-effort: unparseable input
/// degrades to an empty (namespace-style) binding set rather than panicking.
pub fn parse_import_bindings(import_line: &str) -> ImportBindings {
    let line = import_line.trim();
    let type_only = line.starts_with("import type");

    if let Some(star_pos) = line.find("* as ") {
        let rest = &line[star_pos + 5..];
        let _ = rest; // namespace alias name is irrelevant to the recipe
        return ImportBindings { default: false, named: vec![], namespace: true, type_only };
    }

    let mut named = Vec::new();
    let mut default = false;
    if let Some(open) = line.find('{') {
        if let Some(close) = line.find('}') {
            if close > open {
                named = line[open + 1..close]
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            }
        }
        let before_brace = &line[..open];
        default = before_brace.trim_start_matches("import").trim_start_matches("type").contains(|c: char| c.is_alphabetic())
        && !before_brace.contains('{');
    } else if line.contains("import ") && !line.contains('{') {
        default = true;
    }

    ImportBindings { default, named, namespace: false, type_only }
}

/// `stubExports` summary materialized into the stub marker, derived from
/// the importing declaration's bindings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StubExportsSummary {
    pub default: bool,
    pub named: Vec<String>,
    pub namespace: bool,
    pub type_only: bool,
}

impl From<ImportBindings> for StubExportsSummary {
    fn from(b: ImportBindings) -> Self {
        Self { default: b.default, named: b.named, namespace: b.namespace, type_only: b.type_only }
    }
}

/// TypeScript-style module resolution: try the specifier, `.ts`/`.tsx`/`.js`
/// suffixed, and `index.*` inside a directory, relative to the containing
/// file's directory. Returns the first path that exists on disk.
pub fn resolve_module(project_root: &Path, containing_file: &str, specifier: &str) -> Option<PathBuf> {
    if !specifier.starts_with('.') {
        // Non-relative (package) specifiers are out of scope for this recipe.
        return None;
    }
    let containing_dir = project_root.join(containing_file).parent()?.to_path_buf();
    let base = containing_dir.join(specifier);

    let candidates = [
        base.clone(),
        with_ext(&base, "ts"),
        with_ext(&base, "tsx"),
        with_ext(&base, "js"),
        base.join("index.ts"),
        base.join("index.tsx"),
        base.join("index.js"),
    ];
    candidates.into_iter().find(|c| c.exists())
}

fn with_ext(base: &Path, ext: &str) -> PathBuf {
    let mut p = base.to_path_buf();
    let file_name = p.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    p.set_file_name(format!("{file_name}.{ext}"));
    p
}

/// Result of attempting the import-resolution recipe: either a rewrite of
/// the broken specifier to an existing target, or a stub materialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ImportResolutionOutcome {
    Rewrite { target_relative_path: String },
    MaterializeStub { stub_path: String, stub_content: String, exports: StubExportsSummary },
}

/// `// @deeprun-stub {"createdByRunId":"...","projectId":"...","stubPath":"<relative>",
/// "stubExports":{...},"createdAt":"<iso>"}` followed by a newline and the
/// generated module body.
pub const STUB_MARKER_PREFIX: &str = "// @deeprun-stub ";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StubMarker {
    #[serde(rename = "createdByRunId")]
    created_by_run_id: Id,
    #[serde(rename = "projectId")]
    project_id: Id,
    #[serde(rename = "stubPath")]
    stub_path: String,
    #[serde(rename = "stubExports")]
    stub_exports: StubExportsSummary,
    #[serde(rename = "createdAt")]
    created_at: DateTime<Utc>,
}

fn render_stub_body(exports: &StubExportsSummary) -> String {
    let mut body = String::new();
    if exports.namespace || (!exports.default && exports.named.is_empty()) {
        body.push_str("export {};\n");
        return body;
    }
    for name in &exports.named {
        if exports.type_only {
            body.push_str(&format!("export type {name} = unknown;\n"));
        } else {
            body.push_str(&format!("export const {name}: unknown = undefined;\n"));
        }
    }
    if exports.default {
        body.push_str("export default undefined;\n");
    }
    body
}

fn render_stub_file(marker: &StubMarker, exports: &StubExportsSummary) -> String {
    let marker_json = serde_json::to_string(marker).unwrap_or_else(|_| "{}".to_string());
    format!("{STUB_MARKER_PREFIX}{marker_json}\n{}", render_stub_body(exports))
}

/// True iff `content`'s first line is a well-formed stub marker.
pub fn is_stub_content(content: &str) -> bool {
    content
    .lines()
    .next()
    .map(|l| l.starts_with(STUB_MARKER_PREFIX))
    .unwrap_or(false)
}

/// Run the import-resolution recipe: rewrite when a real target resolves,
/// else materialize a stub at the best candidate location (the resolved
/// directory's sibling matching the specifier's basename).
pub fn run_import_resolution_recipe(
    project_root: &Path,
    run_id: &Id,
    project_id: &Id,
    signal: &ImportSignal,
    import_line: &str,
    now: DateTime<Utc>,
) -> ImportResolutionOutcome {
    if let Some(target) = resolve_module(project_root, &signal.containing_file, &signal.specifier) {
        let relative = target.strip_prefix(project_root).unwrap_or(&target).to_string_lossy().to_string();
        return ImportResolutionOutcome::Rewrite { target_relative_path: relative };
    }

    let bindings = parse_import_bindings(import_line);
    let exports: StubExportsSummary = bindings.into();

    let containing_dir = Path::new(&signal.containing_file).parent().unwrap_or_else(|| Path::new(""));
    let stub_rel_path = containing_dir.join(format!("{}.ts", last_path_segment(&signal.specifier)));
    let stub_path = stub_rel_path.to_string_lossy().to_string();

    let marker = StubMarker {
        created_by_run_id: run_id.clone(),
        project_id: project_id.clone(),
        stub_path: stub_path.clone(),
        stub_exports: exports.clone(),
        created_at: now,
    };
    let stub_content = render_stub_file(&marker, &exports);

    ImportResolutionOutcome::MaterializeStub { stub_path, stub_content, exports }
}

fn last_path_segment(specifier: &str) -> String {
    specifier.rsplit('/').next().unwrap_or(specifier).to_string()
}

/// Rewrite an import line's specifier to a `.js`-suffixed relative path,
/// mode 1 ("rewrite the import to a `.js`-suffixed relative
/// path").
pub fn rewrite_import_specifier(import_line: &str, old_specifier: &str, target_relative_path: &str) -> String {
    let js_path = with_js_suffix(target_relative_path);
    import_line.replacen(old_specifier, &js_path, 1)
}

fn with_js_suffix(path: &str) -> String {
    let stem = path.trim_end_matches(".ts").trim_end_matches(".tsx");
    if stem.starts_with('.') {
        format!("{stem}.js")
    } else {
        format!("./{stem}.js")
    }
}

/// Status of one stub-debt ledger entry, tracked until a non-stub
/// replacement is committed (GLOSSARY: "Stub debt").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StubDebtStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StubDebtRecord {
    pub run_id: Id,
    pub step_index: i32,
    pub attempt: i32,
    pub stub_path: String,
    pub exports: StubExportsSummary,
    pub status: StubDebtStatus,
    pub created_at: DateTime<Utc>,
}

/// Generate the debt-resolution replacement module: same exports, no stub
/// marker debt-resolution recipe.
pub fn render_debt_resolution_module(exports: &StubExportsSummary) -> String {
    render_stub_body(exports)
}

/// Debt is "paid down" iff, for the tracked target: the file is absent, OR
/// its hash changed AND its stub marker is absent AND the content is not
/// stub-like, OR all remaining referrers no longer resolve to it — per
///.
pub fn is_debt_paid_down(
    file_exists: bool,
    current_content: Option<&str>,
    previous_content_hash: Option<&str>,
    current_content_hash: Option<&str>,
    remaining_referrers_resolve: bool,
) -> bool {
    if !file_exists {
        return true;
    }
    let hash_changed = previous_content_hash != current_content_hash;
    let no_longer_stub = current_content.map(|c| !is_stub_content(c)).unwrap_or(false);
    if hash_changed && no_longer_stub {
        return true;
    }
    !remaining_referrers_resolve
}
