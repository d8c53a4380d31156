//! The root template every page renders through.
//!
//! A template is plain text with `${...}` placeholders for the build
//! artifacts of a page (head, html, css, js) plus a few identity values.
//! `${include relative/path}` directives are spliced in before placeholder
//! parsing. The parsed form is swapped atomically so renders never see a
//! half-loaded template; a dirty flag triggers a lazy reload on the next
//! render.

use crate::error::TemplateError;
use arc_swap::ArcSwap;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};

/// Total include substitutions allowed per load. Includes may nest; a cycle
/// would otherwise expand forever.
const INCLUDE_LIMIT: usize = 64;

static INCLUDE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{\s*include\s+([^\s}]+)\s*\}").unwrap());
static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{\s*(\w+)\s*\}").unwrap());

// ============================================================================
// Sections
// ============================================================================

/// Placeholder names the template may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placeholder {
    /// Head markup produced by server rendering.
    Head,
    /// Body markup produced by server rendering.
    Html,
    /// Stylesheet extracted from the compiled component.
    Css,
    /// Client-side bundle.
    Js,
    /// Component constructor name.
    Name,
    /// Canonical page path (used by live-reload client scripts).
    Path,
    /// Filtered props as JSON.
    Locals,
}

impl Placeholder {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "head" => Self::Head,
            "html" => Self::Html,
            "css" => Self::Css,
            "js" => Self::Js,
            "name" => Self::Name,
            "path" => Self::Path,
            "locals" => Self::Locals,
            _ => return None,
        })
    }
}

#[derive(Debug)]
enum Section {
    Raw(String),
    Placeholder(Placeholder),
}

#[derive(Debug, Default)]
struct Parsed {
    sections: Vec<Section>,
    /// Template file plus every spliced include, for watch mode.
    files: Vec<PathBuf>,
}

// ============================================================================
// Template
// ============================================================================

/// Values substituted into the template for one render.
#[derive(Debug, Clone, Copy)]
pub struct TemplateVars<'a> {
    pub head: &'a str,
    pub html: &'a str,
    pub css: &'a str,
    pub js: &'a str,
    pub name: &'a str,
    pub path: &'a str,
    /// Pre-serialized JSON of the filtered locals.
    pub locals: &'a str,
}

#[derive(Debug)]
pub struct Template {
    path: PathBuf,
    parsed: ArcSwap<Parsed>,
    ready: AtomicBool,
}

impl Template {
    /// Load and parse the template at `path`.
    pub fn new(path: &Path) -> Result<Self, TemplateError> {
        let template = Self {
            path: path.to_path_buf(),
            parsed: ArcSwap::from_pointee(Parsed::default()),
            ready: AtomicBool::new(false),
        };
        template.load()?;
        Ok(template)
    }

    /// Substitute `vars` into the template.
    ///
    /// Reloads from disk first if the template was marked dirty.
    pub fn render(&self, vars: &TemplateVars<'_>) -> Result<String, TemplateError> {
        if !self.ready.load(Ordering::Acquire) {
            self.load()?;
        }

        let parsed = self.parsed.load();
        let mut out = String::with_capacity(
            parsed
                .sections
                .iter()
                .map(|s| match s {
                    Section::Raw(text) => text.len(),
                    Section::Placeholder(_) => 64,
                })
                .sum(),
        );

        for section in parsed.sections.iter() {
            match section {
                Section::Raw(text) => out.push_str(text),
                Section::Placeholder(placeholder) => out.push_str(match placeholder {
                    Placeholder::Head => vars.head,
                    Placeholder::Html => vars.html,
                    Placeholder::Css => vars.css,
                    Placeholder::Js => vars.js,
                    Placeholder::Name => vars.name,
                    Placeholder::Path => vars.path,
                    Placeholder::Locals => vars.locals,
                }),
            }
        }
        Ok(out)
    }

    /// Force a reload on the next render (watch-mode change callback).
    ///
    /// A stale template never invalidates compiled pages; it only affects
    /// document assembly.
    pub fn mark_dirty(&self) {
        self.ready.store(false, Ordering::Release);
    }

    /// The template file and every include it splices, for watching.
    pub fn files(&self) -> Vec<PathBuf> {
        self.parsed.load().files.clone()
    }

    fn load(&self) -> Result<(), TemplateError> {
        let read = |path: &Path| {
            fs::read_to_string(path).map_err(|err| TemplateError::Io(path.to_path_buf(), err))
        };

        let mut text = read(&self.path)?;
        let mut files = vec![self.path.clone()];
        let base = self.path.parent().unwrap_or_else(|| Path::new("."));

        // Splice includes before placeholder parsing. Rescan from the start
        // each round so included files may themselves include.
        let mut expansions = 0;
        while let Some(found) = INCLUDE_RE.captures(&text) {
            if expansions == INCLUDE_LIMIT {
                return Err(TemplateError::IncludeLimit(INCLUDE_LIMIT));
            }
            expansions += 1;

            let target = base.join(&found[1]);
            let content = read(&target)?;
            files.push(target);

            let span = found.get(0).unwrap().range();
            text.replace_range(span, &content);
        }

        let mut sections = Vec::new();
        let mut last_end = 0;
        for found in PLACEHOLDER_RE.captures_iter(&text) {
            let whole = found.get(0).unwrap();
            let name = &found[1];
            let placeholder = Placeholder::parse(name)
                .ok_or_else(|| TemplateError::UnknownPlaceholder(name.to_string()))?;

            if whole.start() > last_end {
                sections.push(Section::Raw(text[last_end..whole.start()].to_string()));
            }
            sections.push(Section::Placeholder(placeholder));
            last_end = whole.end();
        }
        if last_end < text.len() {
            sections.push(Section::Raw(text[last_end..].to_string()));
        }

        self.parsed.store(Arc::new(Parsed { sections, files }));
        self.ready.store(true, Ordering::Release);
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
