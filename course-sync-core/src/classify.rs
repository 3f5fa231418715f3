//! Path classifier: maps a repository path to the kind of content it holds.
//!
//! Pure and deterministic. Path conventions:
//!
//! - `/Courses/<course>/course.json`: course descriptor
//! - `/Modules/<module>/module.json`: module descriptor
//! - `/Modules/<module>/<order>-<name>.md`: section content
//! - `*.png`, `*.jpg`, `*.jpeg`: attachment
//!
//! Anything under `/cicd/` or with `README` in its path is ignored.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

static COURSE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/Courses/([^/]+)/course\.json$").expect("course pattern"));

static MODULE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/Modules/([^/]+)/module\.json$").expect("module pattern"));

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/Modules/([^/]+)/([0-9]+)-([A-Za-z0-9]+)\.md$").expect("section pattern")
});

static MODULE_DIR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/Modules/([^/]+)/").expect("module dir pattern"));

/// Classification result for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentKind {
    Course {
        course_id: String,
    },
    Module {
        module_id: String,
    },
    Section {
        module_id: String,
        section_key: String,
        order_index: u32,
    },
    Attachment {
        /// Owning module when the attachment lives under `/Modules/<module>/`.
        module_id: Option<String>,
    },
    Ignored,
}

/// Paths that look like managed content but break the naming conventions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassifyError {
    #[error("unparseable section path: {0}")]
    UnparseableSection(String),

    #[error("descriptor outside its expected folder: {0}")]
    UnexpectedLayout(String),
}

pub fn is_excluded(path: &str) -> bool {
    path.contains("/cicd/")
}

fn is_readme(path: &str) -> bool {
    path.to_ascii_uppercase().contains("README")
}

fn has_extension(path: &str, exts: &[&str]) -> bool {
    let lower = path.to_ascii_lowercase();
    exts.iter().any(|ext| lower.ends_with(ext))
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Module folder segment of a path under `/Modules/<module>/`.
pub fn module_segment(path: &str) -> Option<&str> {
    MODULE_DIR_RE
        .captures(path)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Classify a repository-absolute path.
pub fn classify(path: &str) -> Result<ContentKind, ClassifyError> {
    if is_excluded(path) || is_readme(path) {
        return Ok(ContentKind::Ignored);
    }

    match file_name(path) {
        "course.json" => {
            return COURSE_RE
                .captures(path)
                .map(|c| ContentKind::Course {
                    course_id: c[1].to_string(),
                })
                .ok_or_else(|| ClassifyError::UnexpectedLayout(path.to_string()));
        }
        "module.json" => {
            return MODULE_RE
                .captures(path)
                .map(|c| ContentKind::Module {
                    module_id: c[1].to_string(),
                })
                .ok_or_else(|| ClassifyError::UnexpectedLayout(path.to_string()));
        }
        _ => {}
    }

    if has_extension(path, &[".md"]) {
        let caps = SECTION_RE
            .captures(path)
            .ok_or_else(|| ClassifyError::UnparseableSection(path.to_string()))?;
        let order_index = caps[2]
            .parse::<u32>()
            .map_err(|_| ClassifyError::UnparseableSection(path.to_string()))?;
        let module_id = caps[1].to_string();
        let section_key = format!("{}-{}", module_id, &caps[3]).to_lowercase();
        return Ok(ContentKind::Section {
            module_id,
            section_key,
            order_index,
        });
    }

    if has_extension(path, &[".png", ".jpg", ".jpeg"]) {
        return Ok(ContentKind::Attachment {
            module_id: module_segment(path).map(str::to_string),
        });
    }

    Ok(ContentKind::Ignored)
}
