//! Filesystem [`DocumentSource`].
//!
//! Documents for a key live under `<root>/<project>/<document_type>/`.
//! Every file below that directory matching the include globs (and none of
//! the exclude globs) becomes one document whose id is its path relative
//! to the key directory. Metadata comes from an optional TOML sidecar next
//! to the file, named `<file>.meta.toml`:
//!
//! ```toml
//! agency_match = true
//! technologies = ["rust", "postgres"]
//! keywords = ["migration"]
//! date = 2024-03-01
//! ```
//!
//! Without a sidecar `date`, the file's modification date is used.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

use context_bundler_core::models::{Document, DocumentMetadata};
use context_bundler_core::source::DocumentSource;

use crate::config::DocumentsConfig;

const SIDECAR_SUFFIX: &str = ".meta.toml";

#[derive(Clone)]
pub struct FsDocumentSource {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
}

#[derive(Debug, Default, Deserialize)]
struct Sidecar {
    #[serde(default)]
    agency_match: bool,
    #[serde(default)]
    technologies: Vec<String>,
    #[serde(default)]
    keywords: Vec<String>,
    /// Either a TOML date or a `"YYYY-MM-DD"` string.
    date: Option<toml::Value>,
}

impl FsDocumentSource {
    pub fn new(config: &DocumentsConfig) -> Result<Self> {
        let mut excludes = vec!["**/.git/**".to_string()];
        excludes.extend(config.exclude_globs.iter().cloned());
        Ok(Self {
            root: config.root.clone(),
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&excludes)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn scan(&self, project: &str, document_type: &str) -> Result<Vec<Document>> {
        for part in [project, document_type] {
            if part.is_empty() || part == "." || part == ".." || part.contains(['/', '\\']) {
                bail!("Invalid path component: {:?}", part);
            }
        }

        let dir = self.root.join(project).join(document_type);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut documents = Vec::new();
        for entry in WalkDir::new(&dir) {
            let entry = entry.with_context(|| format!("Failed to walk {}", dir.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(&dir).unwrap_or(path);
            let rel_str = relative.to_string_lossy().replace('\\', "/");

            if rel_str.ends_with(SIDECAR_SUFFIX) {
                continue;
            }
            if self.exclude.is_match(&rel_str) || !self.include.is_match(&rel_str) {
                continue;
            }

            if let Some(document) = read_document(path, &rel_str, project, document_type)? {
                documents.push(document);
            }
        }

        // Sort for deterministic ordering
        documents.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(documents)
    }
}

#[async_trait]
impl DocumentSource for FsDocumentSource {
    async fn list(&self, project: &str, document_type: &str) -> Result<Vec<Document>> {
        let source = self.clone();
        let project = project.to_string();
        let document_type = document_type.to_string();
        tokio::task::spawn_blocking(move || source.scan(&project, &document_type))
            .await
            .context("Document scan task failed")?
    }
}

/// Returns `None` for files that cannot be read as UTF-8 text; one bad file
/// must not fail the whole key.
fn read_document(
    path: &Path,
    id: &str,
    project: &str,
    document_type: &str,
) -> Result<Option<Document>> {
    let fs_meta =
        std::fs::metadata(path).with_context(|| format!("Failed to stat {}", path.display()))?;
    let text = match std::fs::read(path).map(String::from_utf8) {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            warn!(path = %path.display(), error = %e, "skipping file that is not UTF-8");
            return Ok(None);
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "skipping unreadable file");
            return Ok(None);
        }
    };

    let mut sidecar_path = path.as_os_str().to_owned();
    sidecar_path.push(SIDECAR_SUFFIX);
    let sidecar_path = PathBuf::from(sidecar_path);
    let sidecar = if sidecar_path.exists() {
        let content = std::fs::read_to_string(&sidecar_path)
            .with_context(|| format!("Failed to read {}", sidecar_path.display()))?;
        toml::from_str::<Sidecar>(&content)
            .with_context(|| format!("Failed to parse {}", sidecar_path.display()))?
    } else {
        Sidecar::default()
    };

    let date = match &sidecar.date {
        Some(value) => Some(parse_date(value).with_context(|| {
            format!("Invalid date in {}", sidecar_path.display())
        })?),
        None => fs_meta
            .modified()
            .ok()
            .map(|t| DateTime::<Utc>::from(t).date_naive()),
    };

    Ok(Some(Document {
        id: id.to_string(),
        project: project.to_string(),
        document_type: document_type.to_string(),
        size: fs_meta.len(),
        text,
        metadata: DocumentMetadata {
            agency_match: sidecar.agency_match,
            technologies: sidecar.technologies,
            date,
            keywords: sidecar.keywords,
        },
    }))
}

fn parse_date(value: &toml::Value) -> Result<NaiveDate> {
    let raw = match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Datetime(dt) => dt.to_string(),
        other => bail!("expected a date, found {}", other.type_str()),
    };
    let day = raw.get(..10).unwrap_or(&raw);
    Ok(NaiveDate::parse_from_str(day, "%Y-%m-%d")?)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn source(root: &Path) -> FsDocumentSource {
        FsDocumentSource::new(&DocumentsConfig {
            root: root.to_path_buf(),
            include_globs: vec!["**/*.md".into(), "**/*.txt".into()],
            exclude_globs: vec!["**/drafts/**".into()],
        })
        .unwrap()
    }

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn test_lists_matching_files_with_sidecars() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "apollo/resume/alice.md", "Alice builds Rust services.");
        write(
            tmp.path(),
            "apollo/resume/alice.md.meta.toml",
            "agency_match = true\ntechnologies = [\"rust\"]\ndate = 2024-03-01\n",
        );
        write(tmp.path(), "apollo/resume/team/bob.txt", "Bob");
        write(tmp.path(), "apollo/resume/drafts/wip.md", "wip");
        write(tmp.path(), "apollo/resume/photo.png", "binary");
        write(tmp.path(), "apollo/past_performance/p1.md", "other type");

        let docs = source(tmp.path()).list("apollo", "resume").await.unwrap();
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["alice.md", "team/bob.txt"]);

        let alice = &docs[0];
        assert!(alice.metadata.agency_match);
        assert_eq!(alice.metadata.technologies, vec!["rust"]);
        assert_eq!(
            alice.metadata.date,
            NaiveDate::from_ymd_opt(2024, 3, 1)
        );
        assert_eq!(alice.project, "apollo");
        assert_eq!(alice.size, "Alice builds Rust services.".len() as u64);

        // No sidecar: falls back to the modification date
        assert!(docs[1].metadata.date.is_some());
        assert!(!docs[1].metadata.agency_match);
    }

    #[tokio::test]
    async fn test_missing_directory_is_empty() {
        let tmp = TempDir::new().unwrap();
        let docs = source(tmp.path()).list("gemini", "resume").await.unwrap();
        assert!(docs.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let tmp = TempDir::new().unwrap();
        assert!(source(tmp.path()).list("..", "resume").await.is_err());
    }

    #[tokio::test]
    async fn test_bad_sidecar_is_an_error() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "apollo/resume/a.md", "a");
        write(tmp.path(), "apollo/resume/a.md.meta.toml", "date = \"not a date\"");
        assert!(source(tmp.path()).list("apollo", "resume").await.is_err());
    }

    #[tokio::test]
    async fn test_skips_file_that_is_not_utf8() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "apollo/resume/alice.md", "Alice");
        let scanned = tmp.path().join("apollo/resume/scan.md");
        std::fs::write(scanned, [0xff, 0xfe, 0x00, 0x41]).unwrap();
        write(tmp.path(), "apollo/resume/zed.md", "Zed");

        let docs = source(tmp.path()).list("apollo", "resume").await.unwrap();
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["alice.md", "zed.md"]);
    }

    #[test]
    fn test_parse_date_accepts_string_and_toml_date() {
        let expected = NaiveDate::from_ymd_opt(2023, 12, 24);
        assert_eq!(
            parse_date(&toml::Value::String("2023-12-24".into())).ok(),
            expected
        );
        let parsed: toml::Value = toml::from_str::<toml::Table>("d = 2023-12-24")
            .unwrap()
            .remove("d")
            .unwrap();
        assert_eq!(parse_date(&parsed).ok(), expected);
    }
}
