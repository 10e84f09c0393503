// src/chain/markers.rs

//! Success markers: the externally observable evidence that a stage worked.
//!
//! A stage succeeds only when *all* of its markers hold:
//! - the exit code lies in the configured range (implicitly `0..=0`),
//! - every `file` marker matches at least `min_count` files,
//! - every `pattern` marker matches a line of its source.
//!
//! File and pattern markers are "evidence": they can be re-checked after a
//! crash without the process, which is how an interrupted stage that actually
//! finished is recognised and skipped.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use globset::{Glob, GlobMatcher};
use regex::Regex;

use crate::config::model::MarkerConfig;
use crate::fs::FileSystem;
use crate::types::OutputStream;

/// Directory (inside each working directory) holding attempt artifacts.
/// Never scanned by `file` markers.
pub const ARTIFACT_DIR: &str = ".forecycle";

/// Where a `pattern` marker looks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternSource {
    /// The captured output of the attempt being evaluated.
    Stream(OutputStream),
    /// A file relative to the working directory (e.g. a model's own log).
    File(PathBuf),
}

/// A marker that can be checked from the filesystem alone.
#[derive(Debug, Clone)]
pub enum Evidence {
    File {
        glob: String,
        matcher: GlobMatcher,
        min_count: usize,
    },
    Pattern {
        regex: Regex,
        source: PatternSource,
    },
}

impl fmt::Display for Evidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Evidence::File { glob, min_count, .. } if *min_count > 1 => {
                write!(f, "file '{glob}' (x{min_count})")
            }
            Evidence::File { glob, .. } => write!(f, "file '{glob}'"),
            Evidence::Pattern {
                regex,
                source: PatternSource::Stream(stream),
            } => write!(f, "pattern '{}' in {:?}", regex.as_str(), stream),
            Evidence::Pattern {
                regex,
                source: PatternSource::File(path),
            } => write!(f, "pattern '{}' in {}", regex.as_str(), path.display()),
        }
    }
}

/// Inputs for evaluating evidence markers of one attempt.
#[derive(Debug, Clone, Copy)]
pub struct MarkerInputs<'a> {
    pub workdir: &'a Path,
    pub stdout_log: Option<&'a Path>,
    pub stderr_log: Option<&'a Path>,
}

/// Result of checking evidence markers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkerReport {
    /// Human-readable descriptions of unmet markers.
    pub missing: Vec<String>,
    /// Files matched by `file` markers, relative to the working directory.
    pub matched_files: Vec<PathBuf>,
}

impl MarkerReport {
    pub fn satisfied(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Compiled set of success markers for one stage.
#[derive(Debug, Clone)]
pub struct SuccessMarkers {
    exit_min: i32,
    exit_max: i32,
    evidence: Vec<Evidence>,
}

impl Default for SuccessMarkers {
    fn default() -> Self {
        Self {
            exit_min: 0,
            exit_max: 0,
            evidence: Vec::new(),
        }
    }
}

impl SuccessMarkers {
    /// Compile marker configs. At most one `exit_code` marker is allowed.
    pub fn compile(configs: &[MarkerConfig]) -> Result<Self, String> {
        let mut markers = SuccessMarkers::default();
        let mut saw_exit_code = false;

        for cfg in configs {
            match cfg {
                MarkerConfig::ExitCode { min, max } => {
                    if saw_exit_code {
                        return Err("at most one exit_code marker per stage".to_string());
                    }
                    if min > max {
                        return Err(format!("exit_code marker has min {min} > max {max}"));
                    }
                    saw_exit_code = true;
                    markers.exit_min = *min;
                    markers.exit_max = *max;
                }
                MarkerConfig::File { glob, min_count } => {
                    if *min_count == 0 {
                        return Err(format!("file marker '{glob}' needs min_count >= 1"));
                    }
                    let matcher = Glob::new(glob)
                        .map_err(|e| format!("invalid glob '{glob}': {e}"))?
                        .compile_matcher();
                    markers.evidence.push(Evidence::File {
                        glob: glob.clone(),
                        matcher,
                        min_count: *min_count,
                    });
                }
                MarkerConfig::Pattern {
                    regex,
                    stream,
                    file,
                } => {
                    let compiled =
                        Regex::new(regex).map_err(|e| format!("invalid regex '{regex}': {e}"))?;
                    let source = match file {
                        Some(path) if path.is_absolute() => {
                            return Err(format!(
                                "pattern marker file '{}' must be relative to the working directory",
                                path.display()
                            ));
                        }
                        Some(path) => PatternSource::File(path.clone()),
                        None => PatternSource::Stream(*stream),
                    };
                    markers.evidence.push(Evidence::Pattern {
                        regex: compiled,
                        source,
                    });
                }
            }
        }

        Ok(markers)
    }

    pub fn exit_code_ok(&self, code: i32) -> bool {
        (self.exit_min..=self.exit_max).contains(&code)
    }

    pub fn exit_range(&self) -> (i32, i32) {
        (self.exit_min, self.exit_max)
    }

    pub fn evidence(&self) -> &[Evidence] {
        &self.evidence
    }

    pub fn has_evidence(&self) -> bool {
        !self.evidence.is_empty()
    }

    /// Check every evidence marker. Unreadable sources count as unmet.
    pub fn check_evidence(&self, fs: &dyn FileSystem, inputs: MarkerInputs<'_>) -> MarkerReport {
        let mut report = MarkerReport::default();

        for marker in &self.evidence {
            match marker {
                Evidence::File {
                    matcher, min_count, ..
                } => {
                    let found = match matching_files(fs, inputs.workdir, matcher) {
                        Ok(found) => found,
                        Err(e) => {
                            report.missing.push(format!("{marker} ({e:#})"));
                            continue;
                        }
                    };
                    if found.len() < *min_count {
                        report.missing.push(format!("{marker} (found {})", found.len()));
                    }
                    report.matched_files.extend(found);
                }
                Evidence::Pattern { regex, source } => {
                    let path = match source {
                        PatternSource::Stream(OutputStream::Stdout) => {
                            inputs.stdout_log.map(Path::to_path_buf)
                        }
                        PatternSource::Stream(OutputStream::Stderr) => {
                            inputs.stderr_log.map(Path::to_path_buf)
                        }
                        PatternSource::File(rel) => Some(inputs.workdir.join(rel)),
                    };
                    let matched = path
                        .and_then(|p| fs.read_to_string(&p).ok())
                        .map(|text| text.lines().any(|line| regex.is_match(line)))
                        .unwrap_or(false);
                    if !matched {
                        report.missing.push(marker.to_string());
                    }
                }
            }
        }

        report.matched_files.sort();
        report.matched_files.dedup();
        report
    }
}

/// Collect files under `root` (relative, forward slashes) that match `matcher`.
fn matching_files(fs: &dyn FileSystem, root: &Path, matcher: &GlobMatcher) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !fs.is_dir(root) {
        return Ok(files);
    }
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let entries = fs
            .read_dir(&dir)
            .with_context(|| format!("scanning {}", dir.display()))?;
        for path in entries {
            let Ok(rel) = path.strip_prefix(root) else {
                continue;
            };
            if rel.starts_with(ARTIFACT_DIR) {
                continue;
            }
            if fs.is_dir(&path) {
                stack.push(path);
            } else if fs.is_file(&path) {
                let rel_str = rel.to_string_lossy().replace('\\', "/");
                if matcher.is_match(&rel_str) {
                    files.push(rel.to_path_buf());
                }
            }
        }
    }

    Ok(files)
}
