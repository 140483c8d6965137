//! Release model.
//!
//! A release is an extracted tarball describing jobs (templates plus the
//! packages they need) and packages (source archives with a dependency
//! graph). Releases live in process-private temp dirs for the duration of
//! one command and are deleted when it ends.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

pub mod dag;
pub mod extractor;

pub use dag::{compilation_order, transitive_closure};
pub use extractor::extract;

#[derive(Debug, Error)]
pub enum ReleaseError {
  #[error("extracting release from '{path}': {source}")]
  Extract {
    path: String,
    #[source]
    source: io::Error,
  },

  #[error("release metadata 'release.json' missing from '{0}'")]
  MissingMetadata(String),

  #[error("parsing release metadata: {0}")]
  ParseMetadata(#[source] serde_json::Error),

  #[error("package '{package}' archive missing at '{path}'")]
  MissingPackageArchive { package: String, path: String },

  #[error("package '{package}' depends on unknown package '{dependency}'")]
  UnknownDependency { package: String, dependency: String },

  #[error("job '{job}' references unknown package '{package}'")]
  UnknownJobPackage { job: String, package: String },

  #[error("dependency cycle in release package graph")]
  DependencyCycle,

  #[error("job '{job}' not found in release '{release}'")]
  JobNotFound { job: String, release: String },

  #[error("release '{0}' not found among extracted releases")]
  ReleaseNotFound(String),
}

/// A software package within a release.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Package {
  pub name: String,
  pub fingerprint: String,
  #[serde(default)]
  pub dependencies: Vec<String>,
  #[serde(skip)]
  pub archive_path: PathBuf,
}

/// A job within a release: template sources and required packages.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Job {
  pub name: String,
  pub fingerprint: String,
  /// Template source path (under the job's `templates/` dir) to destination
  /// path within the rendered job.
  #[serde(default)]
  pub templates: BTreeMap<String, String>,
  #[serde(default)]
  pub packages: Vec<String>,
  #[serde(skip)]
  pub templates_dir: PathBuf,
}

/// An extracted release.
#[derive(Debug)]
pub struct Release {
  pub name: String,
  pub version: String,
  pub jobs: Vec<Job>,
  pub packages: Vec<Package>,
  extracted: Option<tempfile::TempDir>,
}

impl Release {
  pub fn extracted_path(&self) -> Option<&Path> {
    self.extracted.as_ref().map(|d| d.path())
  }

  pub fn find_job(&self, name: &str) -> Option<&Job> {
    self.jobs.iter().find(|j| j.name == name)
  }

  pub fn find_package(&self, name: &str) -> Option<&Package> {
    self.packages.iter().find(|p| p.name == name)
  }

  /// Remove the extracted directory.
  pub fn delete(self) -> io::Result<()> {
    match self.extracted {
      Some(dir) => dir.close(),
      None => Ok(()),
    }
  }

  #[cfg(test)]
  pub fn for_test(name: &str, version: &str, jobs: Vec<Job>, packages: Vec<Package>) -> Self {
    Self {
      name: name.to_string(),
      version: version.to_string(),
      jobs,
      packages,
      extracted: None,
    }
  }
}

/// Tracks every release extracted during a command.
#[derive(Debug, Default)]
pub struct Manager {
  releases: Vec<Release>,
}

impl Manager {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&mut self, release: Release) {
    self.releases.push(release);
  }

  pub fn list(&self) -> &[Release] {
    &self.releases
  }

  pub fn find_by_name(&self, name: &str) -> Option<&Release> {
    self.releases.iter().find(|r| r.name == name)
  }

  /// Resolve a job reference to its release and job.
  pub fn find_job(&self, release_name: &str, job_name: &str) -> Result<(&Release, &Job), ReleaseError> {
    let release = self
      .find_by_name(release_name)
      .ok_or_else(|| ReleaseError::ReleaseNotFound(release_name.to_string()))?;
    let job = release.find_job(job_name).ok_or_else(|| ReleaseError::JobNotFound {
      job: job_name.to_string(),
      release: release_name.to_string(),
    })?;
    Ok((release, job))
  }

  /// Delete every extracted release dir. Failures are logged, not raised,
  /// so cleanup never masks a primary error.
  pub fn delete_all(&mut self) {
    for release in self.releases.drain(..) {
      let name = release.name.clone();
      if let Err(e) = release.delete() {
        warn!(release = %name, error = %e, "failed to delete extracted release");
      }
    }
  }
}
