//! Release tarball extraction.
//!
//! A release tarball unpacks to:
//!
//! ```text
//! release.json                  name, version, jobs, packages
//! jobs/<job>/templates/<files>  template sources
//! packages/<pkg>.tgz            package source archive with `packaging`
//! ```
//!
//! Extraction validates the metadata eagerly: package archives must exist,
//! job package references must resolve, and the dependency graph must be
//! acyclic.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use flate2::read::GzDecoder;
use serde::Deserialize;
use tar::Archive;
use tracing::debug;

use super::{Job, Package, Release, ReleaseError, dag};

#[derive(Debug, Deserialize)]
struct ReleaseMetadata {
  name: String,
  version: String,
  #[serde(default)]
  jobs: Vec<Job>,
  #[serde(default)]
  packages: Vec<Package>,
}

/// Extract a release tarball into a process-private temp dir.
pub fn extract(tarball_path: &Path) -> Result<Release, ReleaseError> {
  let extract_err = |source| ReleaseError::Extract {
    path: tarball_path.display().to_string(),
    source,
  };

  let temp_dir = tempfile::tempdir().map_err(extract_err)?;

  let file = File::open(tarball_path).map_err(extract_err)?;
  let mut archive = Archive::new(GzDecoder::new(BufReader::new(file)));
  archive.unpack(temp_dir.path()).map_err(extract_err)?;

  let metadata_path = temp_dir.path().join("release.json");
  if !metadata_path.exists() {
    return Err(ReleaseError::MissingMetadata(tarball_path.display().to_string()));
  }
  let metadata_file = File::open(&metadata_path).map_err(extract_err)?;
  let metadata: ReleaseMetadata =
    serde_json::from_reader(BufReader::new(metadata_file)).map_err(ReleaseError::ParseMetadata)?;

  debug!(
    release = %metadata.name,
    version = %metadata.version,
    jobs = metadata.jobs.len(),
    packages = metadata.packages.len(),
    "extracted release"
  );

  let mut packages = metadata.packages;
  for package in &mut packages {
    package.archive_path = temp_dir.path().join("packages").join(format!("{}.tgz", package.name));
    if !package.archive_path.exists() {
      return Err(ReleaseError::MissingPackageArchive {
        package: package.name.clone(),
        path: package.archive_path.display().to_string(),
      });
    }
  }

  let mut jobs = metadata.jobs;
  for job in &mut jobs {
    job.templates_dir = temp_dir.path().join("jobs").join(&job.name).join("templates");
    for package in &job.packages {
      if !packages.iter().any(|p| &p.name == package) {
        return Err(ReleaseError::UnknownJobPackage {
          job: job.name.clone(),
          package: package.clone(),
        });
      }
    }
  }

  let release = Release {
    name: metadata.name,
    version: metadata.version,
    jobs,
    packages,
    extracted: Some(temp_dir),
  };

  // Reject cyclic or dangling dependencies at load
  dag::compilation_order(&release)?;

  Ok(release)
}
