//! Package compilation.
//!
//! A package compiles by extracting its source archive into a sandboxed temp
//! dir and running its `packaging` script under `/bin/sh` with a minimal
//! environment:
//!
//! - `BOSH_COMPILE_TARGET` - the extracted source
//! - `BOSH_INSTALL_TARGET` - where the script installs its output
//! - `DEPENDENCIES`        - staged compiled dependencies, one dir per name
//!
//! The install target is tarred, SHA-1'd and uploaded to the blobstore.
//! Compilation is idempotent per source fingerprint: a second request for
//! the same fingerprint answers from the cache without running anything.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::blobstore::{Blobstore, BlobstoreError};
use crate::release::Package;
use crate::util::sha1_of_file;

pub mod release_compiler;

pub use release_compiler::ReleasePackagesCompiler;

#[derive(Debug, Error)]
pub enum CompileError {
  #[error("extracting package '{package}' source: {source}")]
  ExtractSource {
    package: String,
    #[source]
    source: std::io::Error,
  },

  #[error("package '{package}' has no packaging script")]
  MissingBuildScript { package: String },

  #[error("packaging script for '{package}' failed with status {status:?}: {stderr}")]
  Script {
    package: String,
    status: Option<i32>,
    stderr: String,
  },

  #[error("staging dependency '{dependency}' for package '{package}': {source}")]
  StageDependency {
    package: String,
    dependency: String,
    #[source]
    source: BlobstoreError,
  },

  #[error("dependency '{dependency}' of package '{package}' was not compiled first")]
  MissingDependency { package: String, dependency: String },

  #[error("archiving compiled package '{package}': {source}")]
  Archive {
    package: String,
    #[source]
    source: std::io::Error,
  },

  #[error("uploading compiled package '{package}': {source}")]
  Upload {
    package: String,
    #[source]
    source: BlobstoreError,
  },
}

/// A compiled package in the blobstore. `version` is the source fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledPackageRef {
  pub name: String,
  pub version: String,
  pub sha1: String,
  pub blobstore_id: String,
}

/// Compiles packages and caches the result per fingerprint.
pub struct PackageCompiler {
  blobstore: Arc<dyn Blobstore>,
  cache: Mutex<HashMap<String, CompiledPackageRef>>,
}

impl PackageCompiler {
  pub fn new(blobstore: Arc<dyn Blobstore>) -> Self {
    Self {
      blobstore,
      cache: Mutex::new(HashMap::new()),
    }
  }

  /// Compile one package given its direct dependencies' compiled refs.
  pub async fn compile(
    &self,
    package: &Package,
    deps: &BTreeMap<String, CompiledPackageRef>,
  ) -> Result<CompiledPackageRef, CompileError> {
    if let Some(cached) = self.cache.lock().unwrap().get(&package.fingerprint) {
      debug!(package = %package.name, fingerprint = %package.fingerprint, "compile cache hit");
      return Ok(cached.clone());
    }

    for dependency in &package.dependencies {
      if !deps.contains_key(dependency) {
        return Err(CompileError::MissingDependency {
          package: package.name.clone(),
          dependency: dependency.clone(),
        });
      }
    }

    let sandbox = tempfile::tempdir().map_err(|source| CompileError::ExtractSource {
      package: package.name.clone(),
      source,
    })?;
    let source_dir = sandbox.path().join("source");
    let install_dir = sandbox.path().join("install");
    let deps_dir = sandbox.path().join("deps");
    for dir in [&source_dir, &install_dir, &deps_dir] {
      std::fs::create_dir_all(dir).map_err(|source| CompileError::ExtractSource {
        package: package.name.clone(),
        source,
      })?;
    }

    extract_tgz(&package.archive_path, &source_dir).map_err(|source| CompileError::ExtractSource {
      package: package.name.clone(),
      source,
    })?;

    self.stage_dependencies(package, deps, &deps_dir).await?;

    run_build_script(&package.name, &source_dir, &install_dir, Some(&deps_dir)).await?;

    let archive_path = sandbox.path().join("compiled.tgz");
    write_tgz(&install_dir, &archive_path).map_err(|source| CompileError::Archive {
      package: package.name.clone(),
      source,
    })?;
    let sha1 = sha1_of_file(&archive_path).map_err(|source| CompileError::Archive {
      package: package.name.clone(),
      source,
    })?;

    let blobstore_id = self
      .blobstore
      .add(&archive_path)
      .await
      .map_err(|source| CompileError::Upload {
        package: package.name.clone(),
        source,
      })?;

    let compiled = CompiledPackageRef {
      name: package.name.clone(),
      version: package.fingerprint.clone(),
      sha1,
      blobstore_id,
    };
    debug!(package = %package.name, blobstore_id = %compiled.blobstore_id, "package compiled");

    self
      .cache
      .lock()
      .unwrap()
      .insert(package.fingerprint.clone(), compiled.clone());
    Ok(compiled)
  }

  async fn stage_dependencies(
    &self,
    package: &Package,
    deps: &BTreeMap<String, CompiledPackageRef>,
    deps_dir: &Path,
  ) -> Result<(), CompileError> {
    for dependency in &package.dependencies {
      let dep_ref = &deps[dependency.as_str()];
      let staged = deps_dir.join(dependency);
      let archive = deps_dir.join(format!("{}.tgz", dependency));

      let stage_err = |source| CompileError::StageDependency {
        package: package.name.clone(),
        dependency: dependency.clone(),
        source,
      };
      self.blobstore.get(&dep_ref.blobstore_id, &archive).await.map_err(stage_err)?;

      let io_err = |source| CompileError::ExtractSource {
        package: package.name.clone(),
        source,
      };
      std::fs::create_dir_all(&staged).map_err(&io_err)?;
      extract_tgz(&archive, &staged).map_err(&io_err)?;
      std::fs::remove_file(&archive).map_err(&io_err)?;
    }
    Ok(())
  }
}

/// Run a package's `packaging` script in a minimal environment.
///
/// Shared by compilation (install target is tarred and uploaded) and local
/// CPI installation (install target is the final location).
pub(crate) async fn run_build_script(
  package_name: &str,
  source_dir: &Path,
  install_dir: &Path,
  deps_dir: Option<&Path>,
) -> Result<(), CompileError> {
  let script = source_dir.join("packaging");
  if !script.exists() {
    return Err(CompileError::MissingBuildScript {
      package: package_name.to_string(),
    });
  }

  let mut command = Command::new("/bin/sh");
  command
    .arg(script)
    .current_dir(source_dir)
    .env_clear()
    .env("PATH", "/usr/local/bin:/usr/bin:/bin")
    .env("HOME", source_dir)
    .env("BOSH_COMPILE_TARGET", source_dir)
    .env("BOSH_INSTALL_TARGET", install_dir)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());
  if let Some(deps_dir) = deps_dir {
    command.env("DEPENDENCIES", deps_dir);
  }

  let output = command.output().await.map_err(|source| CompileError::ExtractSource {
    package: package_name.to_string(),
    source,
  })?;

  if !output.status.success() {
    return Err(CompileError::Script {
      package: package_name.to_string(),
      status: output.status.code(),
      stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    });
  }

  Ok(())
}

pub(crate) fn extract_tgz(archive: &Path, dest: &Path) -> std::io::Result<()> {
  let file = std::fs::File::open(archive)?;
  let decoder = flate2::read::GzDecoder::new(std::io::BufReader::new(file));
  tar::Archive::new(decoder).unpack(dest)
}

pub(crate) fn write_tgz(source_dir: &Path, archive: &Path) -> std::io::Result<()> {
  let file = std::fs::File::create(archive)?;
  let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
  let mut builder = tar::Builder::new(encoder);
  builder.append_dir_all(".", source_dir)?;
  builder.into_inner()?.finish()?;
  Ok(())
}
