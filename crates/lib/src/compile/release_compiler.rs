//! Release-level compilation driver.
//!
//! Walks a release's packages in dependency order, feeding each package its
//! direct dependencies' compiled refs and emitting one stage step per
//! package: `Compiling package '<name>/<fingerprint>'`.

use std::collections::BTreeMap;

use anyhow::{Context, Result};

use crate::release::{Package, Release, dag};
use crate::ui::Stage;

use super::{CompiledPackageRef, PackageCompiler};

pub struct ReleasePackagesCompiler<'a> {
  compiler: &'a PackageCompiler,
}

impl<'a> ReleasePackagesCompiler<'a> {
  pub fn new(compiler: &'a PackageCompiler) -> Self {
    Self { compiler }
  }

  /// Compile every package of the release.
  pub async fn compile_all(
    &self,
    release: &Release,
    stage: &Stage,
  ) -> Result<BTreeMap<String, CompiledPackageRef>> {
    let order = dag::compilation_order(release)?;
    self.compile_in_order(&order, stage).await
  }

  /// Compile the transitive closure of the named packages.
  pub async fn compile_closure(
    &self,
    release: &Release,
    package_names: &[String],
    stage: &Stage,
  ) -> Result<BTreeMap<String, CompiledPackageRef>> {
    let order = dag::transitive_closure(release, package_names)?;
    self.compile_in_order(&order, stage).await
  }

  async fn compile_in_order(
    &self,
    order: &[&Package],
    stage: &Stage,
  ) -> Result<BTreeMap<String, CompiledPackageRef>> {
    let mut compiled: BTreeMap<String, CompiledPackageRef> = BTreeMap::new();

    for package in order {
      // deps were compiled earlier in the order; clone their refs out so the
      // step closure can own them
      let deps: BTreeMap<String, CompiledPackageRef> = package
        .dependencies
        .iter()
        .filter_map(|d| compiled.get(d).map(|r| (d.clone(), r.clone())))
        .collect();

      let step_name = format!("Compiling package '{}/{}'", package.name, package.fingerprint);
      let compiler = self.compiler;
      let compiled_ref = &mut compiled;
      stage
        .perform(&step_name, || async move {
          let result = compiler
            .compile(package, &deps)
            .await
            .with_context(|| format!("Compiling package '{}'", package.name))?;
          compiled_ref.insert(package.name.clone(), result);
          Ok(())
        })
        .await?;
    }

    Ok(compiled)
  }
}
