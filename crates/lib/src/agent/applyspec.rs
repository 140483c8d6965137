//! The apply spec wire payload.
//!
//! This is the authoritative declarative state sent to the agent: which
//! deployment and job the VM belongs to, its network layout, every compiled
//! package it must install (transitive closure included), and where to fetch
//! the rendered templates. Map fields are BTreeMaps so serialization is
//! byte-stable across runs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::compile::CompiledPackageRef;
use crate::manifest::NetworkInterface;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyJobTemplate {
  pub name: String,
  pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyJob {
  pub name: String,
  pub templates: Vec<ApplyJobTemplate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedTemplatesArchiveSpec {
  pub sha1: String,
  pub blobstore_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplySpec {
  pub deployment: String,
  pub index: u32,
  pub networks: BTreeMap<String, NetworkInterface>,
  pub job: ApplyJob,
  pub packages: BTreeMap<String, CompiledPackageRef>,
  pub rendered_templates_archive: RenderedTemplatesArchiveSpec,
  pub configuration_hash: String,
}
