//! Job template rendering.
//!
//! Templates reference deployment properties with `((dotted.path))`
//! placeholders, resolved against the merged property set (job-level keys
//! win over deployment-level). Rendering a job list produces one directory
//! per job; compressing it yields a single tgz whose SHA-1 and fingerprint
//! travel in the apply spec (`rendered_templates_archive` and
//! `configuration_hash`).
//!
//! Rendered lists and archives live in process-private temp locations and
//! are dropped once the apply spec has been sent.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::manifest::Properties;
use crate::release::Job;
use crate::util::{sha1_hex, sha1_of_file};

#[derive(Debug, Error)]
pub enum TemplateError {
  #[error("reading template '{template}' of job '{job}': {source}")]
  ReadTemplate {
    job: String,
    template: String,
    #[source]
    source: io::Error,
  },

  #[error("writing rendered template '{template}' of job '{job}': {source}")]
  WriteTemplate {
    job: String,
    template: String,
    #[source]
    source: io::Error,
  },

  #[error("template '{template}' of job '{job}' has an unclosed '((' placeholder")]
  Unclosed { job: String, template: String },

  #[error("template '{template}' of job '{job}' references unknown property '{path}'")]
  MissingProperty {
    job: String,
    template: String,
    path: String,
  },

  #[error("creating render workspace: {0}")]
  Workspace(#[source] io::Error),

  #[error("compressing rendered templates: {0}")]
  Compress(#[source] io::Error),
}

/// Merge deployment-level and job-level properties; job keys win.
pub fn merge_properties(deployment: &Properties, job: &Properties) -> Properties {
  let mut merged = deployment.clone();
  for (key, value) in job {
    merged.insert(key.clone(), value.clone());
  }
  merged
}

fn lookup<'a>(properties: &'a Properties, path: &str) -> Option<&'a Value> {
  let mut segments = path.split('.');
  let mut current = properties.get(segments.next()?)?;
  for segment in segments {
    current = current.get(segment)?;
  }
  Some(current)
}

fn value_to_text(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

/// Substitute `((dotted.path))` placeholders in one template body.
fn render_text(job: &str, template: &str, content: &str, properties: &Properties) -> Result<String, TemplateError> {
  let mut output = String::with_capacity(content.len());
  let mut rest = content;

  while let Some(start) = rest.find("((") {
    output.push_str(&rest[..start]);
    let after_open = &rest[start + 2..];
    let end = after_open.find("))").ok_or_else(|| TemplateError::Unclosed {
      job: job.to_string(),
      template: template.to_string(),
    })?;
    let path = after_open[..end].trim();

    let value = lookup(properties, path).ok_or_else(|| TemplateError::MissingProperty {
      job: job.to_string(),
      template: template.to_string(),
      path: path.to_string(),
    })?;
    output.push_str(&value_to_text(value));

    rest = &after_open[end + 2..];
  }
  output.push_str(rest);

  Ok(output)
}

/// One rendered job within a list.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedJob {
  pub name: String,
  pub fingerprint: String,
}

/// A directory of rendered jobs, deleted on drop.
#[derive(Debug)]
pub struct RenderedJobList {
  dir: tempfile::TempDir,
  pub jobs: Vec<RenderedJob>,
  pub fingerprint: String,
}

impl RenderedJobList {
  pub fn path(&self) -> &Path {
    self.dir.path()
  }

  pub fn job_path(&self, name: &str) -> PathBuf {
    self.dir.path().join(name)
  }
}

/// The compressed rendered-job archive, deleted on drop.
pub struct RenderedJobListArchive {
  file: tempfile::NamedTempFile,
  pub sha1: String,
  pub fingerprint: String,
}

impl RenderedJobListArchive {
  pub fn path(&self) -> &Path {
    self.file.path()
  }
}

/// Renders release jobs against resolved properties.
pub struct JobListRenderer;

impl JobListRenderer {
  /// Render every template of every job into a fresh temp dir.
  ///
  /// The list fingerprint is a stable hash over the job fingerprints, the
  /// canonical properties JSON and the deployment name; it becomes the apply
  /// spec's `configuration_hash`.
  pub fn render(jobs: &[&Job], properties: &Properties, deployment_name: &str) -> Result<RenderedJobList, TemplateError> {
    let dir = tempfile::tempdir().map_err(TemplateError::Workspace)?;

    for job in jobs {
      let job_dir = dir.path().join(&job.name);
      for (src, dst) in &job.templates {
        let src_path = job.templates_dir.join(src);
        let content = fs::read_to_string(&src_path).map_err(|source| TemplateError::ReadTemplate {
          job: job.name.clone(),
          template: src.clone(),
          source,
        })?;

        let rendered = render_text(&job.name, src, &content, properties)?;

        let dst_path = job_dir.join(dst);
        let write_err = |source| TemplateError::WriteTemplate {
          job: job.name.clone(),
          template: dst.clone(),
          source,
        };
        if let Some(parent) = dst_path.parent() {
          fs::create_dir_all(parent).map_err(&write_err)?;
        }
        fs::write(&dst_path, &rendered).map_err(&write_err)?;

        // executables under bin/ keep their exec bit through the archive
        if dst.starts_with("bin/") {
          #[cfg(unix)]
          {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dst_path, fs::Permissions::from_mode(0o755)).map_err(&write_err)?;
          }
        }
      }
    }

    let fingerprint = list_fingerprint(jobs, properties, deployment_name);
    debug!(jobs = jobs.len(), fingerprint = %fingerprint, "rendered job list");

    Ok(RenderedJobList {
      dir,
      jobs: jobs
        .iter()
        .map(|j| RenderedJob {
          name: j.name.clone(),
          fingerprint: j.fingerprint.clone(),
        })
        .collect(),
      fingerprint,
    })
  }

  /// Pack a rendered list into a single tgz and compute its SHA-1.
  pub fn compress(list: &RenderedJobList) -> Result<RenderedJobListArchive, TemplateError> {
    let file = tempfile::NamedTempFile::new().map_err(TemplateError::Workspace)?;

    let encoder = flate2::write::GzEncoder::new(
      fs::File::create(file.path()).map_err(TemplateError::Compress)?,
      flate2::Compression::default(),
    );
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(".", list.path()).map_err(TemplateError::Compress)?;
    builder
      .into_inner()
      .and_then(|e| e.finish())
      .map_err(TemplateError::Compress)?;

    let sha1 = sha1_of_file(file.path()).map_err(TemplateError::Compress)?;

    Ok(RenderedJobListArchive {
      file,
      sha1,
      fingerprint: list.fingerprint.clone(),
    })
  }
}

fn list_fingerprint(jobs: &[&Job], properties: &Properties, deployment_name: &str) -> String {
  let canonical = serde_json::json!({
    "deployment": deployment_name,
    "jobs": jobs.iter().map(|j| j.fingerprint.clone()).collect::<Vec<_>>(),
    "properties": properties,
  });
  sha1_hex(canonical.to_string().as_bytes())
}
