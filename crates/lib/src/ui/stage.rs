//! Staged progress reporting.
//!
//! A stage is a named span of work. Simple steps print a single line:
//!
//! ```text
//! Commencing Validating stemcell... Completed (00:00:02)
//! ```
//!
//! Complex steps open a multi-line block whose sub-steps are indented two
//! spaces per depth:
//!
//! ```text
//! Commencing deploying
//!   Commencing Creating VM... Completed (00:00:31)
//! Completed deploying (00:00:31)
//! ```
//!
//! A step closure may return [`SkipStage`] to report `Skipped [reason]`
//! without failing the pipeline.

use std::time::{Duration, Instant};

use anyhow::Result;
use thiserror::Error;

use super::Ui;

/// Distinguished error a step returns to be reported as Skipped.
///
/// `Stage::perform` downcasts it out of the step error and swallows it.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct SkipStage(pub String);

/// A named span in the progress display.
#[derive(Clone)]
pub struct Stage {
  ui: Ui,
  depth: usize,
}

impl Stage {
  pub fn new(ui: Ui) -> Self {
    Self { ui, depth: 0 }
  }

  fn sub_stage(&self) -> Stage {
    Stage {
      ui: self.ui.clone(),
      depth: self.depth + 1,
    }
  }

  fn pad(&self) -> String {
    "  ".repeat(self.depth)
  }

  /// Run a single-line step.
  pub async fn perform<F, Fut>(&self, name: &str, f: F) -> Result<()>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<()>>,
  {
    self.ui.begin_line(&format!("{}Commencing {}...", self.pad(), name));
    let started = Instant::now();
    match f().await {
      Ok(()) => {
        self.ui.end_line(&format!(" Completed ({})", format_elapsed(started.elapsed())));
        Ok(())
      }
      Err(err) => match err.downcast_ref::<SkipStage>() {
        Some(skip) => {
          self
            .ui
            .end_line(&format!(" Skipped [{}] ({})", skip.0, format_elapsed(started.elapsed())));
          tracing::info!(stage = name, reason = %skip.0, "stage skipped");
          Ok(())
        }
        None => {
          self.ui.end_line(&format!(" Failed ({})", format_elapsed(started.elapsed())));
          Err(err)
        }
      },
    }
  }

  /// Run a multi-line step whose closure receives an indented sub-stage.
  pub async fn perform_complex<F, Fut>(&self, name: &str, f: F) -> Result<()>
  where
    F: FnOnce(Stage) -> Fut,
    Fut: Future<Output = Result<()>>,
  {
    self.ui.print_line(&format!("{}Commencing {}", self.pad(), name));
    let started = Instant::now();
    match f(self.sub_stage()).await {
      Ok(()) => {
        self.ui.print_line(&format!(
          "{}Completed {} ({})",
          self.pad(),
          name,
          format_elapsed(started.elapsed())
        ));
        Ok(())
      }
      Err(err) => {
        self.ui.print_line(&format!(
          "{}Failed {} ({})",
          self.pad(),
          name,
          format_elapsed(started.elapsed())
        ));
        Err(err)
      }
    }
  }
}

fn format_elapsed(elapsed: Duration) -> String {
  let secs = elapsed.as_secs();
  format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}
