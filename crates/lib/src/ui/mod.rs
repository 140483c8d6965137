//! Operator-facing terminal output.
//!
//! `Ui` is a line sink that writes either to the real terminal or, in tests,
//! to an in-memory buffer that can be inspected. `Stage` builds the staged
//! progress display on top of it.

use std::io::Write;
use std::sync::{Arc, Mutex};

pub mod stage;

pub use stage::{SkipStage, Stage};

enum Sink {
  Terminal,
  Buffer { lines: Vec<String>, partial: String },
}

/// Destination for all user-visible output.
///
/// Cloning is cheap; clones share the same sink.
#[derive(Clone)]
pub struct Ui {
  sink: Arc<Mutex<Sink>>,
}

impl Ui {
  /// A Ui writing to stdout/stderr.
  pub fn terminal() -> Self {
    Self {
      sink: Arc::new(Mutex::new(Sink::Terminal)),
    }
  }

  /// A Ui capturing everything into an in-memory buffer.
  pub fn buffer() -> Self {
    Self {
      sink: Arc::new(Mutex::new(Sink::Buffer {
        lines: Vec::new(),
        partial: String::new(),
      })),
    }
  }

  /// Start a line without terminating it; `end_line` completes it.
  pub fn begin_line(&self, text: &str) {
    let mut sink = self.sink.lock().expect("ui sink poisoned");
    match &mut *sink {
      Sink::Terminal => {
        print!("{}", text);
        let _ = std::io::stdout().flush();
      }
      Sink::Buffer { partial, .. } => partial.push_str(text),
    }
  }

  /// Complete a line previously started with `begin_line`.
  pub fn end_line(&self, text: &str) {
    let mut sink = self.sink.lock().expect("ui sink poisoned");
    match &mut *sink {
      Sink::Terminal => println!("{}", text),
      Sink::Buffer { lines, partial } => {
        partial.push_str(text);
        lines.push(std::mem::take(partial));
      }
    }
  }

  /// Print a complete line.
  pub fn print_line(&self, text: &str) {
    let mut sink = self.sink.lock().expect("ui sink poisoned");
    match &mut *sink {
      Sink::Terminal => println!("{}", text),
      Sink::Buffer { lines, .. } => lines.push(text.to_string()),
    }
  }

  /// Print a complete line on the error channel.
  pub fn error_line(&self, text: &str) {
    let mut sink = self.sink.lock().expect("ui sink poisoned");
    match &mut *sink {
      Sink::Terminal => eprintln!("{}", text),
      Sink::Buffer { lines, .. } => lines.push(text.to_string()),
    }
  }

  /// Captured lines; empty for a terminal Ui.
  pub fn lines(&self) -> Vec<String> {
    let sink = self.sink.lock().expect("ui sink poisoned");
    match &*sink {
      Sink::Terminal => Vec::new(),
      Sink::Buffer { lines, .. } => lines.clone(),
    }
  }
}
