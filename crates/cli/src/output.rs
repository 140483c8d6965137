//! Terminal output accents.

use owo_colors::{OwoColorize, Stream};

pub fn print_error(message: &str) {
  eprintln!("{}", message.if_supports_color(Stream::Stderr, |m| m.red()));
}

pub fn print_success(message: &str) {
  println!("{}", message.if_supports_color(Stream::Stdout, |m| m.green()));
}
