use std::path::PathBuf;

use colored::Colorize;

use self::lexer::Span;

pub mod ast;
pub mod lexer;
pub mod parser;

#[derive(Debug)]
pub struct SourceFile {
    pub contents: String,
    pub origin: SourceFileOrigin,
}

impl SourceFile {
    pub fn from_memory(contents: impl Into<String>) -> Self {
        Self {
            contents: contents.into(),
            origin: SourceFileOrigin::Memory,
        }
    }

    pub fn value_of_span(&self, span: Span) -> &str {
        &self.contents[span.start..span.end]
    }

    /// 1-based line number containing the given byte position
    pub fn row_for_position(&self, position: usize) -> usize {
        self.contents[..position].matches('\n').count() + 1
    }

    /// 1-based column of the given byte position within its line
    pub fn column_for_position(&self, position: usize) -> usize {
        let line_start = self.contents[..position]
            .rfind('\n')
            .map(|i| i + 1)
            .unwrap_or(0);

        position - line_start + 1
    }

    /// Prints the line containing the span with a caret run underneath it
    pub fn highlight_span(&self, span: Span) {
        let row = self.row_for_position(span.start);
        let column = self.column_for_position(span.start);

        let Some(line) = self.contents.lines().nth(row - 1) else {
            return;
        };

        let width = (span.end - span.start).max(1).min(line.len() + 1 - column);

        eprintln!("  {:3} {} {}", row, "|".blue(), line);
        eprintln!(
            "      {} {}{}",
            "|".blue(),
            " ".repeat(column - 1),
            "^".repeat(width).red().bold()
        );
    }
}

#[derive(Debug)]
pub enum SourceFileOrigin {
    Memory,
    File(PathBuf),
}

impl core::fmt::Display for SourceFileOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceFileOrigin::Memory => f.write_str("<memory>"),
            SourceFileOrigin::File(path) => f.write_fmt(format_args!("{}", path.display())),
        }
    }
}
