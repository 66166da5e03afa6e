//! Document Assembler - substitute resolved values and shape the output
//!
//! Pure and in-memory. Headings are detected on the template's own lines,
//! so a value that happens to start with `#` never opens a section.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::{DocforgeError, Result};
use crate::placeholders::ResolvedValues;
use crate::templates::{parse_segments, Segment, Template};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Headings as written in the template.
    #[default]
    Markdown,
    /// Each heading opens a `<section level=".." title="..">` block.
    Tagged,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Markdown => "markdown",
            OutputFormat::Tagged => "tagged",
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `#` count of a markdown heading line (1 to 6, followed by a space).
pub fn heading_level(line: &str) -> Option<usize> {
    let level = line.bytes().take_while(|b| *b == b'#').count();
    if (1..=6).contains(&level) && line[level..].starts_with(' ') {
        Some(level)
    } else {
        None
    }
}

fn split_line_ending(line: &str) -> (&str, &str) {
    if let Some(content) = line.strip_suffix("\r\n") {
        (content, "\r\n")
    } else if let Some(content) = line.strip_suffix('\n') {
        (content, "\n")
    } else {
        (line, "")
    }
}

fn substitute(segments: &[Segment], values: &ResolvedValues) -> Result<String> {
    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Placeholder(name) => {
                let value = values
                    .get(name)
                    .ok_or_else(|| DocforgeError::MissingDatapoint(name.clone()))?;
                out.push_str(value);
            }
        }
    }
    Ok(out)
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
}

/// Renders `template` with every placeholder token replaced exactly once.
///
/// Fails with `MissingDatapoint` if `values` lacks a referenced name.
pub fn render(template: &Template, values: &ResolvedValues, format: OutputFormat) -> Result<String> {
    let mut out = String::with_capacity(template.body.len());
    let mut section_open = false;

    for line in template.body.split_inclusive('\n') {
        let (content, ending) = split_line_ending(line);
        let text = substitute(&parse_segments(content)?, values)?;

        match heading_level(content) {
            Some(level) if format == OutputFormat::Tagged => {
                if section_open {
                    out.push_str("</section>\n");
                }
                let title = text[level..].trim();
                out.push_str(&format!(
                    "<section level=\"{}\" title=\"{}\">",
                    level,
                    escape_attr(title)
                ));
                out.push_str(if ending.is_empty() { "\n" } else { ending });
                section_open = true;
            }
            _ => {
                out.push_str(&text);
                out.push_str(ending);
            }
        }
    }

    if section_open {
        if !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str("</section>\n");
    }
    Ok(out)
}
