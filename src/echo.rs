//! Optional per-record console output for debugging a pattern.

use crate::extract::FieldMapping;
use console::{style, Color};
use regex::{Captures, Regex};
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("placeholder pattern is valid"));

/// Observer called once for every record whose fields were extracted.
pub trait RecordHook: Send + Sync {
    fn on_record(&self, fields: &FieldMapping);
}

/// Prints a templated line per record, colored by its `level` field.
pub struct ConsoleEcho {
    template: String,
}

impl ConsoleEcho {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Substitute `${field}` placeholders. Unknown fields are left as written.
    pub fn render(&self, fields: &FieldMapping) -> String {
        PLACEHOLDER
            .replace_all(&self.template, |caps: &Captures| {
                fields
                    .get(&caps[1])
                    .cloned()
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }
}

fn level_color(level: Option<&str>) -> Color {
    match level {
        Some("INFO") => Color::Green,
        Some("WARN") => Color::Yellow,
        Some("ERROR") => Color::Red,
        _ => Color::White,
    }
}

impl RecordHook for ConsoleEcho {
    fn on_record(&self, fields: &FieldMapping) {
        let color = level_color(fields.get("level").map(String::as_str));
        println!("{}", style(self.render(fields)).fg(color));
    }
}
