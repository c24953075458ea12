//! Maps a record's stream name and timestamp to the concrete index it is written to.
//!
//! Date patterns use the `SimpleDateFormat` letters connector users already write in
//! their properties (`yyyy.MM.dd`, `yyyy-MM-dd'T'HH`, ...). They are translated
//! once into chrono format items so naming a record never re-parses the pattern.

use std::collections::HashMap;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Utc};

use crate::config::SinkConfig;
use crate::errors::ConfigError;

const TOPIC_PLACEHOLDER: &str = "{topic}";

#[derive(Debug, Clone)]
pub struct IndexNamer {
    mapping: HashMap<String, String>,
    template: String,
    separator: String,
    date_format: Option<DateFormat>,
}

impl IndexNamer {
    pub fn new(
        mapping: HashMap<String, String>,
        template: &str,
        separator: &str,
        date_format: Option<&str>,
    ) -> Result<Self, ConfigError> {
        if separator.is_empty() {
            return Err(ConfigError::ValidationFailed {
                reason: "Suffix separator cannot be empty".to_string(),
            });
        }
        if template.trim().is_empty() {
            return Err(ConfigError::ValidationFailed {
                reason: "Index name template cannot be empty".to_string(),
            });
        }
        let date_format = date_format
            .filter(|pattern| !pattern.is_empty())
            .map(DateFormat::parse)
            .transpose()?;

        Ok(Self {
            mapping,
            template: template.to_string(),
            separator: separator.to_string(),
            date_format,
        })
    }

    pub fn from_config(config: &SinkConfig) -> Result<Self, ConfigError> {
        Self::new(
            config.stream_to_index(),
            &config.index_name_template,
            &config.suffix_separator,
            config.date_format.as_deref(),
        )
    }

    /// Index for a record of `stream` stamped at `timestamp`.
    ///
    /// Without a configured date format, or for records carrying no timestamp,
    /// the unsuffixed base index is returned.
    pub fn name_for(&self, stream: &str, timestamp: Option<DateTime<Utc>>) -> String {
        let base = match self.mapping.get(stream) {
            Some(index) => index.to_lowercase(),
            None => self.template.replace(TOPIC_PLACEHOLDER, stream).to_lowercase(),
        };

        match (&self.date_format, timestamp) {
            (Some(format), Some(ts)) => {
                // month and day names render capitalized; index names must be lowercase
                let suffix = format.render(&ts).to_lowercase();
                format!("{}{}{}", base, self.separator, suffix)
            }
            _ => base,
        }
    }
}

/// A translated date pattern.
#[derive(Debug, Clone)]
struct DateFormat {
    strftime: String,
}

impl DateFormat {
    fn parse(pattern: &str) -> Result<Self, ConfigError> {
        let strftime = translate_pattern(pattern)?;
        if StrftimeItems::new(&strftime).any(|item| matches!(item, Item::Error)) {
            return Err(invalid_pattern(pattern, "unsupported field"));
        }
        Ok(Self { strftime })
    }

    fn render(&self, timestamp: &DateTime<Utc>) -> String {
        timestamp.format(&self.strftime).to_string()
    }
}

fn invalid_pattern(pattern: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        message: format!("Invalid date format '{pattern}': {reason}"),
    }
}

/// Translates a `SimpleDateFormat` pattern into a strftime string.
fn translate_pattern(pattern: &str) -> Result<String, ConfigError> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len() * 2);
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c == '\'' {
            // '' is a literal quote, 'text' is literal text
            if chars.get(i + 1) == Some(&'\'') {
                out.push('\'');
                i += 2;
                continue;
            }
            let mut j = i + 1;
            loop {
                match chars.get(j) {
                    None => return Err(invalid_pattern(pattern, "unterminated quote")),
                    Some('\'') if chars.get(j + 1) == Some(&'\'') => {
                        out.push('\'');
                        j += 2;
                    }
                    Some('\'') => break,
                    Some(&literal) => {
                        push_literal(&mut out, literal);
                        j += 1;
                    }
                }
            }
            i = j + 1;
            continue;
        }

        if !c.is_ascii_alphabetic() {
            push_literal(&mut out, c);
            i += 1;
            continue;
        }

        let mut run = 1;
        while chars.get(i + run) == Some(&c) {
            run += 1;
        }
        let directive = match (c, run) {
            ('y', 2) => "%y",
            ('y', _) => "%Y",
            ('M', 1) => "%-m",
            ('M', 2) => "%m",
            ('M', 3) => "%b",
            ('M', _) => "%B",
            ('d', 1) => "%-d",
            ('d', _) => "%d",
            ('D', _) => "%j",
            ('H', 1) => "%-H",
            ('H', _) => "%H",
            ('h', 1) => "%-I",
            ('h', _) => "%I",
            ('m', 1) => "%-M",
            ('m', _) => "%M",
            ('s', 1) => "%-S",
            ('s', _) => "%S",
            ('S', _) => "%3f",
            ('E', 1..=3) => "%a",
            ('E', _) => "%A",
            ('a', _) => "%p",
            ('w', _) => "%V",
            ('Z', _) => "%z",
            ('X', _) => "%:z",
            _ => {
                return Err(invalid_pattern(
                    pattern,
                    &format!("unknown pattern letter '{c}'"),
                ));
            }
        };
        out.push_str(directive);
        i += run;
    }

    Ok(out)
}

fn push_literal(out: &mut String, c: char) {
    if c == '%' {
        out.push_str("%%");
    } else {
        out.push(c);
    }
}
