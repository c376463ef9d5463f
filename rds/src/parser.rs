//! Parser for RouterOS CLI output.
//!
//! Both `print` and `print detail` emit `name=value` fields; `print`
//! prefixes each entry with a numeric index (and optional flag
//! letters), while `print detail` emits one record whose fields may
//! wrap over several indented lines. Values are bare tokens or quoted
//! strings. Unknown fields are ignored; a known field that fails a
//! typed getter is a parse error and is never retried.

use crate::{error::ParseSnafu, RdsError};
use snafu::OptionExt;
use std::collections::HashMap;

/// One parsed record.
#[derive(Debug, Default, Clone)]
pub struct Record {
    /// entry index in plain `print` output
    pub index: Option<u32>,
    /// single-letter flags preceding the fields (`X` disabled, ...)
    pub flags: String,
    fields: HashMap<String, String>,
}

impl Record {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn require(&self, name: &str) -> Result<&str, RdsError> {
        self.get(name).context(ParseSnafu {
            text: format!("missing field '{}'", name),
        })
    }

    pub fn get_u64(&self, name: &str) -> Result<Option<u64>, RdsError> {
        match self.get(name) {
            None => Ok(None),
            Some(value) => {
                let parsed =
                    value.parse::<u64>().ok().context(ParseSnafu {
                        text: format!(
                            "field '{}' is not an integer: {}",
                            name, value
                        ),
                    })?;
                Ok(Some(parsed))
            }
        }
    }

    pub fn require_u64(&self, name: &str) -> Result<u64, RdsError> {
        self.get_u64(name)?.context(ParseSnafu {
            text: format!("missing field '{}'", name),
        })
    }

    pub fn get_bool(&self, name: &str) -> Result<Option<bool>, RdsError> {
        match self.get(name) {
            None => Ok(None),
            Some("yes") | Some("true") => Ok(Some(true)),
            Some("no") | Some("false") => Ok(Some(false)),
            Some(other) => ParseSnafu {
                text: format!("field '{}' is not a boolean: {}", name, other),
            }
            .fail(),
        }
    }

    fn is_empty(&self) -> bool {
        self.index.is_none() && self.flags.is_empty() && self.fields.is_empty()
    }
}

/// Split command output into records.
pub fn parse_records(output: &str) -> Result<Vec<Record>, RdsError> {
    let mut records: Vec<Record> = Vec::new();
    let mut current: Option<Record> = None;

    for raw in output.lines() {
        let line = raw.trim_end();
        let trimmed = line.trim_start();

        if trimmed.is_empty() {
            // blank line terminates a detail record
            if let Some(record) = current.take() {
                if !record.is_empty() {
                    records.push(record);
                }
            }
            continue;
        }
        // legend emitted before the first entry
        if trimmed.starts_with("Flags:") {
            continue;
        }

        let (index, rest) = split_index(trimmed);
        if index.is_some() {
            if let Some(record) = current.take() {
                if !record.is_empty() {
                    records.push(record);
                }
            }
            current = Some(Record {
                index,
                ..Default::default()
            });
        } else if current.is_none() {
            current = Some(Record::default());
        }

        let record = current.as_mut().expect("record exists");
        parse_fields(rest, record)?;
    }

    if let Some(record) = current.take() {
        if !record.is_empty() {
            records.push(record);
        }
    }
    Ok(records)
}

/// An index is a leading run of digits followed by whitespace.
fn split_index(line: &str) -> (Option<u32>, &str) {
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return (None, line);
    }
    let rest = &line[digits ..];
    if rest.is_empty() || rest.starts_with(char::is_whitespace) {
        (line[.. digits].parse().ok(), rest.trim_start())
    } else {
        (None, line)
    }
}

fn parse_fields(line: &str, record: &mut Record) -> Result<(), RdsError> {
    let mut chars = line.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        // consume one token up to '=' or whitespace
        let mut end = start;
        while let Some(&(i, c)) = chars.peek() {
            if c == '=' || c.is_whitespace() {
                end = i;
                break;
            }
            chars.next();
            end = i + c.len_utf8();
        }
        let token = &line[start .. end];

        match chars.peek() {
            Some(&(_, '=')) => {
                chars.next(); // consume '='
                let value = parse_value(line, &mut chars)?;
                record.fields.insert(token.to_string(), value);
            }
            _ => {
                // bare token before any field: flag letters
                if record.fields.is_empty()
                    && token.len() <= 2
                    && token.chars().all(|c| c.is_ascii_uppercase())
                {
                    record.flags.push_str(token);
                } else {
                    // tabular or free-form text we do not understand;
                    // tolerated so that banners do not break parsing
                    trace!("ignoring output token: {}", token);
                }
            }
        }
    }
    Ok(())
}

fn parse_value(
    line: &str,
    chars: &mut std::iter::Peekable<std::str::CharIndices>,
) -> Result<String, RdsError> {
    match chars.peek() {
        Some(&(_, '"')) => {
            chars.next(); // opening quote
            let mut value = String::new();
            loop {
                match chars.next() {
                    Some((_, '"')) => return Ok(value),
                    Some((_, '\\')) => {
                        if let Some((_, escaped)) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    Some((_, c)) => value.push(c),
                    None => {
                        return ParseSnafu {
                            text: format!("unterminated quote in: {}", line),
                        }
                        .fail()
                    }
                }
            }
        }
        _ => {
            let mut value = String::new();
            while let Some(&(_, c)) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                value.push(c);
                chars.next();
            }
            Ok(value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_print_detail_record() {
        let output = r#"
 0   slot="pvc-5bcf13d7-9c36-5a2c-9d5e-cafe00112233" type="file"
     file-path="rds1/volumes/pvc-5bcf13d7-9c36-5a2c-9d5e-cafe00112233.img"
     file-size=1073741824 nvme-tcp-export=yes nvme-tcp-server-port=4420
     nvme-tcp-server-nqn="nqn.2014-08.com.mikrotik:pvc-5bcf13d7-9c36-5a2c-9d5e-cafe00112233"
"#;
        let records = parse_records(output).unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.index, Some(0));
        assert_eq!(
            record.get("slot"),
            Some("pvc-5bcf13d7-9c36-5a2c-9d5e-cafe00112233")
        );
        assert_eq!(record.require_u64("file-size").unwrap(), 1073741824);
        assert_eq!(record.get_bool("nvme-tcp-export").unwrap(), Some(true));
        assert_eq!(record.require_u64("nvme-tcp-server-port").unwrap(), 4420);
    }

    #[test]
    fn parses_numbered_print_entries() {
        let output = r#"Flags: X - disabled
 0 X name="snap-0f5a1b2c-3d4e-5f60-7182-93a4b5c6d7e8" parent="pvc-1" read-only=yes
 1   name="snap-11111111-2222-3333-4444-555555555555" parent="pvc-2" read-only=no
"#;
        let records = parse_records(output).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].index, Some(0));
        assert_eq!(records[0].flags, "X");
        assert_eq!(records[0].get_bool("read-only").unwrap(), Some(true));
        assert_eq!(records[1].index, Some(1));
        assert_eq!(records[1].flags, "");
        assert_eq!(
            records[1].get("name"),
            Some("snap-11111111-2222-3333-4444-555555555555")
        );
    }

    #[test]
    fn detail_without_index_is_one_record() {
        let output = "name=\"disk1\" size=42\n    free-space=10\n";
        let records = parse_records(output).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].index, None);
        assert_eq!(records[0].require_u64("free-space").unwrap(), 10);
    }

    #[test]
    fn blank_line_separates_detail_records() {
        let output = "name=\"a\" size=1\n\nname=\"b\" size=2\n";
        let records = parse_records(output).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("name"), Some("a"));
        assert_eq!(records[1].get("name"), Some("b"));
    }

    #[test]
    fn quoted_values_may_contain_spaces_and_escapes() {
        let output = r#"0 comment="hello \"rds\" world" name=x"#;
        let records = parse_records(output).unwrap();
        assert_eq!(
            records[0].get("comment"),
            Some(r#"hello "rds" world"#)
        );
        assert_eq!(records[0].get("name"), Some("x"));
    }

    #[test]
    fn unknown_fields_are_ignored_known_bad_values_error() {
        let output = "0 mystery=??? file-size=abc";
        let records = parse_records(output).unwrap();
        assert_eq!(records[0].get("mystery"), Some("???"));
        assert!(records[0].get_u64("file-size").is_err());
        assert!(records[0].get_bool("mystery").is_err());
    }

    #[test]
    fn empty_output_is_no_records() {
        assert!(parse_records("").unwrap().is_empty());
        assert!(parse_records("\n\n").unwrap().is_empty());
    }

    #[test]
    fn unterminated_quote_is_parse_error() {
        assert!(parse_records("0 name=\"oops").is_err());
    }
}
