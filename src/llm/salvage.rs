//! Best-effort recovery of `{path, content}` records from a tool input that
//! was cut off at the token ceiling.
//!
//! The scanner walks the `"files"` array once, tracking string/escape state
//! and brace depth. Each element whose closing brace is seen is parsed on its
//! own; the trailing half-written element never is.

use serde_json::Value;

use crate::pipeline::models::GeneratedFile;

#[derive(Debug, Default)]
struct Scanner {
    in_string: bool,
    escaped: bool,
    depth: usize,
}

impl Scanner {
    /// Advance over one byte. Returns `true` if the byte is structural
    /// (outside any string literal).
    fn step(&mut self, byte: u8) -> bool {
        if self.in_string {
            if self.escaped {
                self.escaped = false;
            } else if byte == b'\\' {
                self.escaped = true;
            } else if byte == b'"' {
                self.in_string = false;
            }
            return false;
        }
        if byte == b'"' {
            self.in_string = true;
            return false;
        }
        true
    }
}

/// Recover every complete file record from truncated `write_files` input.
/// Returns `None` when nothing usable was found.
pub fn salvage_files(raw: &str) -> Option<Vec<GeneratedFile>> {
    let start = find_files_array(raw)?;
    let bytes = raw.as_bytes();
    let mut scanner = Scanner::default();
    let mut object_start = None;
    let mut files = Vec::new();

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        let index = start + offset;
        if !scanner.step(byte) {
            continue;
        }
        match byte {
            b'{' | b'[' => {
                if scanner.depth == 0 && byte == b'{' {
                    object_start = Some(index);
                }
                scanner.depth += 1;
            }
            b'}' | b']' => {
                if scanner.depth == 0 {
                    // End of the files array itself.
                    break;
                }
                scanner.depth -= 1;
                if scanner.depth == 0 && byte == b'}' {
                    if let Some(begin) = object_start.take() {
                        if let Some(file) = parse_record(&raw[begin..=index]) {
                            files.push(file);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    if files.is_empty() { None } else { Some(files) }
}

fn parse_record(slice: &str) -> Option<GeneratedFile> {
    let value: Value = serde_json::from_str(slice).ok()?;
    let path = value.get("path")?.as_str()?;
    let content = value.get("content")?.as_str()?;
    Some(GeneratedFile::new(path, content))
}

/// Byte offset just past the `[` that opens the top-level `"files"` array.
fn find_files_array(raw: &str) -> Option<usize> {
    let bytes = raw.as_bytes();
    let mut scanner = Scanner::default();
    let mut key_start = None;
    let mut last_key: Option<&str> = None;
    let mut awaiting_value = false;

    for (index, &byte) in bytes.iter().enumerate() {
        let was_in_string = scanner.in_string;
        let structural = scanner.step(byte);

        if !was_in_string && scanner.in_string {
            key_start = Some(index + 1);
            continue;
        }
        if was_in_string && !scanner.in_string {
            if scanner.depth == 1 {
                last_key = key_start.map(|s| &raw[s..index]);
            }
            key_start = None;
            continue;
        }
        if !structural {
            continue;
        }
        match byte {
            b':' if scanner.depth == 1 => awaiting_value = last_key == Some("files"),
            b'[' if awaiting_value && scanner.depth == 1 => return Some(index + 1),
            b'{' | b'[' => {
                awaiting_value = false;
                scanner.depth += 1;
            }
            b'}' | b']' => {
                awaiting_value = false;
                scanner.depth = scanner.depth.saturating_sub(1);
            }
            b',' => {
                awaiting_value = false;
                last_key = None;
            }
            _ => {}
        }
    }
    None
}
