//! Utility functions shared across the crate.

/// Truncate a string to at most `max_chars` characters, appending "..." if truncated.
///
/// Safe for multi-byte UTF-8 input: truncation happens on character
/// boundaries, never byte indices.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", s[..idx].trim_end()),
        None => s.to_string(),
    }
}

/// Result of a tail-first truncation: the kept tail plus what was dropped.
#[derive(Debug, Clone)]
pub struct TailTruncation {
    pub text: String,
    pub truncated: bool,
    pub dropped_lines: usize,
    pub dropped_bytes: usize,
}

impl TailTruncation {
    /// Render with a marker line describing what was dropped, when anything was.
    pub fn with_marker(&self) -> String {
        if self.truncated {
            format!(
                "[... {} earlier lines ({} bytes) dropped ...]\n{}",
                self.dropped_lines, self.dropped_bytes, self.text
            )
        } else {
            self.text.clone()
        }
    }
}

/// Truncate tail-first: keep the *last* `max_lines` lines and at most
/// `max_bytes` bytes, dropping from the front.
pub fn truncate_tail(s: &str, max_lines: usize, max_bytes: usize) -> TailTruncation {
    let total_lines = s.lines().count();
    let mut kept: &str = s;

    if total_lines > max_lines {
        // Byte offset of the first kept line.
        let skip = total_lines - max_lines;
        let mut offset = 0;
        for (i, line) in s.split_inclusive('\n').enumerate() {
            if i == skip {
                break;
            }
            offset += line.len();
        }
        kept = &s[offset..];
    }

    if kept.len() > max_bytes {
        let mut cut = kept.len() - max_bytes;
        while !kept.is_char_boundary(cut) {
            cut += 1;
        }
        // Start at the next full line inside the byte window if there is one.
        if let Some(nl) = kept[cut..].find('\n') {
            if cut + nl + 1 < kept.len() {
                cut += nl + 1;
            }
        }
        kept = &kept[cut..];
    }

    let dropped_bytes = s.len() - kept.len();
    let kept_lines = kept.lines().count();
    TailTruncation {
        text: kept.to_string(),
        truncated: dropped_bytes > 0,
        dropped_lines: total_lines - kept_lines,
        dropped_bytes,
    }
}

/// Replace every character outside `[A-Za-z0-9._-]` with `_`.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Human-readable file size: `B`, `K`, `M`.
pub fn human_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes}B")
    } else if bytes < 1024 * 1024 {
        format!("{}K", bytes / 1024)
    } else {
        format!("{}M", bytes / (1024 * 1024))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_short_string_unchanged() {
        assert_eq!(truncate_with_ellipsis("hello", 10), "hello");
    }

    #[test]
    fn truncate_long_string_gets_ellipsis() {
        assert_eq!(truncate_with_ellipsis("hello world", 5), "hello...");
    }

    #[test]
    fn truncate_multibyte_safe() {
        assert_eq!(truncate_with_ellipsis("😀😀😀😀", 2), "😀😀...");
    }

    #[test]
    fn tail_keeps_last_lines() {
        let input = (1..=10)
            .map(|i| format!("line{i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let t = truncate_tail(&input, 3, 1024);
        assert!(t.truncated);
        assert_eq!(t.text, "line8\nline9\nline10");
        assert_eq!(t.dropped_lines, 7);
    }

    #[test]
    fn tail_no_truncation_when_small() {
        let t = truncate_tail("a\nb", 10, 1024);
        assert!(!t.truncated);
        assert_eq!(t.with_marker(), "a\nb");
    }

    #[test]
    fn tail_byte_limit_applies() {
        let input = "x".repeat(100);
        let t = truncate_tail(&input, 10, 40);
        assert!(t.truncated);
        assert!(t.text.len() <= 40);
        assert_eq!(t.dropped_bytes, 100 - t.text.len());
    }

    #[test]
    fn tail_marker_names_dropped_amounts() {
        let input = (1..=5)
            .map(|i| format!("l{i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let t = truncate_tail(&input, 2, 1024);
        let rendered = t.with_marker();
        assert!(rendered.starts_with("[... 3 earlier lines"));
        assert!(rendered.ends_with("l4\nl5"));
    }

    #[test]
    fn sanitize_replaces_special_chars() {
        assert_eq!(sanitize_filename("my file (1).png"), "my_file__1_.png");
        assert_eq!(sanitize_filename("safe-name_1.txt"), "safe-name_1.txt");
    }

    #[test]
    fn human_size_units() {
        assert_eq!(human_size(512), "512B");
        assert_eq!(human_size(2048), "2K");
        assert_eq!(human_size(3 * 1024 * 1024), "3M");
    }
}
