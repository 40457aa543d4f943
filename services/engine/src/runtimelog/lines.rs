//! Splitting raw log bytes into prefixed lines.

/// Accumulates bytes and yields complete lines.
///
/// Lines keep their trailing newline. Splitting happens on raw bytes, so a
/// multi-byte character cut across two reads is decoded intact.
#[derive(Debug, Default)]
pub struct LineBuffer {
    prefix: Option<String>,
    partial: Vec<u8>,
}

impl LineBuffer {
    pub fn new(prefix: Option<String>) -> Self {
        Self {
            prefix,
            partial: Vec::new(),
        }
    }

    /// Append bytes, returning every line they complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(bytes);

        let Some(last_newline) = self.partial.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };

        let rest = self.partial.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.partial, rest);

        complete
            .split_inclusive(|b| *b == b'\n')
            .map(|line| self.render(line))
            .collect()
    }

    /// Drain a trailing partial line, terminating it with a newline.
    pub fn flush(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        let mut line = std::mem::take(&mut self.partial);
        line.push(b'\n');
        Some(self.render(&line))
    }

    fn render(&self, line: &[u8]) -> String {
        let text = String::from_utf8_lossy(line);
        match &self.prefix {
            Some(prefix) => format!("{prefix}{text}"),
            None => text.into_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_lines_held_back() {
        let mut lines = LineBuffer::new(None);
        assert!(lines.push(b"hel").is_empty());
        assert_eq!(lines.push(b"lo\nwor"), vec!["hello\n"]);
        assert_eq!(lines.push(b"ld\n"), vec!["world\n"]);
        assert_eq!(lines.flush(), None);
    }

    #[test]
    fn test_prefix_every_line() {
        let mut lines = LineBuffer::new(Some("[init] ".to_string()));
        assert_eq!(
            lines.push(b"a\nb\nc"),
            vec!["[init] a\n", "[init] b\n"]
        );
        assert_eq!(lines.flush(), Some("[init] c\n".to_string()));
    }

    #[test]
    fn test_split_multibyte_char() {
        let bytes = "héllo\n".as_bytes();
        let mut lines = LineBuffer::new(None);
        assert!(lines.push(&bytes[..2]).is_empty());
        assert_eq!(lines.push(&bytes[2..]), vec!["héllo\n"]);
    }
}
