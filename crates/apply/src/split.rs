//! Manifest splitting on `---` marker lines.

/// Split a raw manifest into its documents, in source order.
///
/// A separator is a line that reads exactly `---` (trailing whitespace and
/// `\r` tolerated). Blank or whitespace-only segments are dropped.
pub fn split_manifest(raw: &[u8]) -> Vec<&[u8]> {
    let mut docs = Vec::new();
    let mut start = 0usize;
    let mut pos = 0usize;
    loop {
        let end = raw[pos..].iter().position(|&b| b == b'\n').map(|i| pos + i).unwrap_or(raw.len());
        if is_separator(&raw[pos..end]) {
            push_doc(&mut docs, &raw[start..pos]);
            start = (end + 1).min(raw.len());
        }
        if end >= raw.len() {
            break;
        }
        pos = end + 1;
    }
    push_doc(&mut docs, &raw[start..]);
    docs
}

fn is_separator(line: &[u8]) -> bool {
    let trimmed = match line.iter().rposition(|b| !b.is_ascii_whitespace()) {
        Some(last) => &line[..=last],
        None => return false,
    };
    trimmed == b"---"
}

fn push_doc<'a>(docs: &mut Vec<&'a [u8]>, seg: &'a [u8]) {
    if !seg.iter().all(u8::is_ascii_whitespace) {
        docs.push(seg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split_str(s: &str) -> Vec<String> {
        split_manifest(s.as_bytes()).into_iter().map(|d| String::from_utf8_lossy(d).into_owned()).collect()
    }

    #[test]
    fn blank_segment_between_separators_is_dropped() {
        let docs = split_str("docA\n---\n\n---\ndocB");
        assert_eq!(docs, vec!["docA\n", "docB"]);
    }

    #[test]
    fn leading_and_trailing_separators_yield_nothing_extra() {
        let docs = split_str("---\na: 1\n---\nb: 2\n---\n");
        assert_eq!(docs, vec!["a: 1\n", "b: 2\n"]);
        let docs = split_str("---\na: 1\n---");
        assert_eq!(docs, vec!["a: 1\n"]);
    }

    #[test]
    fn empty_and_whitespace_input() {
        assert!(split_manifest(b"").is_empty());
        assert!(split_manifest(b"   \n\t\n---\n  \n").is_empty());
    }

    #[test]
    fn single_document_without_separator() {
        assert_eq!(split_str("kind: ConfigMap\n"), vec!["kind: ConfigMap\n"]);
    }

    #[test]
    fn crlf_and_trailing_spaces_still_separate() {
        let docs = split_str("a: 1\r\n--- \r\nb: 2\r\n");
        assert_eq!(docs, vec!["a: 1\r\n", "b: 2\r\n"]);
    }

    #[test]
    fn dashes_inside_content_are_not_separators() {
        let src = "data:\n  banner: |\n    ---\n    hello\nnote: a---b\n----\n";
        assert_eq!(split_str(src), vec![src.to_string()]);
    }
}
