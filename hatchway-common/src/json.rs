//! Helpers for the streaming JSON used on control channels. A bridge may
//! concatenate several top-level JSON values into one payload; `json_skip`
//! reports how many bytes the leading value covers so the caller can peel
//! values off one at a time.

fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r' | b'\n' | b'\x0b' | b'\x0c')
}

fn is_structural(b: u8) -> bool {
    matches!(b, b'{' | b'}' | b'[' | b']' | b'"' | b',' | b':')
}

/// Skip one string literal starting at the opening quote. Returns the
/// offset just past the closing quote, or None when truncated.
fn skip_string(data: &[u8], mut at: usize) -> Option<usize> {
    at += 1;
    while at < data.len() {
        match data[at] {
            b'\\' => at += 2,
            b'"' => return Some(at + 1),
            _ => at += 1,
        }
    }
    None
}

/// Byte length covered by the first complete top-level JSON value in
/// `data`, including any whitespace around it. Returns 0 when the value is
/// truncated. Input that is nothing but whitespace counts as one block.
pub fn json_skip(data: &[u8]) -> usize {
    json_skip_with_spaces(data).0
}

/// Like [`json_skip`], additionally reporting how many leading whitespace
/// bytes were consumed before the value.
pub fn json_skip_with_spaces(data: &[u8]) -> (usize, usize) {
    let mut at = 0;
    while at < data.len() && is_space(data[at]) {
        at += 1;
    }
    let spaces = at;

    if at == data.len() {
        return (at, spaces);
    }

    match data[at] {
        b'"' => {
            let Some(end) = skip_string(data, at) else {
                return (0, spaces);
            };
            at = end;
        }
        b'{' | b'[' => {
            // Track bracket depth; strings are opaque.
            let mut depth = 0usize;
            loop {
                if at == data.len() {
                    return (0, spaces);
                }
                match data[at] {
                    b'{' | b'[' => {
                        depth += 1;
                        at += 1;
                    }
                    b'}' | b']' => {
                        depth -= 1;
                        at += 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    b'"' => {
                        let Some(end) = skip_string(data, at) else {
                            return (0, spaces);
                        };
                        at = end;
                    }
                    _ => at += 1,
                }
            }
        }
        _ => {
            // Number, boolean or null: runs until whitespace or structure.
            while at < data.len() && !is_space(data[at]) && !is_structural(data[at]) {
                at += 1;
            }
        }
    }

    while at < data.len() && is_space(data[at]) {
        at += 1;
    }
    (at, spaces)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_blocks(json: &str, blocks: &[usize]) {
        let mut data = json.as_bytes();
        for &expected in blocks {
            let off = json_skip(data);
            assert_eq!(off, expected, "input {json:?}");
            assert!(off <= data.len());
            if off == 0 {
                return;
            }
            data = &data[off..];
        }
        assert_eq!(json_skip(data), 0);
    }

    #[test]
    fn test_skip_number() {
        assert_blocks("0123456789", &[10]);
        assert_blocks("-0123456789.33E-5", &[17]);
    }

    #[test]
    fn test_skip_string() {
        assert_blocks("\"string\"", &[8]);
        assert_blocks("\"st\\\"ring\"", &[10]);
        assert_blocks("\"string", &[0]);
    }

    #[test]
    fn test_skip_literals() {
        assert_blocks("true", &[4]);
        assert_blocks("null", &[4]);
    }

    #[test]
    fn test_skip_concatenated() {
        assert_blocks("\"string\"0123456789", &[8, 10]);
        assert_blocks("0123456789\"string\"", &[10, 8]);
        assert_blocks("0123456789 123", &[11, 3]);
        assert_blocks("\"string\"\"two\"\"three\"", &[8, 5, 7]);
        assert_blocks("\"string\"\"tw", &[8, 0]);
    }

    #[test]
    fn test_skip_array() {
        assert_blocks("[\"string\",\"two\",\"three\"]", &[24]);
        assert_blocks("[\"string\",\"two\",\"thr]e\"]", &[24]);
        assert_blocks(" [ \"string\", \"two\" ,\"thr]e\" ]\t", &[30]);
        assert_blocks("[\"string\",\"two\",\"thr", &[0]);
    }

    #[test]
    fn test_skip_object() {
        assert_blocks("{\"string\":\"two\",\"number\":222}", &[29]);
        assert_blocks("{\"string\":\"two\",\"num]}}ber\":222}", &[32]);
        assert_blocks("{ \"string\": \"two\", \"number\": 222 }", &[34]);
        assert_blocks(
            "{\"string\":\"two\",\"number\":222}{\"string\":\"two\",\"number\":222}",
            &[29, 29],
        );
        assert_blocks(
            "{\"string\":\"two\",\"number\":222}\n{\"string\":\"two\",\"number\":222}",
            &[30, 29],
        );
        assert_blocks("{\"stri}ng\"", &[0]);
    }

    #[test]
    fn test_skip_whitespace_only() {
        assert_blocks("  \r\n\t \x0b", &[7]);
    }

    #[test]
    fn test_skip_returns_spaces() {
        let (off, spaces) = json_skip_with_spaces(b"  234  ");
        assert_eq!(off, 7);
        assert_eq!(spaces, 2);

        let (off, spaces) = json_skip_with_spaces(b"   \t   ");
        assert_eq!(off, 7);
        assert_eq!(spaces, 7);
    }

    #[test]
    fn test_skip_additivity() {
        let a = "{\"command\":\"close\",\"channel\":4}";
        let b = "{\"command\":\"ping\"}";
        let joined = format!("{a}{b}");
        let first = json_skip(joined.as_bytes());
        let second = json_skip(&joined.as_bytes()[first..]);
        assert_eq!(first + second, joined.len());
    }
}
