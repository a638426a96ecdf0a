//! Request text decoding for the command-line tool.

/// Decode backslash escapes: `\r`, `\n`, `\t`, `\0`, `\\` and `\xNN`.
///
/// Unknown escapes and truncated `\x` sequences are kept verbatim.
pub fn unescape(input: &str) -> Vec<u8> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'\\' || i + 1 == bytes.len() {
            out.push(bytes[i]);
            i += 1;
            continue;
        }

        let decoded = match bytes[i + 1] {
            b'r' => Some((b'\r', 2)),
            b'n' => Some((b'\n', 2)),
            b't' => Some((b'\t', 2)),
            b'0' => Some((0, 2)),
            b'\\' => Some((b'\\', 2)),
            b'x' => bytes
                .get(i + 2..i + 4)
                .and_then(|hex| std::str::from_utf8(hex).ok())
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                .map(|b| (b, 4)),
            _ => None,
        };

        match decoded {
            Some((b, width)) => {
                out.push(b);
                i += width;
            }
            None => {
                out.push(b'\\');
                i += 1;
            }
        }
    }

    out
}

/// Normalise bare `\n` line endings to `\r\n`, leaving existing `\r\n`
/// untouched.
pub fn normalize_newlines(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() + input.len() / 8);
    for (i, &b) in input.iter().enumerate() {
        if b == b'\n' && (i == 0 || input[i - 1] != b'\r') {
            out.push(b'\r');
        }
        out.push(b);
    }
    out
}
