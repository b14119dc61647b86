//! Transformation functions.
//!
//! Every transformation is a pure `&str -> String` function returning `false`
//! when the input is left unchanged; the caller then keeps the previous
//! value. Results are cached per transaction keyed by input-string identity
//! (see `Transaction::transform_cache`).

use base64::Engine as _;
use md5::Md5;
use sha1::Sha1;
use sha2::Digest;

use crate::config::EngineConfig;

/// The closed set of transformations.
///
/// `none` never appears here: it is consumed at parse time, where it clears
/// the accumulated list and suppresses default-action transforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transform {
    Base64Decode,
    Base64DecodeExt,
    Base64Encode,
    CmdLine,
    CompressWhitespace,
    CssDecode,
    EscapeSeqDecode,
    HexDecode,
    HexEncode,
    HtmlEntityDecode,
    JsDecode,
    Length,
    Lowercase,
    Uppercase,
    Md5,
    Sha1,
    NormalisePath,
    NormalisePathWin,
    ParityEven7Bit,
    ParityOdd7Bit,
    ParityZero7Bit,
    RemoveComments,
    RemoveCommentsChar,
    RemoveNulls,
    RemoveWhitespace,
    ReplaceComments,
    ReplaceNulls,
    SqlHexDecode,
    Trim,
    TrimLeft,
    TrimRight,
    UrlDecode,
    UrlDecodeUni,
    UrlEncode,
    Utf8ToUnicode,
}

impl Transform {
    /// Resolve a `t:<name>` action argument.
    pub fn from_name(name: &str) -> Option<Transform> {
        Some(match name {
            "base64Decode" => Transform::Base64Decode,
            "base64DecodeExt" => Transform::Base64DecodeExt,
            "base64Encode" => Transform::Base64Encode,
            "cmdLine" => Transform::CmdLine,
            "compressWhitespace" => Transform::CompressWhitespace,
            "cssDecode" => Transform::CssDecode,
            "escapeSeqDecode" => Transform::EscapeSeqDecode,
            "hexDecode" => Transform::HexDecode,
            "hexEncode" => Transform::HexEncode,
            "htmlEntityDecode" => Transform::HtmlEntityDecode,
            "jsDecode" => Transform::JsDecode,
            "length" => Transform::Length,
            "lowercase" => Transform::Lowercase,
            "uppercase" => Transform::Uppercase,
            "md5" => Transform::Md5,
            "sha1" => Transform::Sha1,
            "normalisePath" | "normalizePath" => Transform::NormalisePath,
            "normalisePathWin" | "normalizePathWin" => Transform::NormalisePathWin,
            "parityEven7bit" | "parityEven7Bit" => Transform::ParityEven7Bit,
            "parityOdd7bit" | "parityOdd7Bit" => Transform::ParityOdd7Bit,
            "parityZero7bit" | "parityZero7Bit" => Transform::ParityZero7Bit,
            "removeComments" => Transform::RemoveComments,
            "removeCommentsChar" => Transform::RemoveCommentsChar,
            "removeNulls" => Transform::RemoveNulls,
            "removeWhitespace" => Transform::RemoveWhitespace,
            "replaceComments" => Transform::ReplaceComments,
            "replaceNulls" => Transform::ReplaceNulls,
            "sqlHexDecode" => Transform::SqlHexDecode,
            "trim" => Transform::Trim,
            "trimLeft" => Transform::TrimLeft,
            "trimRight" => Transform::TrimRight,
            "urlDecode" => Transform::UrlDecode,
            "urlDecodeUni" => Transform::UrlDecodeUni,
            "urlEncode" => Transform::UrlEncode,
            "utf8toUnicode" | "utf8ToUnicode" => Transform::Utf8ToUnicode,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Transform::Base64Decode => "base64Decode",
            Transform::Base64DecodeExt => "base64DecodeExt",
            Transform::Base64Encode => "base64Encode",
            Transform::CmdLine => "cmdLine",
            Transform::CompressWhitespace => "compressWhitespace",
            Transform::CssDecode => "cssDecode",
            Transform::EscapeSeqDecode => "escapeSeqDecode",
            Transform::HexDecode => "hexDecode",
            Transform::HexEncode => "hexEncode",
            Transform::HtmlEntityDecode => "htmlEntityDecode",
            Transform::JsDecode => "jsDecode",
            Transform::Length => "length",
            Transform::Lowercase => "lowercase",
            Transform::Uppercase => "uppercase",
            Transform::Md5 => "md5",
            Transform::Sha1 => "sha1",
            Transform::NormalisePath => "normalisePath",
            Transform::NormalisePathWin => "normalisePathWin",
            Transform::ParityEven7Bit => "parityEven7bit",
            Transform::ParityOdd7Bit => "parityOdd7bit",
            Transform::ParityZero7Bit => "parityZero7bit",
            Transform::RemoveComments => "removeComments",
            Transform::RemoveCommentsChar => "removeCommentsChar",
            Transform::RemoveNulls => "removeNulls",
            Transform::RemoveWhitespace => "removeWhitespace",
            Transform::ReplaceComments => "replaceComments",
            Transform::ReplaceNulls => "replaceNulls",
            Transform::SqlHexDecode => "sqlHexDecode",
            Transform::Trim => "trim",
            Transform::TrimLeft => "trimLeft",
            Transform::TrimRight => "trimRight",
            Transform::UrlDecode => "urlDecode",
            Transform::UrlDecodeUni => "urlDecodeUni",
            Transform::UrlEncode => "urlEncode",
            Transform::Utf8ToUnicode => "utf8toUnicode",
        }
    }

    /// True when the output should be re-read as an integer (`length`).
    pub fn converts_to_int(&self) -> bool {
        matches!(self, Transform::Length)
    }

    /// Apply the transformation. Returns `false` (output untouched) when the
    /// input is already in normal form.
    pub fn evaluate(&self, input: &str, output: &mut String, config: &EngineConfig) -> bool {
        match self {
            Transform::Base64Decode => base64_decode(input, output, false),
            Transform::Base64DecodeExt => base64_decode(input, output, true),
            Transform::Base64Encode => {
                *output = base64::engine::general_purpose::STANDARD.encode(input.as_bytes());
                true
            }
            Transform::CmdLine => cmd_line(input, output),
            Transform::CompressWhitespace => compress_whitespace(input, output),
            Transform::CssDecode => css_decode(input, output),
            Transform::EscapeSeqDecode => escape_seq_decode(input, output),
            Transform::HexDecode => hex_decode(input, output),
            Transform::HexEncode => {
                *output = input.bytes().map(|b| format!("{b:02x}")).collect();
                true
            }
            Transform::HtmlEntityDecode => html_entity_decode(input, output),
            Transform::JsDecode => js_decode(input, output),
            Transform::Length => {
                *output = input.len().to_string();
                true
            }
            Transform::Lowercase => case_change(input, output, false),
            Transform::Uppercase => case_change(input, output, true),
            Transform::Md5 => {
                *output = hex_digest(Md5::new(), input);
                true
            }
            Transform::Sha1 => {
                *output = hex_digest(Sha1::new(), input);
                true
            }
            Transform::NormalisePath => normalise_path(input, output),
            Transform::NormalisePathWin => {
                let forward = input.replace('\\', "/");
                if !normalise_path(&forward, output) {
                    if forward == input {
                        return false;
                    }
                    *output = forward;
                }
                true
            }
            Transform::ParityEven7Bit => parity(input, output, Parity::Even),
            Transform::ParityOdd7Bit => parity(input, output, Parity::Odd),
            Transform::ParityZero7Bit => parity(input, output, Parity::Zero),
            Transform::RemoveComments => remove_comments(input, output, CommentMode::Remove),
            Transform::RemoveCommentsChar => remove_comments_char(input, output),
            Transform::RemoveNulls => remove_chars(input, output, |c| c == '\0'),
            Transform::RemoveWhitespace => remove_chars(input, output, |c| c.is_ascii_whitespace()),
            Transform::ReplaceComments => remove_comments(input, output, CommentMode::Replace),
            Transform::ReplaceNulls => {
                if !input.contains('\0') {
                    return false;
                }
                *output = input.replace('\0', " ");
                true
            }
            Transform::SqlHexDecode => sql_hex_decode(input, output),
            Transform::Trim => trimmed(input, output, input.trim()),
            Transform::TrimLeft => trimmed(input, output, input.trim_start()),
            Transform::TrimRight => trimmed(input, output, input.trim_end()),
            Transform::UrlDecode => url_decode(input, output, false, config),
            Transform::UrlDecodeUni => url_decode(input, output, true, config),
            Transform::UrlEncode => url_encode(input, output),
            Transform::Utf8ToUnicode => utf8_to_unicode(input, output),
        }
    }
}

enum Parity {
    Even,
    Odd,
    Zero,
}

enum CommentMode {
    Remove,
    Replace,
}

fn case_change(input: &str, output: &mut String, upper: bool) -> bool {
    let changed = if upper {
        input.to_uppercase()
    } else {
        input.to_lowercase()
    };
    if changed == input {
        return false;
    }
    *output = changed;
    true
}

fn trimmed(input: &str, output: &mut String, result: &str) -> bool {
    if result.len() == input.len() {
        return false;
    }
    *output = result.to_string();
    true
}

fn remove_chars(input: &str, output: &mut String, pred: impl Fn(char) -> bool) -> bool {
    if !input.chars().any(&pred) {
        return false;
    }
    *output = input.chars().filter(|&c| !pred(c)).collect();
    true
}

fn hex_digest<D: Digest>(mut hasher: D, input: &str) -> String {
    hasher.update(input.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Embed decoded bytes as U+0000..U+00FF scalars. Every distinct byte
/// sequence stays distinct through the string pipeline; replacement-character
/// folding would collapse different payloads to the same output.
fn bytes_to_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn base64_decode(input: &str, output: &mut String, forgiving: bool) -> bool {
    let cleaned: String;
    let subject = if forgiving {
        cleaned = input
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='))
            .collect();
        cleaned.as_str()
    } else {
        input
    };
    let engine = base64::engine::general_purpose::GeneralPurpose::new(
        &base64::alphabet::STANDARD,
        base64::engine::general_purpose::GeneralPurposeConfig::new()
            .with_decode_padding_mode(base64::engine::DecodePaddingMode::Indifferent),
    );
    match engine.decode(subject) {
        Ok(bytes) => {
            *output = bytes_to_string(&bytes);
            true
        }
        Err(_) => false,
    }
}

fn compress_whitespace(input: &str, output: &mut String) -> bool {
    let mut changed = false;
    let mut last_space = false;
    let mut result = String::with_capacity(input.len());
    for c in input.chars() {
        if c.is_ascii_whitespace() {
            if last_space {
                changed = true;
                continue;
            }
            if c != ' ' {
                changed = true;
            }
            result.push(' ');
            last_space = true;
        } else {
            result.push(c);
            last_space = false;
        }
    }
    if !changed {
        return false;
    }
    *output = result;
    true
}

/// Anti-evasion normalisation for shell command payloads: drops quoting and
/// caret escapes, folds separator characters to single spaces, lower-cases.
fn cmd_line(input: &str, output: &mut String) -> bool {
    let mut result = String::with_capacity(input.len());
    let mut pending_space = false;
    for c in input.chars() {
        match c {
            '\\' | '"' | '\'' | '^' => continue,
            ',' | ';' => pending_space = true,
            c if c.is_ascii_whitespace() => pending_space = true,
            '/' | '(' => {
                // spaces before a slash or open parenthesis are dropped
                pending_space = false;
                result.push(c);
            }
            c => {
                if pending_space && !result.is_empty() {
                    result.push(' ');
                }
                pending_space = false;
                result.extend(c.to_lowercase());
            }
        }
    }
    if result == input {
        return false;
    }
    *output = result;
    true
}

fn css_decode(input: &str, output: &mut String) -> bool {
    if !input.contains('\\') {
        return false;
    }
    let bytes = input.as_bytes();
    let mut result = String::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 1 < bytes.len() {
            let mut j = i + 1;
            let mut value: u32 = 0;
            let mut digits = 0;
            while j < bytes.len() && digits < 2 && bytes[j].is_ascii_hexdigit() {
                value = value * 16 + (bytes[j] as char).to_digit(16).unwrap_or(0);
                digits += 1;
                j += 1;
            }
            if digits > 0 {
                result.push((value as u8) as char);
                i = j;
            } else {
                result.push(bytes[i + 1] as char);
                i += 2;
            }
        } else {
            result.push(bytes[i] as char);
            i += 1;
        }
    }
    *output = result;
    true
}

fn escape_seq_decode(input: &str, output: &mut String) -> bool {
    if !input.contains('\\') {
        return false;
    }
    let bytes = input.as_bytes();
    let mut result = String::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' || i + 1 >= bytes.len() {
            result.push(bytes[i] as char);
            i += 1;
            continue;
        }
        let c = bytes[i + 1];
        let decoded = match c {
            b'a' => Some(0x07),
            b'b' => Some(0x08),
            b'f' => Some(0x0c),
            b'n' => Some(b'\n'),
            b'r' => Some(b'\r'),
            b't' => Some(b'\t'),
            b'v' => Some(0x0b),
            b'\\' | b'?' | b'\'' | b'"' => Some(c),
            b'x' => {
                let mut value: u32 = 0;
                let mut digits = 0;
                let mut j = i + 2;
                while j < bytes.len() && digits < 2 && bytes[j].is_ascii_hexdigit() {
                    value = value * 16 + (bytes[j] as char).to_digit(16).unwrap_or(0);
                    digits += 1;
                    j += 1;
                }
                if digits > 0 {
                    result.push((value as u8) as char);
                    i = j;
                    continue;
                }
                None
            }
            b'0'..=b'7' => {
                let mut value: u32 = 0;
                let mut digits = 0;
                let mut j = i + 1;
                while j < bytes.len() && digits < 3 && (b'0'..=b'7').contains(&bytes[j]) {
                    value = value * 8 + (bytes[j] - b'0') as u32;
                    digits += 1;
                    j += 1;
                }
                result.push((value as u8) as char);
                i = j;
                continue;
            }
            _ => None,
        };
        match decoded {
            Some(b) => {
                result.push(b as char);
                i += 2;
            }
            None => {
                result.push(bytes[i] as char);
                result.push(c as char);
                i += 2;
            }
        }
    }
    *output = result;
    true
}

fn hex_decode(input: &str, output: &mut String) -> bool {
    let hex: Vec<u8> = input
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    if hex.is_empty() || hex.len() % 2 != 0 || !hex.iter().all(u8::is_ascii_hexdigit) {
        return false;
    }
    *output = hex
        .chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16).unwrap_or(0) as u8;
            let lo = (pair[1] as char).to_digit(16).unwrap_or(0) as u8;
            ((hi << 4) | lo) as char
        })
        .collect();
    true
}

fn html_entity_decode(input: &str, output: &mut String) -> bool {
    if !input.contains('&') {
        return false;
    }
    let mut result = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find('&') {
        result.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let end = rest[1..]
            .find(';')
            .map(|e| e + 1)
            .filter(|&e| e <= 32);
        let Some(end) = end else {
            result.push('&');
            rest = &rest[1..];
            continue;
        };
        let entity = &rest[1..end];
        let decoded = match entity {
            "quot" => Some('"'),
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "apos" => Some('\''),
            "nbsp" => Some('\u{a0}'),
            _ => entity
                .strip_prefix('#')
                .and_then(|num| {
                    if let Some(hex) = num.strip_prefix('x').or_else(|| num.strip_prefix('X')) {
                        u32::from_str_radix(hex, 16).ok()
                    } else {
                        num.parse::<u32>().ok()
                    }
                })
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => {
                result.push(c);
                rest = &rest[end + 1..];
            }
            None => {
                result.push('&');
                rest = &rest[1..];
            }
        }
    }
    result.push_str(rest);
    if result == input {
        return false;
    }
    *output = result;
    true
}

fn js_decode(input: &str, output: &mut String) -> bool {
    if !input.contains('\\') {
        return false;
    }
    let bytes = input.as_bytes();
    let mut result = String::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' || i + 1 >= bytes.len() {
            result.push(bytes[i] as char);
            i += 1;
            continue;
        }
        match bytes[i + 1] {
            b'u' if i + 5 < bytes.len() && bytes[i + 2..i + 6].iter().all(u8::is_ascii_hexdigit) => {
                let code = u32::from_str_radix(
                    std::str::from_utf8(&bytes[i + 2..i + 6]).unwrap_or("0"),
                    16,
                )
                .unwrap_or(0);
                // fold full-width ASCII variants back onto ASCII
                let code = if (0xff01..=0xff5e).contains(&code) {
                    code - 0xff00 + 0x20
                } else {
                    code
                };
                if let Some(c) = char::from_u32(code) {
                    result.push(c);
                }
                i += 6;
            }
            b'x' if i + 3 < bytes.len() && bytes[i + 2..i + 4].iter().all(u8::is_ascii_hexdigit) => {
                let code = u32::from_str_radix(
                    std::str::from_utf8(&bytes[i + 2..i + 4]).unwrap_or("0"),
                    16,
                )
                .unwrap_or(0);
                result.push((code as u8) as char);
                i += 4;
            }
            b'n' => {
                result.push('\n');
                i += 2;
            }
            b'r' => {
                result.push('\r');
                i += 2;
            }
            b't' => {
                result.push('\t');
                i += 2;
            }
            c => {
                result.push(c as char);
                i += 2;
            }
        }
    }
    *output = result;
    true
}

fn normalise_path(input: &str, output: &mut String) -> bool {
    let absolute = input.starts_with('/');
    let trailing_slash = input.ends_with('/') && input.len() > 1;
    let mut segments: Vec<&str> = Vec::new();
    for segment in input.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                if !segments.is_empty() && *segments.last().unwrap() != ".." {
                    segments.pop();
                } else if !absolute {
                    segments.push("..");
                }
            }
            s => segments.push(s),
        }
    }
    let mut result = String::with_capacity(input.len());
    if absolute {
        result.push('/');
    }
    result.push_str(&segments.join("/"));
    if trailing_slash && !result.ends_with('/') {
        result.push('/');
    }
    if result == input {
        return false;
    }
    *output = result;
    true
}

fn parity(input: &str, output: &mut String, mode: Parity) -> bool {
    let result: String = input
        .bytes()
        .map(|b| {
            let low = b & 0x7f;
            let with_parity = match mode {
                Parity::Zero => low,
                Parity::Even => {
                    if low.count_ones() % 2 == 1 {
                        low | 0x80
                    } else {
                        low
                    }
                }
                Parity::Odd => {
                    if low.count_ones() % 2 == 0 {
                        low | 0x80
                    } else {
                        low
                    }
                }
            };
            with_parity as char
        })
        .collect();
    if result == input {
        return false;
    }
    *output = result;
    true
}

fn remove_comments(input: &str, output: &mut String, mode: CommentMode) -> bool {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;
    let mut changed = false;
    loop {
        match rest.find("/*") {
            None => {
                if let CommentMode::Remove = mode {
                    // line comments: -- and # cut to end of line
                    if let Some(pos) = rest.find("--").into_iter().chain(rest.find('#')).min() {
                        result.push_str(&rest[..pos]);
                        if let Some(nl) = rest[pos..].find('\n') {
                            rest = &rest[pos + nl..];
                            changed = true;
                            continue;
                        }
                        changed = true;
                        break;
                    }
                }
                result.push_str(rest);
                break;
            }
            Some(start) => {
                result.push_str(&rest[..start]);
                changed = true;
                if let CommentMode::Replace = mode {
                    result.push(' ');
                }
                match rest[start + 2..].find("*/") {
                    Some(end) => rest = &rest[start + 2 + end + 2..],
                    None => break,
                }
            }
        }
    }
    if !changed {
        return false;
    }
    *output = result;
    true
}

fn remove_comments_char(input: &str, output: &mut String) -> bool {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;
    let mut changed = false;
    while !rest.is_empty() {
        if let Some(stripped) = rest
            .strip_prefix("/*")
            .or_else(|| rest.strip_prefix("*/"))
            .or_else(|| rest.strip_prefix("<!--"))
            .or_else(|| rest.strip_prefix("-->"))
            .or_else(|| rest.strip_prefix("--"))
            .or_else(|| rest.strip_prefix("#"))
        {
            rest = stripped;
            changed = true;
        } else {
            let mut chars = rest.chars();
            result.push(chars.next().unwrap());
            rest = chars.as_str();
        }
    }
    if !changed {
        return false;
    }
    *output = result;
    true
}

fn sql_hex_decode(input: &str, output: &mut String) -> bool {
    let bytes = input.as_bytes();
    let mut result = String::with_capacity(bytes.len());
    let mut i = 0;
    let mut changed = false;
    while i < bytes.len() {
        if (bytes[i] == b'0')
            && i + 1 < bytes.len()
            && (bytes[i + 1] == b'x' || bytes[i + 1] == b'X')
        {
            let mut j = i + 2;
            while j < bytes.len() && bytes[j].is_ascii_hexdigit() {
                j += 1;
            }
            let digits = j - (i + 2);
            if digits >= 2 {
                let even_end = i + 2 + digits - (digits % 2);
                for pair in bytes[i + 2..even_end].chunks(2) {
                    let hi = (pair[0] as char).to_digit(16).unwrap_or(0) as u8;
                    let lo = (pair[1] as char).to_digit(16).unwrap_or(0) as u8;
                    result.push(((hi << 4) | lo) as char);
                }
                changed = true;
                i = j;
                continue;
            }
        }
        result.push(bytes[i] as char);
        i += 1;
    }
    if !changed {
        return false;
    }
    *output = result;
    true
}

fn url_decode(input: &str, output: &mut String, unicode: bool, config: &EngineConfig) -> bool {
    if !input.contains('%') && !input.contains('+') {
        return false;
    }
    let bytes = input.as_bytes();
    let mut result = String::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                result.push(' ');
                i += 1;
            }
            b'%' => {
                if unicode
                    && i + 5 < bytes.len()
                    && (bytes[i + 1] == b'u' || bytes[i + 1] == b'U')
                    && bytes[i + 2..i + 6].iter().all(u8::is_ascii_hexdigit)
                {
                    let code = u32::from_str_radix(
                        std::str::from_utf8(&bytes[i + 2..i + 6]).unwrap_or("0"),
                        16,
                    )
                    .unwrap_or(0);
                    let mapped = config
                        .unicode_map
                        .get(&code)
                        .copied()
                        .unwrap_or(if (0xff01..=0xff5e).contains(&code) {
                            code - 0xff00 + 0x20
                        } else if code <= 0xff {
                            code
                        } else {
                            code & 0xff
                        });
                    result.push((mapped as u8) as char);
                    i += 6;
                } else if i + 2 < bytes.len()
                    && bytes[i + 1].is_ascii_hexdigit()
                    && bytes[i + 2].is_ascii_hexdigit()
                {
                    let hi = (bytes[i + 1] as char).to_digit(16).unwrap_or(0) as u8;
                    let lo = (bytes[i + 2] as char).to_digit(16).unwrap_or(0) as u8;
                    result.push(((hi << 4) | lo) as char);
                    i += 3;
                } else {
                    result.push('%');
                    i += 1;
                }
            }
            b => {
                result.push(b as char);
                i += 1;
            }
        }
    }
    *output = result;
    true
}

fn url_encode(input: &str, output: &mut String) -> bool {
    let mut changed = false;
    let mut result = String::with_capacity(input.len());
    for b in input.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' => {
                result.push(b as char)
            }
            b' ' => {
                result.push('+');
                changed = true;
            }
            b => {
                result.push_str(&format!("%{b:02x}"));
                changed = true;
            }
        }
    }
    if !changed {
        return false;
    }
    *output = result;
    true
}

fn utf8_to_unicode(input: &str, output: &mut String) -> bool {
    if input.is_ascii() {
        return false;
    }
    let mut result = String::with_capacity(input.len());
    for c in input.chars() {
        if c.is_ascii() {
            result.push(c);
        } else {
            result.push_str(&format!("%u{:04x}", c as u32));
        }
    }
    *output = result;
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(t: Transform, input: &str) -> Option<String> {
        let mut out = String::new();
        let config = EngineConfig::default();
        t.evaluate(input, &mut out, &config).then_some(out)
    }

    #[test]
    fn test_lowercase_reports_no_change() {
        assert_eq!(apply(Transform::Lowercase, "MiXeD"), Some("mixed".into()));
        assert_eq!(apply(Transform::Lowercase, "quiet"), None);
    }

    #[test]
    fn test_url_decode() {
        assert_eq!(
            apply(Transform::UrlDecode, "a%20b+c"),
            Some("a b c".into())
        );
        assert_eq!(apply(Transform::UrlDecode, "plain"), None);
    }

    #[test]
    fn test_url_decode_uni() {
        assert_eq!(
            apply(Transform::UrlDecodeUni, "%u0041%42"),
            Some("AB".into())
        );
        // full-width S folds back to ASCII
        assert_eq!(apply(Transform::UrlDecodeUni, "%uFF33"), Some("S".into()));
    }

    #[test]
    fn test_base64_round_trip() {
        assert_eq!(
            apply(Transform::Base64Decode, "ZXZpbA=="),
            Some("evil".into())
        );
        assert_eq!(
            apply(Transform::Base64Encode, "evil"),
            Some("ZXZpbA==".into())
        );
        assert_eq!(
            apply(Transform::Base64DecodeExt, "ZX Zp bA=="),
            Some("evil".into())
        );
    }

    #[test]
    fn test_compress_whitespace() {
        assert_eq!(
            apply(Transform::CompressWhitespace, "a  b\t\nc"),
            Some("a b c".into())
        );
        assert_eq!(apply(Transform::CompressWhitespace, "a b"), None);
    }

    #[test]
    fn test_normalise_path() {
        assert_eq!(
            apply(Transform::NormalisePath, "/a/./b/../c"),
            Some("/a/c".into())
        );
        assert_eq!(apply(Transform::NormalisePath, "/a/c"), None);
        assert_eq!(
            apply(Transform::NormalisePathWin, "\\a\\..\\b"),
            Some("/b".into())
        );
    }

    #[test]
    fn test_length_converts_to_int() {
        assert!(Transform::Length.converts_to_int());
        assert_eq!(apply(Transform::Length, "four"), Some("4".into()));
    }

    #[test]
    fn test_html_entity_decode() {
        assert_eq!(
            apply(Transform::HtmlEntityDecode, "&lt;b&gt;&#65;&#x42;"),
            Some("<b>AB".into())
        );
        assert_eq!(apply(Transform::HtmlEntityDecode, "no entities"), None);
    }

    #[test]
    fn test_hex_codecs() {
        assert_eq!(apply(Transform::HexEncode, "AB"), Some("4142".into()));
        assert_eq!(apply(Transform::HexDecode, "4142"), Some("AB".into()));
        assert_eq!(apply(Transform::HexDecode, "41g2"), None);
    }

    #[test]
    fn test_cmd_line() {
        assert_eq!(
            apply(Transform::CmdLine, "NET\" \"User;add"),
            Some("net user add".into())
        );
    }

    #[test]
    fn test_sql_hex_decode() {
        assert_eq!(
            apply(Transform::SqlHexDecode, "0x414243 rest"),
            Some("ABC rest".into())
        );
        assert_eq!(apply(Transform::SqlHexDecode, "0x rest"), None);
    }

    #[test]
    fn test_js_decode() {
        assert_eq!(apply(Transform::JsDecode, r"A\x42"), Some("AB".into()));
        assert_eq!(apply(Transform::JsDecode, r"a\'b"), Some("a'b".into()));
    }

    #[test]
    fn test_trim_family() {
        assert_eq!(apply(Transform::Trim, "  x  "), Some("x".into()));
        assert_eq!(apply(Transform::TrimLeft, "  x  "), Some("x  ".into()));
        assert_eq!(apply(Transform::TrimRight, "  x  "), Some("  x".into()));
        assert_eq!(apply(Transform::Trim, "x"), None);
    }

    #[test]
    fn test_digests_are_hex() {
        let md5 = apply(Transform::Md5, "abc").unwrap();
        assert_eq!(md5, "900150983cd24fb0d6963f7d28e17f72");
        let sha1 = apply(Transform::Sha1, "abc").unwrap();
        assert_eq!(sha1, "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_parity() {
        // 'a' = 0x61 has three set bits: even parity sets the high bit
        let out = apply(Transform::ParityEven7Bit, "a").unwrap();
        assert_eq!(out, "\u{e1}");
        assert_eq!(apply(Transform::ParityZero7Bit, "a"), None);
    }

    #[test]
    fn test_decoded_high_bytes_stay_distinct() {
        // decoded bytes embed as U+00xx scalars, never the replacement char
        assert_eq!(apply(Transform::HexDecode, "ff41"), Some("\u{ff}A".into()));
        assert_ne!(
            apply(Transform::HexDecode, "fe41"),
            apply(Transform::HexDecode, "ff41")
        );
        assert_eq!(
            apply(Transform::UrlDecode, "%80%81"),
            Some("\u{80}\u{81}".into())
        );
        assert_eq!(apply(Transform::CssDecode, r"\ff"), Some("\u{ff}".into()));
    }
}
