//! Scan normalization.
//!
//! Maps a raw scanner payload plus an optional format hint onto a
//! `(code_type, normalized_value)` pair. Handles GS1 element strings
//! (symbology prefixes, parenthesized and bare application identifiers),
//! GTIN-14 normalization, UPC-E expansion, and free-text fallbacks.
//! Pure; no I/O.

const GS: char = '\u{1d}';

/// GS1 symbology identifier prefixes emitted by imagers.
const SYMBOLOGY_PREFIXES: [&str; 4] = ["]C1", "]d2", "]Q3", "]e0"];

/// Fixed-length application identifiers we understand.
const FIXED_AIS: [(&str, usize); 4] = [("01", 14), ("11", 6), ("15", 6), ("17", 6)];

/// Variable-length AIs, terminated by GS or end of input. Max 20 chars.
const VARIABLE_AIS: [&str; 2] = ["10", "21"];

const VARIABLE_AI_MAX: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedScan {
    pub code_type: String,
    pub normalized_value: String,
    pub metadata: Option<ScanMetadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanMetadata {
    pub batch: Option<String>,
    pub expiry: Option<String>,
    pub serial: Option<String>,
}

impl ScanMetadata {
    fn is_empty(&self) -> bool {
        self.batch.is_none() && self.expiry.is_none() && self.serial.is_none()
    }
}

/// Normalize a raw scan. Returns `None` when nothing usable remains.
pub fn normalize_scan(format_hint: Option<&str>, raw: &str) -> Option<NormalizedScan> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }

    let hint = format_hint.map(|h| h.trim().to_ascii_lowercase());
    let hint = hint.as_deref();

    if looks_like_gs1(hint, text) {
        if let Some(scan) = parse_gs1(text) {
            return Some(scan);
        }
    }

    let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
    if (8..=14).contains(&digits.len()) {
        let expanded = if is_upc_e_hint(hint) {
            expand_upc_e(&digits)
        } else {
            None
        };
        let value = expanded.unwrap_or(digits);
        return Some(NormalizedScan {
            code_type: numeric_code_type(hint).to_string(),
            normalized_value: format!("{:0>14}", value),
            metadata: None,
        });
    }

    let cleaned: String = text.chars().filter(|c| !c.is_ascii_control()).collect();
    let cleaned = cleaned.trim().to_string();
    if cleaned.is_empty() {
        return None;
    }
    Some(NormalizedScan {
        code_type: text_code_type(hint).to_string(),
        normalized_value: cleaned,
        metadata: None,
    })
}

fn looks_like_gs1(hint: Option<&str>, text: &str) -> bool {
    if hint.map_or(false, |h| h.contains("gs1")) {
        return true;
    }
    if SYMBOLOGY_PREFIXES.iter().any(|p| text.starts_with(p)) {
        return true;
    }
    if text.contains(GS) {
        return true;
    }
    if text.starts_with('(') {
        return true;
    }
    text.starts_with("01") && text.len() >= 16
}

fn is_upc_e_hint(hint: Option<&str>) -> bool {
    matches!(hint, Some("upc_e") | Some("upc-e") | Some("upce"))
}

fn numeric_code_type(hint: Option<&str>) -> &str {
    match hint {
        Some(h) if h.contains("gs1") => "GS1",
        Some(h) if h.contains("ean") => "EAN",
        Some(h) if h.contains("upc") => "UPC",
        Some(h) if h.contains("code") && h.contains("128") => "CODE128",
        Some(h) if h.contains("qr") => "QR",
        Some(h) if h.contains("data") && h.contains("matrix") => "DATAMATRIX",
        Some("") | None => "EAN",
        Some(_) => "EAN",
    }
}

fn text_code_type(hint: Option<&str>) -> &str {
    match hint {
        Some(h) if h.contains("qr") => "QR_TEXT",
        Some(h) if h.contains("code") && h.contains("128") => "CODE128_TEXT",
        Some(h) if h.contains("data") && h.contains("matrix") => "DATAMATRIX_TEXT",
        _ => "UNKNOWN_TEXT",
    }
}

/// Left-pad an 8/12/13-digit AI 01 value to GTIN-14. Rejects other lengths.
fn to_gtin14(digits: &str) -> Option<String> {
    match digits.len() {
        8 | 12 | 13 | 14 => Some(format!("{:0>14}", digits)),
        _ => None,
    }
}

fn parse_gs1(text: &str) -> Option<NormalizedScan> {
    let mut body = text;
    for prefix in SYMBOLOGY_PREFIXES {
        if let Some(stripped) = body.strip_prefix(prefix) {
            body = stripped;
            break;
        }
    }

    let elements = if body.starts_with('(') {
        parse_parenthesized(body)
    } else {
        parse_bare(body)
    };

    let mut gtin = None;
    let mut metadata = ScanMetadata::default();
    let mut best_before = None;
    for (ai, value) in elements {
        match ai.as_str() {
            "01" => gtin = to_gtin14(&value),
            "10" => metadata.batch = Some(value),
            "15" => best_before = Some(value),
            "17" => metadata.expiry = Some(value),
            "21" => metadata.serial = Some(value),
            _ => {}
        }
    }
    if metadata.expiry.is_none() {
        metadata.expiry = best_before;
    }

    let gtin = gtin?;
    Some(NormalizedScan {
        code_type: "GS1".to_string(),
        normalized_value: gtin,
        metadata: if metadata.is_empty() { None } else { Some(metadata) },
    })
}

/// `(AI)value(AI)value...` form produced by human-readable transcriptions.
fn parse_parenthesized(body: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut rest = body;
    while let Some(open) = rest.find('(') {
        let after_open = &rest[open + 1..];
        let Some(close) = after_open.find(')') else {
            break;
        };
        let ai = after_open[..close].to_string();
        let after_close = &after_open[close + 1..];
        let value_end = after_close.find('(').unwrap_or(after_close.len());
        let value = after_close[..value_end].trim_matches(GS).to_string();
        if !ai.is_empty() && !value.is_empty() {
            out.push((ai, value));
        }
        rest = &after_close[value_end..];
    }
    out
}

/// Concatenated AI form: fixed-length AIs run back to back, variable-length
/// AIs are terminated by a GS character or the end of the input.
fn parse_bare(body: &str) -> Vec<(String, String)> {
    let chars: Vec<char> = body.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == GS {
            i += 1;
            continue;
        }
        if i + 2 > chars.len() {
            break;
        }
        let ai: String = chars[i..i + 2].iter().collect();
        i += 2;

        if let Some(&(_, len)) = FIXED_AIS.iter().find(|(a, _)| *a == ai) {
            if i + len > chars.len() {
                break;
            }
            let value: String = chars[i..i + len].iter().collect();
            i += len;
            out.push((ai, value));
        } else if VARIABLE_AIS.contains(&ai.as_str()) {
            let mut end = i;
            while end < chars.len() && chars[end] != GS && end - i < VARIABLE_AI_MAX {
                end += 1;
            }
            let value: String = chars[i..end].iter().collect();
            i = end;
            if !value.is_empty() {
                out.push((ai, value));
            }
        } else {
            // Unknown AI: everything past this point is unparseable.
            break;
        }
    }
    out
}

/// Expand UPC-E (number system + 6 code digits, with or without its check
/// digit) to a full 12-digit UPC-A. The UPC-E check digit, when present, is
/// defined over the expanded form, so it is recomputed rather than copied.
fn expand_upc_e(digits: &str) -> Option<String> {
    let d: Vec<u8> = digits.bytes().map(|b| b - b'0').collect();
    let (num, code) = match d.len() {
        6 => (0, &d[0..6]),
        7 => (d[0], &d[1..7]),
        8 => (d[0], &d[1..7]),
        _ => return None,
    };
    let (d1, d2, d3, d4, d5, d6) = (code[0], code[1], code[2], code[3], code[4], code[5]);

    let body = match d6 {
        0 | 1 | 2 => format!("{num}{d1}{d2}{d6}0000{d3}{d4}{d5}"),
        3 => format!("{num}{d1}{d2}{d3}00000{d4}{d5}"),
        4 => format!("{num}{d1}{d2}{d3}{d4}00000{d5}"),
        _ => format!("{num}{d1}{d2}{d3}{d4}{d5}0000{d6}"),
    };
    let check = gtin_check_digit(&body);
    Some(format!("{body}{check}"))
}

/// Mod-10 check digit: weight 3 on the rightmost body digit, alternating.
fn gtin_check_digit(body: &str) -> u8 {
    let sum: u32 = body
        .bytes()
        .rev()
        .enumerate()
        .map(|(i, b)| {
            let digit = (b - b'0') as u32;
            if i % 2 == 0 {
                digit * 3
            } else {
                digit
            }
        })
        .sum();
    ((10 - sum % 10) % 10) as u8
}
