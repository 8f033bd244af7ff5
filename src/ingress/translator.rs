use serde::{Deserialize, Serialize};

const TOPIC_ROOT: &str = "vessels";
const SELF_SEGMENT: &str = "self";

/// What to do with a payload that does not read as a number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NonNumericPolicy {
    /// Keep the message; its value becomes NaN.
    #[default]
    PassThrough,
    /// Treat the message as not ours.
    Reject,
}

/// A wire message that maps onto a path of our own vessel.
#[derive(Debug, Clone)]
pub struct InboundRecord {
    pub context: String,
    pub path: String,
    pub value: f64,
}

#[derive(Debug, Clone)]
pub enum Translation {
    Valid(InboundRecord),
    Invalid,
}

impl Translation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Translation::Valid(_))
    }
}

/// Maps `vessels/self/<path segments>` topics with numeric payloads onto
/// records for the gateway's own vessel.
#[derive(Debug, Clone)]
pub struct InboundTranslator {
    context: String,
    policy: NonNumericPolicy,
}

impl InboundTranslator {
    pub fn new(self_id: &str, policy: NonNumericPolicy) -> Self {
        Self {
            context: format!("{}.{}", TOPIC_ROOT, self_id),
            policy,
        }
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn translate(&self, topic: &str, payload: &[u8]) -> Translation {
        let segments: Vec<&str> = topic.split('/').collect();
        if segments.len() < 3 || segments[0] != TOPIC_ROOT || segments[1] != SELF_SEGMENT {
            return Translation::Invalid;
        }

        let value = parse_number(&String::from_utf8_lossy(payload));
        if value.is_nan() && self.policy == NonNumericPolicy::Reject {
            return Translation::Invalid;
        }

        Translation::Valid(InboundRecord {
            context: self.context.clone(),
            path: segments[2..].join("."),
            value,
        })
    }
}

/// Reads a payload the way a JavaScript `Number()` conversion would:
/// whitespace is trimmed, blank input is zero, `Infinity` and unsigned
/// `0x`/`0o`/`0b` literals are accepted, anything else that is not a decimal
/// literal is NaN.
pub fn parse_number(raw: &str) -> f64 {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return 0.0;
    }

    if let Some(value) = parse_radix_literal(trimmed) {
        return value;
    }

    let (sign, unsigned) = match trimmed.as_bytes()[0] {
        b'-' => (-1.0, &trimmed[1..]),
        b'+' => (1.0, &trimmed[1..]),
        _ => (1.0, trimmed),
    };

    if unsigned == "Infinity" {
        return sign * f64::INFINITY;
    }

    let is_decimal_literal = !unsigned.is_empty()
        && unsigned.bytes().any(|b| b.is_ascii_digit())
        && unsigned
            .bytes()
            .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'+' | b'-'));
    if !is_decimal_literal {
        return f64::NAN;
    }

    trimmed.parse::<f64>().unwrap_or(f64::NAN)
}

fn parse_radix_literal(literal: &str) -> Option<f64> {
    let bytes = literal.as_bytes();
    if bytes.len() < 2 || bytes[0] != b'0' {
        return None;
    }

    let radix = match bytes[1] {
        b'x' | b'X' => 16,
        b'o' | b'O' => 8,
        b'b' | b'B' => 2,
        _ => return None,
    };

    let digits = &literal[2..];
    Some(
        u128::from_str_radix(digits, radix)
            .ok()
            .filter(|_| !digits.starts_with('+'))
            .map(|v| v as f64)
            .unwrap_or(f64::NAN),
    )
}
