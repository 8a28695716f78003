//! Lenient phone number parsing: calling-code country and velocity prefix.

pub const UNKNOWN_COUNTRY: &str = "UNKNOWN";

const PREFIX_LEN: usize = 7;

const CALLING_CODES: &[(&str, &str)] = &[
    ("1", "US"),
    ("44", "GB"),
    ("49", "DE"),
    ("33", "FR"),
    ("81", "JP"),
    ("86", "CN"),
    ("91", "IN"),
    ("55", "BR"),
    ("52", "MX"),
    ("62", "ID"),
    ("63", "PH"),
    ("234", "NG"),
    ("92", "PK"),
    ("66", "TH"),
    ("84", "VN"),
    ("61", "AU"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPhone {
    /// ISO country code, or `UNKNOWN`
    pub country: String,
    /// Leading digits used to group numbers from the same range
    pub prefix: String,
    /// All digits, no formatting
    pub digits: String,
}

/// Parse anything that looks like a phone number. Never fails: unrecognized
/// calling codes map to `UNKNOWN`.
pub fn parse_phone_number(raw: &str) -> ParsedPhone {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();

    let country = [3, 2, 1]
        .iter()
        .filter(|&&len| digits.len() >= len)
        .find_map(|&len| lookup_calling_code(&digits[..len]))
        .unwrap_or(UNKNOWN_COUNTRY)
        .to_string();

    let prefix = digits.chars().take(PREFIX_LEN).collect();

    ParsedPhone {
        country,
        prefix,
        digits,
    }
}

fn lookup_calling_code(code: &str) -> Option<&'static str> {
    CALLING_CODES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, country)| *country)
}
