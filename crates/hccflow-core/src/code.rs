//! ICD-10 code normalisation.
//!
//! Codes arrive in whatever shape the extractor or the reference table wrote
//! them ("E11.65", "e11.65 ", "E11-65", "E1165"). Every comparison in the
//! pipeline happens on the normalised form so that these all collapse to the
//! same lookup key.
//!
//! # ICD-10 shape
//!
//! - First character: a letter (chapter)
//! - Second character: a digit
//! - Category is 3 characters, optional subcategory adds up to 4 more
//! - The dot after the category is presentation only

/// Characters treated as separators and removed during normalisation.
const SEPARATORS: &[char] = &['.', '-', '_'];

/// Normalise a code into its lookup key.
///
/// Input: "E11.65", " e11.65", "E11-65"
/// Output: "E1165"
///
/// Strips separators and whitespace, then upper-cases. No shape validation
/// happens here; use [`is_well_formed`] for that.
pub fn normalize_code(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace() && !SEPARATORS.contains(c))
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Whether a normalised code has the ICD-10 shape.
///
/// 3 to 7 ASCII alphanumerics, a letter first and a digit second.
pub fn is_well_formed(normalized: &str) -> bool {
    let bytes = normalized.as_bytes();
    if !(3..=7).contains(&bytes.len()) {
        return false;
    }
    bytes[0].is_ascii_uppercase()
        && bytes[1].is_ascii_digit()
        && bytes.iter().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

/// Re-insert the category dot for display.
///
/// "E1165" → "E11.65", "I10" → "I10"
pub fn with_dot(normalized: &str) -> String {
    if normalized.len() <= 3 || !normalized.is_ascii() {
        return normalized.to_string();
    }
    format!("{}.{}", &normalized[..3], &normalized[3..])
}
