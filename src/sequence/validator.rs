use super::parser::parse_sequence;

/// Validate a raw sequence, returning every problem found.
///
/// An empty list means the sequence is valid. Offending fragments appear
/// verbatim, structural messages precede the fragments they refer to, and no
/// entry is repeated.
pub fn validate(source: &str) -> Vec<String> {
    match parse_sequence(source) {
        Ok(_) => Vec::new(),
        Err(diagnostics) => diagnostics.into_messages(),
    }
}
