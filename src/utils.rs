pub fn column_name_to_number(name: &str) -> Option<u32> {
    if name.is_empty() || name.len() > 3 {
        return None;
    }
    let mut column = 0u32;
    for byte in name.bytes() {
        if !byte.is_ascii_alphabetic() {
            return None;
        }
        column = column * 26 + u32::from(byte.to_ascii_uppercase() - b'A' + 1);
    }
    Some(column)
}

/// Parse an A1-style reference (absolute markers allowed) into (row, col)
pub fn parse_cell_ref(reference: &str) -> Option<(u32, u32)> {
    let cleaned: String = reference.chars().filter(|c| *c != '$').collect();
    let split = cleaned.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = cleaned.split_at(split);
    let col = column_name_to_number(letters)?;
    let row = digits.parse::<u32>().ok().filter(|r| *r > 0)?;
    Some((row, col))
}
