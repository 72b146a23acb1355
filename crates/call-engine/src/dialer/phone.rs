/// Normalize a dial target to E.164.
///
/// Ten digits are taken as a North American number, eleven digits with a
/// leading `1` already carry the country code, and a value that already
/// starts with `+` is kept as given. Anything else gets the digits it
/// contains with a `+` in front.
pub fn normalize_phone(phone: &str) -> String {
    let digits: String = phone.chars().filter(char::is_ascii_digit).collect();

    if digits.len() == 10 {
        return format!("+1{}", digits);
    }
    if digits.len() == 11 && digits.starts_with('1') {
        return format!("+{}", digits);
    }
    if phone.starts_with('+') {
        return phone.to_string();
    }
    format!("+{}", digits)
}
