/// Lowercases and reduces punctuation runs to single spaces, so
/// `"ALBERT-Praha, 4"` and `"albert praha 4"` compare equal.
pub fn fold(s: &str) -> String {
    s.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Account number without its `/bankcode` suffix.
pub fn account_base(account: &str) -> &str {
    account.split('/').next().unwrap_or(account).trim()
}

/// Up to three leading digit-free words of the folded description.
/// Card numbers, dates and reference codes vary per payment; the merchant
/// words in front of them do not.
pub fn description_pattern(description: &str) -> Option<String> {
    let words: Vec<String> = fold(description)
        .split(' ')
        .take_while(|w| !w.chars().any(|c| c.is_ascii_digit()))
        .filter(|w| w.chars().count() > 1)
        .take(3)
        .map(str::to_string)
        .collect();
    (!words.is_empty()).then(|| words.join(" "))
}
