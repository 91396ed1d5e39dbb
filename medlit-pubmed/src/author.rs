//! Author-name parsing for title/author lookups.

/// Extract the surname from a free-form author string.
///
/// Handles "Last, First", "Last F" and "First Last". With no comma, a final
/// token of at most two characters is taken as initials and the first token
/// is the surname; otherwise the last token is. Short surnames written
/// "First Last" (e.g. "Wei Li") are misread as initials; this is a known
/// accuracy gap kept for compatibility with existing lookups.
pub fn extract_surname(author: &str) -> Option<String> {
    let author = author.trim();
    if author.is_empty() {
        return None;
    }

    if let Some((last, _)) = author.split_once(',') {
        let last = last.trim();
        return (!last.is_empty()).then(|| last.to_string());
    }

    let tokens: Vec<&str> = author.split_whitespace().collect();
    let surname = match tokens.as_slice() {
        [] => return None,
        [only] => *only,
        [first, .., last] if last.chars().count() <= 2 => *first,
        [.., last] => *last,
    };
    Some(surname.to_string())
}

/// Build an esearch term: `<title>[Title] AND <surname>[Author]`.
///
/// Field-tag syntax characters are removed from the title so it cannot
/// change the meaning of the query.
pub fn build_search_term(title: &str, author: Option<&str>) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| if matches!(c, '[' | ']' | '"' | '(' | ')') { ' ' } else { c })
        .collect();
    let title = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");

    match author.and_then(extract_surname) {
        Some(surname) => format!("{title}[Title] AND {surname}[Author]"),
        None => format!("{title}[Title]"),
    }
}
