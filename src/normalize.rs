use deunicode::deunicode;

/// Canonical comparable form of a player or team name.
///
/// Trims, lowercases, drops punctuation (letters with diacritics and digits
/// survive) and collapses runs of whitespace into a single space. Never fails;
/// empty input yields an empty string.
pub fn normalize(input: &str) -> String {
    let lower = input.trim().to_lowercase();
    let mut out = String::with_capacity(lower.len());
    let mut pending_space = false;
    for ch in lower.chars() {
        if ch.is_alphanumeric() || is_combining_mark(ch) {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.push(ch);
        } else if ch.is_whitespace() {
            pending_space = true;
        }
    }
    out
}

pub fn normalize_opt(input: Option<&str>) -> String {
    input.map(normalize).unwrap_or_default()
}

/// ASCII transliteration of an already-normalized name. Only used for
/// similarity scoring; identity keys keep their diacritics.
pub fn fold_diacritics(input: &str) -> String {
    normalize(&deunicode(input))
}

/// Team containment in either direction. Both sides must be normalized and
/// non-empty.
pub fn teams_overlap(query_team: &str, candidate_team: &str) -> bool {
    if query_team.is_empty() || candidate_team.is_empty() {
        return false;
    }
    candidate_team.contains(query_team) || query_team.contains(candidate_team)
}

// Decomposed accents (e.g. "e\u{301}") are not alphanumeric on their own.
fn is_combining_mark(ch: char) -> bool {
    matches!(ch, '\u{0300}'..='\u{036F}' | '\u{1AB0}'..='\u{1AFF}' | '\u{1DC0}'..='\u{1DFF}')
}
