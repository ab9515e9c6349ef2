use strsim::normalized_levenshtein;

use crate::normalize::fold_diacritics;

// An initial ("k") against the full token it abbreviates ("kylian").
const INITIAL_TOKEN_SCORE: f64 = 0.9;

/// Token-order-insensitive similarity between two names, 0..=100.
///
/// Takes the better of two views: the edit ratio of the sorted token strings,
/// and a one-to-one token alignment where each token of the shorter name is
/// paired with its best unused counterpart in the longer one. Accents are
/// folded before comparison.
pub fn token_similarity(a: &str, b: &str) -> f64 {
    let a = fold_diacritics(a);
    let b = fold_diacritics(b);
    let mut tokens_a: Vec<&str> = a.split_whitespace().collect();
    let mut tokens_b: Vec<&str> = b.split_whitespace().collect();
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }

    tokens_a.sort_unstable();
    tokens_b.sort_unstable();
    let sorted = normalized_levenshtein(&tokens_a.join(" "), &tokens_b.join(" "));
    let aligned = alignment_ratio(&tokens_a, &tokens_b);

    round1(sorted.max(aligned) * 100.0).clamp(0.0, 100.0)
}

fn alignment_ratio(a: &[&str], b: &[&str]) -> f64 {
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };

    let mut pairs = Vec::with_capacity(short.len() * long.len());
    for (i, x) in short.iter().enumerate() {
        for (j, y) in long.iter().enumerate() {
            pairs.push((token_score(x, y), i, j));
        }
    }
    pairs.sort_by(|l, r| r.0.total_cmp(&l.0));

    let mut used_short = vec![false; short.len()];
    let mut used_long = vec![false; long.len()];
    let mut total = 0.0;
    for (score, i, j) in pairs {
        if used_short[i] || used_long[j] {
            continue;
        }
        used_short[i] = true;
        used_long[j] = true;
        total += score;
    }
    total / short.len() as f64
}

fn token_score(x: &str, y: &str) -> f64 {
    if x == y {
        return 1.0;
    }
    let is_initial_of = |initial: &str, full: &str| {
        initial.chars().count() == 1 && full.chars().count() > 1 && full.starts_with(initial)
    };
    if is_initial_of(x, y) || is_initial_of(y, x) {
        return INITIAL_TOKEN_SCORE;
    }
    normalized_levenshtein(x, y)
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_names_score_full() {
        assert_eq!(token_similarity("kylian mbappe", "kylian mbappe"), 100.0);
    }

    #[test]
    fn token_order_is_ignored() {
        assert_eq!(token_similarity("mbappe kylian", "kylian mbappe"), 100.0);
    }

    #[test]
    fn initials_and_accents_align() {
        let score = token_similarity("kylian mbappé", "k mbappe");
        assert!(score >= 90.0, "score was {score}");
    }

    #[test]
    fn unrelated_names_score_low() {
        assert!(token_similarity("j doe", "erling haaland") < 50.0);
        assert_eq!(token_similarity("", "erling haaland"), 0.0);
    }
}
