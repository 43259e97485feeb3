//! Typo suggestion for destination ids and email syntax checks.

/// Largest edit distance that still counts as a typo.
pub const MAX_TYPO_DISTANCE: usize = 2;

/// Suggest the single candidate within [`MAX_TYPO_DISTANCE`] edits of
/// `input`. Returns `None` when nothing is close enough or when two different
/// candidates tie for closest.
pub fn suggest<'a, I>(input: &str, candidates: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut best: Option<(&str, usize)> = None;
    let mut tied = false;

    for candidate in candidates {
        let dist = levenshtein(input, candidate);
        if dist > MAX_TYPO_DISTANCE {
            continue;
        }
        match best {
            None => best = Some((candidate, dist)),
            Some((_, best_dist)) if dist < best_dist => {
                best = Some((candidate, dist));
                tied = false;
            }
            Some((name, best_dist)) if dist == best_dist && name != candidate => tied = true,
            _ => {}
        }
    }

    if tied {
        None
    } else {
        best.map(|(name, _)| name)
    }
}

/// Levenshtein edit distance between two strings.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let n = b.len();

    let mut prev = (0..=n).collect::<Vec<_>>();
    let mut curr = vec![0; n + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[n]
}

/// Loose `local@domain.tld` check.
pub fn is_email(s: &str) -> bool {
    if s.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    match domain.rsplit_once('.') {
        Some((host, tld)) => !host.is_empty() && !tld.is_empty(),
        None => false,
    }
}
