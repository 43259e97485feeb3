//! Shell-style patterns for destination limit keys.
//!
//! - `*` matches zero or more characters
//! - `?` matches exactly one character
//! - `[abc]`, `[a-z]` match one character of the set; `[!..]` or `[^..]` negate

pub fn is_pattern(s: &str) -> bool {
    s.contains('*') || s.contains('?') || s.contains('[')
}

/// Whether `pattern` matches the whole of `input`.
pub fn glob_match(pattern: &str, input: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let input: Vec<char> = input.chars().collect();

    let (mut pi, mut ii) = (0, 0);
    // Last `*` seen and the input position it is currently absorbing up to.
    let mut star: Option<(usize, usize)> = None;

    while ii < input.len() {
        if pi < pattern.len() {
            match pattern[pi] {
                '*' => {
                    star = Some((pi, ii));
                    pi += 1;
                    continue;
                }
                '?' => {
                    pi += 1;
                    ii += 1;
                    continue;
                }
                '[' => {
                    if let Some((matched, len)) = char_class(&pattern[pi..], input[ii]) {
                        if matched {
                            pi += len;
                            ii += 1;
                            continue;
                        }
                    } else if input[ii] == '[' {
                        pi += 1;
                        ii += 1;
                        continue;
                    }
                }
                c if c == input[ii] => {
                    pi += 1;
                    ii += 1;
                    continue;
                }
                _ => {}
            }
        }
        match star {
            Some((star_pi, absorbed)) => {
                pi = star_pi + 1;
                ii = absorbed + 1;
                star = Some((star_pi, absorbed + 1));
            }
            None => return false,
        }
    }

    pattern[pi..].iter().all(|c| *c == '*')
}

/// Match one character against the class opening `pattern`. Returns the
/// outcome and the class length, or `None` for an unterminated class.
fn char_class(pattern: &[char], ch: char) -> Option<(bool, usize)> {
    let mut i = 1;
    let negated = matches!(pattern.get(i), Some('!' | '^'));
    if negated {
        i += 1;
    }
    let mut matched = false;
    let mut first = true;
    while i < pattern.len() {
        let c = pattern[i];
        if c == ']' && !first {
            return Some((matched != negated, i + 1));
        }
        first = false;
        if pattern.get(i + 1) == Some(&'-') && pattern.get(i + 2).is_some_and(|e| *e != ']') {
            if c <= ch && ch <= pattern[i + 2] {
                matched = true;
            }
            i += 3;
        } else {
            if c == ch {
                matched = true;
            }
            i += 1;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_and_question_mark() {
        assert!(glob_match("slurm_*", "slurm_normal"));
        assert!(glob_match("slurm_*", "slurm_"));
        assert!(glob_match("*_long", "slurm_long"));
        assert!(glob_match("k8s_?", "k8s_a"));
        assert!(!glob_match("k8s_?", "k8s_ab"));
        assert!(!glob_match("slurm_*", "local"));
        assert!(glob_match("*", ""));
    }

    #[test]
    fn backtracks_over_repeated_segments() {
        assert!(glob_match("*a*b", "xaxaxb"));
        assert!(!glob_match("*a*b", "xaxax"));
    }

    #[test]
    fn character_classes() {
        assert!(glob_match("node[0-3]", "node2"));
        assert!(!glob_match("node[0-3]", "node7"));
        assert!(glob_match("node[!0-3]", "node7"));
        assert!(glob_match("[]x]", "]"));
        assert!(glob_match("a[b", "a[b"));
    }

    #[test]
    fn detects_patterns() {
        assert!(is_pattern("slurm_*"));
        assert!(!is_pattern("slurm_normal"));
    }
}
