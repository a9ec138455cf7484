//! Wildcard matching for archive listings and directory enumeration
//!
//! Supports, case-insensitively:
//! - `*` - any run of characters within one path segment (`cfg/*.txt`)
//! - `?` - exactly one character within a segment
//! - `**` - any number of whole segments (`maps/**`)

/// Pattern matcher for logical file names
pub struct PatternMatcher;

impl PatternMatcher {
    /// Check if a logical path matches a pattern
    ///
    /// # Examples
    /// ```
    /// use pakfs::PatternMatcher;
    ///
    /// assert!(PatternMatcher::matches("cfg/*.txt", "CFG/Settings.txt"));
    /// assert!(PatternMatcher::matches("maps/**", "maps/de/dust.bsp"));
    /// assert!(!PatternMatcher::matches("cfg/*", "cfg/sub/a.txt"));
    /// ```
    pub fn matches(pattern: &str, path: &str) -> bool {
        let pattern = Self::normalize(pattern);
        let path = Self::normalize(path);

        if pattern == path {
            return true;
        }
        if !pattern.contains(['*', '?']) {
            return false;
        }

        let pattern_parts: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
        let path_parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        Self::match_parts(&pattern_parts, &path_parts)
    }

    /// Match a single segment (no `/`) against a segment pattern
    pub fn matches_segment(pattern: &str, segment: &str) -> bool {
        let pattern: Vec<char> = pattern.chars().map(|c| c.to_ascii_lowercase()).collect();
        let segment: Vec<char> = segment.chars().map(|c| c.to_ascii_lowercase()).collect();
        Self::match_glob_segment(&pattern, &segment)
    }

    /// Lower-case, slash-normalize, and resolve `.`/`..` components
    fn normalize(path: &str) -> String {
        let path = path.replace('\\', "/").to_ascii_lowercase();
        let mut resolved: Vec<&str> = Vec::new();

        for part in path.split('/').filter(|s| !s.is_empty()) {
            match part {
                "." => continue,
                ".." => {
                    resolved.pop();
                }
                _ => resolved.push(part),
            }
        }

        resolved.join("/")
    }

    fn match_parts(pattern: &[&str], path: &[&str]) -> bool {
        match (pattern.first(), path.first()) {
            (None, None) => true,
            (None, Some(_)) => false,
            // Path exhausted - only trailing ** can still match
            (Some(_), None) => pattern.iter().all(|&p| p == "**"),
            (Some(&"**"), Some(_)) => {
                (0..=path.len()).any(|skip| Self::match_parts(&pattern[1..], &path[skip..]))
            }
            (Some(&pat), Some(&seg)) => {
                Self::matches_segment(pat, seg) && Self::match_parts(&pattern[1..], &path[1..])
            }
        }
    }

    /// Iterative glob match with single-star backtracking
    fn match_glob_segment(pattern: &[char], segment: &[char]) -> bool {
        let (mut p, mut s) = (0, 0);
        let mut star: Option<(usize, usize)> = None;

        while s < segment.len() {
            if p < pattern.len() && (pattern[p] == '?' || pattern[p] == segment[s]) {
                p += 1;
                s += 1;
            } else if p < pattern.len() && pattern[p] == '*' {
                star = Some((p, s));
                p += 1;
            } else if let Some((star_p, star_s)) = star {
                p = star_p + 1;
                s = star_s + 1;
                star = Some((star_p, star_s + 1));
            } else {
                return false;
            }
        }

        pattern[p..].iter().all(|&c| c == '*')
    }
}

/// Split a find pattern into its literal directory and its last-segment wildcard
///
/// `"cfg/sub/*.txt"` becomes `("cfg/sub", "*.txt")`; a bare `"*.txt"` has an
/// empty directory part.
pub fn split_wildcard(pattern: &str) -> (String, String) {
    let pattern = pattern.replace('\\', "/");
    let pattern = pattern.trim_start_matches("./").trim_start_matches('/');
    match pattern.rfind('/') {
        Some(idx) => (
            pattern[..idx].trim_end_matches('/').to_string(),
            pattern[idx + 1..].to_string(),
        ),
        None => (String::new(), pattern.to_string()),
    }
}
