//! Wildcard matching for directory listings
//!
//! Supports wildcards:
//! - `*` - Matches any run of characters within one path segment (e.g., `models/*.mdl`)
//! - `?` - Matches exactly one character within a segment
//! - `**` - Matches any number of path segments recursively (e.g., `sound/**`)
//!
//! A pattern without a `/` is matched against the file name only, so
//! `*.wav` finds every `.wav` file regardless of its directory.

/// Compiled wildcard over normalized entry paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wildcard {
    segments: Vec<String>,
    name_only: bool,
}

impl Wildcard {
    /// Compile a pattern
    ///
    /// Matching is case-insensitive and treats `\` as `/`, like entry
    /// path normalization.
    ///
    /// # Examples
    /// ```
    /// use pakfile::Wildcard;
    ///
    /// assert!(Wildcard::new("models/*.mdl").matches("models/a.mdl"));
    /// assert!(Wildcard::new("SOUND/**").matches("sound/weapons/hit.wav"));
    /// assert!(Wildcard::new("*.wav").matches("sound/weapons/hit.wav"));
    /// assert!(!Wildcard::new("models/*").matches("models/props/box.mdl"));
    /// ```
    pub fn new(pattern: &str) -> Self {
        let lowered = pattern.replace('\\', "/").to_lowercase();
        let segments: Vec<String> = lowered
            .split('/')
            .filter(|s| !s.is_empty() && *s != ".")
            .map(str::to_string)
            .collect();
        let name_only = !lowered.contains('/') && segments.len() == 1;

        Wildcard {
            segments,
            name_only,
        }
    }

    /// Check if a normalized entry path matches
    pub fn matches(&self, path: &str) -> bool {
        let path_parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        if self.name_only {
            return match path_parts.last() {
                Some(name) if self.segments[0] == "**" => !name.is_empty(),
                Some(name) => match_segment(self.segments[0].as_bytes(), name.as_bytes()),
                None => false,
            };
        }

        let pattern_parts: Vec<&str> = self.segments.iter().map(String::as_str).collect();
        match_parts(&pattern_parts, &path_parts, 0, 0)
    }
}

/// Recursively match pattern parts against path parts
fn match_parts(pattern: &[&str], path: &[&str], pat_idx: usize, path_idx: usize) -> bool {
    // Both exhausted - match
    if pat_idx >= pattern.len() && path_idx >= path.len() {
        return true;
    }

    // Pattern exhausted but path remains - no match
    if pat_idx >= pattern.len() {
        return false;
    }

    // Path exhausted - only matches if remaining pattern is all **
    if path_idx >= path.len() {
        return pattern[pat_idx..].iter().all(|&p| p == "**");
    }

    match pattern[pat_idx] {
        // ** matches zero or more segments
        "**" => (0..=(path.len() - path_idx))
            .any(|skip| match_parts(pattern, path, pat_idx + 1, path_idx + skip)),
        segment => {
            match_segment(segment.as_bytes(), path[path_idx].as_bytes())
                && match_parts(pattern, path, pat_idx + 1, path_idx + 1)
        }
    }
}

/// Match one segment with `*` and `?` against one path segment
///
/// Iterative with single-star backtracking, so it is linear in practice.
fn match_segment(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&b| b == b'*')
}
