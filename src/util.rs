//! Small stand-alone helpers used throughout the server: logging, time,
//! errno access, config-value parsing and glob-style pattern matching.

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use std::process::exit;
use libc::__errno_location;

#[derive(Clone, Copy, PartialEq, PartialOrd)]
pub enum LogLevel {
    Debug,
    Verbose,
    Notice,
    Warning,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => ".",
            LogLevel::Verbose => "-",
            LogLevel::Notice => "*",
            LogLevel::Warning => "#",
        }
    }
}

/// Log a message at the given level, prefixed with a timestamp, the way the
/// server logs to stdout or a configured log file.
pub fn log(level: LogLevel, msg: &str) {
    use crate::server::server_read;
    if level < *server_read().verbosity() {
        return;
    }
    let now = timestamp().as_secs();
    let line = format!("[{}] {} {}", now, level.as_str(), msg);
    let log_file = server_read().log_file().to_string();
    if log_file.is_empty() {
        println!("{}", line);
    } else {
        use std::fs::OpenOptions;
        use std::io::Write;
        match OpenOptions::new().create(true).append(true).open(&log_file) {
            Ok(mut f) => { let _ = writeln!(f, "{}", line); },
            Err(_) => { println!("{}", line); },
        }
    }
}

/// Called on an unrecoverable allocation or resource failure: log and abort.
pub fn oom(msg: &str) -> ! {
    log(LogLevel::Warning, &format!("Out of memory: {}", msg));
    exit(1);
}

pub fn timestamp() -> Duration {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap()
}

pub fn get_time_ms() -> u128 {
    timestamp().as_millis()
}

pub fn add_ms_to_now(ms: u128) -> u128 {
    get_time_ms() + ms
}

pub fn error() -> i32 {
    unsafe { *__errno_location() }
}

pub fn yes_no_to_bool(s: &str) -> Result<bool, String> {
    match s.to_ascii_lowercase().as_str() {
        "yes" => Ok(true),
        "no" => Ok(false),
        other => Err(format!("argument must be 'yes' or 'no', got '{}'", other)),
    }
}

/// Glob-style matcher over byte strings: `*` matches any run (including
/// empty), `?` matches exactly one byte, `[...]` matches a character class
/// (supporting `^` negation and `a-z` ranges), and `\` escapes the next
/// character literally. Mirrors the classic `stringmatchlen` algorithm.
pub fn string_match(pattern: &[u8], s: &[u8], nocase: bool) -> bool {
    string_match_impl(pattern, s, nocase)
}

fn eq_byte(a: u8, b: u8, nocase: bool) -> bool {
    if nocase {
        a.to_ascii_lowercase() == b.to_ascii_lowercase()
    } else {
        a == b
    }
}

fn string_match_impl(pattern: &[u8], s: &[u8], nocase: bool) -> bool {
    let mut p = 0usize;
    let mut si = 0usize;

    while p < pattern.len() {
        match pattern[p] {
            b'*' => {
                while p + 1 < pattern.len() && pattern[p + 1] == b'*' {
                    p += 1;
                }
                if p + 1 == pattern.len() {
                    return true;
                }
                for skip in 0..=(s.len() - si) {
                    if string_match_impl(&pattern[p + 1..], &s[si + skip..], nocase) {
                        return true;
                    }
                }
                return false;
            },
            b'?' => {
                if si >= s.len() {
                    return false;
                }
                si += 1;
                p += 1;
            },
            b'[' => {
                if si >= s.len() {
                    return false;
                }
                p += 1;
                let negate = p < pattern.len() && pattern[p] == b'^';
                if negate {
                    p += 1;
                }
                let mut matched = false;
                loop {
                    if p >= pattern.len() {
                        break;
                    }
                    if pattern[p] == b']' {
                        p += 1;
                        break;
                    }
                    if pattern[p] == b'\\' && p + 1 < pattern.len() {
                        p += 1;
                        if eq_byte(pattern[p], s[si], nocase) {
                            matched = true;
                        }
                        p += 1;
                    } else if p + 2 < pattern.len() && pattern[p + 1] == b'-' && pattern[p + 2] != b']' {
                        let (mut lo, mut hi) = (pattern[p], pattern[p + 2]);
                        if lo > hi {
                            std::mem::swap(&mut lo, &mut hi);
                        }
                        let c = if nocase { s[si].to_ascii_lowercase() } else { s[si] };
                        let (lo, hi) = if nocase {
                            (lo.to_ascii_lowercase(), hi.to_ascii_lowercase())
                        } else {
                            (lo, hi)
                        };
                        if lo <= c && c <= hi {
                            matched = true;
                        }
                        p += 3;
                    } else {
                        if eq_byte(pattern[p], s[si], nocase) {
                            matched = true;
                        }
                        p += 1;
                    }
                }
                if negate {
                    matched = !matched;
                }
                if !matched {
                    return false;
                }
                si += 1;
            },
            b'\\' if p + 1 < pattern.len() => {
                p += 1;
                if si >= s.len() || !eq_byte(pattern[p], s[si], nocase) {
                    return false;
                }
                si += 1;
                p += 1;
            },
            c => {
                if si >= s.len() || !eq_byte(c, s[si], nocase) {
                    return false;
                }
                si += 1;
                p += 1;
            },
        }
    }

    si == s.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_everything() {
        assert!(string_match(b"*", b"hello", false));
        assert!(string_match(b"*", b"", false));
    }

    #[test]
    fn reflexive_without_meta_chars() {
        assert!(string_match(b"hello", b"hello", false));
        assert!(!string_match(b"hello", b"helloo", false));
    }

    #[test]
    fn question_mark_and_classes() {
        assert!(string_match(b"h?llo", b"hello", false));
        assert!(string_match(b"h[ae]llo", b"hello", false));
        assert!(!string_match(b"h[^ae]llo", b"hello", false));
        assert!(string_match(b"h[a-z]llo", b"hello", false));
    }

    #[test]
    fn escaped_meta() {
        assert!(string_match(b"foo\\*bar", b"foo*bar", false));
        assert!(!string_match(b"foo\\*bar", b"fooXbar", false));
    }
}
