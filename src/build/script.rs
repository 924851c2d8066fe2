// ABOUTME: Composition of build steps into one fail-fast shell script.
// ABOUTME: All step output is appended to a single run log by one trailing redirect.

/// A composed script and the log file its output is appended to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunScript {
    pub text: String,
    pub log_path: String,
}

/// Join steps behind `set -e` and redirect the whole group into the log once.
pub fn compose<S: AsRef<str>>(steps: &[S], log_path: &str) -> RunScript {
    let body = if steps.is_empty() {
        ":".to_string()
    } else {
        steps
            .iter()
            .map(|s| s.as_ref().trim().trim_end_matches(';'))
            .collect::<Vec<_>>()
            .join("; ")
    };
    RunScript {
        text: format!("set -e; {{ {}; }} >> {} 2>&1", body, quote(log_path)),
        log_path: log_path.to_string(),
    }
}

/// Script that appends an error banner and message to an existing run log.
pub fn failure_log_script(log_path: &str, message: &str) -> RunScript {
    RunScript {
        text: format!(
            "printf '%s\\n' '' '==================== ERROR ====================' {} >> {}",
            quote(message),
            quote(log_path)
        ),
        log_path: log_path.to_string(),
    }
}

/// Quote a shell word unless it is made only of characters that never need it.
pub fn quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:@%+=,".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', "'\\''"))
    }
}
