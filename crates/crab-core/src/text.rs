//! Text helpers shared by the daemon and the wrapper: the environment
//! truthiness rule, lossy output decoding, and `VAR=value` command prefixes.

/// Case-insensitive truthiness for wrapper environment variables.
///
/// Recognised true values: `1`, `yes`, `true`, `on`.
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "yes" | "true" | "on"
    )
}

/// Decode captured job output for storage.
///
/// Wrapper output arrives as raw bytes in an 8-bit superset of ASCII; the
/// decode never fails, replacing unrepresentable bytes so the stored text
/// is always valid UTF-8.
pub fn decode_output(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Split leading `VAR=value` words off a command string.
///
/// Cron lines routinely embed variable assignments before the command
/// proper (`CRABID=backup /usr/bin/backup`). Returns the assignments in
/// order and the remaining command text. A word is an assignment when it
/// contains `=` and everything before the `=` is a valid variable name
/// (`[A-Za-z_][A-Za-z0-9_]*`).
pub fn split_embedded_vars(command: &str) -> (Vec<(String, String)>, String) {
    let mut vars = Vec::new();
    let mut rest = command.trim_start();

    loop {
        let word_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let word = &rest[..word_end];

        match word.split_once('=') {
            Some((name, value)) if is_var_name(name) => {
                vars.push((name.to_string(), value.to_string()));
                rest = rest[word_end..].trim_start();
            }
            _ => break,
        }
    }

    (vars, rest.to_string())
}

fn is_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
