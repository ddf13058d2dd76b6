//! Terminal input

use std::io::{self, BufRead, Write};

/// Environment variable that supplies the password non-interactively
pub const PASSWORD_ENV: &str = "EZFTP_PASSWORD";

/// Ask for the password, or take it from `EZFTP_PASSWORD` when set.
///
/// Input is read as a plain line; the terminal echoes it.
pub fn password(label: &str) -> anyhow::Result<String> {
    if let Ok(value) = std::env::var(PASSWORD_ENV) {
        return Ok(value);
    }
    line(label)
}

/// Print `label` on stderr and read one trimmed line from stdin
pub fn line(label: &str) -> anyhow::Result<String> {
    let mut stderr = io::stderr();
    write!(stderr, "{label}: ")?;
    stderr.flush()?;

    let mut input = String::new();
    io::stdin().lock().read_line(&mut input)?;
    Ok(input.trim_end_matches(['\r', '\n']).to_string())
}
