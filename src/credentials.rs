use std::io::{self, IsTerminal, Write};

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};

use crate::catalog::Credentials;
use crate::error::BidsError;

pub const PASSWORD_ENV: &str = "SHANOIR_PASSWORD";

/// Resolves the portal password from the environment or an interactive prompt.
pub fn resolve(username: &str, interactive: bool) -> Result<Credentials, BidsError> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        if !password.is_empty() {
            return Ok(Credentials {
                username: username.to_string(),
                password,
            });
        }
    }
    if !interactive || !io::stdin().is_terminal() {
        return Err(BidsError::MissingCredentials);
    }
    let password = prompt_hidden(&format!("Shanoir password for {username}: "))?;
    if password.is_empty() {
        return Err(BidsError::MissingCredentials);
    }
    Ok(Credentials {
        username: username.to_string(),
        password,
    })
}

fn prompt_hidden(prompt: &str) -> Result<String, BidsError> {
    let mut stderr = io::stderr();
    write!(stderr, "{prompt}").map_err(|err| BidsError::Filesystem(err.to_string()))?;
    stderr
        .flush()
        .map_err(|err| BidsError::Filesystem(err.to_string()))?;

    enable_raw_mode().map_err(|err| BidsError::Filesystem(err.to_string()))?;
    let result = read_hidden_line();
    let restore = disable_raw_mode();
    let _ = writeln!(stderr);
    restore.map_err(|err| BidsError::Filesystem(err.to_string()))?;
    result
}

fn read_hidden_line() -> Result<String, BidsError> {
    let mut buffer = String::new();
    loop {
        let event = event::read().map_err(|err| BidsError::Filesystem(err.to_string()))?;
        let Event::Key(KeyEvent {
            code,
            modifiers,
            kind,
            ..
        }) = event
        else {
            continue;
        };
        if kind != KeyEventKind::Press {
            continue;
        }
        match code {
            KeyCode::Enter => return Ok(buffer),
            KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => {
                return Err(BidsError::MissingCredentials);
            }
            KeyCode::Esc => return Err(BidsError::MissingCredentials),
            KeyCode::Backspace => {
                buffer.pop();
            }
            KeyCode::Char(ch) => buffer.push(ch),
            _ => {}
        }
    }
}
