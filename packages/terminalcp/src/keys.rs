//! Key Notation Translator
//!
//! Maps symbolic key tokens (`Up`, `C-c`, `M-x`, `F5`, ...) to the byte
//! sequences an xterm would emit in normal keypad mode. Tokens that are
//! neither a recognized name nor a modifier form pass through verbatim as
//! literal text.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid key token: {0:?}")]
pub struct InvalidKey(pub String);

/// Translate one key token to the bytes a terminal would emit.
///
/// Resolution order: named key, `C-`/`M-` modifier forms (which compose, so
/// `C-M-x` and `M-Up` work), then literal passthrough. Modifier forms with
/// an untranslatable remainder, and `F<n>` names outside F1-F12, fail with
/// [`InvalidKey`]; anything else is treated as text to type.
pub fn translate(token: &str) -> Result<Vec<u8>, InvalidKey> {
    if let Some(bytes) = named_key(token) {
        return Ok(bytes);
    }

    if let Some(rest) = token.strip_prefix("C-") {
        return ctrl_key(token, rest);
    }

    if let Some(rest) = token.strip_prefix("M-") {
        // Meta is an ESC prefix on whatever the rest translates to.
        if rest.is_empty() {
            return Err(InvalidKey(token.to_string()));
        }
        let mut bytes = vec![0x1b];
        bytes.extend(translate(rest).map_err(|_| InvalidKey(token.to_string()))?);
        return Ok(bytes);
    }

    // F13, F0, F99... collide with the named-key namespace; reject rather
    // than silently typing the letters.
    if is_unknown_function_key(token) {
        return Err(InvalidKey(token.to_string()));
    }

    Ok(token.as_bytes().to_vec())
}

fn named_key(token: &str) -> Option<Vec<u8>> {
    let bytes: &[u8] = match token {
        "Up" => b"\x1b[A",
        "Down" => b"\x1b[B",
        "Right" => b"\x1b[C",
        "Left" => b"\x1b[D",
        "Home" => b"\x1b[H",
        "End" => b"\x1b[F",
        "Insert" => b"\x1b[2~",
        "Delete" => b"\x1b[3~",
        "PageUp" => b"\x1b[5~",
        "PageDown" => b"\x1b[6~",
        "Tab" => b"\t",
        "BackTab" => b"\x1b[Z",
        "Backspace" => b"\x7f",
        "Enter" => b"\r",
        "Escape" => b"\x1b",
        "Space" => b" ",
        "F1" => b"\x1bOP",
        "F2" => b"\x1bOQ",
        "F3" => b"\x1bOR",
        "F4" => b"\x1bOS",
        "F5" => b"\x1b[15~",
        "F6" => b"\x1b[17~",
        "F7" => b"\x1b[18~",
        "F8" => b"\x1b[19~",
        "F9" => b"\x1b[20~",
        "F10" => b"\x1b[21~",
        "F11" => b"\x1b[23~",
        "F12" => b"\x1b[24~",
        _ => return None,
    };
    Some(bytes.to_vec())
}

fn ctrl_key(token: &str, rest: &str) -> Result<Vec<u8>, InvalidKey> {
    // C-M-x is ESC plus the control byte.
    if let Some(meta_rest) = rest.strip_prefix("M-") {
        let mut bytes = vec![0x1b];
        bytes.extend(ctrl_key(token, meta_rest)?);
        return Ok(bytes);
    }

    let mut chars = rest.chars();
    let (c, trailing) = match (chars.next(), chars.next()) {
        (Some(c), None) => (c, false),
        _ => (' ', true),
    };

    if !trailing {
        if let Some(byte) = ctrl_char(c) {
            return Ok(vec![byte]);
        }
    } else if rest == "Space" {
        return Ok(vec![0x00]);
    }

    Err(InvalidKey(token.to_string()))
}

/// Fold a character onto its control byte, xterm style.
fn ctrl_char(c: char) -> Option<u8> {
    match c {
        'a'..='z' => Some(c as u8 & 0x1f),
        'A'..='Z' => Some(c.to_ascii_lowercase() as u8 & 0x1f),
        ' ' | '@' => Some(0x00),
        '[' => Some(0x1b),
        '\\' => Some(0x1c),
        ']' => Some(0x1d),
        '^' => Some(0x1e),
        '_' => Some(0x1f),
        '?' => Some(0x7f),
        _ => None,
    }
}

fn is_unknown_function_key(token: &str) -> bool {
    let Some(rest) = token.strip_prefix('F') else {
        return false;
    };
    !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
}
