//! Escape sequences for delimiter characters carried as data.
//!
//! | Sequence | Meaning |
//! |---|---|
//! | `\F\` | field separator |
//! | `\S\` | component separator |
//! | `\T\` | sub-component separator |
//! | `\R\` | repetition separator |
//! | `\E\` | escape character |
//!
//! Any other escape sequence (`\X0D\`, `\.br\`...) is left verbatim by [`unescape`].

use std::borrow::Cow;

use super::Delimiters;

/// Replaces every delimiter character in `value` with its escape sequence.
pub fn escape<'a>(value: &'a str, delimiters: &Delimiters) -> Cow<'a, str> {
    if !value.chars().any(|c| delimiters.is_reserved(c)) {
        return Cow::Borrowed(value);
    }

    let mut out = String::with_capacity(value.len() + 8);
    for c in value.chars() {
        match code_for(c, delimiters) {
            Some(code) => {
                out.push(delimiters.escape);
                out.push(code);
                out.push(delimiters.escape);
            }
            None => out.push(c),
        }
    }
    Cow::Owned(out)
}

/// Reverses [`escape`]. Unrecognised or unterminated sequences pass through untouched.
pub fn unescape<'a>(value: &'a str, delimiters: &Delimiters) -> Cow<'a, str> {
    if !value.contains(delimiters.escape) {
        return Cow::Borrowed(value);
    }

    let chars: Vec<char> = value.chars().collect();
    let mut out = String::with_capacity(value.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == delimiters.escape {
            // single letter sequences only: \F\ \S\ \T\ \R\ \E\
            if i + 2 < chars.len() && chars[i + 2] == delimiters.escape {
                if let Some(literal) = char_for(chars[i + 1], delimiters) {
                    out.push(literal);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(c);
        i += 1;
    }
    Cow::Owned(out)
}

fn code_for(c: char, delimiters: &Delimiters) -> Option<char> {
    if c == delimiters.field {
        Some('F')
    } else if c == delimiters.component {
        Some('S')
    } else if c == delimiters.sub_component {
        Some('T')
    } else if c == delimiters.repetition {
        Some('R')
    } else if c == delimiters.escape {
        Some('E')
    } else {
        None
    }
}

fn char_for(code: char, delimiters: &Delimiters) -> Option<char> {
    match code {
        'F' => Some(delimiters.field),
        'S' => Some(delimiters.component),
        'T' => Some(delimiters.sub_component),
        'R' => Some(delimiters.repetition),
        'E' => Some(delimiters.escape),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn escapes_every_reserved_character() {
        let d = Delimiters::default();
        assert_eq!(escape("a|b^c~d\\e&f", &d), "a\\F\\b\\S\\c\\R\\d\\E\\e\\T\\f");
    }

    #[test]
    fn plain_text_is_borrowed() {
        let d = Delimiters::default();
        assert!(matches!(escape("plain", &d), Cow::Borrowed(_)));
        assert!(matches!(unescape("plain", &d), Cow::Borrowed(_)));
    }

    #[test]
    fn unescapes_known_sequences() {
        let d = Delimiters::default();
        assert_eq!(unescape("Smith\\S\\Jones \\T\\ Co", &d), "Smith^Jones & Co");
    }

    #[test]
    fn unknown_and_dangling_sequences_pass_through() {
        let d = Delimiters::default();
        assert_eq!(unescape("line\\.br\\next", &d), "line\\.br\\next");
        assert_eq!(unescape("ends with \\", &d), "ends with \\");
        assert_eq!(unescape("\\F", &d), "\\F");
    }

    #[test]
    fn honours_custom_delimiters() {
        let d = Delimiters::extract("MSH#$%!*#");
        assert_eq!(escape("a#b$c", &d), "a!F!b!S!c");
        assert_eq!(unescape("a!F!b!S!c", &d), "a#b$c");
    }

    #[test]
    fn escaped_text_survives_a_round_trip() {
        let d = Delimiters::default();
        let escaped = "\\F\\\\S\\\\T\\\\R\\\\E\\";
        assert_eq!(escape(&unescape(escaped, &d), &d), escaped);
    }

    proptest! {
        #[test]
        fn unescape_inverts_escape(value in "[a-zA-Z0-9 |^~&\\\\]*") {
            let d = Delimiters::default();
            let escaped = escape(&value, &d).into_owned();
            prop_assert_eq!(unescape(&escaped, &d), value);
        }

        #[test]
        fn escape_inverts_unescape_on_escaped_text(value in "[a-zA-Z0-9 |^~&\\\\]*") {
            let d = Delimiters::default();
            let escaped = escape(&value, &d).into_owned();
            let decoded = unescape(&escaped, &d).into_owned();
            prop_assert_eq!(escape(&decoded, &d), escaped);
        }
    }
}
