use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// Segment code of the header that carries the delimiters.
pub const HEADER_SEGMENT: &str = "MSH";

/// Shortest header that still carries a field separator and the four encoding characters.
const MIN_HEADER_LENGTH: usize = 8;

/// The five special characters governing how one message is split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delimiters {
    pub field: char,
    pub component: char,
    pub repetition: char,
    pub escape: char,
    pub sub_component: char,
}

impl Default for Delimiters {
    fn default() -> Self {
        Delimiters {
            field: '|',
            component: '^',
            repetition: '~',
            escape: '\\',
            sub_component: '&',
        }
    }
}

impl Delimiters {
    /// Reads the delimiters from a raw `MSH` segment, falling back to `| ^ ~ \ &` when the
    /// header is missing, too short or declares the same character twice.
    ///
    /// ```
    /// use hl7_processor::hl7::Delimiters;
    /// let d = Delimiters::extract("MSH#$%!*#APP");
    /// assert_eq!((d.field, d.component, d.sub_component), ('#', '$', '*'));
    /// ```
    pub fn extract(raw_header: &str) -> Delimiters {
        if !raw_header.starts_with(HEADER_SEGMENT) {
            debug!("No MSH header, using default delimiters");
            return Delimiters::default();
        }

        let chars: Vec<char> = raw_header.chars().take(MIN_HEADER_LENGTH).collect();
        if chars.len() < MIN_HEADER_LENGTH {
            warn!(
                "MSH header '{}' is too short to carry delimiters, using defaults",
                raw_header
            );
            return Delimiters::default();
        }

        let delimiters = Delimiters {
            field: chars[3],
            component: chars[4],
            repetition: chars[5],
            escape: chars[6],
            sub_component: chars[7],
        };

        if !delimiters.is_usable() {
            warn!(
                "MSH header declares unusable delimiters {:?}, using defaults",
                delimiters.all()
            );
            return Delimiters::default();
        }

        delimiters
    }

    pub fn all(&self) -> [char; 5] {
        [
            self.field,
            self.component,
            self.repetition,
            self.escape,
            self.sub_component,
        ]
    }

    /// Distinct, and none of them could be mistaken for data.
    fn is_usable(&self) -> bool {
        let all = self.all();
        all.iter().enumerate().all(|(i, c)| {
            !all[i + 1..].contains(c) && !c.is_alphanumeric() && !c.is_whitespace()
        })
    }

    /// `MSH-2` as it appears on the wire.
    pub fn encoding_characters(&self) -> String {
        [
            self.component,
            self.repetition,
            self.escape,
            self.sub_component,
        ]
        .iter()
        .collect()
    }

    /// Builds the set from `MSH-1` and `MSH-2` values, as carried by the JSON and XML projections.
    pub fn from_parts(field: &str, encoding: &str) -> Option<Delimiters> {
        let mut field_chars = field.chars();
        let field = field_chars.next()?;
        if field_chars.next().is_some() {
            return None;
        }
        let encoding: Vec<char> = encoding.chars().collect();
        if encoding.len() < 4 {
            return None;
        }
        let delimiters = Delimiters {
            field,
            component: encoding[0],
            repetition: encoding[1],
            escape: encoding[2],
            sub_component: encoding[3],
        };
        delimiters.is_usable().then_some(delimiters)
    }

    pub fn is_reserved(&self, c: char) -> bool {
        self.all().contains(&c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_standard() {
        let d = Delimiters::default();
        assert_eq!(d.all(), ['|', '^', '~', '\\', '&']);
        assert_eq!(d.encoding_characters(), "^~\\&");
    }

    #[test]
    fn extracts_from_standard_header() {
        let d = Delimiters::extract("MSH|^~\\&|SND|SND");
        assert_eq!(d, Delimiters::default());
    }

    #[test]
    fn extracts_custom_delimiters() {
        let d = Delimiters::extract("MSH!@#$%!APP");
        assert_eq!(d.field, '!');
        assert_eq!(d.component, '@');
        assert_eq!(d.repetition, '#');
        assert_eq!(d.escape, '$');
        assert_eq!(d.sub_component, '%');
    }

    #[test]
    fn short_or_foreign_header_gives_defaults() {
        assert_eq!(Delimiters::extract("MSH|^~"), Delimiters::default());
        assert_eq!(Delimiters::extract("PID|1||123"), Delimiters::default());
        assert_eq!(Delimiters::extract(""), Delimiters::default());
    }

    #[test]
    fn duplicated_delimiters_give_defaults() {
        assert_eq!(Delimiters::extract("MSH|^^\\&|X"), Delimiters::default());
    }

    #[test]
    fn from_parts_round_trips() {
        let d = Delimiters::from_parts("#", "$~\\&").unwrap();
        assert_eq!(d.field, '#');
        assert_eq!(d.component, '$');
        assert!(Delimiters::from_parts("||", "^~\\&").is_none());
        assert!(Delimiters::from_parts("|", "^~").is_none());
    }
}
