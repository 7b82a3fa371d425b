//! The small expression language used by custom rules.
//!
//! Value expressions concatenate terms with `+`:
//!
//! * `'text'` or `"text"` is a literal and is never substituted,
//! * `{name}` is a placeholder for a record field that must exist,
//! * a bare word names a record field when one exists and is otherwise literal,
//! * `value` is bound to the current value of the field being transformed.
//!
//! Text that does not fit that grammar, such as `Dr. {last_name}`, is a template:
//! placeholders are substituted and everything else is kept as written.
//!
//! Conditions compare one field against one value (`gender == 'M'`, `age >= 18`,
//! `name starts_with 'DR'`, `phone is empty`), and conditional mappings read
//! `if <condition> then <field> = <value expression>`.

use regex::Regex;
use std::cmp::Ordering;
use std::fmt;

use super::config::ConditionOperator;
use super::value::MappedRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpressionError(pub String);

impl fmt::Display for ExpressionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ExpressionError {}

fn error<T>(message: impl Into<String>) -> Result<T, ExpressionError> {
    Err(ExpressionError(message.into()))
}

/// Name resolution during evaluation.
pub trait Scope {
    fn lookup(&self, name: &str) -> Option<String>;
}

impl Scope for MappedRecord {
    fn lookup(&self, name: &str) -> Option<String> {
        self.get(name).map(|v| v.to_string())
    }
}

/// A record with `value` bound to the field currently being rewritten.
pub struct Bindings<'a> {
    pub record: &'a MappedRecord,
    pub value: Option<&'a str>,
}

impl Scope for Bindings<'_> {
    fn lookup(&self, name: &str) -> Option<String> {
        match (name, self.value) {
            ("value", Some(v)) => Some(v.to_string()),
            _ => self.record.lookup(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Str(String),
    Placeholder(String),
    Plus,
    Op(&'static str),
    Word(String),
}

fn is_word_char(c: char) -> bool {
    !(c.is_whitespace() || matches!(c, '\'' | '"' | '{' | '}' | '+' | '=' | '<' | '>'))
}

fn tokenize(source: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            _ if c.is_whitespace() => i += 1,
            '\'' | '"' => {
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return error(format!("unterminated string in '{}'", source)),
                        Some(&'\\') if i + 1 < chars.len() => {
                            text.push(chars[i + 1]);
                            i += 2;
                        }
                        Some(&q) if q == c => {
                            i += 1;
                            break;
                        }
                        Some(&other) => {
                            text.push(other);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            '{' => {
                let close = chars[i..]
                    .iter()
                    .position(|&c| c == '}')
                    .ok_or_else(|| ExpressionError(format!("unterminated placeholder in '{}'", source)))?;
                let name: String = chars[i + 1..i + close].iter().collect();
                let name = name.trim();
                if name.is_empty() {
                    return error("empty placeholder");
                }
                tokens.push(Token::Placeholder(name.to_string()));
                i += close + 1;
            }
            '}' => return error(format!("unexpected '}}' in '{}'", source)),
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '=' | '<' | '>' | '!' if c != '!' || chars.get(i + 1) == Some(&'=') => {
                let double = chars.get(i + 1) == Some(&'=');
                let op = match (c, double) {
                    ('=', true) => "==",
                    ('=', false) => "=",
                    ('!', _) => "!=",
                    ('<', true) => "<=",
                    ('<', false) => "<",
                    ('>', true) => ">=",
                    _ => ">",
                };
                tokens.push(Token::Op(op));
                i += if double { 2 } else { 1 };
            }
            _ => {
                let start = i;
                while i < chars.len() && is_word_char(chars[i]) && !(chars[i] == '!' && chars.get(i + 1) == Some(&'=')) {
                    i += 1;
                }
                tokens.push(Token::Word(chars[start..i].iter().collect()));
            }
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Literal(String),
    /// `{name}`, must resolve
    Field(String),
    /// Bare word, a field when present
    Word(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Text(String),
    Field(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValueExpr {
    Concat(Vec<Term>),
    Template(Vec<TemplatePart>),
}

impl ValueExpr {
    pub fn parse(source: &str) -> Result<ValueExpr, ExpressionError> {
        match tokenize(source) {
            Ok(tokens) if tokens.is_empty() => error("empty expression"),
            Ok(tokens) if tokens.contains(&Token::Plus) => concat(&tokens).map(ValueExpr::Concat),
            Ok(tokens) if tokens.len() == 1 => concat(&tokens).map(ValueExpr::Concat),
            _ => template(source).map(ValueExpr::Template),
        }
    }

    /// Only the `+` grammar, used where a template would be ambiguous.
    fn strict(tokens: &[Token]) -> Result<ValueExpr, ExpressionError> {
        concat(tokens).map(ValueExpr::Concat)
    }

    pub fn evaluate(&self, scope: &dyn Scope) -> Result<String, ExpressionError> {
        let required = |name: &str| {
            scope
                .lookup(name)
                .ok_or_else(|| ExpressionError(format!("field '{}' is not available", name)))
        };

        let mut out = String::new();
        match self {
            ValueExpr::Concat(terms) => {
                for term in terms {
                    match term {
                        Term::Literal(text) => out.push_str(text),
                        Term::Field(name) => out.push_str(&required(name)?),
                        Term::Word(word) => match scope.lookup(word) {
                            Some(value) => out.push_str(&value),
                            None => out.push_str(word),
                        },
                    }
                }
            }
            ValueExpr::Template(parts) => {
                for part in parts {
                    match part {
                        TemplatePart::Text(text) => out.push_str(text),
                        TemplatePart::Field(name) => out.push_str(&required(name)?),
                    }
                }
            }
        }
        Ok(out)
    }
}

fn term(token: &Token) -> Option<Term> {
    match token {
        Token::Str(s) => Some(Term::Literal(s.clone())),
        Token::Placeholder(name) => Some(Term::Field(name.clone())),
        Token::Word(w) => Some(Term::Word(w.clone())),
        Token::Plus | Token::Op(_) => None,
    }
}

fn concat(tokens: &[Token]) -> Result<Vec<Term>, ExpressionError> {
    let mut terms = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        let expect_term = i % 2 == 0;
        match (expect_term, token) {
            (true, t) => match term(t) {
                Some(term) => terms.push(term),
                None => return error(format!("expected a value at position {}", i + 1)),
            },
            (false, Token::Plus) => {}
            (false, _) => return error(format!("expected '+' at position {}", i + 1)),
        }
    }
    if tokens.len() % 2 == 0 {
        return error("expression ends with '+'");
    }
    Ok(terms)
}

fn template(source: &str) -> Result<Vec<TemplatePart>, ExpressionError> {
    let mut parts = Vec::new();
    let mut rest = source;
    while let Some(open) = rest.find('{') {
        if open > 0 {
            parts.push(TemplatePart::Text(rest[..open].to_string()));
        }
        let close = rest[open..]
            .find('}')
            .ok_or_else(|| ExpressionError(format!("unterminated placeholder in '{}'", source)))?;
        let name = rest[open + 1..open + close].trim();
        if name.is_empty() {
            return error("empty placeholder");
        }
        parts.push(TemplatePart::Field(name.to_string()));
        rest = &rest[open + close + 1..];
    }
    if !rest.is_empty() {
        parts.push(TemplatePart::Text(rest.to_string()));
    }
    Ok(parts)
}

/// `<field> <operator> <value>`.
#[derive(Debug, Clone)]
pub struct Comparison {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: String,
    regex: Option<Regex>,
}

impl PartialEq for Comparison {
    fn eq(&self, other: &Self) -> bool {
        self.field == other.field && self.operator == other.operator && self.value == other.value
    }
}

impl Comparison {
    pub fn new(field: impl Into<String>, operator: ConditionOperator, value: impl Into<String>) -> Result<Comparison, regex::Error> {
        let value = value.into();
        let regex = match operator {
            ConditionOperator::Regex => Some(Regex::new(&value)?),
            _ => None,
        };
        Ok(Comparison {
            field: field.into(),
            operator,
            value,
            regex,
        })
    }

    pub fn parse(source: &str) -> Result<Comparison, ExpressionError> {
        Self::from_tokens(&tokenize(source)?)
    }

    fn from_tokens(tokens: &[Token]) -> Result<Comparison, ExpressionError> {
        let field = match tokens.first() {
            Some(Token::Word(w)) | Some(Token::Placeholder(w)) => w.clone(),
            _ => return error("condition must start with a field name"),
        };

        let (operator, used) = match tokens.get(1) {
            Some(Token::Op(op)) => (symbol_operator(op)?, 1),
            Some(Token::Word(_)) => word_operator(&tokens[1..])?,
            _ => return error(format!("missing operator after '{}'", field)),
        };

        let rest = &tokens[1 + used..];
        let value = match (operator, rest) {
            (ConditionOperator::IsEmpty | ConditionOperator::IsNotEmpty, []) => String::new(),
            (ConditionOperator::IsEmpty | ConditionOperator::IsNotEmpty, _) => {
                return error("'is empty' takes no value")
            }
            (_, [Token::Str(v)]) | (_, [Token::Word(v)]) => v.clone(),
            (_, []) => return error(format!("missing value after operator on '{}'", field)),
            _ => return error("a condition compares against a single value"),
        };

        Comparison::new(field, operator, value).map_err(|e| ExpressionError(e.to_string()))
    }

    pub fn evaluate(&self, scope: &dyn Scope) -> bool {
        let actual = scope.lookup(&self.field).unwrap_or_default();
        self.operator.evaluate(&actual, &self.value, self.regex.as_ref())
    }
}

fn symbol_operator(op: &str) -> Result<ConditionOperator, ExpressionError> {
    Ok(match op {
        "=" | "==" => ConditionOperator::Equals,
        "!=" => ConditionOperator::NotEquals,
        ">" => ConditionOperator::GreaterThan,
        ">=" => ConditionOperator::GreaterThanOrEqual,
        "<" => ConditionOperator::LessThan,
        "<=" => ConditionOperator::LessThanOrEqual,
        other => return error(format!("unknown operator '{}'", other)),
    })
}

/// Returns the operator and how many tokens it spans.
fn word_operator(tokens: &[Token]) -> Result<(ConditionOperator, usize), ExpressionError> {
    let words: Vec<String> = tokens
        .iter()
        .take(3)
        .map(|t| match t {
            Token::Word(w) => w.to_ascii_lowercase(),
            _ => String::new(),
        })
        .collect();
    let w = |i: usize| words.get(i).map(String::as_str).unwrap_or("");

    Ok(match (w(0), w(1), w(2)) {
        ("is", "not", "empty") => (ConditionOperator::IsNotEmpty, 3),
        ("is", "empty", _) => (ConditionOperator::IsEmpty, 2),
        ("not", "contains", _) => (ConditionOperator::NotContains, 2),
        ("not", "in", _) => (ConditionOperator::NotIn, 2),
        ("contains", _, _) => (ConditionOperator::Contains, 1),
        ("starts_with" | "startswith", _, _) => (ConditionOperator::StartsWith, 1),
        ("ends_with" | "endswith", _, _) => (ConditionOperator::EndsWith, 1),
        ("matches", _, _) => (ConditionOperator::Regex, 1),
        ("in", _, _) => (ConditionOperator::In, 1),
        (other, _, _) => return error(format!("unknown operator '{}'", other)),
    })
}

fn finite(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

fn ordering(actual: &str, expected: &str) -> Ordering {
    match (finite(actual), finite(expected)) {
        (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        _ => actual.cmp(expected),
    }
}

impl ConditionOperator {
    /// Finite numbers on both sides compare numerically, anything else compares lexically.
    pub fn evaluate(&self, actual: &str, expected: &str, regex: Option<&Regex>) -> bool {
        let in_list = || expected.split(',').any(|item| item.trim() == actual.trim());
        match self {
            ConditionOperator::Equals => actual == expected || ordering(actual, expected) == Ordering::Equal,
            ConditionOperator::NotEquals => !(actual == expected || ordering(actual, expected) == Ordering::Equal),
            ConditionOperator::Contains => actual.contains(expected),
            ConditionOperator::NotContains => !actual.contains(expected),
            ConditionOperator::StartsWith => actual.starts_with(expected),
            ConditionOperator::EndsWith => actual.ends_with(expected),
            ConditionOperator::Regex => match regex {
                Some(re) => re.is_match(actual),
                None => Regex::new(expected).map_or(false, |re| re.is_match(actual)),
            },
            ConditionOperator::GreaterThan => ordering(actual, expected) == Ordering::Greater,
            ConditionOperator::GreaterThanOrEqual => ordering(actual, expected) != Ordering::Less,
            ConditionOperator::LessThan => ordering(actual, expected) == Ordering::Less,
            ConditionOperator::LessThanOrEqual => ordering(actual, expected) != Ordering::Greater,
            ConditionOperator::In => in_list(),
            ConditionOperator::NotIn => !in_list(),
            ConditionOperator::IsEmpty => actual.trim().is_empty(),
            ConditionOperator::IsNotEmpty => !actual.trim().is_empty(),
        }
    }
}

/// `if <condition> then <field> = <value expression>`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionalAssignment {
    pub condition: Comparison,
    pub target: String,
    pub value: ValueExpr,
}

impl ConditionalAssignment {
    pub fn parse(source: &str) -> Result<ConditionalAssignment, ExpressionError> {
        let tokens = tokenize(source)?;
        let is_word = |t: &Token, word: &str| matches!(t, Token::Word(w) if w.eq_ignore_ascii_case(word));

        if !tokens.first().map_or(false, |t| is_word(t, "if")) {
            return error("conditional mapping must start with 'if'");
        }
        let then = tokens
            .iter()
            .position(|t| is_word(t, "then"))
            .ok_or_else(|| ExpressionError("conditional mapping has no 'then'".to_string()))?;

        let condition = Comparison::from_tokens(&tokens[1..then])?;

        let assignment = &tokens[then + 1..];
        let target = match assignment.first() {
            Some(Token::Word(w)) | Some(Token::Placeholder(w)) => w.clone(),
            _ => return error("expected a target field after 'then'"),
        };
        if !matches!(assignment.get(1), Some(Token::Op("=")) | Some(Token::Op("=="))) {
            return error(format!("expected '=' after '{}'", target));
        }
        let value = ValueExpr::strict(&assignment[2..])?;

        Ok(ConditionalAssignment {
            condition,
            target,
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::value::MappedValue;

    fn record() -> MappedRecord {
        vec![
            ("first_name", MappedValue::from("JOHN")),
            ("last_name", MappedValue::from("DOE")),
            ("gender", MappedValue::from("M")),
            ("age", MappedValue::from(34i64)),
            ("phone", MappedValue::from("")),
        ]
        .into_iter()
        .collect()
    }

    fn eval(source: &str) -> Result<String, ExpressionError> {
        ValueExpr::parse(source)?.evaluate(&record())
    }

    #[test]
    fn concatenation() {
        assert_eq!(eval("{first_name} + ' ' + {last_name}").unwrap(), "JOHN DOE");
        assert_eq!(eval("first_name + ' ' + last_name").unwrap(), "JOHN DOE");
        assert_eq!(eval("last_name + ', ' + first_name").unwrap(), "DOE, JOHN");
    }

    #[test]
    fn quoted_literals_are_never_substituted() {
        assert_eq!(eval("'first_name'").unwrap(), "first_name");
        assert_eq!(eval("'{last_name}'").unwrap(), "{last_name}");
    }

    #[test]
    fn bare_words_fall_back_to_literals() {
        assert_eq!(eval("UNKNOWN").unwrap(), "UNKNOWN");
        assert_eq!(eval("gender").unwrap(), "M");
    }

    #[test]
    fn templates() {
        assert_eq!(eval("Dr. {last_name}").unwrap(), "Dr. DOE");
        assert_eq!(eval("Hello World").unwrap(), "Hello World");
        assert_eq!(
            ValueExpr::parse("Dr. {last_name}").unwrap(),
            ValueExpr::Template(vec![
                TemplatePart::Text("Dr. ".into()),
                TemplatePart::Field("last_name".into())
            ])
        );
    }

    #[test]
    fn missing_placeholder_is_an_evaluation_error() {
        assert!(eval("{middle_name} + ' '").is_err());
        assert!(eval("Dr. {middle_name}").is_err());
    }

    #[test]
    fn value_binding() {
        let record = record();
        let scope = Bindings {
            record: &record,
            value: Some("doe"),
        };
        let expr = ValueExpr::parse("'Mr. ' + value").unwrap();
        assert_eq!(expr.evaluate(&scope).unwrap(), "Mr. doe");
    }

    #[test]
    fn malformed_expressions() {
        for bad in ["", "{first_name", "a + ", "+ a", "a + + b", "{}"] {
            assert!(ValueExpr::parse(bad).is_err(), "{:?}", bad);
        }
    }

    #[test]
    fn comparisons() {
        let record = record();
        let holds = |s: &str| Comparison::parse(s).unwrap().evaluate(&record);
        assert!(holds("gender == 'M'"));
        assert!(holds("gender = M"));
        assert!(!holds("gender != 'M'"));
        assert!(holds("age >= 18"));
        assert!(holds("age > 9"));
        assert!(holds("last_name starts_with 'D'"));
        assert!(holds("last_name matches '^D.E$'"));
        assert!(holds("gender in 'M,F'"));
        assert!(holds("phone is empty"));
        assert!(holds("last_name is not empty"));
        assert!(holds("missing is empty"));
    }

    #[test]
    fn non_finite_numbers_compare_as_text() {
        let holds = |op: ConditionOperator, a: &str, b: &str| op.evaluate(a, b, None);
        assert!(!holds(ConditionOperator::Equals, "NaN", "5"));
        // lexical, as for any other text
        assert_eq!(
            holds(ConditionOperator::GreaterThanOrEqual, "NaN", "5"),
            holds(ConditionOperator::GreaterThanOrEqual, "Nab", "5")
        );
        assert!(!holds(ConditionOperator::LessThanOrEqual, "NaN", "5"));
        assert!(holds(ConditionOperator::NotEquals, "NaN", "5"));
        assert!(holds(ConditionOperator::Equals, "NaN", "NaN"));
        assert!(!holds(ConditionOperator::Equals, "inf", "5"));
        assert!(holds(ConditionOperator::GreaterThan, "10", "9"));
        assert!(holds(ConditionOperator::Equals, "5.0", "5"));
        assert!(holds(ConditionOperator::Equals, "0", "-0"));
    }

    #[test]
    fn malformed_comparisons() {
        for bad in ["gender", "== 'M'", "gender ~ 'M'", "gender == 'M' 'F'", "age matches '('", "gender is empty 'x'"] {
            assert!(Comparison::parse(bad).is_err(), "{:?}", bad);
        }
    }

    #[test]
    fn conditional_assignment() {
        let parsed = ConditionalAssignment::parse("if gender == 'M' then gender_text = 'Male'").unwrap();
        assert_eq!(parsed.target, "gender_text");
        assert!(parsed.condition.evaluate(&record()));
        assert_eq!(parsed.value.evaluate(&record()).unwrap(), "Male");

        let parsed = ConditionalAssignment::parse("IF age < 18 THEN category = 'minor'").unwrap();
        assert!(!parsed.condition.evaluate(&record()));
    }

    #[test]
    fn malformed_conditionals() {
        for bad in [
            "gender == 'M' then x = 'y'",
            "if gender == 'M' x = 'y'",
            "if gender == 'M' then = 'y'",
            "if gender == 'M' then x 'y'",
            "if gender == 'M' then x = 'a' 'b'",
            "if then x = 'y'",
        ] {
            assert!(ConditionalAssignment::parse(bad).is_err(), "{:?}", bad);
        }
    }
}
