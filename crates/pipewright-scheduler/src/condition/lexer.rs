//! Tokenizer for condition expressions.

use super::ConditionError;

const MAX_TOKENS: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    Return,
    LParen,
    RParen,
    Semi,
    Not,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Match,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
}

pub(crate) fn tokenize(src: &str) -> Result<Vec<Token>, ConditionError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        if tokens.len() > MAX_TOKENS {
            return Err(ConditionError::Parse("expression is too long".to_string()));
        }

        let c = chars[i];
        let peek = chars.get(i + 1).copied();

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let (token, width) = match (c, peek) {
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            (';', _) => (Token::Semi, 1),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('%', _) => (Token::Percent, 1),
            ('&', Some('&')) => (Token::And, 2),
            ('|', Some('|')) => (Token::Or, 2),
            ('=', Some('=')) => (Token::Eq, 2),
            ('=', Some('~')) => (Token::Match, 2),
            ('!', Some('=')) => (Token::Ne, 2),
            ('!', _) => (Token::Not, 1),
            ('<', Some('=')) => (Token::Le, 2),
            ('<', _) => (Token::Lt, 1),
            ('>', Some('=')) => (Token::Ge, 2),
            ('>', _) => (Token::Gt, 1),
            ('"' | '\'', _) => {
                let (text, width) = read_string(&chars[i..])?;
                (Token::Str(text), width)
            }
            ('$', Some('{')) => {
                let end = chars[i..]
                    .iter()
                    .position(|&c| c == '}')
                    .ok_or_else(|| ConditionError::Parse("unterminated ${".to_string()))?;
                let name: String = chars[i + 2..i + end].iter().collect();
                if !is_identifier(&name) {
                    return Err(ConditionError::Parse(format!("invalid variable name '{name}'")));
                }
                (Token::Ident(name), end + 1)
            }
            ('$', _) => {
                let name = read_word(&chars[i + 1..]);
                if !is_identifier(&name) {
                    return Err(ConditionError::Parse("'$' must be followed by a name".to_string()));
                }
                let width = name.chars().count() + 1;
                (Token::Ident(name), width)
            }
            (c, _) if c.is_ascii_digit() => {
                let text: String = chars[i..]
                    .iter()
                    .take_while(|c| c.is_ascii_digit() || **c == '.')
                    .collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| ConditionError::Parse(format!("invalid number '{text}'")))?;
                let width = text.chars().count();
                (Token::Num(value), width)
            }
            (c, _) if c.is_ascii_alphabetic() || c == '_' => {
                let word = read_word(&chars[i..]);
                let width = word.chars().count();
                let token = match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "return" => Token::Return,
                    _ => Token::Ident(word),
                };
                (token, width)
            }
            (c, _) => {
                return Err(ConditionError::Parse(format!("unexpected character '{c}'")));
            }
        };

        tokens.push(token);
        i += width;
    }

    Ok(tokens)
}

fn read_word(chars: &[char]) -> String {
    chars
        .iter()
        .take_while(|c| c.is_ascii_alphanumeric() || **c == '_')
        .collect()
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Read a quoted string starting at `chars[0]`; returns the text and the
/// number of characters consumed including quotes.
fn read_string(chars: &[char]) -> Result<(String, usize), ConditionError> {
    let quote = chars[0];
    let mut text = String::new();
    let mut i = 1;

    while i < chars.len() {
        match chars[i] {
            '\\' => {
                let escaped = chars
                    .get(i + 1)
                    .ok_or_else(|| ConditionError::Parse("unterminated string".to_string()))?;
                text.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    other => *other,
                });
                i += 2;
            }
            c if c == quote => return Ok((text, i + 1)),
            c => {
                text.push(c);
                i += 1;
            }
        }
    }

    Err(ConditionError::Parse("unterminated string".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_comparison() {
        let tokens = tokenize(r#"return $BRANCH == "main" && ${COUNT} >= 2;"#).unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Return,
                Token::Ident("BRANCH".to_string()),
                Token::Eq,
                Token::Str("main".to_string()),
                Token::And,
                Token::Ident("COUNT".to_string()),
                Token::Ge,
                Token::Num(2.0),
                Token::Semi,
            ]
        );
    }

    #[test]
    fn test_escapes_in_strings() {
        let tokens = tokenize(r#"'it\'s'"#).unwrap();
        assert_eq!(tokens, vec![Token::Str("it's".to_string())]);
    }

    #[test]
    fn test_rejects_assignment_and_unknown_characters() {
        assert!(tokenize("a = 1").is_err());
        assert!(tokenize("a # b").is_err());
        assert!(tokenize("\"open").is_err());
    }
}
