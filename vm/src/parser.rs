//! EDN-like S-expression parser
//!
//! Supports rich literal syntax while maintaining homoiconicity:
//! - S-expressions: (+ 1 2)
//! - Vectors: [1 2 3]
//! - Maps: {:key "value"}
//! - Keywords: :keyword
//! - Metadata: ^{:doc "..."} value
//!
//! Every non-empty list is wrapped with its source location so the evaluator
//! can report line-addressable errors.

use std::collections::HashMap;

use crate::error::{ParseError, Position};
use crate::value::{Keyword, Symbol, Value};

const SYMBOL_CHARS: &str = "-_+*/?!<>=%&.";

/// Token types for the lexer
#[derive(Clone, Debug, PartialEq)]
enum Token {
    // Delimiters
    LParen,   // (
    RParen,   // )
    LBracket, // [
    RBracket, // ]
    LBrace,   // {
    RBrace,   // }

    // Literals
    Nil,
    True,
    False,
    Int(i64),
    Float(f64),
    Str(String),
    Symbol(String),
    Keyword(String),

    // Special
    Quote,    // '
    Metadata, // ^
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
            Token::LBracket => "'['".to_string(),
            Token::RBracket => "']'".to_string(),
            Token::LBrace => "'{'".to_string(),
            Token::RBrace => "'}'".to_string(),
            Token::Quote => "'''".to_string(),
            Token::Metadata => "'^'".to_string(),
            other => format!("{:?}", other),
        }
    }
}

/// Lexer for tokenizing input
struct Lexer {
    input: Vec<char>,
    position: usize,
    current: Option<char>,
    line: usize,
    column: usize,
}

impl Lexer {
    fn new(input: &str) -> Self {
        let chars: Vec<char> = input.chars().collect();
        let current = chars.first().cloned();
        Lexer {
            input: chars,
            position: 0,
            current,
            line: 1,
            column: 1,
        }
    }

    fn here(&self) -> Position {
        Position::new(self.line, self.column)
    }

    fn advance(&mut self) {
        if self.current == Some('\n') {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        self.position += 1;
        self.current = self.input.get(self.position).cloned();
    }

    fn peek(&self) -> Option<char> {
        self.input.get(self.position + 1).cloned()
    }

    fn skip_whitespace_and_comments(&mut self) {
        while let Some(ch) = self.current {
            if ch.is_whitespace() || ch == ',' {
                self.advance();
            } else if ch == ';' {
                while let Some(c) = self.current {
                    if c == '\n' {
                        break;
                    }
                    self.advance();
                }
            } else {
                break;
            }
        }
    }

    fn read_string(&mut self) -> Result<String, ParseError> {
        let start = self.here();
        let mut result = String::new();
        self.advance(); // skip opening "

        while let Some(ch) = self.current {
            if ch == '"' {
                self.advance(); // skip closing "
                return Ok(result);
            } else if ch == '\\' {
                let escape_at = self.here();
                self.advance();
                match self.current {
                    Some('n') => result.push('\n'),
                    Some('t') => result.push('\t'),
                    Some('r') => result.push('\r'),
                    Some('\\') => result.push('\\'),
                    Some('"') => result.push('"'),
                    Some(c) => {
                        return Err(ParseError::new(
                            format!("invalid escape sequence: \\{}", c),
                            escape_at,
                        ))
                    }
                    None => break,
                }
                self.advance();
            } else {
                result.push(ch);
                self.advance();
            }
        }

        Err(ParseError::new("unterminated string", start))
    }

    fn read_number(&mut self) -> Result<Token, ParseError> {
        let start = self.here();
        let mut num_str = String::new();
        let mut is_float = false;

        if self.current == Some('-') {
            num_str.push('-');
            self.advance();
        }

        while let Some(ch) = self.current {
            if ch.is_ascii_digit() {
                num_str.push(ch);
                self.advance();
            } else if ch == '.' && !is_float {
                is_float = true;
                num_str.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        if is_float {
            num_str
                .parse::<f64>()
                .map(Token::Float)
                .map_err(|e| ParseError::new(format!("invalid float: {}", e), start))
        } else {
            num_str
                .parse::<i64>()
                .map(Token::Int)
                .map_err(|e| ParseError::new(format!("invalid integer: {}", e), start))
        }
    }

    fn read_symbol_or_keyword(&mut self) -> Result<Token, ParseError> {
        let start = self.here();
        let mut ident = String::new();
        let is_keyword = self.current == Some(':');

        if is_keyword {
            self.advance(); // skip :
        }

        while let Some(ch) = self.current {
            if ch.is_alphanumeric() || SYMBOL_CHARS.contains(ch) {
                ident.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        if is_keyword {
            if ident.is_empty() {
                return Err(ParseError::new("empty keyword", start));
            }
            return Ok(Token::Keyword(ident));
        }
        Ok(match ident.as_str() {
            "nil" => Token::Nil,
            "true" => Token::True,
            "false" => Token::False,
            _ => Token::Symbol(ident),
        })
    }

    fn next_token(&mut self) -> Result<Option<(Token, Position)>, ParseError> {
        self.skip_whitespace_and_comments();
        let at = self.here();

        let token = match self.current {
            None => return Ok(None),
            Some('(') => {
                self.advance();
                Token::LParen
            }
            Some(')') => {
                self.advance();
                Token::RParen
            }
            Some('[') => {
                self.advance();
                Token::LBracket
            }
            Some(']') => {
                self.advance();
                Token::RBracket
            }
            Some('{') => {
                self.advance();
                Token::LBrace
            }
            Some('}') => {
                self.advance();
                Token::RBrace
            }
            Some('#') => match self.peek() {
                Some('t') => {
                    self.advance(); // skip #
                    self.advance(); // skip t
                    Token::True
                }
                Some('f') => {
                    self.advance(); // skip #
                    self.advance(); // skip f
                    Token::False
                }
                other => {
                    return Err(ParseError::new(
                        format!("unexpected character after #: {:?}", other),
                        at,
                    ))
                }
            },
            Some('\'') => {
                self.advance();
                Token::Quote
            }
            Some('^') => {
                self.advance();
                Token::Metadata
            }
            Some('"') => Token::Str(self.read_string()?),
            Some('-') if self.peek().map(|c| c.is_ascii_digit()).unwrap_or(false) => {
                self.read_number()?
            }
            Some(ch) if ch.is_ascii_digit() => self.read_number()?,
            Some(':') => self.read_symbol_or_keyword()?,
            Some(ch) if ch.is_alphabetic() || SYMBOL_CHARS.contains(ch) => {
                self.read_symbol_or_keyword()?
            }
            Some(ch) => {
                return Err(ParseError::new(format!("unexpected character: {}", ch), at));
            }
        };
        Ok(Some((token, at)))
    }
}

/// Parser for converting tokens to Values
pub struct Parser {
    lexer: Lexer,
    current: Option<(Token, Position)>,
}

impl Parser {
    pub fn new(input: &str) -> Result<Self, ParseError> {
        let mut lexer = Lexer::new(input);
        let current = lexer.next_token()?;
        Ok(Parser { lexer, current })
    }

    fn advance(&mut self) -> Result<(), ParseError> {
        self.current = self.lexer.next_token()?;
        Ok(())
    }

    fn end_of_input(&self) -> ParseError {
        ParseError::new("unexpected end of input", self.lexer.here())
    }

    fn at(&self, token: &Token) -> bool {
        matches!(&self.current, Some((t, _)) if t == token)
    }

    fn parse_sequence(&mut self, close: Token) -> Result<Vec<Value>, ParseError> {
        let mut items = Vec::new();
        self.advance()?; // consume opener

        while !self.at(&close) {
            if self.current.is_none() {
                return Err(self.end_of_input());
            }
            items.push(self.parse_value()?);
        }

        self.advance()?; // consume closer
        Ok(items)
    }

    fn parse_list(&mut self, start: Position) -> Result<Value, ParseError> {
        let items = self.parse_sequence(Token::RParen)?;
        if items.is_empty() {
            return Ok(Value::List(items));
        }
        Ok(Value::located(Value::List(items), start))
    }

    fn parse_map(&mut self) -> Result<HashMap<String, Value>, ParseError> {
        let mut map = HashMap::new();
        self.advance()?; // consume {

        while !self.at(&Token::RBrace) {
            let key_at = match &self.current {
                Some((_, at)) => *at,
                None => return Err(self.end_of_input()),
            };
            let key = self.parse_value()?;
            if self.current.is_none() {
                return Err(self.end_of_input());
            }
            if self.at(&Token::RBrace) {
                return Err(ParseError::new("map missing value for key", key_at));
            }
            let value = self.parse_value()?;

            let key_str = match key {
                Value::Keyword(Keyword(k)) => k,
                Value::Str(s) => s,
                Value::Symbol(Symbol(s)) => s,
                other => {
                    return Err(ParseError::new(
                        format!(
                            "map keys must be keywords, strings or symbols, got {}",
                            other.type_name()
                        ),
                        key_at,
                    ))
                }
            };

            map.insert(key_str, value);
        }

        self.advance()?; // consume }
        Ok(map)
    }

    fn parse_metadata(&mut self, start: Position) -> Result<Value, ParseError> {
        self.advance()?; // consume ^

        if !self.at(&Token::LBrace) {
            return Err(ParseError::new("metadata must be a map", start));
        }
        let mut metadata = self.parse_map()?;
        let value = self.parse_value()?;

        // Keep the location attached by the list parser
        let value = match value {
            Value::WithMeta {
                value,
                metadata: location,
            } => {
                for (k, v) in location {
                    metadata.entry(k).or_insert(v);
                }
                *value
            }
            other => other,
        };
        Ok(Value::WithMeta {
            value: Box::new(value),
            metadata,
        })
    }

    pub fn parse_value(&mut self) -> Result<Value, ParseError> {
        let (token, at) = match &self.current {
            None => return Err(self.end_of_input()),
            Some((token, at)) => (token.clone(), *at),
        };
        match token {
            Token::Nil => {
                self.advance()?;
                Ok(Value::Nil)
            }
            Token::True => {
                self.advance()?;
                Ok(Value::Bool(true))
            }
            Token::False => {
                self.advance()?;
                Ok(Value::Bool(false))
            }
            Token::Int(n) => {
                self.advance()?;
                Ok(Value::Int(n))
            }
            Token::Float(f) => {
                self.advance()?;
                Ok(Value::Float(f))
            }
            Token::Str(s) => {
                self.advance()?;
                Ok(Value::Str(s))
            }
            Token::Symbol(s) => {
                self.advance()?;
                Ok(Value::Symbol(Symbol(s)))
            }
            Token::Keyword(k) => {
                self.advance()?;
                Ok(Value::Keyword(Keyword(k)))
            }
            Token::LParen => self.parse_list(at),
            Token::LBracket => Ok(Value::Vector(self.parse_sequence(Token::RBracket)?)),
            Token::LBrace => Ok(Value::Map(self.parse_map()?)),
            Token::Quote => {
                self.advance()?; // consume '
                let value = self.parse_value()?;
                Ok(Value::Quote(Box::new(value)))
            }
            Token::Metadata => self.parse_metadata(at),
            closer => Err(ParseError::new(
                format!("unexpected {}", closer.describe()),
                at,
            )),
        }
    }

    pub fn parse(&mut self) -> Result<Vec<Value>, ParseError> {
        let mut values = Vec::new();

        while self.current.is_some() {
            values.push(self.parse_value()?);
        }

        Ok(values)
    }
}

/// Parse a string into Values
pub fn parse(input: &str) -> Result<Vec<Value>, ParseError> {
    Parser::new(input)?.parse()
}

/// Parse a single expression
pub fn parse_one(input: &str) -> Result<Value, ParseError> {
    let mut values = parse(input)?;
    if values.len() != 1 {
        return Err(ParseError::new(
            format!("expected single expression, got {}", values.len()),
            Position::new(1, 1),
        ));
    }
    Ok(values.remove(0))
}
