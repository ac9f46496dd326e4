use db_intel_core::{AttrValue, Record};
use thiserror::Error;

/// Restricted predicate language for sampling rules.
///
/// Grammar: boolean composition (`and`, `or`, `not`, parentheses) over
/// comparisons `key op literal`, where op is one of `==`, `!=`, `<`, `<=`,
/// `>`, `>=`, `contains`. Keys are dotted attribute names; literals are
/// quoted strings, numbers, or booleans.
///
/// A comparison against a missing attribute evaluates to false. A comparison
/// between incompatible types is an evaluation error; the sampler drops the
/// record and counts it.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    Cmp {
        key: String,
        op: CmpOp,
        value: Literal,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message} at offset {position}")]
pub struct ParseError {
    pub message: String,
    pub position: usize,
}

/// Type-mismatch during evaluation.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("predicate error on '{key}': {detail}")]
pub struct EvalError {
    pub key: String,
    pub detail: String,
}

impl Predicate {
    pub fn parse(input: &str) -> Result<Predicate, ParseError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(ParseError {
                message: format!("unexpected trailing input '{}'", parser.peek_text()),
                position: parser.peek_offset(),
            });
        }
        Ok(expr)
    }

    pub fn eval(&self, record: &Record) -> Result<bool, EvalError> {
        match self {
            Predicate::And(parts) => {
                for p in parts {
                    if !p.eval(record)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Predicate::Or(parts) => {
                for p in parts {
                    if p.eval(record)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Predicate::Not(inner) => Ok(!inner.eval(record)?),
            Predicate::Cmp { key, op, value } => {
                let attr = match record.attr(key) {
                    Some(a) => a,
                    // missing attribute: the comparison is simply false
                    None => return Ok(false),
                };
                compare(key, attr, *op, value)
            }
        }
    }
}

fn compare(key: &str, attr: &AttrValue, op: CmpOp, lit: &Literal) -> Result<bool, EvalError> {
    let mismatch = |detail: &str| EvalError {
        key: key.to_string(),
        detail: detail.to_string(),
    };

    match op {
        CmpOp::Eq | CmpOp::Ne => {
            let eq = match (attr, lit) {
                (AttrValue::Str(a), Literal::Str(b)) => a == b,
                (AttrValue::Bool(a), Literal::Bool(b)) => a == b,
                (_, Literal::Num(b)) => match attr.as_f64() {
                    Some(a) => (a - b).abs() < f64::EPSILON * a.abs().max(b.abs()).max(1.0),
                    None => {
                        return Err(mismatch(&format!(
                            "cannot compare {} to number",
                            attr.type_name()
                        )))
                    }
                },
                _ => {
                    return Err(mismatch(&format!(
                        "cannot compare {} to {:?}",
                        attr.type_name(),
                        lit
                    )))
                }
            };
            Ok(if op == CmpOp::Eq { eq } else { !eq })
        }
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let ordering = match (attr, lit) {
                (AttrValue::Str(a), Literal::Str(b)) => a.as_str().partial_cmp(b.as_str()),
                (_, Literal::Num(b)) => match attr.as_f64() {
                    Some(a) => a.partial_cmp(b),
                    None => {
                        return Err(mismatch(&format!(
                            "cannot order {} against number",
                            attr.type_name()
                        )))
                    }
                },
                _ => {
                    return Err(mismatch(&format!(
                        "cannot order {} against {:?}",
                        attr.type_name(),
                        lit
                    )))
                }
            };
            let ordering = ordering.ok_or_else(|| mismatch("unordered values"))?;
            Ok(match op {
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Le => ordering.is_le(),
                CmpOp::Gt => ordering.is_gt(),
                CmpOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            })
        }
        CmpOp::Contains => match (attr, lit) {
            (AttrValue::Str(a), Literal::Str(b)) => Ok(a.contains(b.as_str())),
            _ => Err(mismatch("contains requires string operands")),
        },
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String, usize),
    Str(String, usize),
    Num(f64, usize),
    LParen(usize),
    RParen(usize),
    Op(CmpOp, usize),
}

impl Token {
    fn offset(&self) -> usize {
        match self {
            Token::Ident(_, o)
            | Token::Str(_, o)
            | Token::Num(_, o)
            | Token::LParen(o)
            | Token::RParen(o)
            | Token::Op(_, o) => *o,
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ParseError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen(i));
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen(i));
                i += 1;
            }
            '=' | '!' | '<' | '>' => {
                let two = input.get(i..i + 2).unwrap_or("");
                let (op, len) = match two {
                    "==" => (CmpOp::Eq, 2),
                    "!=" => (CmpOp::Ne, 2),
                    "<=" => (CmpOp::Le, 2),
                    ">=" => (CmpOp::Ge, 2),
                    _ => match c {
                        '<' => (CmpOp::Lt, 1),
                        '>' => (CmpOp::Gt, 1),
                        _ => {
                            return Err(ParseError {
                                message: format!("unexpected character '{c}'"),
                                position: i,
                            })
                        }
                    },
                };
                tokens.push(Token::Op(op, i));
                i += len;
            }
            '\'' | '"' => {
                let start = i;
                let rest = &input[i + 1..];
                match rest.find(c) {
                    Some(end) => {
                        tokens.push(Token::Str(rest[..end].to_string(), start));
                        i += end + 2;
                    }
                    None => {
                        return Err(ParseError {
                            message: "unterminated string literal".to_string(),
                            position: start,
                        })
                    }
                }
            }
            _ if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_digit() || bytes[i] == b'.')
                {
                    i += 1;
                }
                let text = &input[start..i];
                let num = text.parse::<f64>().map_err(|_| ParseError {
                    message: format!("invalid number '{text}'"),
                    position: start,
                })?;
                tokens.push(Token::Num(num, start));
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len() {
                    let ch = bytes[i] as char;
                    if ch.is_ascii_alphanumeric() || ch == '_' || ch == '.' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let word = &input[start..i];
                if word.eq_ignore_ascii_case("contains") {
                    tokens.push(Token::Op(CmpOp::Contains, start));
                } else {
                    tokens.push(Token::Ident(word.to_string(), start));
                }
            }
            _ => {
                return Err(ParseError {
                    message: format!("unexpected character '{c}'"),
                    position: i,
                })
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_text(&self) -> String {
        match self.peek() {
            Some(Token::Ident(s, _)) => s.clone(),
            Some(Token::Str(s, _)) => format!("'{s}'"),
            Some(Token::Num(n, _)) => n.to_string(),
            Some(Token::LParen(_)) => "(".to_string(),
            Some(Token::RParen(_)) => ")".to_string(),
            Some(Token::Op(_, _)) => "operator".to_string(),
            None => "end of input".to_string(),
        }
    }

    fn peek_offset(&self) -> usize {
        self.peek().map(Token::offset).unwrap_or(0)
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if let Some(Token::Ident(word, _)) = self.peek() {
            if word.eq_ignore_ascii_case(kw) {
                self.pos += 1;
                return true;
            }
        }
        false
    }

    fn parse_or(&mut self) -> Result<Predicate, ParseError> {
        let mut parts = vec![self.parse_and()?];
        while self.eat_keyword("or") {
            parts.push(self.parse_and()?);
        }
        Ok(if parts.len() == 1 {
            parts.pop().unwrap()
        } else {
            Predicate::Or(parts)
        })
    }

    fn parse_and(&mut self) -> Result<Predicate, ParseError> {
        let mut parts = vec![self.parse_unary()?];
        while self.eat_keyword("and") {
            parts.push(self.parse_unary()?);
        }
        Ok(if parts.len() == 1 {
            parts.pop().unwrap()
        } else {
            Predicate::And(parts)
        })
    }

    fn parse_unary(&mut self) -> Result<Predicate, ParseError> {
        if self.eat_keyword("not") {
            return Ok(Predicate::Not(Box::new(self.parse_unary()?)));
        }
        if let Some(Token::LParen(_)) = self.peek() {
            self.pos += 1;
            let inner = self.parse_or()?;
            match self.peek() {
                Some(Token::RParen(_)) => {
                    self.pos += 1;
                    Ok(inner)
                }
                _ => Err(ParseError {
                    message: "expected ')'".to_string(),
                    position: self.peek_offset(),
                }),
            }
        } else {
            self.parse_comparison()
        }
    }

    fn parse_comparison(&mut self) -> Result<Predicate, ParseError> {
        let key = match self.peek() {
            Some(Token::Ident(word, _)) => {
                let key = word.clone();
                self.pos += 1;
                key
            }
            _ => {
                return Err(ParseError {
                    message: format!("expected attribute name, found {}", self.peek_text()),
                    position: self.peek_offset(),
                })
            }
        };

        let op = match self.peek() {
            Some(Token::Op(op, _)) => {
                let op = *op;
                self.pos += 1;
                op
            }
            _ => {
                return Err(ParseError {
                    message: format!("expected comparison operator, found {}", self.peek_text()),
                    position: self.peek_offset(),
                })
            }
        };

        let value = match self.peek() {
            Some(Token::Str(s, _)) => {
                let lit = Literal::Str(s.clone());
                self.pos += 1;
                lit
            }
            Some(Token::Num(n, _)) => {
                let lit = Literal::Num(*n);
                self.pos += 1;
                lit
            }
            Some(Token::Ident(word, _)) if word.eq_ignore_ascii_case("true") => {
                self.pos += 1;
                Literal::Bool(true)
            }
            Some(Token::Ident(word, _)) if word.eq_ignore_ascii_case("false") => {
                self.pos += 1;
                Literal::Bool(false)
            }
            _ => {
                return Err(ParseError {
                    message: format!("expected literal, found {}", self.peek_text()),
                    position: self.peek_offset(),
                })
            }
        };

        Ok(Predicate::Cmp { key, op, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record() -> Record {
        Record::metric("postgresql.query.duration", Utc::now(), 12.0)
            .with_attr("db.system", "postgresql")
            .with_attr("db.name", "orders")
            .with_attr("db.statement", "SELECT * FROM orders")
            .with_attr("db.query.duration_ms", 1500.0)
            .with_attr("db.query.slow", true)
    }

    #[test]
    fn equality_and_boolean_composition() {
        let p = Predicate::parse("db.system == 'postgresql' and db.name != 'billing'").unwrap();
        assert!(p.eval(&record()).unwrap());

        let p = Predicate::parse("db.system == 'mysql' or db.name == 'orders'").unwrap();
        assert!(p.eval(&record()).unwrap());

        let p = Predicate::parse("not (db.system == 'postgresql')").unwrap();
        assert!(!p.eval(&record()).unwrap());
    }

    #[test]
    fn ordering_and_substring() {
        let p = Predicate::parse("db.query.duration_ms >= 1000").unwrap();
        assert!(p.eval(&record()).unwrap());

        let p = Predicate::parse("db.query.duration_ms < 1000").unwrap();
        assert!(!p.eval(&record()).unwrap());

        let p = Predicate::parse("db.statement contains 'FROM orders'").unwrap();
        assert!(p.eval(&record()).unwrap());
    }

    #[test]
    fn boolean_literal_comparison() {
        let p = Predicate::parse("db.query.slow == true").unwrap();
        assert!(p.eval(&record()).unwrap());
    }

    #[test]
    fn missing_attribute_is_false_not_error() {
        let p = Predicate::parse("no.such.attribute == 'x'").unwrap();
        assert_eq!(p.eval(&record()), Ok(false));
    }

    #[test]
    fn type_mismatch_is_an_error() {
        let p = Predicate::parse("db.system > 10").unwrap();
        assert!(p.eval(&record()).is_err());

        let p = Predicate::parse("db.query.duration_ms contains 'x'").unwrap();
        assert!(p.eval(&record()).is_err());
    }

    #[test]
    fn parse_errors_are_reported() {
        assert!(Predicate::parse("db.system ==").is_err());
        assert!(Predicate::parse("== 'x'").is_err());
        assert!(Predicate::parse("(db.system == 'a'").is_err());
        assert!(Predicate::parse("db.system == 'a' garbage").is_err());
        assert!(Predicate::parse("db.system ~ 'a'").is_err());
    }

    #[test]
    fn and_binds_tighter_than_or() {
        // a or (b and c): with a true, the malformed-but-parsable rest is moot
        let p =
            Predicate::parse("db.name == 'orders' or db.name == 'x' and db.system == 'mysql'")
                .unwrap();
        assert!(p.eval(&record()).unwrap());
        match p {
            Predicate::Or(parts) => assert_eq!(parts.len(), 2),
            other => panic!("expected Or at the root, got {other:?}"),
        }
    }
}
