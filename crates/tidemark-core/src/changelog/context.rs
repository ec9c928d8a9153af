//! Context and label expressions.
//!
//! A change set's `context` attribute is a boolean expression over context
//! names (`dev, test`, `!prod`, `qa and (eu or us)`). The runtime supplies a
//! set of active contexts. Labels work the other way round: the change set
//! carries a plain list and the runtime supplies the expression.
//!
//! `,` and `or` are disjunction, `and` is conjunction, `!` and `not` negate.
//! `and` binds tighter than `or`. Names are case-insensitive.

use serde::{Serialize, Serializer};

use super::ChangeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Name(String),
    Not(Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
}

impl Node {
    fn eval(&self, active: &[String]) -> bool {
        match self {
            Node::Name(name) => active.iter().any(|a| a == name),
            Node::Not(inner) => !inner.eval(active),
            Node::And(l, r) => l.eval(active) && r.eval(active),
            Node::Or(l, r) => l.eval(active) || r.eval(active),
        }
    }
}

/// A parsed context or label expression.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContextExpr {
    source: String,
    root: Option<Node>,
}

impl ContextExpr {
    /// The empty expression, which matches everything.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse an expression. Blank input yields the empty expression.
    pub fn parse(input: &str) -> Result<Self, String> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Ok(Self::empty());
        }

        let mut parser = ExprParser { tokens, pos: 0 };
        let root = parser.parse_or()?;
        if let Some(token) = parser.tokens.get(parser.pos) {
            return Err(format!("unexpected '{}' in expression '{}'", token, input));
        }

        Ok(Self {
            source: input.trim().to_string(),
            root: Some(root),
        })
    }

    /// Check if the expression is empty.
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// The expression as written.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Evaluate against a set of names. The empty expression is always true.
    pub fn matches<I, S>(&self, names: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        match &self.root {
            None => true,
            Some(root) => {
                let active: Vec<String> = names
                    .into_iter()
                    .map(|n| n.as_ref().trim().to_lowercase())
                    .collect();
                root.eval(&active)
            }
        }
    }
}

impl std::fmt::Display for ContextExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

impl Serialize for ContextExpr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

/// Runtime selection of change sets by context and label.
#[derive(Debug, Clone, Default)]
pub struct ContextFilter {
    contexts: Vec<String>,
    labels: ContextExpr,
}

impl ContextFilter {
    /// A filter that accepts every change set.
    pub fn all() -> Self {
        Self::default()
    }

    /// Build a filter from active contexts and a label expression.
    pub fn new<I, S>(contexts: I, labels: ContextExpr) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            contexts: contexts
                .into_iter()
                .map(|c| c.into().trim().to_lowercase())
                .filter(|c| !c.is_empty())
                .collect(),
            labels,
        }
    }

    /// Active contexts.
    pub fn contexts(&self) -> &[String] {
        &self.contexts
    }

    /// Label expression.
    pub fn labels(&self) -> &ContextExpr {
        &self.labels
    }

    /// Decide whether a change set takes part in this run.
    ///
    /// With no active contexts every context expression passes. A change set
    /// without labels passes any label expression.
    pub fn accepts(&self, change_set: &ChangeSet) -> bool {
        let context_ok = self.contexts.is_empty() || change_set.contexts.matches(&self.contexts);
        let labels_ok = change_set.labels.is_empty() || self.labels.matches(&change_set.labels);
        context_ok && labels_ok
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Name(String),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Name(n) => write!(f, "{}", n),
            Token::And => write!(f, "and"),
            Token::Or => write!(f, "or"),
            Token::Not => write!(f, "not"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            ',' => {
                chars.next();
                tokens.push(Token::Or);
            }
            '!' => {
                chars.next();
                tokens.push(Token::Not);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            c if is_name_char(c) => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if !is_name_char(c) {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                let lower = word.to_lowercase();
                tokens.push(match lower.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Name(lower),
                });
            }
            other => {
                return Err(format!("invalid character '{}' in expression '{}'", other, input))
            }
        }
    }

    Ok(tokens)
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ':' | '$' | '{' | '}')
}

struct ExprParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl ExprParser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn parse_or(&mut self) -> Result<Node, String> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Node::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Node, String> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Node::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Node, String> {
        match self.tokens.get(self.pos).cloned() {
            Some(Token::Not) => {
                self.pos += 1;
                Ok(Node::Not(Box::new(self.parse_unary()?)))
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.parse_or()?;
                if self.peek() != Some(&Token::RParen) {
                    return Err("missing ')' in expression".to_string());
                }
                self.pos += 1;
                Ok(inner)
            }
            Some(Token::Name(name)) => {
                self.pos += 1;
                Ok(Node::Name(name))
            }
            Some(other) => Err(format!("unexpected '{}' in expression", other)),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}
