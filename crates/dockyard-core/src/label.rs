//! Scheduler label matching against a template's label set.
//!
//! ```text
//!   expr  := or
//!   or    := and ( "||" and )*
//!   and   := unary ( "&&" unary )*
//!   unary := "!" unary | "(" or ")" | atom
//! ```
//!
//! `!` binds tightest, then `&&`, then `||`. A malformed expression parses
//! to the empty expression, which matches nothing.

use std::collections::BTreeSet;
use std::iter::Peekable;
use std::vec::IntoIter;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Atom(String),
    And,
    Or,
    Not,
    Open,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Atom(String),
    Not(Box<Node>),
    And(Vec<Node>),
    Or(Vec<Node>),
}

impl Node {
    fn eval(&self, labels: &BTreeSet<&str>) -> bool {
        match self {
            Node::Atom(atom) => labels.contains(atom.as_str()),
            Node::Not(inner) => !inner.eval(labels),
            Node::And(nodes) => nodes.iter().all(|n| n.eval(labels)),
            Node::Or(nodes) => nodes.iter().any(|n| n.eval(labels)),
        }
    }
}

fn tokenize(expr: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = expr.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '&' | '|' => {
                chars.next();
                if chars.next() != Some(c) {
                    return None;
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
            }
            '!' => {
                chars.next();
                tokens.push(Token::Not);
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            _ => {
                let mut atom = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || "&|!()".contains(c) {
                        break;
                    }
                    atom.push(c);
                    chars.next();
                }
                tokens.push(Token::Atom(atom));
            }
        }
    }
    Some(tokens)
}

struct Parser {
    tokens: Peekable<IntoIter<Token>>,
}

impl Parser {
    fn or(&mut self) -> Option<Node> {
        let mut nodes = vec![self.and()?];
        while self.tokens.next_if_eq(&Token::Or).is_some() {
            nodes.push(self.and()?);
        }
        Some(if nodes.len() == 1 { nodes.remove(0) } else { Node::Or(nodes) })
    }

    fn and(&mut self) -> Option<Node> {
        let mut nodes = vec![self.unary()?];
        while self.tokens.next_if_eq(&Token::And).is_some() {
            nodes.push(self.unary()?);
        }
        Some(if nodes.len() == 1 { nodes.remove(0) } else { Node::And(nodes) })
    }

    fn unary(&mut self) -> Option<Node> {
        match self.tokens.next()? {
            Token::Not => Some(Node::Not(Box::new(self.unary()?))),
            Token::Open => {
                let inner = self.or()?;
                self.tokens.next_if_eq(&Token::Close)?;
                Some(inner)
            }
            Token::Atom(atom) => Some(Node::Atom(atom)),
            Token::And | Token::Or | Token::Close => None,
        }
    }
}

/// A parsed label expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelExpr {
    root: Option<Node>,
}

impl LabelExpr {
    pub fn parse(expr: &str) -> Self {
        let root = tokenize(expr).and_then(|tokens| {
            let mut parser = Parser {
                tokens: tokens.into_iter().peekable(),
            };
            parser.tokens.peek()?;
            let root = parser.or()?;
            // Trailing tokens mean an unbalanced `)` or a missing operator.
            parser.tokens.peek().is_none().then_some(root)
        });
        Self { root }
    }

    /// True if `labels` satisfy the expression.
    pub fn matches<S: AsRef<str>>(&self, labels: &[S]) -> bool {
        let set: BTreeSet<&str> = labels.iter().map(AsRef::as_ref).collect();
        self.root.as_ref().is_some_and(|root| root.eval(&set))
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_atom() {
        let expr = LabelExpr::parse("docker");
        assert!(expr.matches(&["docker", "linux"]));
        assert!(!expr.matches(&["linux"]));
    }

    #[test]
    fn conjunction_requires_all() {
        let expr = LabelExpr::parse("linux && java17");
        assert!(expr.matches(&["java17", "linux"]));
        assert!(!expr.matches(&["linux"]));
    }

    #[test]
    fn disjunction_requires_any() {
        let expr = LabelExpr::parse("java17 || java21");
        assert!(expr.matches(&["java21"]));
        assert!(!expr.matches(&["java11"]));
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let expr = LabelExpr::parse("linux && java17 || windows");
        assert!(expr.matches(&["windows"]));
        assert!(expr.matches(&["linux", "java17"]));
        assert!(!expr.matches(&["linux"]));
    }

    #[test]
    fn negation_excludes_label() {
        let expr = LabelExpr::parse("docker && !windows");
        assert!(expr.matches(&["docker", "linux"]));
        assert!(!expr.matches(&["docker", "windows"]));

        let double = LabelExpr::parse("!!docker");
        assert!(double.matches(&["docker"]));
    }

    #[test]
    fn parentheses_group() {
        let expr = LabelExpr::parse("(java17 || java21) && linux");
        assert!(expr.matches(&["java21", "linux"]));
        assert!(!expr.matches(&["java21"]));
        assert!(!expr.matches(&["linux"]));

        let negated = LabelExpr::parse("!(arm64 || windows)");
        assert!(negated.matches(&["linux"]));
        assert!(!negated.matches(&["linux", "arm64"]));
    }

    #[test]
    fn malformed_expression_matches_nothing() {
        for bad in ["(linux", "linux)", "linux &&", "linux & docker", "|| linux", "linux docker", "!"] {
            let expr = LabelExpr::parse(bad);
            assert!(expr.is_empty(), "{bad}");
            assert!(!expr.matches(&["linux", "docker"]), "{bad}");
        }
    }

    #[test]
    fn blank_expression_matches_nothing() {
        let expr = LabelExpr::parse("  ");
        assert!(expr.is_empty());
        assert!(!expr.matches(&["docker"]));
    }
}
