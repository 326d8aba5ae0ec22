//! Rule language compiler.
//!
//! Accepts the block syntax
//!
//! ```text
//! # comment
//! service "web" { policy = "write" intentions = "read" }
//! key_prefix "" { policy = "read" }
//! operator = "read"
//! ```
//!
//! or the equivalent JSON document
//! (`{"service": {"web": {"policy": "write"}}, "operator": "read"}`),
//! and lowers both into a canonical [`RuleTree`].

use std::collections::BTreeMap;

use crate::error::{AclError, Result};

use super::model::{AccessLevel, MatchKind, ResourceKind, Rule, RuleTree, Selector};

/// Compile rule text into a rule tree.
///
/// Pure and deterministic: the same text always yields the same tree.
pub fn compile(text: &str) -> Result<RuleTree> {
    let statements = if text.trim_start().starts_with('{') {
        parse_json(text)?
    } else {
        Parser::new(text).parse()?
    };
    lower(statements)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Statements
// ═══════════════════════════════════════════════════════════════════════════════

/// A parsed but not yet validated statement.
#[derive(Debug)]
enum Statement {
    /// `operator = "read"`
    Assign { ident: String, value: String, line: usize },
    /// `service "web" { ... }`
    Block {
        ident: String,
        name: String,
        attrs: Vec<(String, String)>,
        line: usize,
    },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Lexer
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    LBrace,
    RBrace,
    Equals,
    Eof,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(s) => format!("identifier `{}`", s),
            Token::Str(s) => format!("string {:?}", s),
            Token::LBrace => "'{'".to_string(),
            Token::RBrace => "'}'".to_string(),
            Token::Equals => "'='".to_string(),
            Token::Eof => "end of input".to_string(),
        }
    }
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            chars: src.chars().peekable(),
            line: 1,
            column: 1,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn skip_line(&mut self) {
        while let Some(c) = self.bump() {
            if c == '\n' {
                break;
            }
        }
    }

    /// Skip whitespace, commas and comments.
    fn skip_trivia(&mut self) -> Result<()> {
        loop {
            match self.chars.peek().copied() {
                Some(c) if c.is_whitespace() || c == ',' => {
                    self.bump();
                }
                Some('#') => self.skip_line(),
                Some('/') => {
                    let (line, column) = (self.line, self.column);
                    self.bump();
                    match self.bump() {
                        Some('/') => self.skip_line(),
                        Some('*') => {
                            let mut prev = '\0';
                            loop {
                                match self.bump() {
                                    Some('/') if prev == '*' => break,
                                    Some(c) => prev = c,
                                    None => {
                                        return Err(AclError::syntax(
                                            line,
                                            column,
                                            "unterminated block comment",
                                        ))
                                    }
                                }
                            }
                        }
                        _ => return Err(AclError::syntax(line, column, "unexpected '/'")),
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// Next token with the position it started at.
    fn next_token(&mut self) -> Result<(Token, usize, usize)> {
        self.skip_trivia()?;
        let (line, column) = (self.line, self.column);
        let Some(c) = self.bump() else {
            return Ok((Token::Eof, line, column));
        };

        let token = match c {
            '{' => Token::LBrace,
            '}' => Token::RBrace,
            '=' => Token::Equals,
            '"' => Token::Str(self.string(line, column)?),
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::from(c);
                while let Some(&n) = self.chars.peek() {
                    if n.is_ascii_alphanumeric() || n == '_' || n == '-' {
                        ident.push(n);
                        self.bump();
                    } else {
                        break;
                    }
                }
                Token::Ident(ident)
            }
            other => {
                return Err(AclError::syntax(
                    line,
                    column,
                    format!("unexpected character {:?}", other),
                ))
            }
        };
        Ok((token, line, column))
    }

    fn string(&mut self, line: usize, column: usize) -> Result<String> {
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(out),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('"') => out.push('"'),
                    Some('\\') => out.push('\\'),
                    Some(other) => {
                        return Err(AclError::syntax(
                            self.line,
                            self.column,
                            format!("invalid escape sequence \\{}", other),
                        ))
                    }
                    None => break,
                },
                Some('\n') | None => break,
                Some(c) => out.push(c),
            }
        }
        Err(AclError::syntax(line, column, "unterminated string"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Parser
// ═══════════════════════════════════════════════════════════════════════════════

struct Parser<'a> {
    lexer: Lexer<'a>,
    peeked: Option<(Token, usize, usize)>,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            lexer: Lexer::new(src),
            peeked: None,
        }
    }

    fn next(&mut self) -> Result<(Token, usize, usize)> {
        match self.peeked.take() {
            Some(t) => Ok(t),
            None => self.lexer.next_token(),
        }
    }

    fn peek(&mut self) -> Result<&Token> {
        if self.peeked.is_none() {
            self.peeked = Some(self.lexer.next_token()?);
        }
        Ok(self.peeked.as_ref().map(|(t, _, _)| t).unwrap_or(&Token::Eof))
    }

    fn expect_string(&mut self, after: &str) -> Result<String> {
        match self.next()? {
            (Token::Str(s), _, _) => Ok(s),
            (other, line, column) => Err(AclError::syntax(
                line,
                column,
                format!("expected quoted string after {}, found {}", after, other.describe()),
            )),
        }
    }

    fn parse(mut self) -> Result<Vec<Statement>> {
        let mut statements = Vec::new();
        loop {
            let (token, line, column) = self.next()?;
            let ident = match token {
                Token::Eof => return Ok(statements),
                Token::Ident(ident) => ident,
                other => {
                    return Err(AclError::syntax(
                        line,
                        column,
                        format!("expected resource identifier, found {}", other.describe()),
                    ))
                }
            };

            match self.next()? {
                (Token::Equals, _, _) => {
                    let value = self.expect_string(&format!("`{} =`", ident))?;
                    statements.push(Statement::Assign { ident, value, line });
                }
                (Token::Str(name), _, _) => {
                    let attrs = self.block(&ident)?;
                    statements.push(Statement::Block {
                        ident,
                        name,
                        attrs,
                        line,
                    });
                }
                (other, l, c) => {
                    return Err(AclError::syntax(
                        l,
                        c,
                        format!(
                            "expected '=' or a quoted name after `{}`, found {}",
                            ident,
                            other.describe()
                        ),
                    ))
                }
            }
        }
    }

    fn block(&mut self, ident: &str) -> Result<Vec<(String, String)>> {
        match self.next()? {
            (Token::LBrace, _, _) => {}
            (other, line, column) => {
                return Err(AclError::syntax(
                    line,
                    column,
                    format!("expected '{{' to open `{}` block, found {}", ident, other.describe()),
                ))
            }
        }

        let mut attrs = Vec::new();
        loop {
            if *self.peek()? == Token::RBrace {
                self.next()?;
                return Ok(attrs);
            }
            let key = match self.next()? {
                (Token::Ident(key), _, _) => key,
                (other, line, column) => {
                    return Err(AclError::syntax(
                        line,
                        column,
                        format!("expected attribute or '}}', found {}", other.describe()),
                    ))
                }
            };
            match self.next()? {
                (Token::Equals, _, _) => {}
                (other, line, column) => {
                    return Err(AclError::syntax(
                        line,
                        column,
                        format!("expected '=' after `{}`, found {}", key, other.describe()),
                    ))
                }
            }
            let value = self.expect_string(&format!("`{} =`", key))?;
            attrs.push((key, value));
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// JSON form
// ═══════════════════════════════════════════════════════════════════════════════

fn parse_json(text: &str) -> Result<Vec<Statement>> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| AclError::syntax(e.line(), e.column(), format!("invalid JSON rules: {}", e)))?;

    let serde_json::Value::Object(top) = value else {
        return Err(AclError::syntax(1, 1, "JSON rules must be an object"));
    };

    let mut statements = Vec::new();
    for (ident, body) in top {
        match body {
            serde_json::Value::String(value) => {
                statements.push(Statement::Assign { ident, value, line: 1 });
            }
            serde_json::Value::Object(named) => {
                for (name, attrs) in named {
                    let serde_json::Value::Object(attrs) = attrs else {
                        return Err(AclError::syntax(
                            1,
                            1,
                            format!("`{}` entry {:?} must be an object", ident, name),
                        ));
                    };
                    let mut pairs = Vec::with_capacity(attrs.len());
                    for (key, value) in attrs {
                        let serde_json::Value::String(value) = value else {
                            return Err(AclError::syntax(
                                1,
                                1,
                                format!("attribute `{}` of {} {:?} must be a string", key, ident, name),
                            ));
                        };
                        pairs.push((key, value));
                    }
                    statements.push(Statement::Block {
                        ident: ident.clone(),
                        name,
                        attrs: pairs,
                        line: 1,
                    });
                }
            }
            _ => {
                return Err(AclError::syntax(
                    1,
                    1,
                    format!("`{}` must be a string or an object", ident),
                ))
            }
        }
    }
    Ok(statements)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Semantic lowering
// ═══════════════════════════════════════════════════════════════════════════════

fn resolve_ident(ident: &str, line: usize) -> Result<(ResourceKind, MatchKind)> {
    let (base, match_kind) = match ident.strip_suffix("_prefix") {
        Some(base) => (base, MatchKind::Prefix),
        None => (ident, MatchKind::Exact),
    };
    let kind = ResourceKind::parse(base).ok_or_else(|| {
        AclError::semantic(format!("line {}: unknown resource type `{}`", line, ident))
    })?;
    if kind.is_kind_level() && match_kind == MatchKind::Prefix {
        return Err(AclError::semantic(format!(
            "line {}: `{}` has no prefix form",
            line, ident
        )));
    }
    Ok((kind, match_kind))
}

fn access_level(value: &str, kind: ResourceKind, line: usize) -> Result<AccessLevel> {
    let level = AccessLevel::parse(value).ok_or_else(|| {
        AclError::semantic(format!(
            "line {}: invalid access level {:?} (expected deny, read, write or list)",
            line, value
        ))
    })?;
    if level == AccessLevel::List && !kind.supports_list() {
        return Err(AclError::semantic(format!(
            "line {}: `list` is only valid for key rules, not `{}`",
            line, kind
        )));
    }
    Ok(level)
}

fn lower(statements: Vec<Statement>) -> Result<RuleTree> {
    let mut rules: BTreeMap<Selector, Rule> = BTreeMap::new();

    for statement in statements {
        let (rule, line) = match statement {
            Statement::Assign { ident, value, line } => {
                let (kind, _) = resolve_ident(&ident, line)?;
                if !kind.is_kind_level() {
                    return Err(AclError::semantic(format!(
                        "line {}: `{}` rules need a quoted name and a block",
                        line, ident
                    )));
                }
                let rule = Rule {
                    selector: Selector::kind_level(kind),
                    policy: Some(access_level(&value, kind, line)?),
                    intentions: None,
                };
                (rule, line)
            }
            Statement::Block {
                ident,
                name,
                attrs,
                line,
            } => {
                let (kind, match_kind) = resolve_ident(&ident, line)?;
                if kind.is_kind_level() {
                    return Err(AclError::semantic(format!(
                        "line {}: `{}` takes a single value, not a named block",
                        line, ident
                    )));
                }

                let mut policy = None;
                let mut intentions = None;
                for (key, value) in attrs {
                    let slot = match key.as_str() {
                        "policy" => &mut policy,
                        "intentions" if kind.supports_intentions() => &mut intentions,
                        "intentions" => {
                            return Err(AclError::semantic(format!(
                                "line {}: `intentions` is only valid for service rules",
                                line
                            )))
                        }
                        other => {
                            return Err(AclError::semantic(format!(
                                "line {}: unknown attribute `{}` in `{}` block",
                                line, other, ident
                            )))
                        }
                    };
                    if slot.is_some() {
                        return Err(AclError::semantic(format!(
                            "line {}: attribute `{}` set twice in {} {:?}",
                            line, key, ident, name
                        )));
                    }
                    let level = access_level(&value, kind, line)?;
                    if key == "intentions" && level == AccessLevel::List {
                        return Err(AclError::semantic(format!(
                            "line {}: intentions cannot be `list`",
                            line
                        )));
                    }
                    *slot = Some(level);
                }

                if policy.is_none() && intentions.is_none() {
                    return Err(AclError::semantic(format!(
                        "line {}: {} {:?} grants nothing (set `policy` or `intentions`)",
                        line, ident, name
                    )));
                }

                // `service ""` is the wildcard, same as `service_prefix ""`.
                let match_kind = if name.is_empty() {
                    MatchKind::Prefix
                } else {
                    match_kind
                };
                let selector = Selector {
                    kind,
                    name,
                    match_kind,
                };
                (
                    Rule {
                        selector,
                        policy,
                        intentions,
                    },
                    line,
                )
            }
        };

        match rules.get(&rule.selector) {
            Some(existing) if *existing == rule => {}
            Some(_) => {
                return Err(AclError::semantic(format!(
                    "line {}: conflicting grants for {}",
                    line, rule.selector
                )))
            }
            None => {
                rules.insert(rule.selector.clone(), rule);
            }
        }
    }

    Ok(RuleTree::from_sorted(rules.into_values().collect()))
}
