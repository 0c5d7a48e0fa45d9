//! SQL tokens, the atomic units of rendered output.
//!
//! A [`TokenStream`] is built dialect-agnostic and only becomes text in
//! [`TokenStream::serialize`], where quoting, literals and function names are
//! settled by the target dialect.

use std::fmt;

use super::dialect::{Dialect, SqlDialect};

/// Reserved words. These render the same in every supported dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Select,
    Distinct,
    All,
    From,
    Where,
    GroupBy,
    Having,
    OrderBy,
    Asc,
    Desc,
    NullsFirst,
    NullsLast,
    Limit,
    Offset,
    Fetch,
    Next,
    Rows,
    Only,
    As,
    With,
    Recursive,
    Union,
    // joins
    Join,
    Inner,
    Left,
    Right,
    Full,
    Outer,
    Cross,
    On,
    // predicates
    And,
    Or,
    Not,
    In,
    Like,
    IsNull,
    IsNotNull,
    Null,
    // case
    Case,
    When,
    Then,
    Else,
    End,
    // windows
    Over,
    PartitionBy,
}

impl Keyword {
    pub fn as_str(self) -> &'static str {
        use Keyword::*;
        match self {
            Select => "SELECT",
            Distinct => "DISTINCT",
            All => "ALL",
            From => "FROM",
            Where => "WHERE",
            GroupBy => "GROUP BY",
            Having => "HAVING",
            OrderBy => "ORDER BY",
            Asc => "ASC",
            Desc => "DESC",
            NullsFirst => "NULLS FIRST",
            NullsLast => "NULLS LAST",
            Limit => "LIMIT",
            Offset => "OFFSET",
            Fetch => "FETCH",
            Next => "NEXT",
            Rows => "ROWS",
            Only => "ONLY",
            As => "AS",
            With => "WITH",
            Recursive => "RECURSIVE",
            Union => "UNION",
            Join => "JOIN",
            Inner => "INNER",
            Left => "LEFT",
            Right => "RIGHT",
            Full => "FULL",
            Outer => "OUTER",
            Cross => "CROSS",
            On => "ON",
            And => "AND",
            Or => "OR",
            Not => "NOT",
            In => "IN",
            Like => "LIKE",
            IsNull => "IS NULL",
            IsNotNull => "IS NOT NULL",
            Null => "NULL",
            Case => "CASE",
            When => "WHEN",
            Then => "THEN",
            Else => "ELSE",
            End => "END",
            Over => "OVER",
            PartitionBy => "PARTITION BY",
        }
    }
}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One element of rendered SQL.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Kw(Keyword),

    // punctuation
    Comma,
    Dot,
    Star,
    LParen,
    RParen,

    // operators
    Eq,
    Ne,
    Lt,
    Gt,
    Lte,
    Gte,
    Plus,
    Minus,
    Mul,
    Div,
    Mod,
    /// String concatenation; `||` or `+` depending on the dialect.
    Concat,

    // layout
    Space,
    Newline,
    Indent(usize),

    /// Table, column or alias name, quoted per dialect.
    Ident(String),
    /// `schema.table`.
    QualifiedIdent { schema: Option<String>, name: String },
    LitInt(i64),
    LitFloat(f64),
    LitString(String),
    LitBool(bool),
    LitNull,

    /// Function name, remapped per dialect (`LENGTH` is `LEN` on T-SQL).
    FunctionName(String),

    /// SQL passed through unescaped: datasource column expressions, query
    /// datasources and dialect templates.
    Raw(String),
    /// `-- text` followed by a newline.
    Comment(String),
}

impl From<Keyword> for Token {
    fn from(kw: Keyword) -> Self {
        Token::Kw(kw)
    }
}

impl Token {
    /// Text of tokens that never depend on the dialect.
    fn fixed(&self) -> Option<&'static str> {
        Some(match self {
            Token::Kw(kw) => kw.as_str(),
            Token::Comma => ",",
            Token::Dot => ".",
            Token::Star | Token::Mul => "*",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::Eq => "=",
            Token::Ne => "<>",
            Token::Lt => "<",
            Token::Gt => ">",
            Token::Lte => "<=",
            Token::Gte => ">=",
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Div => "/",
            Token::Mod => "%",
            Token::Space => " ",
            Token::Newline => "\n",
            Token::LitNull => "NULL",
            _ => return None,
        })
    }

    pub fn serialize(&self, dialect: Dialect) -> String {
        if let Some(text) = self.fixed() {
            return text.to_string();
        }
        match self {
            Token::Concat => dialect.concat_operator().into(),
            Token::Indent(n) => "  ".repeat(*n),
            Token::Ident(name) => dialect.quote_identifier(name),
            Token::QualifiedIdent { schema: Some(s), name } => {
                format!("{}.{}", dialect.quote_identifier(s), dialect.quote_identifier(name))
            }
            Token::QualifiedIdent { schema: None, name } => dialect.quote_identifier(name),
            Token::LitInt(n) => n.to_string(),
            Token::LitFloat(f) if !f.is_finite() => {
                log::warn!("non-finite float {} rendered as NULL", f);
                "NULL".into()
            }
            Token::LitFloat(f) => ryu::Buffer::new().format(*f).to_string(),
            Token::LitString(s) => dialect.quote_string(s),
            Token::LitBool(b) => dialect.format_bool(*b).into(),
            Token::FunctionName(name) => dialect
                .remap_function(name)
                .unwrap_or(name.as_str())
                .to_uppercase(),
            Token::Raw(s) => s.clone(),
            Token::Comment(text) => text
                .lines()
                .map(|l| format!("-- {}\n", l.trim_start_matches("-- ")))
                .collect(),
            other => unreachable!("{:?} has fixed text", other),
        }
    }
}

/// An ordered run of tokens.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenStream {
    tokens: Vec<Token>,
}

impl TokenStream {
    pub fn new() -> Self {
        Self { tokens: vec![] }
    }

    pub fn push(&mut self, token: Token) -> &mut Self {
        self.tokens.push(token);
        self
    }

    pub fn kw(&mut self, kw: Keyword) -> &mut Self {
        self.push(Token::Kw(kw))
    }

    pub fn extend(&mut self, tokens: impl IntoIterator<Item = Token>) -> &mut Self {
        self.tokens.extend(tokens);
        self
    }

    pub fn append(&mut self, other: &TokenStream) -> &mut Self {
        self.tokens.extend(other.tokens.iter().cloned());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn serialize(&self, dialect: Dialect) -> String {
        self.tokens.iter().map(|t| t.serialize(dialect)).collect()
    }

    pub fn space(&mut self) -> &mut Self {
        self.push(Token::Space)
    }
    pub fn newline(&mut self) -> &mut Self {
        self.push(Token::Newline)
    }
    pub fn indent(&mut self, n: usize) -> &mut Self {
        self.push(Token::Indent(n))
    }
    pub fn comma(&mut self) -> &mut Self {
        self.push(Token::Comma)
    }
    pub fn lparen(&mut self) -> &mut Self {
        self.push(Token::LParen)
    }
    pub fn rparen(&mut self) -> &mut Self {
        self.push(Token::RParen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_quoting_per_dialect() {
        let tok = Token::Ident("users".into());
        assert_eq!(tok.serialize(Dialect::DuckDb), "\"users\"");
        assert_eq!(tok.serialize(Dialect::TSql), "[users]");
        assert_eq!(tok.serialize(Dialect::BigQuery), "`users`");
        let qualified = Token::QualifiedIdent {
            schema: Some("dbo".into()),
            name: "users".into(),
        };
        assert_eq!(qualified.serialize(Dialect::TSql), "[dbo].[users]");
    }

    #[test]
    fn test_stream_joins_keywords_and_names() {
        let mut ts = TokenStream::new();
        ts.kw(Keyword::Select)
            .space()
            .push(Token::Ident("name".into()))
            .space()
            .kw(Keyword::From)
            .space()
            .push(Token::Ident("users".into()));
        assert_eq!(ts.serialize(Dialect::Sqlite), "SELECT \"name\" FROM \"users\"");
    }

    #[test]
    fn test_float_literals() {
        assert_eq!(Token::LitFloat(3.25).serialize(Dialect::DuckDb), "3.25");
        assert_eq!(Token::LitFloat(1.0).serialize(Dialect::DuckDb), "1.0");
        assert_eq!(Token::LitFloat(f64::NAN).serialize(Dialect::DuckDb), "NULL");
        assert_eq!(Token::LitFloat(f64::INFINITY).serialize(Dialect::Postgres), "NULL");
    }

    #[test]
    fn test_comment_lines() {
        let tok = Token::Comment("Target: a.\n-- Output: b.".into());
        assert_eq!(tok.serialize(Dialect::DuckDb), "-- Target: a.\n-- Output: b.\n");
    }

    #[test]
    fn test_function_name_remap() {
        let tok = Token::FunctionName("length".into());
        assert_eq!(tok.serialize(Dialect::TSql), "LEN");
        assert_eq!(tok.serialize(Dialect::Postgres), "LENGTH");
        assert_eq!(Token::FunctionName("any_value".into()).serialize(Dialect::Sqlite), "MAX");
    }
}
