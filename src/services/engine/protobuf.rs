// Protobuf schema reader
//
// Reads the subset of the .proto language the metadata importer needs:
// packages, messages (nested included), enums, scalar/message/map fields and
// oneofs. Services, options, reserved ranges and extensions are skipped.

use anyhow::{anyhow, bail, Context, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtoSchema {
    pub package: Option<String>,
    /// Messages in declaration order, nested ones right after their parent
    pub messages: Vec<MessageDef>,
    /// Fully qualified enum names
    pub enums: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDef {
    pub name: String,
    pub full_name: String,
    pub fields: Vec<FieldDef>,
    /// Declared inside another message
    pub nested: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub type_name: String,
    pub number: u32,
    pub label: FieldLabel,
    pub is_map: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldLabel {
    /// No label (proto3 singular)
    Singular,
    Optional,
    Required,
    Repeated,
}

impl ProtoSchema {
    pub fn is_enum(&self, type_name: &str) -> bool {
        self.enums.iter().any(|e| same_type(e, type_name))
    }

    pub fn is_message(&self, type_name: &str) -> bool {
        self.messages.iter().any(|m| same_type(&m.full_name, type_name))
    }

    pub fn message(&self, name: &str) -> Option<&MessageDef> {
        self.messages.iter().find(|m| same_type(&m.full_name, name))
    }
}

/// Compare a fully qualified name with a possibly relative reference
fn same_type(full_name: &str, reference: &str) -> bool {
    let reference = reference.trim_start_matches('.');
    full_name == reference || full_name.ends_with(&format!(".{}", reference))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Str(String),
    Symbol(char),
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Word(w) => format!("'{}'", w),
            Token::Str(s) => format!("\"{}\"", s),
            Token::Symbol(c) => format!("'{}'", c),
        }
    }
}

/// Parse a .proto document
pub fn parse_proto(source: &str) -> Result<ProtoSchema> {
    let tokens = tokenize(source).context("Failed to tokenize protobuf schema")?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        schema: ProtoSchema::default(),
    };
    parser.parse_file()?;
    Ok(parser.schema)
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '/' && chars.get(i + 1) == Some(&'/') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if c == '/' && chars.get(i + 1) == Some(&'*') {
            let start = i;
            i += 2;
            loop {
                if i + 1 >= chars.len() {
                    bail!("unterminated block comment starting at offset {}", start);
                }
                if chars[i] == '*' && chars[i + 1] == '/' {
                    i += 2;
                    break;
                }
                i += 1;
            }
        } else if c == '"' || c == '\'' {
            let quote = c;
            let mut value = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => bail!("unterminated string literal"),
                    Some('\\') => {
                        if let Some(escaped) = chars.get(i + 1) {
                            value.push(*escaped);
                        }
                        i += 2;
                    }
                    Some(&ch) if ch == quote => {
                        i += 1;
                        break;
                    }
                    Some(&ch) => {
                        value.push(ch);
                        i += 1;
                    }
                }
            }
            tokens.push(Token::Str(value));
        } else if is_word_char(c) {
            let start = i;
            while i < chars.len() && is_word_char(chars[i]) {
                i += 1;
            }
            tokens.push(Token::Word(chars[start..i].iter().collect()));
        } else {
            tokens.push(Token::Symbol(c));
            i += 1;
        }
    }

    Ok(tokens)
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '.' | '-' | '+')
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    schema: ProtoSchema,
}

impl Parser {
    fn parse_file(&mut self) -> Result<()> {
        while let Some(token) = self.next() {
            match token {
                Token::Symbol(';') => {}
                Token::Word(w) => match w.as_str() {
                    "syntax" | "edition" | "import" | "option" => self.skip_statement()?,
                    "package" => {
                        self.schema.package = Some(self.expect_word()?);
                        self.expect_symbol(';')?;
                    }
                    "message" => {
                        let scope = self.schema.package.clone();
                        self.parse_message(scope.as_deref(), false)?;
                    }
                    "enum" => {
                        let scope = self.schema.package.clone();
                        self.parse_enum(scope.as_deref())?;
                    }
                    "service" | "extend" => self.skip_block()?,
                    other => bail!("unexpected '{}' at top level", other),
                },
                other => bail!("unexpected {} at top level", other.describe()),
            }
        }
        Ok(())
    }

    fn parse_message(&mut self, scope: Option<&str>, nested: bool) -> Result<()> {
        let name = self.expect_word()?;
        let full_name = qualify(scope, &name);
        self.expect_symbol('{')?;

        let index = self.schema.messages.len();
        let mut fields = Vec::new();

        loop {
            let token = self
                .next()
                .ok_or_else(|| anyhow!("message '{}' is not closed", full_name))?;
            match token {
                Token::Symbol('}') => break,
                Token::Symbol(';') => {}
                Token::Word(w) => match w.as_str() {
                    "message" => self.parse_message(Some(&full_name), true)?,
                    "enum" => self.parse_enum(Some(&full_name))?,
                    "option" | "reserved" | "extensions" => self.skip_statement()?,
                    "extend" => self.skip_block()?,
                    "oneof" => self.parse_oneof(&mut fields)?,
                    "map" => fields.push(self.parse_map_field()?),
                    "repeated" => {
                        let type_name = self.expect_word()?;
                        fields.push(self.parse_field(FieldLabel::Repeated, type_name)?);
                    }
                    "optional" => {
                        let type_name = self.expect_word()?;
                        fields.push(self.parse_field(FieldLabel::Optional, type_name)?);
                    }
                    "required" => {
                        let type_name = self.expect_word()?;
                        fields.push(self.parse_field(FieldLabel::Required, type_name)?);
                    }
                    _ => fields.push(self.parse_field(FieldLabel::Singular, w)?),
                },
                other => bail!("unexpected {} in message '{}'", other.describe(), full_name),
            }
        }

        self.schema.messages.insert(
            index,
            MessageDef {
                name,
                full_name,
                fields,
                nested,
            },
        );
        Ok(())
    }

    fn parse_oneof(&mut self, fields: &mut Vec<FieldDef>) -> Result<()> {
        let name = self.expect_word()?;
        self.expect_symbol('{')?;
        loop {
            match self.next() {
                Some(Token::Symbol('}')) => return Ok(()),
                Some(Token::Symbol(';')) => {}
                Some(Token::Word(w)) if w == "option" => self.skip_statement()?,
                Some(Token::Word(type_name)) => {
                    fields.push(self.parse_field(FieldLabel::Optional, type_name)?)
                }
                Some(other) => bail!("unexpected {} in oneof '{}'", other.describe(), name),
                None => bail!("oneof '{}' is not closed", name),
            }
        }
    }

    fn parse_map_field(&mut self) -> Result<FieldDef> {
        self.expect_symbol('<')?;
        let key = self.expect_word()?;
        self.expect_symbol(',')?;
        let value = self.expect_word()?;
        self.expect_symbol('>')?;
        let mut field = self.parse_field(FieldLabel::Repeated, format!("map<{},{}>", key, value))?;
        field.is_map = true;
        Ok(field)
    }

    /// `name = number [options];` after the label and type
    fn parse_field(&mut self, label: FieldLabel, type_name: String) -> Result<FieldDef> {
        let name = self.expect_word()?;
        self.expect_symbol('=')?;
        let number = self.expect_word()?;
        let number = number
            .parse::<u32>()
            .with_context(|| format!("field '{}' has invalid number '{}'", name, number))?;

        if self.peek() == Some(&Token::Symbol('[')) {
            self.skip_until(']')?;
        }
        self.expect_symbol(';')?;

        Ok(FieldDef {
            name,
            type_name,
            number,
            label,
            is_map: false,
        })
    }

    fn parse_enum(&mut self, scope: Option<&str>) -> Result<()> {
        let name = self.expect_word()?;
        self.schema.enums.push(qualify(scope, &name));
        self.skip_block()
    }

    /// Skip to the end of the current statement, including any `{...}` value
    fn skip_statement(&mut self) -> Result<()> {
        let mut depth = 0usize;
        while let Some(token) = self.next() {
            match token {
                Token::Symbol('{') => depth += 1,
                Token::Symbol('}') => depth = depth.saturating_sub(1),
                Token::Symbol(';') if depth == 0 => return Ok(()),
                _ => {}
            }
        }
        bail!("statement is not terminated by ';'")
    }

    /// Skip up to and including the next balanced `{...}` block
    fn skip_block(&mut self) -> Result<()> {
        self.skip_until('{')?;
        let mut depth = 1usize;
        while let Some(token) = self.next() {
            match token {
                Token::Symbol('{') => depth += 1,
                Token::Symbol('}') => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                _ => {}
            }
        }
        bail!("block is not closed")
    }

    fn skip_until(&mut self, symbol: char) -> Result<()> {
        while let Some(token) = self.next() {
            if token == Token::Symbol(symbol) {
                return Ok(());
            }
        }
        bail!("expected '{}' before end of schema", symbol)
    }

    fn expect_word(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Word(w)) => Ok(w),
            Some(other) => bail!("expected an identifier, found {}", other.describe()),
            None => bail!("expected an identifier, found end of schema"),
        }
    }

    fn expect_symbol(&mut self, symbol: char) -> Result<()> {
        match self.next() {
            Some(Token::Symbol(c)) if c == symbol => Ok(()),
            Some(other) => bail!("expected '{}', found {}", symbol, other.describe()),
            None => bail!("expected '{}', found end of schema", symbol),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }
}

fn qualify(scope: Option<&str>, name: &str) -> String {
    match scope {
        Some(scope) if !scope.is_empty() => format!("{}.{}", scope, name),
        _ => name.to_string(),
    }
}
