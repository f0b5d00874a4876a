//! `.grd` template engine.
//!
//! Templates are plain text with `<% ... %>` tags:
//!
//! | Tag                                  | Meaning                              |
//! |--------------------------------------|--------------------------------------|
//! | `<%= expr %>`                        | HTML-escaped output                  |
//! | `<%- expr %>`                        | raw output                           |
//! | `<% if (cond) %>`                    | conditional                          |
//! | `<% elseif (cond) %>` / `<% else %>` | further branches                     |
//! | `<% endif %>`                        | closes the conditional               |
//! | `<% foreach (list as item) %>`       | loop over an array or object values  |
//! | `<% endforeach %>`                   | closes the loop                      |
//!
//! An expression is a dotted path into the data (`user.name`, `users.0`), a
//! quoted string, a number, `true`, `false` or `null`. A condition is an
//! expression, `!expr`, `a == b` or `a != b`.
//!
//! A template is compiled once into a node tree and can then be rendered any
//! number of times against `serde_json::Value` data.

use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use thiserror::Error;

/// File extension every template name must carry.
pub const EXTENSION: &str = ".grd";

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("invalid template name `{0}`: expected a relative path ending in `.grd`")]
    InvalidName(String),

    #[error("template `{name}` could not be read: {source}")]
    NotFound {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("syntax error at byte {offset}: {message}")]
    Syntax { offset: usize, message: String },
}

fn syntax(offset: usize, message: impl Into<String>) -> TemplateError {
    TemplateError::Syntax {
        offset,
        message: message.into(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Path(Vec<String>),
    Literal(Value),
}

#[derive(Debug, Clone, PartialEq)]
enum Cond {
    Truthy(Expr),
    Not(Expr),
    Eq(Expr, Expr),
    Ne(Expr, Expr),
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Escaped(Expr),
    Raw(Expr),
    If {
        branches: Vec<(Cond, Vec<Node>)>,
        otherwise: Vec<Node>,
    },
    ForEach {
        list: Expr,
        item: String,
        body: Vec<Node>,
    },
}

#[derive(Debug)]
enum Token {
    Text(String),
    Escaped(Expr),
    Raw(Expr),
    If(Cond),
    ElseIf(Cond),
    Else,
    EndIf,
    ForEach(Expr, String),
    EndForEach,
}

impl Token {
    fn keyword(&self) -> &'static str {
        match self {
            Token::Text(_) | Token::Escaped(_) | Token::Raw(_) => "output",
            Token::If(_) => "if",
            Token::ElseIf(_) => "elseif",
            Token::Else => "else",
            Token::EndIf => "endif",
            Token::ForEach(..) => "foreach",
            Token::EndForEach => "endforeach",
        }
    }
}

/// A compiled template.
///
/// ```
/// use socketry::template::Template;
///
/// let template = Template::compile(
///     "<% foreach (users as user) %><li><%= user.name %></li><% endforeach %>",
/// )?;
/// let html = template.render(&serde_json::json!({
///     "users": [{"name": "Ada"}, {"name": "<Bob>"}]
/// }));
/// assert_eq!(html, "<li>Ada</li><li>&lt;Bob&gt;</li>");
/// # Ok::<(), socketry::template::TemplateError>(())
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    nodes: Vec<Node>,
}

impl Template {
    pub fn compile(source: &str) -> Result<Self, TemplateError> {
        let mut tokens = tokenize(source)?.into_iter();
        let (nodes, end) = parse_block(&mut tokens)?;
        if let Some((offset, token)) = end {
            return Err(syntax(
                offset,
                format!("unexpected `{}`", token.keyword()),
            ));
        }
        Ok(Self { nodes })
    }

    pub fn render(&self, data: &Value) -> String {
        let mut out = String::new();
        let mut scope = Vec::new();
        render_nodes(&self.nodes, data, &mut scope, &mut out);
        out
    }
}

/// Loads, compiles and caches templates from a directory.
#[derive(Debug)]
pub struct TemplateEngine {
    dir: PathBuf,
    cache: Mutex<HashMap<String, Arc<Template>>>,
}

impl TemplateEngine {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Renders the template file `name` (relative to the directory) with `data`.
    ///
    /// # Errors
    ///
    /// [`TemplateError::InvalidName`] unless `name` is a relative path ending
    /// in `.grd`, [`TemplateError::NotFound`] when the file cannot be read, and
    /// [`TemplateError::Syntax`] when it does not compile.
    pub fn render(&self, name: &str, data: &Value) -> Result<String, TemplateError> {
        Ok(self.load(name)?.render(data))
    }

    /// Compiles and renders `source` without touching the cache.
    pub fn render_str(&self, source: &str, data: &Value) -> Result<String, TemplateError> {
        Ok(Template::compile(source)?.render(data))
    }

    fn load(&self, name: &str) -> Result<Arc<Template>, TemplateError> {
        if let Some(template) = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Ok(Arc::clone(template));
        }

        let relative = Path::new(name);
        let is_plain = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !name.ends_with(EXTENSION) || !is_plain {
            return Err(TemplateError::InvalidName(name.to_owned()));
        }

        let source = std::fs::read_to_string(self.dir.join(relative)).map_err(|source| {
            TemplateError::NotFound {
                name: name.to_owned(),
                source,
            }
        })?;
        let template = Arc::new(Template::compile(&source)?);
        tracing::debug!(template = name, "compiled template");

        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), Arc::clone(&template));
        Ok(template)
    }
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, TemplateError> {
    let mut tokens = Vec::new();
    let mut pos = 0;

    while let Some(rel) = source[pos..].find("<%") {
        let open = pos + rel;
        if open > pos {
            tokens.push((pos, Token::Text(source[pos..open].to_owned())));
        }
        let body_start = open + 2;
        let close = source[body_start..]
            .find("%>")
            .map(|r| body_start + r)
            .ok_or_else(|| syntax(open, "unterminated tag"))?;
        tokens.push((open, tag(open, &source[body_start..close])?));
        pos = close + 2;
    }
    if pos < source.len() {
        tokens.push((pos, Token::Text(source[pos..].to_owned())));
    }
    Ok(tokens)
}

fn tag(offset: usize, body: &str) -> Result<Token, TemplateError> {
    if let Some(expr) = body.strip_prefix('=') {
        return Ok(Token::Escaped(expression(offset, expr.trim_start_matches('='))?));
    }
    if let Some(expr) = body.strip_prefix('-') {
        return Ok(Token::Raw(expression(offset, expr.trim_start_matches('-'))?));
    }

    let statement = body.trim();
    let (keyword, rest) = statement
        .find(|c: char| !c.is_ascii_alphabetic())
        .map_or((statement, ""), |i| statement.split_at(i));

    match keyword {
        "if" => Ok(Token::If(condition(offset, parenthesized(offset, rest)?)?)),
        "elseif" => Ok(Token::ElseIf(condition(offset, parenthesized(offset, rest)?)?)),
        "else" if rest.trim().is_empty() => Ok(Token::Else),
        "endif" if rest.trim().is_empty() => Ok(Token::EndIf),
        "foreach" => {
            let inner = parenthesized(offset, rest)?;
            let (list, item) = inner
                .rsplit_once(" as ")
                .ok_or_else(|| syntax(offset, "expected `foreach (list as item)`"))?;
            let item = item.trim();
            if !is_identifier(item) {
                return Err(syntax(offset, format!("invalid loop variable `{item}`")));
            }
            Ok(Token::ForEach(expression(offset, list)?, item.to_owned()))
        }
        "endforeach" if rest.trim().is_empty() => Ok(Token::EndForEach),
        _ => Err(syntax(
            offset,
            format!("unsupported statement `{statement}`"),
        )),
    }
}

fn parenthesized(offset: usize, rest: &str) -> Result<&str, TemplateError> {
    rest.trim()
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(|| syntax(offset, "expected a parenthesized expression"))
}

fn condition(offset: usize, source: &str) -> Result<Cond, TemplateError> {
    if let Some((lhs, rhs)) = source.split_once("==") {
        return Ok(Cond::Eq(expression(offset, lhs)?, expression(offset, rhs)?));
    }
    if let Some((lhs, rhs)) = source.split_once("!=") {
        return Ok(Cond::Ne(expression(offset, lhs)?, expression(offset, rhs)?));
    }
    match source.trim().strip_prefix('!') {
        Some(inner) => Ok(Cond::Not(expression(offset, inner)?)),
        None => Ok(Cond::Truthy(expression(offset, source)?)),
    }
}

fn expression(offset: usize, source: &str) -> Result<Expr, TemplateError> {
    let source = source.trim();
    if source.is_empty() {
        return Err(syntax(offset, "empty expression"));
    }

    for quote in ['"', '\''] {
        if let Some(inner) = source
            .strip_prefix(quote)
            .and_then(|s| s.strip_suffix(quote))
        {
            return Ok(Expr::Literal(Value::String(inner.to_owned())));
        }
    }
    match source {
        "true" => return Ok(Expr::Literal(Value::Bool(true))),
        "false" => return Ok(Expr::Literal(Value::Bool(false))),
        "null" => return Ok(Expr::Literal(Value::Null)),
        _ => {}
    }
    if source.starts_with(|c: char| c.is_ascii_digit() || c == '-') {
        return serde_json::from_str::<serde_json::Number>(source)
            .map(|n| Expr::Literal(Value::Number(n)))
            .map_err(|_| syntax(offset, format!("invalid number `{source}`")));
    }

    let segments: Vec<String> = source.split('.').map(str::to_owned).collect();
    let valid = is_identifier(&segments[0])
        && segments[1..]
            .iter()
            .all(|s| is_identifier(s) || (!s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())));
    if !valid {
        return Err(syntax(offset, format!("invalid expression `{source}`")));
    }
    Ok(Expr::Path(segments))
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

type Tokens = std::vec::IntoIter<(usize, Token)>;

// Parses nodes until a token that closes or continues an enclosing block,
// which is returned to the caller.
fn parse_block(tokens: &mut Tokens) -> Result<(Vec<Node>, Option<(usize, Token)>), TemplateError> {
    let mut nodes = Vec::new();
    while let Some((offset, token)) = tokens.next() {
        match token {
            Token::Text(text) => nodes.push(Node::Text(text)),
            Token::Escaped(expr) => nodes.push(Node::Escaped(expr)),
            Token::Raw(expr) => nodes.push(Node::Raw(expr)),
            Token::If(cond) => nodes.push(parse_if(offset, cond, tokens)?),
            Token::ForEach(list, item) => {
                let (body, end) = parse_block(tokens)?;
                match end {
                    Some((_, Token::EndForEach)) => nodes.push(Node::ForEach { list, item, body }),
                    Some((at, other)) => {
                        return Err(syntax(at, format!("unexpected `{}` inside foreach", other.keyword())));
                    }
                    None => return Err(syntax(offset, "foreach without endforeach")),
                }
            }
            closing => return Ok((nodes, Some((offset, closing)))),
        }
    }
    Ok((nodes, None))
}

fn parse_if(offset: usize, first: Cond, tokens: &mut Tokens) -> Result<Node, TemplateError> {
    let mut branches = Vec::new();
    let mut cond = first;
    loop {
        let (body, end) = parse_block(tokens)?;
        branches.push((cond, body));
        match end {
            Some((_, Token::ElseIf(next))) => cond = next,
            Some((_, Token::Else)) => {
                let (otherwise, end) = parse_block(tokens)?;
                return match end {
                    Some((_, Token::EndIf)) => Ok(Node::If { branches, otherwise }),
                    Some((at, other)) => Err(syntax(at, format!("unexpected `{}` after else", other.keyword()))),
                    None => Err(syntax(offset, "if without endif")),
                };
            }
            Some((_, Token::EndIf)) => {
                return Ok(Node::If {
                    branches,
                    otherwise: Vec::new(),
                });
            }
            Some((at, other)) => {
                return Err(syntax(at, format!("unexpected `{}` inside if", other.keyword())));
            }
            None => return Err(syntax(offset, "if without endif")),
        }
    }
}

fn render_nodes<'a>(
    nodes: &'a [Node],
    data: &'a Value,
    scope: &mut Vec<(&'a str, &'a Value)>,
    out: &mut String,
) {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Escaped(expr) => {
                if let Some(value) = resolve(expr, data, scope) {
                    escape_into(&display(value), out);
                }
            }
            Node::Raw(expr) => {
                if let Some(value) = resolve(expr, data, scope) {
                    out.push_str(&display(value));
                }
            }
            Node::If {
                branches,
                otherwise,
            } => {
                let taken = branches
                    .iter()
                    .find(|(cond, _)| evaluate(cond, data, scope.as_slice()))
                    .map_or(otherwise.as_slice(), |(_, body)| body.as_slice());
                render_nodes(taken, data, scope, out);
            }
            Node::ForEach { list, item, body } => {
                let items: Vec<&'a Value> = match resolve(list, data, scope) {
                    Some(Value::Array(values)) => values.iter().collect(),
                    Some(Value::Object(map)) => map.values().collect(),
                    _ => Vec::new(),
                };
                for value in items {
                    scope.push((item.as_str(), value));
                    render_nodes(body, data, scope, out);
                    scope.pop();
                }
            }
        }
    }
}

fn resolve<'a>(expr: &'a Expr, data: &'a Value, scope: &[(&'a str, &'a Value)]) -> Option<&'a Value> {
    let segments = match expr {
        Expr::Literal(value) => return Some(value),
        Expr::Path(segments) => segments,
    };
    let (first, rest) = segments.split_first()?;

    let root = scope
        .iter()
        .rev()
        .find(|(name, _)| name == first)
        .map(|(_, value)| *value)
        .or_else(|| data.get(first.as_str()))?;

    rest.iter().try_fold(root, |value, segment| match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn evaluate(cond: &Cond, data: &Value, scope: &[(&str, &Value)]) -> bool {
    let value = |expr| resolve(expr, data, scope).unwrap_or(&Value::Null);
    match cond {
        Cond::Truthy(expr) => truthy(value(expr)),
        Cond::Not(expr) => !truthy(value(expr)),
        Cond::Eq(lhs, rhs) => value(lhs) == value(rhs),
        Cond::Ne(lhs, rhs) => value(lhs) != value(rhs),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn escape_into(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#039;"),
            _ => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn render(source: &str, data: Value) -> String {
        Template::compile(source).unwrap().render(&data)
    }

    #[test]
    fn escaped_and_raw_output() {
        let data = json!({"name": "<b>Ada</b>", "user": {"email": "a@b.c"}});
        assert_eq!(render("Hi <%= name %>!", data.clone()), "Hi &lt;b&gt;Ada&lt;/b&gt;!");
        assert_eq!(render("Hi <%- name %>!", data.clone()), "Hi <b>Ada</b>!");
        assert_eq!(render("<%= user.email %>", data), "a@b.c");
    }

    #[test]
    fn missing_values_render_empty() {
        assert_eq!(render("[<%= nope.deeper %>]", json!({})), "[]");
    }

    #[test]
    fn conditionals() {
        let source = "<% if (role == 'admin') %>A<% elseif (!role) %>N<% else %>U<% endif %>";
        assert_eq!(render(source, json!({"role": "admin"})), "A");
        assert_eq!(render(source, json!({})), "N");
        assert_eq!(render(source, json!({"role": "guest"})), "U");
        assert_eq!(render("<% if (n != 0) %>yes<% endif %>", json!({"n": 3})), "yes");
    }

    #[test]
    fn nested_loops_and_indexing() {
        let data = json!({
            "groups": [
                {"name": "a", "members": [1, 2]},
                {"name": "b", "members": []}
            ]
        });
        let source = "<% foreach (groups as g) %><%= g.name %>:<% foreach (g.members as m) %><%= m %>,<% endforeach %>;<% endforeach %>";
        assert_eq!(render(source, data.clone()), "a:1,2,;b:;");
        assert_eq!(render("<%= groups.1.name %>", data), "b");
    }

    #[test]
    fn syntax_errors() {
        for source in [
            "<% if (x) %>open",
            "<% endif %>",
            "<% foreach (items) %><% endforeach %>",
            "<% while (x) %><% endwhile %>",
            "<%= a b %>",
            "<%= unterminated",
            "<% foreach (xs as x) %><% endif %>",
        ] {
            assert!(
                matches!(Template::compile(source), Err(TemplateError::Syntax { .. })),
                "{source}"
            );
        }
    }

    #[test]
    fn engine_validates_names() {
        let engine = TemplateEngine::new("views");
        assert!(matches!(
            engine.render("home.html", &json!({})),
            Err(TemplateError::InvalidName(_))
        ));
        assert!(matches!(
            engine.render("../secret.grd", &json!({})),
            Err(TemplateError::InvalidName(_))
        ));
    }

    #[test]
    fn engine_loads_and_caches_files() {
        let dir = std::env::temp_dir().join(format!("socketry-templates-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("greet.grd"), "Hello, <%= name %>!").unwrap();

        let engine = TemplateEngine::new(&dir);
        assert_eq!(
            engine.render("greet.grd", &json!({"name": "World"})).unwrap(),
            "Hello, World!"
        );

        // Served from the cache once compiled.
        std::fs::remove_file(dir.join("greet.grd")).unwrap();
        assert_eq!(
            engine.render("greet.grd", &json!({"name": "again"})).unwrap(),
            "Hello, again!"
        );
        assert!(matches!(
            engine.render("missing.grd", &json!({})),
            Err(TemplateError::NotFound { .. })
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
