//! Canonical value encoding and the XML plist codec.
//!
//! Two encodings live here. The canonical byte encoding of a value is the
//! injective form hashed for row filenames: a one-byte tag followed by the
//! payload (`n`, `i` + decimal, `r` + big-endian IEEE-754 bits, `s` + NFD
//! text, `d` + raw bytes). The plist codec serializes rows and whole tables
//! as XML property lists; each cell value is a one-entry dict keyed by its
//! tag so null and blob survive the round trip losslessly.

use hashbrown::HashSet;
use ravel_core::{Attribute, Error, Result, Row, Scheme, Value};
use unicode_normalization::UnicodeNormalization;

/// Produces the canonical byte encoding of a value.
///
/// The encoding is injective over the storable value domain; `NotFound` is
/// not encodable.
pub fn canonical_encoding(value: &Value) -> Result<Vec<u8>> {
    match value {
        Value::Null => Ok(b"n".to_vec()),
        Value::Integer(v) => Ok(format!("i{}", v).into_bytes()),
        Value::Real(v) => {
            let mut bytes = Vec::with_capacity(9);
            bytes.push(b'r');
            bytes.extend_from_slice(&v.to_bits().to_be_bytes());
            Ok(bytes)
        }
        Value::Text(s) => {
            let mut bytes = vec![b's'];
            let normalized: String = s.nfd().collect();
            bytes.extend_from_slice(normalized.as_bytes());
            Ok(bytes)
        }
        Value::Blob(b) => {
            let mut bytes = Vec::with_capacity(b.len() + 1);
            bytes.push(b'd');
            bytes.extend_from_slice(b);
            Ok(bytes)
        }
        Value::NotFound => Err(Error::serialization("notFound has no canonical encoding")),
    }
}

/// The subset of plist node types this codec reads and writes.
#[derive(Clone, Debug, PartialEq)]
enum PlistNode {
    Dict(Vec<(String, PlistNode)>),
    Array(Vec<PlistNode>),
    String(String),
    Integer(i64),
    Real(f64),
    Data(Vec<u8>),
    True,
}

// ===== value / row / table conversion =====

fn value_to_node(value: &Value) -> Result<PlistNode> {
    let (tag, node) = match value {
        Value::Null => ("n", PlistNode::True),
        Value::Integer(v) => ("i", PlistNode::Integer(*v)),
        Value::Real(v) => ("r", PlistNode::Real(*v)),
        Value::Text(s) => ("s", PlistNode::String(s.clone())),
        Value::Blob(b) => ("d", PlistNode::Data(b.clone())),
        Value::NotFound => {
            return Err(Error::serialization("notFound cannot be serialized"))
        }
    };
    Ok(PlistNode::Dict(vec![(tag.to_string(), node)]))
}

fn node_to_value(node: &PlistNode) -> Result<Value> {
    let entries = match node {
        PlistNode::Dict(entries) => entries,
        _ => return Err(Error::serialization("cell value must be a tagged dict")),
    };
    if entries.len() != 1 {
        return Err(Error::serialization("cell value dict must have one entry"));
    }
    let (tag, payload) = &entries[0];
    match (tag.as_str(), payload) {
        ("n", PlistNode::True) => Ok(Value::Null),
        ("i", PlistNode::Integer(v)) => Ok(Value::Integer(*v)),
        ("r", PlistNode::Real(v)) => Ok(Value::Real(*v)),
        ("s", PlistNode::String(s)) => Ok(Value::Text(s.clone())),
        ("d", PlistNode::Data(b)) => Ok(Value::Blob(b.clone())),
        _ => Err(Error::serialization(format!("unknown value tag {:?}", tag))),
    }
}

fn row_to_node(row: &Row) -> Result<PlistNode> {
    let mut entries = Vec::with_capacity(row.len());
    for (attribute, value) in row.iter() {
        entries.push((attribute.name().to_string(), value_to_node(value)?));
    }
    Ok(PlistNode::Dict(entries))
}

fn node_to_row(node: &PlistNode) -> Result<Row> {
    let entries = match node {
        PlistNode::Dict(entries) => entries,
        _ => return Err(Error::serialization("row must be a dict")),
    };
    let mut pairs = Vec::with_capacity(entries.len());
    for (name, value) in entries {
        pairs.push((Attribute::new(name), node_to_value(value)?));
    }
    Ok(Row::new(pairs))
}

/// Serializes one row as an XML plist document.
pub fn encode_row(row: &Row) -> Result<Vec<u8>> {
    Ok(write_document(&row_to_node(row)?).into_bytes())
}

/// Reads one row back from an XML plist document.
pub fn decode_row(bytes: &[u8]) -> Result<Row> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| Error::serialization("row plist is not valid UTF-8"))?;
    node_to_row(&parse_document(text)?)
}

/// Serializes a scheme plus its rows as one XML plist document.
pub fn encode_table(scheme: &Scheme, rows: &HashSet<Row>) -> Result<Vec<u8>> {
    let mut attributes: Vec<&Attribute> = scheme.iter().collect();
    attributes.sort();
    let scheme_node = PlistNode::Array(
        attributes
            .iter()
            .map(|a| PlistNode::String(a.name().to_string()))
            .collect(),
    );

    let mut sorted_rows: Vec<&Row> = rows.iter().collect();
    sorted_rows.sort();
    let mut row_nodes = Vec::with_capacity(sorted_rows.len());
    for row in sorted_rows {
        row_nodes.push(row_to_node(row)?);
    }

    let root = PlistNode::Dict(vec![
        ("scheme".to_string(), scheme_node),
        ("rows".to_string(), PlistNode::Array(row_nodes)),
    ]);
    Ok(write_document(&root).into_bytes())
}

/// Reads a scheme plus rows back from an XML plist document.
pub fn decode_table(bytes: &[u8]) -> Result<(Scheme, HashSet<Row>)> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| Error::serialization("table plist is not valid UTF-8"))?;
    let root = parse_document(text)?;
    let entries = match &root {
        PlistNode::Dict(entries) => entries,
        _ => return Err(Error::serialization("table plist root must be a dict")),
    };

    let mut scheme = None;
    let mut rows = None;
    for (key, node) in entries {
        match key.as_str() {
            "scheme" => {
                let names = match node {
                    PlistNode::Array(items) => items,
                    _ => return Err(Error::serialization("scheme must be an array")),
                };
                let mut result = Scheme::new();
                for item in names {
                    match item {
                        PlistNode::String(name) => {
                            result.insert(Attribute::new(name));
                        }
                        _ => return Err(Error::serialization("scheme entries must be strings")),
                    }
                }
                scheme = Some(result);
            }
            "rows" => {
                let items = match node {
                    PlistNode::Array(items) => items,
                    _ => return Err(Error::serialization("rows must be an array")),
                };
                let mut result = HashSet::with_capacity(items.len());
                for item in items {
                    result.insert(node_to_row(item)?);
                }
                rows = Some(result);
            }
            _ => return Err(Error::serialization(format!("unknown table key {:?}", key))),
        }
    }

    match (scheme, rows) {
        (Some(scheme), Some(rows)) => Ok((scheme, rows)),
        _ => Err(Error::serialization("table plist is missing scheme or rows")),
    }
}

// ===== XML writing =====

const HEADER: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
<!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n\
<plist version=\"1.0\">\n";

fn write_document(node: &PlistNode) -> String {
    let mut out = String::from(HEADER);
    write_node(node, 0, &mut out);
    out.push_str("</plist>\n");
    out
}

fn indent(depth: usize, out: &mut String) {
    for _ in 0..depth {
        out.push('\t');
    }
}

fn write_node(node: &PlistNode, depth: usize, out: &mut String) {
    indent(depth, out);
    match node {
        PlistNode::Dict(entries) => {
            if entries.is_empty() {
                out.push_str("<dict/>\n");
                return;
            }
            out.push_str("<dict>\n");
            for (key, value) in entries {
                indent(depth + 1, out);
                out.push_str("<key>");
                out.push_str(&escape_xml(key));
                out.push_str("</key>\n");
                write_node(value, depth + 1, out);
            }
            indent(depth, out);
            out.push_str("</dict>\n");
        }
        PlistNode::Array(items) => {
            if items.is_empty() {
                out.push_str("<array/>\n");
                return;
            }
            out.push_str("<array>\n");
            for item in items {
                write_node(item, depth + 1, out);
            }
            indent(depth, out);
            out.push_str("</array>\n");
        }
        PlistNode::String(s) => {
            out.push_str("<string>");
            out.push_str(&escape_xml(s));
            out.push_str("</string>\n");
        }
        PlistNode::Integer(v) => {
            out.push_str(&format!("<integer>{}</integer>\n", v));
        }
        PlistNode::Real(v) => {
            out.push_str(&format!("<real>{}</real>\n", v));
        }
        PlistNode::Data(bytes) => {
            out.push_str("<data>");
            out.push_str(&base64_encode(bytes));
            out.push_str("</data>\n");
        }
        PlistNode::True => out.push_str("<true/>\n"),
    }
}

fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape_xml(s: &str) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.char_indices();
    while let Some((pos, c)) = chars.next() {
        if c != '&' {
            out.push(c);
            continue;
        }
        let rest = &s[pos..];
        let end = rest
            .find(';')
            .ok_or_else(|| Error::serialization("unterminated XML entity"))?;
        let entity = &rest[1..end];
        out.push(match entity {
            "amp" => '&',
            "lt" => '<',
            "gt" => '>',
            "quot" => '"',
            "apos" => '\'',
            _ => return Err(Error::serialization(format!("unknown XML entity &{};", entity))),
        });
        for _ in 0..end {
            chars.next();
        }
    }
    Ok(out)
}

// ===== XML parsing =====

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn skip_whitespace(&mut self) {
        let rest = self.rest();
        let trimmed = rest.trim_start();
        self.pos += rest.len() - trimmed.len();
    }

    /// Reads the next `<...>` tag, returning (name, is_closing, self_closing).
    fn read_tag(&mut self) -> Result<(&'a str, bool, bool)> {
        self.skip_whitespace();
        let rest = self.rest();
        if !rest.starts_with('<') {
            return Err(Error::serialization("expected a tag"));
        }
        let end = rest
            .find('>')
            .ok_or_else(|| Error::serialization("unterminated tag"))?;
        let inner = &rest[1..end];
        self.pos += end + 1;

        let is_closing = inner.starts_with('/');
        let trimmed = inner.trim_start_matches('/');
        let self_closing = trimmed.ends_with('/');
        let trimmed = trimmed.trim_end_matches('/');
        // Drop attributes like version="1.0".
        let name = trimmed.split_whitespace().next().unwrap_or("");
        Ok((name, is_closing, self_closing))
    }

    /// Peeks at the next tag without consuming it.
    fn peek_tag(&mut self) -> Result<(&'a str, bool, bool)> {
        let saved = self.pos;
        let result = self.read_tag();
        self.pos = saved;
        result
    }

    /// Reads text content up to the next '<'.
    fn read_text(&mut self) -> Result<&'a str> {
        let rest = self.rest();
        let end = rest
            .find('<')
            .ok_or_else(|| Error::serialization("unterminated text content"))?;
        self.pos += end;
        Ok(&rest[..end])
    }

    fn expect_close(&mut self, name: &str) -> Result<()> {
        let (tag, is_closing, _) = self.read_tag()?;
        if !is_closing || tag != name {
            return Err(Error::serialization(format!("expected </{}>", name)));
        }
        Ok(())
    }
}

fn parse_document(text: &str) -> Result<PlistNode> {
    let mut parser = Parser::new(text);

    // Skip the XML declaration and doctype if present.
    parser.skip_whitespace();
    if parser.rest().starts_with("<?xml") {
        let end = parser
            .rest()
            .find("?>")
            .ok_or_else(|| Error::serialization("unterminated XML declaration"))?;
        parser.pos += end + 2;
    }
    parser.skip_whitespace();
    if parser.rest().starts_with("<!DOCTYPE") {
        let end = parser
            .rest()
            .find('>')
            .ok_or_else(|| Error::serialization("unterminated doctype"))?;
        parser.pos += end + 1;
    }

    let (name, _, _) = parser.read_tag()?;
    if name != "plist" {
        return Err(Error::serialization("document root must be <plist>"));
    }
    let node = parse_node(&mut parser)?;
    parser.expect_close("plist")?;
    Ok(node)
}

fn parse_node(parser: &mut Parser<'_>) -> Result<PlistNode> {
    let (name, is_closing, self_closing) = parser.read_tag()?;
    if is_closing {
        return Err(Error::serialization(format!("unexpected </{}>", name)));
    }

    match name {
        "dict" => {
            if self_closing {
                return Ok(PlistNode::Dict(Vec::new()));
            }
            let mut entries = Vec::new();
            loop {
                let (next, closing, _) = parser.peek_tag()?;
                if closing && next == "dict" {
                    parser.read_tag()?;
                    break;
                }
                let (key_tag, _, _) = parser.read_tag()?;
                if key_tag != "key" {
                    return Err(Error::serialization("dict entry must start with <key>"));
                }
                let key = unescape_xml(parser.read_text()?)?;
                parser.expect_close("key")?;
                entries.push((key, parse_node(parser)?));
            }
            Ok(PlistNode::Dict(entries))
        }
        "array" => {
            if self_closing {
                return Ok(PlistNode::Array(Vec::new()));
            }
            let mut items = Vec::new();
            loop {
                let (next, closing, _) = parser.peek_tag()?;
                if closing && next == "array" {
                    parser.read_tag()?;
                    break;
                }
                items.push(parse_node(parser)?);
            }
            Ok(PlistNode::Array(items))
        }
        "string" => {
            if self_closing {
                return Ok(PlistNode::String(String::new()));
            }
            let text = unescape_xml(parser.read_text()?)?;
            parser.expect_close("string")?;
            Ok(PlistNode::String(text))
        }
        "integer" => {
            let text = parser.read_text()?;
            parser.expect_close("integer")?;
            text.trim()
                .parse::<i64>()
                .map(PlistNode::Integer)
                .map_err(|_| Error::serialization(format!("bad integer {:?}", text)))
        }
        "real" => {
            let text = parser.read_text()?;
            parser.expect_close("real")?;
            text.trim()
                .parse::<f64>()
                .map(PlistNode::Real)
                .map_err(|_| Error::serialization(format!("bad real {:?}", text)))
        }
        "data" => {
            if self_closing {
                return Ok(PlistNode::Data(Vec::new()));
            }
            let text = parser.read_text()?;
            parser.expect_close("data")?;
            Ok(PlistNode::Data(base64_decode(text)?))
        }
        "true" => {
            if !self_closing {
                parser.expect_close("true")?;
            }
            Ok(PlistNode::True)
        }
        other => Err(Error::serialization(format!("unsupported element <{}>", other))),
    }
}

// ===== base64 =====

const BASE64_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

fn base64_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity((bytes.len() + 2) / 3 * 4);
    for chunk in bytes.chunks(3) {
        let b0 = chunk[0] as u32;
        let b1 = chunk.get(1).copied().unwrap_or(0) as u32;
        let b2 = chunk.get(2).copied().unwrap_or(0) as u32;
        let triple = (b0 << 16) | (b1 << 8) | b2;

        out.push(BASE64_ALPHABET[(triple >> 18) as usize & 0x3f] as char);
        out.push(BASE64_ALPHABET[(triple >> 12) as usize & 0x3f] as char);
        out.push(if chunk.len() > 1 {
            BASE64_ALPHABET[(triple >> 6) as usize & 0x3f] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            BASE64_ALPHABET[triple as usize & 0x3f] as char
        } else {
            '='
        });
    }
    out
}

fn base64_decode(text: &str) -> Result<Vec<u8>> {
    fn decode_char(c: u8) -> Result<u32> {
        match c {
            b'A'..=b'Z' => Ok((c - b'A') as u32),
            b'a'..=b'z' => Ok((c - b'a' + 26) as u32),
            b'0'..=b'9' => Ok((c - b'0' + 52) as u32),
            b'+' => Ok(62),
            b'/' => Ok(63),
            _ => Err(Error::serialization("invalid base64 character")),
        }
    }

    let cleaned: Vec<u8> = text
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    if cleaned.len() % 4 != 0 {
        return Err(Error::serialization("base64 length must be a multiple of 4"));
    }

    let mut out = Vec::with_capacity(cleaned.len() / 4 * 3);
    for chunk in cleaned.chunks(4) {
        let padding = chunk.iter().filter(|&&b| b == b'=').count();
        let mut triple: u32 = 0;
        for (i, &b) in chunk.iter().enumerate() {
            let bits = if b == b'=' {
                if i < 2 {
                    return Err(Error::serialization("malformed base64 padding"));
                }
                0
            } else {
                decode_char(b)?
            };
            triple |= bits << (18 - 6 * i);
        }
        out.push((triple >> 16) as u8);
        if padding < 2 {
            out.push((triple >> 8) as u8);
        }
        if padding < 1 {
            out.push(triple as u8);
        }
    }
    Ok(out)
}
