//! Canonical textual serialization of a loaded image, and its inverse.
//!
//! Sections appear in order PTYPE_LIST, PLUGIN_LIST, VIEW_LIST; each node is
//! rendered as `TAG { .attr = "c-escaped", nested lists, }` with two-space
//! indentation proportional to depth. The format doubles as the daemon's
//! on-disk scheme source.

use std::fmt::Write as _;

use crate::error::{SchemeError, SchemeErrorStack};
use crate::image::{ActionImage, EntryImage, PluginImage, SchemeImage};

const ENTRY_ATTRS: [&str; 13] = [
    "name", "help", "container", "mode", "purpose", "min", "max", "ptype", "ref", "value",
    "restore", "order", "filter",
];
const ACTION_ATTRS: [&str; 10] = [
    "sym",
    "lock",
    "interrupt",
    "exec_on",
    "update_retcode",
    "permanent",
    "sync",
    "in",
    "out",
    "script",
];
const PLUGIN_ATTRS: [&str; 5] = ["name", "id", "file", "global", "conf"];

pub fn serialize_image(image: &SchemeImage) -> String {
    let mut out = String::new();
    if !image.ptypes.is_empty() {
        out.push_str("PTYPE_LIST {\n");
        for entry in &image.ptypes {
            write_entry(&mut out, entry, 1);
        }
        out.push_str("},\n");
    }
    if !image.plugins.is_empty() {
        out.push_str("PLUGIN_LIST {\n");
        for plugin in &image.plugins {
            write_plugin(&mut out, plugin, 1);
        }
        out.push_str("},\n");
    }
    if !image.views.is_empty() {
        out.push_str("VIEW_LIST {\n");
        for entry in &image.views {
            write_entry(&mut out, entry, 1);
        }
        out.push_str("},\n");
    }
    out
}

pub fn parse_deploy(text: &str) -> Result<SchemeImage, SchemeErrorStack> {
    let tokens = lex(text).map_err(SchemeErrorStack::from)?;
    let mut parser = Parser { tokens, pos: 0 };
    parser.parse_scheme().map_err(SchemeErrorStack::from)
}

/// C-style escaping for `\`, `"` and control characters.
pub fn escape_str(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 2);
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            ch if (ch as u32) < 0x20 || (ch as u32) == 0x7f => {
                let _ = write!(out, "\\x{:02x}", ch as u32);
            }
            ch => out.push(ch),
        }
    }
    out
}

fn indent(out: &mut String, level: usize) {
    for _ in 0..level {
        out.push_str("  ");
    }
}

fn write_attr(out: &mut String, level: usize, name: &str, value: &Option<String>) {
    if let Some(value) = value {
        indent(out, level);
        let _ = writeln!(out, ".{name} = \"{}\",", escape_str(value));
    }
}

fn write_entry(out: &mut String, entry: &EntryImage, level: usize) {
    indent(out, level);
    out.push_str("ENTRY {\n");
    write_attr(out, level + 1, "name", &entry.name);
    write_attr(out, level + 1, "help", &entry.help);
    write_attr(out, level + 1, "container", &entry.container);
    write_attr(out, level + 1, "mode", &entry.mode);
    write_attr(out, level + 1, "purpose", &entry.purpose);
    write_attr(out, level + 1, "min", &entry.min);
    write_attr(out, level + 1, "max", &entry.max);
    write_attr(out, level + 1, "ptype", &entry.ptype);
    write_attr(out, level + 1, "ref", &entry.ref_);
    write_attr(out, level + 1, "value", &entry.value);
    write_attr(out, level + 1, "restore", &entry.restore);
    write_attr(out, level + 1, "order", &entry.order);
    write_attr(out, level + 1, "filter", &entry.filter);
    if !entry.actions.is_empty() {
        indent(out, level + 1);
        out.push_str("ACTION_LIST {\n");
        for action in &entry.actions {
            write_action(out, action, level + 2);
        }
        indent(out, level + 1);
        out.push_str("},\n");
    }
    if !entry.entries.is_empty() {
        indent(out, level + 1);
        out.push_str("ENTRY_LIST {\n");
        for nested in &entry.entries {
            write_entry(out, nested, level + 2);
        }
        indent(out, level + 1);
        out.push_str("},\n");
    }
    indent(out, level);
    out.push_str("},\n");
}

fn write_action(out: &mut String, action: &ActionImage, level: usize) {
    indent(out, level);
    out.push_str("ACTION {\n");
    write_attr(out, level + 1, "sym", &action.sym);
    write_attr(out, level + 1, "lock", &action.lock);
    write_attr(out, level + 1, "interrupt", &action.interrupt);
    write_attr(out, level + 1, "exec_on", &action.exec_on);
    write_attr(out, level + 1, "update_retcode", &action.update_retcode);
    write_attr(out, level + 1, "permanent", &action.permanent);
    write_attr(out, level + 1, "sync", &action.sync);
    write_attr(out, level + 1, "in", &action.in_);
    write_attr(out, level + 1, "out", &action.out);
    write_attr(out, level + 1, "script", &action.script);
    indent(out, level);
    out.push_str("},\n");
}

fn write_plugin(out: &mut String, plugin: &PluginImage, level: usize) {
    indent(out, level);
    out.push_str("PLUGIN {\n");
    write_attr(out, level + 1, "name", &plugin.name);
    write_attr(out, level + 1, "id", &plugin.id);
    write_attr(out, level + 1, "file", &plugin.file);
    write_attr(out, level + 1, "global", &plugin.global);
    write_attr(out, level + 1, "conf", &plugin.conf);
    indent(out, level);
    out.push_str("},\n");
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    LBrace,
    RBrace,
    Dot,
    Eq,
    Comma,
}

fn syntax(line: usize, message: impl Into<String>) -> SchemeError {
    SchemeError::DeploySyntax {
        line,
        message: message.into(),
    }
}

fn lex(text: &str) -> Result<Vec<(Token, usize)>, SchemeError> {
    let mut tokens = Vec::new();
    let mut line = 1usize;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '\n' => line += 1,
            ch if ch.is_whitespace() => {}
            '{' => tokens.push((Token::LBrace, line)),
            '}' => tokens.push((Token::RBrace, line)),
            '.' => tokens.push((Token::Dot, line)),
            '=' => tokens.push((Token::Eq, line)),
            ',' => tokens.push((Token::Comma, line)),
            '"' => {
                let start_line = line;
                let mut value = String::new();
                loop {
                    let Some(ch) = chars.next() else {
                        return Err(syntax(start_line, "unterminated string"));
                    };
                    match ch {
                        '"' => break,
                        '\n' => return Err(syntax(start_line, "unterminated string")),
                        '\\' => {
                            let Some(escaped) = chars.next() else {
                                return Err(syntax(start_line, "dangling escape"));
                            };
                            match escaped {
                                'n' => value.push('\n'),
                                't' => value.push('\t'),
                                'r' => value.push('\r'),
                                'x' => {
                                    let hi = chars.next();
                                    let lo = chars.next();
                                    let (Some(hi), Some(lo)) = (hi, lo) else {
                                        return Err(syntax(start_line, "truncated \\x escape"));
                                    };
                                    let code = u32::from_str_radix(&format!("{hi}{lo}"), 16)
                                        .map_err(|_| {
                                            syntax(start_line, "invalid \\x escape digits")
                                        })?;
                                    match char::from_u32(code) {
                                        Some(decoded) => value.push(decoded),
                                        None => {
                                            return Err(syntax(
                                                start_line,
                                                "invalid \\x escape code",
                                            ))
                                        }
                                    }
                                }
                                other => value.push(other),
                            }
                        }
                        other => value.push(other),
                    }
                }
                tokens.push((Token::Str(value), start_line));
            }
            ch if ch.is_ascii_alphabetic() || ch == '_' => {
                let mut ident = String::new();
                ident.push(ch);
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        ident.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push((Token::Ident(ident), line));
            }
            other => return Err(syntax(line, format!("unexpected character {other:?}"))),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn parse_scheme(&mut self) -> Result<SchemeImage, SchemeError> {
        let mut image = SchemeImage::default();
        while self.pos < self.tokens.len() {
            let (section, line) = self.expect_ident("section name")?;
            self.expect(Token::LBrace, "'{' after section name")?;
            match section.as_str() {
                "PTYPE_LIST" => {
                    while !self.peek_is(&Token::RBrace) {
                        image.ptypes.push(self.parse_entry()?);
                    }
                }
                "PLUGIN_LIST" => {
                    while !self.peek_is(&Token::RBrace) {
                        image.plugins.push(self.parse_plugin()?);
                    }
                }
                "VIEW_LIST" => {
                    while !self.peek_is(&Token::RBrace) {
                        image.views.push(self.parse_entry()?);
                    }
                }
                other => {
                    return Err(syntax(line, format!("unknown section {other:?}")));
                }
            }
            self.expect(Token::RBrace, "'}' closing section")?;
            self.eat(&Token::Comma);
        }
        Ok(image)
    }

    fn parse_entry(&mut self) -> Result<EntryImage, SchemeError> {
        let (tag, line) = self.expect_ident("ENTRY tag")?;
        if tag != "ENTRY" {
            return Err(syntax(line, format!("expected ENTRY, found {tag:?}")));
        }
        self.expect(Token::LBrace, "'{' after ENTRY")?;
        let mut entry = EntryImage::default();
        loop {
            if self.eat(&Token::RBrace) {
                break;
            }
            if self.eat(&Token::Dot) {
                let (attr, value, attr_line) = self.parse_attr()?;
                if !ENTRY_ATTRS.contains(&attr.as_str()) {
                    return Err(syntax(attr_line, format!("unknown ENTRY attribute {attr:?}")));
                }
                match attr.as_str() {
                    "name" => entry.name = Some(value),
                    "help" => entry.help = Some(value),
                    "container" => entry.container = Some(value),
                    "mode" => entry.mode = Some(value),
                    "purpose" => entry.purpose = Some(value),
                    "min" => entry.min = Some(value),
                    "max" => entry.max = Some(value),
                    "ptype" => entry.ptype = Some(value),
                    "ref" => entry.ref_ = Some(value),
                    "value" => entry.value = Some(value),
                    "restore" => entry.restore = Some(value),
                    "order" => entry.order = Some(value),
                    _ => entry.filter = Some(value),
                }
                continue;
            }
            let (list, list_line) = self.expect_ident("nested list tag")?;
            self.expect(Token::LBrace, "'{' after list tag")?;
            match list.as_str() {
                "ACTION_LIST" => {
                    while !self.peek_is(&Token::RBrace) {
                        entry.actions.push(self.parse_action()?);
                    }
                }
                "ENTRY_LIST" => {
                    while !self.peek_is(&Token::RBrace) {
                        entry.entries.push(self.parse_entry()?);
                    }
                }
                other => {
                    return Err(syntax(
                        list_line,
                        format!("unknown list {other:?} inside ENTRY"),
                    ));
                }
            }
            self.expect(Token::RBrace, "'}' closing nested list")?;
            self.eat(&Token::Comma);
        }
        self.eat(&Token::Comma);
        Ok(entry)
    }

    fn parse_action(&mut self) -> Result<ActionImage, SchemeError> {
        let (tag, line) = self.expect_ident("ACTION tag")?;
        if tag != "ACTION" {
            return Err(syntax(line, format!("expected ACTION, found {tag:?}")));
        }
        self.expect(Token::LBrace, "'{' after ACTION")?;
        let mut action = ActionImage::default();
        loop {
            if self.eat(&Token::RBrace) {
                break;
            }
            self.expect(Token::Dot, "'.' starting ACTION attribute")?;
            let (attr, value, attr_line) = self.parse_attr()?;
            if !ACTION_ATTRS.contains(&attr.as_str()) {
                return Err(syntax(
                    attr_line,
                    format!("unknown ACTION attribute {attr:?}"),
                ));
            }
            match attr.as_str() {
                "sym" => action.sym = Some(value),
                "lock" => action.lock = Some(value),
                "interrupt" => action.interrupt = Some(value),
                "exec_on" => action.exec_on = Some(value),
                "update_retcode" => action.update_retcode = Some(value),
                "permanent" => action.permanent = Some(value),
                "sync" => action.sync = Some(value),
                "in" => action.in_ = Some(value),
                "out" => action.out = Some(value),
                _ => action.script = Some(value),
            }
        }
        self.eat(&Token::Comma);
        Ok(action)
    }

    fn parse_plugin(&mut self) -> Result<PluginImage, SchemeError> {
        let (tag, line) = self.expect_ident("PLUGIN tag")?;
        if tag != "PLUGIN" {
            return Err(syntax(line, format!("expected PLUGIN, found {tag:?}")));
        }
        self.expect(Token::LBrace, "'{' after PLUGIN")?;
        let mut plugin = PluginImage::default();
        loop {
            if self.eat(&Token::RBrace) {
                break;
            }
            self.expect(Token::Dot, "'.' starting PLUGIN attribute")?;
            let (attr, value, attr_line) = self.parse_attr()?;
            if !PLUGIN_ATTRS.contains(&attr.as_str()) {
                return Err(syntax(
                    attr_line,
                    format!("unknown PLUGIN attribute {attr:?}"),
                ));
            }
            match attr.as_str() {
                "name" => plugin.name = Some(value),
                "id" => plugin.id = Some(value),
                "file" => plugin.file = Some(value),
                "global" => plugin.global = Some(value),
                _ => plugin.conf = Some(value),
            }
        }
        self.eat(&Token::Comma);
        Ok(plugin)
    }

    fn parse_attr(&mut self) -> Result<(String, String, usize), SchemeError> {
        let (attr, line) = self.expect_ident("attribute name")?;
        self.expect(Token::Eq, "'=' after attribute name")?;
        let value = self.expect_str("attribute value")?;
        self.expect(Token::Comma, "',' after attribute value")?;
        Ok((attr, value, line))
    }

    fn peek_is(&self, token: &Token) -> bool {
        self.tokens
            .get(self.pos)
            .map(|(found, _)| found == token)
            .unwrap_or(false)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek_is(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn next(&mut self, expected: &str) -> Result<(Token, usize), SchemeError> {
        let Some((token, line)) = self.tokens.get(self.pos).cloned() else {
            let line = self.tokens.last().map(|(_, line)| *line).unwrap_or(1);
            return Err(syntax(line, format!("unexpected end of input, expected {expected}")));
        };
        self.pos += 1;
        Ok((token, line))
    }

    fn expect(&mut self, token: Token, expected: &str) -> Result<(), SchemeError> {
        let (found, line) = self.next(expected)?;
        if found == token {
            Ok(())
        } else {
            Err(syntax(line, format!("expected {expected}, found {found:?}")))
        }
    }

    fn expect_ident(&mut self, expected: &str) -> Result<(String, usize), SchemeError> {
        let (found, line) = self.next(expected)?;
        match found {
            Token::Ident(ident) => Ok((ident, line)),
            other => Err(syntax(line, format!("expected {expected}, found {other:?}"))),
        }
    }

    fn expect_str(&mut self, expected: &str) -> Result<String, SchemeError> {
        let (found, line) = self.next(expected)?;
        match found {
            Token::Str(value) => Ok(value),
            other => Err(syntax(line, format!("expected {expected}, found {other:?}"))),
        }
    }
}
