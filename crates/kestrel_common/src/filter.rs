//! Search-filter expression tree and its text form.
//!
//! The text form follows the usual LDAP filter grammar:
//! `(&(objectClass=person)(cn=a*b)(!(uid>=5)))`. Hex escapes (`\2a`) are
//! honored inside assertion values. Filters are immutable once parsed;
//! evaluation lives in [`crate::matching`].

use std::fmt;

use crate::error::ParseError;

/// A boolean predicate tree over entry attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// True iff every child matches. `And([])` is true.
    And(Vec<Filter>),
    /// True iff some child matches. `Or([])` is false.
    Or(Vec<Filter>),
    /// Negation of the single child.
    Not(Box<Filter>),
    Equality {
        attr: String,
        value: String,
    },
    Substring {
        attr: String,
        initial: Option<String>,
        any: Vec<String>,
        final_part: Option<String>,
    },
    GreaterOrEqual {
        attr: String,
        value: String,
    },
    LessOrEqual {
        attr: String,
        value: String,
    },
    /// True iff the attribute has at least one value.
    Presence {
        attr: String,
    },
    Approximate {
        attr: String,
        value: String,
    },
    /// Extensible match: the rule is resolved through the schema
    /// collaborator at evaluation time.
    ExtensibleMatch {
        attr: Option<String>,
        rule: Option<String>,
        value: String,
    },
}

impl Filter {
    pub fn and(children: Vec<Filter>) -> Self {
        Self::And(children)
    }

    pub fn or(children: Vec<Filter>) -> Self {
        Self::Or(children)
    }

    pub fn not(child: Filter) -> Self {
        Self::Not(Box::new(child))
    }

    pub fn equality(attr: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Equality {
            attr: attr.into(),
            value: value.into(),
        }
    }

    pub fn presence(attr: impl Into<String>) -> Self {
        Self::Presence { attr: attr.into() }
    }

    /// Parse filter text. Errors are raised here, never at match time.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let trimmed = text.trim();
        let mut parser = Parser {
            text,
            trimmed,
            bytes: trimmed.as_bytes(),
            pos: 0,
        };
        let filter = parser.parse_filter()?;
        parser.skip_ws();
        if parser.pos != parser.bytes.len() {
            return Err(parser.err("trailing characters after filter"));
        }
        Ok(filter)
    }
}

struct Parser<'a> {
    text: &'a str,
    trimmed: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn err(&self, reason: &str) -> ParseError {
        ParseError::MalformedFilter {
            text: self.text.to_string(),
            reason: reason.to_string(),
        }
    }

    fn skip_ws(&mut self) {
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn expect(&mut self, b: u8) -> Result<(), ParseError> {
        if self.pos < self.bytes.len() && self.bytes[self.pos] == b {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.err(&format!("expected '{}'", b as char)))
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn parse_filter(&mut self) -> Result<Filter, ParseError> {
        self.skip_ws();
        self.expect(b'(')?;
        let filter = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Filter::And(self.parse_filter_list()?)
            }
            Some(b'|') => {
                self.pos += 1;
                Filter::Or(self.parse_filter_list()?)
            }
            Some(b'!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.parse_filter()?))
            }
            Some(_) => self.parse_item()?,
            None => return Err(self.err("unexpected end of filter")),
        };
        self.skip_ws();
        self.expect(b')')?;
        Ok(filter)
    }

    fn parse_filter_list(&mut self) -> Result<Vec<Filter>, ParseError> {
        let mut children = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                Some(b'(') => children.push(self.parse_filter()?),
                Some(b')') => return Ok(children),
                _ => return Err(self.err("expected '(' or ')' in filter list")),
            }
        }
    }

    fn parse_item(&mut self) -> Result<Filter, ParseError> {
        let start = self.pos;
        while self.pos < self.bytes.len()
            && !matches!(self.bytes[self.pos], b'=' | b'>' | b'<' | b'~' | b')' | b':')
        {
            self.pos += 1;
        }
        let attr = self.text_slice(start, self.pos).trim().to_string();

        match self.peek() {
            Some(b'=') => {
                self.pos += 1;
                if attr.is_empty() {
                    return Err(self.err("missing attribute type"));
                }
                self.parse_value_or_substring(attr)
            }
            Some(b'>') => {
                self.pos += 1;
                self.expect(b'=')?;
                Ok(Filter::GreaterOrEqual {
                    attr: self.require_attr(attr)?,
                    value: self.parse_plain_value()?,
                })
            }
            Some(b'<') => {
                self.pos += 1;
                self.expect(b'=')?;
                Ok(Filter::LessOrEqual {
                    attr: self.require_attr(attr)?,
                    value: self.parse_plain_value()?,
                })
            }
            Some(b'~') => {
                self.pos += 1;
                self.expect(b'=')?;
                Ok(Filter::Approximate {
                    attr: self.require_attr(attr)?,
                    value: self.parse_plain_value()?,
                })
            }
            Some(b':') => {
                self.pos += 1;
                let mut rule = None;
                if self.peek() != Some(b'=') {
                    let rule_start = self.pos;
                    while self.pos < self.bytes.len()
                        && !matches!(self.bytes[self.pos], b':' | b')')
                    {
                        self.pos += 1;
                    }
                    rule = Some(self.text_slice(rule_start, self.pos).trim().to_string());
                    self.expect(b':')?;
                }
                self.expect(b'=')?;
                let value = self.parse_plain_value()?;
                if attr.is_empty() && rule.is_none() {
                    return Err(self.err("extensible match needs an attribute or a rule"));
                }
                Ok(Filter::ExtensibleMatch {
                    attr: (!attr.is_empty()).then_some(attr),
                    rule,
                    value,
                })
            }
            _ => Err(self.err("expected a comparison operator")),
        }
    }

    fn require_attr(&self, attr: String) -> Result<String, ParseError> {
        if attr.is_empty() {
            Err(self.err("missing attribute type"))
        } else {
            Ok(attr)
        }
    }

    /// After `attr=`: presence (`*`), substring (contains unescaped `*`),
    /// or plain equality.
    fn parse_value_or_substring(&mut self, attr: String) -> Result<Filter, ParseError> {
        let mut parts: Vec<String> = vec![String::new()];
        loop {
            match self.peek() {
                None => return Err(self.err("unterminated assertion value")),
                Some(b')') => break,
                Some(b'*') => {
                    self.pos += 1;
                    parts.push(String::new());
                }
                Some(b'\\') => {
                    parts.last_mut().unwrap().push(self.parse_escape()?);
                }
                Some(b) if b == b'(' => return Err(self.err("unescaped '(' in value")),
                Some(_) => {
                    let c = self.next_char()?;
                    parts.last_mut().unwrap().push(c);
                }
            }
        }

        if parts.len() == 1 {
            return Ok(Filter::Equality {
                attr,
                value: parts.pop().unwrap(),
            });
        }
        if parts.len() == 2 && parts[0].is_empty() && parts[1].is_empty() {
            return Ok(Filter::Presence { attr });
        }

        let final_part = {
            let last = parts.pop().unwrap();
            (!last.is_empty()).then_some(last)
        };
        let initial = {
            let first = parts.remove(0);
            (!first.is_empty()).then_some(first)
        };
        // Interior empty fragments come from `**`; they assert nothing.
        let any: Vec<String> = parts.into_iter().filter(|p| !p.is_empty()).collect();
        Ok(Filter::Substring {
            attr,
            initial,
            any,
            final_part,
        })
    }

    fn parse_plain_value(&mut self) -> Result<String, ParseError> {
        let mut value = String::new();
        loop {
            match self.peek() {
                None => return Err(self.err("unterminated assertion value")),
                Some(b')') => break,
                Some(b'\\') => value.push(self.parse_escape()?),
                Some(b'*') => return Err(self.err("wildcard not allowed in this assertion")),
                Some(_) => value.push(self.next_char()?),
            }
        }
        Ok(value)
    }

    fn next_char(&mut self) -> Result<char, ParseError> {
        let rest = &self.trimmed[self.pos..];
        let c = rest.chars().next().ok_or_else(|| self.err("unexpected end"))?;
        self.pos += c.len_utf8();
        Ok(c)
    }

    /// `\XX` hex escape per RFC 4515.
    fn parse_escape(&mut self) -> Result<char, ParseError> {
        self.pos += 1; // consume backslash
        if self.pos + 2 > self.bytes.len() {
            return Err(self.err("truncated hex escape"));
        }
        let hex = self.text_slice(self.pos, self.pos + 2);
        let byte = u8::from_str_radix(hex, 16)
            .map_err(|_| self.err("invalid hex escape"))?;
        self.pos += 2;
        Ok(byte as char)
    }

    fn text_slice(&self, start: usize, end: usize) -> &'a str {
        &self.trimmed[start..end]
    }
}

fn escape_assertion(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '*' => out.push_str("\\2a"),
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '\\' => out.push_str("\\5c"),
            _ => out.push(c),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        render(self, &mut out);
        f.write_str(&out)
    }
}

fn render(filter: &Filter, out: &mut String) {
    out.push('(');
    match filter {
        Filter::And(children) => {
            out.push('&');
            for c in children {
                render(c, out);
            }
        }
        Filter::Or(children) => {
            out.push('|');
            for c in children {
                render(c, out);
            }
        }
        Filter::Not(child) => {
            out.push('!');
            render(child, out);
        }
        Filter::Equality { attr, value } => {
            out.push_str(attr);
            out.push('=');
            escape_assertion(value, out);
        }
        Filter::Substring {
            attr,
            initial,
            any,
            final_part,
        } => {
            out.push_str(attr);
            out.push('=');
            if let Some(i) = initial {
                escape_assertion(i, out);
            }
            out.push('*');
            for fragment in any {
                escape_assertion(fragment, out);
                out.push('*');
            }
            if let Some(fp) = final_part {
                escape_assertion(fp, out);
            }
        }
        Filter::GreaterOrEqual { attr, value } => {
            out.push_str(attr);
            out.push_str(">=");
            escape_assertion(value, out);
        }
        Filter::LessOrEqual { attr, value } => {
            out.push_str(attr);
            out.push_str("<=");
            escape_assertion(value, out);
        }
        Filter::Presence { attr } => {
            out.push_str(attr);
            out.push_str("=*");
        }
        Filter::Approximate { attr, value } => {
            out.push_str(attr);
            out.push_str("~=");
            escape_assertion(value, out);
        }
        Filter::ExtensibleMatch { attr, rule, value } => {
            if let Some(a) = attr {
                out.push_str(a);
            }
            if let Some(r) = rule {
                out.push(':');
                out.push_str(r);
            }
            out.push_str(":=");
            escape_assertion(value, out);
        }
    }
    out.push(')');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_equality() {
        let f = Filter::parse("(cn=Bob Smith)").unwrap();
        assert_eq!(
            f,
            Filter::Equality {
                attr: "cn".into(),
                value: "Bob Smith".into()
            }
        );
    }

    #[test]
    fn parse_presence() {
        assert_eq!(
            Filter::parse("(mail=*)").unwrap(),
            Filter::Presence { attr: "mail".into() }
        );
    }

    #[test]
    fn parse_substring_shapes() {
        assert_eq!(
            Filter::parse("(cn=bo*sm*th)").unwrap(),
            Filter::Substring {
                attr: "cn".into(),
                initial: Some("bo".into()),
                any: vec!["sm".into()],
                final_part: Some("th".into()),
            }
        );
        assert_eq!(
            Filter::parse("(cn=*smith)").unwrap(),
            Filter::Substring {
                attr: "cn".into(),
                initial: None,
                any: vec![],
                final_part: Some("smith".into()),
            }
        );
        assert_eq!(
            Filter::parse("(cn=bob*)").unwrap(),
            Filter::Substring {
                attr: "cn".into(),
                initial: Some("bob".into()),
                any: vec![],
                final_part: None,
            }
        );
    }

    #[test]
    fn parse_nested_boolean() {
        let f = Filter::parse("(&(objectClass=person)(|(uid=bob)(uid=alice))(!(ou=legacy)))")
            .unwrap();
        match f {
            Filter::And(children) => {
                assert_eq!(children.len(), 3);
                assert!(matches!(children[1], Filter::Or(ref c) if c.len() == 2));
                assert!(matches!(children[2], Filter::Not(_)));
            }
            other => panic!("expected And, got {other:?}"),
        }
    }

    #[test]
    fn parse_ordering_and_approx() {
        assert_eq!(
            Filter::parse("(uidNumber>=1000)").unwrap(),
            Filter::GreaterOrEqual {
                attr: "uidNumber".into(),
                value: "1000".into()
            }
        );
        assert_eq!(
            Filter::parse("(uidNumber<=2000)").unwrap(),
            Filter::LessOrEqual {
                attr: "uidNumber".into(),
                value: "2000".into()
            }
        );
        assert_eq!(
            Filter::parse("(cn~=bobsmith)").unwrap(),
            Filter::Approximate {
                attr: "cn".into(),
                value: "bobsmith".into()
            }
        );
    }

    #[test]
    fn parse_extensible() {
        assert_eq!(
            Filter::parse("(cn:caseExactMatch:=Bob)").unwrap(),
            Filter::ExtensibleMatch {
                attr: Some("cn".into()),
                rule: Some("caseExactMatch".into()),
                value: "Bob".into(),
            }
        );
        assert_eq!(
            Filter::parse("(cn:=Bob)").unwrap(),
            Filter::ExtensibleMatch {
                attr: Some("cn".into()),
                rule: None,
                value: "Bob".into(),
            }
        );
    }

    #[test]
    fn hex_escapes_decode() {
        let f = Filter::parse(r"(cn=five\2astar)").unwrap();
        assert_eq!(
            f,
            Filter::Equality {
                attr: "cn".into(),
                value: "five*star".into()
            }
        );
    }

    #[test]
    fn malformed_filters_rejected() {
        for bad in [
            "",
            "(cn=bob",
            "cn=bob",
            "(=bob)",
            "()",
            "(&(cn=a)",
            "(cn=a)(cn=b)",
            "(cn>bob)",
        ] {
            assert!(Filter::parse(bad).is_err(), "accepted: {bad}");
        }
    }

    #[test]
    fn display_round_trips() {
        for text in [
            "(cn=bob)",
            "(mail=*)",
            "(cn=bo*sm*th)",
            "(&(objectClass=person)(!(uid=root)))",
            "(|(uid=a)(uid=b))",
            "(uidNumber>=5)",
            "(cn~=bob)",
            "(cn:caseExactMatch:=Bob)",
        ] {
            let f = Filter::parse(text).unwrap();
            assert_eq!(Filter::parse(&f.to_string()).unwrap(), f, "{text}");
        }
    }
}
