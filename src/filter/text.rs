// RFC 4515 string representation of search filters.

use super::{AssertionValue, Filter, SubstringComponent};
use crate::error::{CodecError, CodecResult};

/// Parse a textual filter. Outer parentheses may be omitted for a single item (`cn=x`).
pub fn query_to_filter(text: &str) -> CodecResult<Filter> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(CodecError::parse(0, "empty filter"));
    }
    let wrapped;
    let src = if trimmed.starts_with('(') {
        trimmed
    } else {
        wrapped = format!("({})", trimmed);
        wrapped.as_str()
    };

    let mut parser = Parser { src, pos: 0 };
    let filter = parser.parse_filter()?;
    if parser.pos != src.len() {
        return Err(CodecError::parse(parser.pos, "unexpected trailing characters"));
    }
    Ok(filter)
}

/// Render a filter as RFC 4515 text, escaping `*`, `(`, `)`, `\` and NUL in values.
/// Values that are not UTF-8 are written with every non-ASCII byte escaped.
pub fn filter_to_query(filter: &Filter) -> String {
    let mut out = String::new();
    write_query(filter, &mut out);
    out
}

fn write_query(filter: &Filter, out: &mut String) {
    out.push('(');
    match filter {
        Filter::And(children) => {
            out.push('&');
            children.iter().for_each(|c| write_query(c, out));
        }
        Filter::Or(children) => {
            out.push('|');
            children.iter().for_each(|c| write_query(c, out));
        }
        Filter::Not(inner) => {
            out.push('!');
            write_query(inner, out);
        }
        Filter::EqualityMatch { attribute, value } => write_simple(out, attribute, "=", value),
        Filter::GreaterOrEqual { attribute, value } => write_simple(out, attribute, ">=", value),
        Filter::LessOrEqual { attribute, value } => write_simple(out, attribute, "<=", value),
        Filter::ApproxMatch { attribute, value } => write_simple(out, attribute, "~=", value),
        Filter::Present { attribute } => {
            out.push_str(attribute);
            out.push_str("=*");
        }
        Filter::Substring {
            attribute,
            components,
        } => {
            out.push_str(attribute);
            out.push('=');
            if !matches!(components.first(), Some(SubstringComponent::Initial(_))) {
                out.push('*');
            }
            for component in components {
                escape_into(component.value(), out);
                if !matches!(component, SubstringComponent::Final(_)) {
                    out.push('*');
                }
            }
        }
        Filter::ExtensibleMatch {
            matching_rule,
            attribute,
            value,
            dn_attributes,
        } => {
            if let Some(attr) = attribute {
                out.push_str(attr);
            }
            if *dn_attributes {
                out.push_str(":dn");
            }
            if let Some(rule) = matching_rule {
                out.push(':');
                out.push_str(rule);
            }
            out.push_str(":=");
            escape_into(value, out);
        }
    }
    out.push(')');
}

fn write_simple(out: &mut String, attribute: &str, op: &str, value: &AssertionValue) {
    out.push_str(attribute);
    out.push_str(op);
    escape_into(value, out);
}

fn escape_into(value: &AssertionValue, out: &mut String) {
    match value.as_str() {
        Some(text) => text.chars().for_each(|ch| escape_char(ch, out)),
        None => {
            for &byte in value.as_bytes() {
                if byte.is_ascii() && !byte.is_ascii_control() {
                    escape_char(byte as char, out);
                } else {
                    out.push_str(&format!("\\{:02x}", byte));
                }
            }
        }
    }
}

fn escape_char(ch: char, out: &mut String) {
    match ch {
        '*' => out.push_str("\\2a"),
        '(' => out.push_str("\\28"),
        ')' => out.push_str("\\29"),
        '\\' => out.push_str("\\5c"),
        '\0' => out.push_str("\\00"),
        _ => out.push(ch),
    }
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.src.as_bytes().get(self.pos).copied()
    }

    fn expect(&mut self, ch: u8) -> CodecResult<()> {
        match self.peek() {
            Some(c) if c == ch => {
                self.pos += 1;
                Ok(())
            }
            Some(c) => Err(CodecError::parse(
                self.pos,
                format!("expected '{}', found '{}'", ch as char, c as char),
            )),
            None => Err(CodecError::parse(
                self.pos,
                format!("expected '{}', found end of input (unbalanced parentheses)", ch as char),
            )),
        }
    }

    fn parse_filter(&mut self) -> CodecResult<Filter> {
        self.expect(b'(')?;
        let filter = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Filter::And(self.parse_list()?)
            }
            Some(b'|') => {
                self.pos += 1;
                Filter::Or(self.parse_list()?)
            }
            Some(b'!') => {
                self.pos += 1;
                Filter::not(self.parse_filter()?)
            }
            Some(b'(') => return Err(CodecError::parse(self.pos, "missing filter operator")),
            Some(_) => self.parse_item()?,
            None => return Err(CodecError::parse(self.pos, "unbalanced parentheses")),
        };
        self.expect(b')')?;
        Ok(filter)
    }

    fn parse_list(&mut self) -> CodecResult<Vec<Filter>> {
        let mut children = Vec::new();
        while self.peek() == Some(b'(') {
            children.push(self.parse_filter()?);
        }
        Ok(children)
    }

    fn parse_item(&mut self) -> CodecResult<Filter> {
        let start = self.pos;
        let rest = &self.src[start..];
        let end = rest
            .find(|c| c == ')' || c == '(')
            .ok_or_else(|| CodecError::parse(start, "unbalanced parentheses"))?;
        if rest.as_bytes()[end] == b'(' {
            return Err(CodecError::parse(start + end, "unescaped '(' in filter item"));
        }
        self.pos = start + end;
        parse_item_text(&rest[..end], start)
    }
}

fn parse_item_text(item: &str, offset: usize) -> CodecResult<Filter> {
    let eq = item
        .find('=')
        .ok_or_else(|| CodecError::parse(offset, format!("missing operator in '{}'", item)))?;
    let raw_value = &item[eq + 1..];
    let value_offset = offset + eq + 1;

    let (lhs, kind) = match item[..eq].chars().last() {
        Some(':') => (&item[..eq - 1], ItemKind::Extensible),
        Some('~') => (&item[..eq - 1], ItemKind::Approx),
        Some('>') => (&item[..eq - 1], ItemKind::GreaterOrEqual),
        Some('<') => (&item[..eq - 1], ItemKind::LessOrEqual),
        _ => (&item[..eq], ItemKind::Equal),
    };

    if let ItemKind::Extensible = kind {
        return parse_extensible(lhs, raw_value, offset, value_offset);
    }

    let attribute = parse_attribute(lhs, offset)?;
    let filter = match kind {
        ItemKind::Approx => Filter::ApproxMatch {
            attribute,
            value: unescape(raw_value, value_offset)?,
        },
        ItemKind::GreaterOrEqual => Filter::GreaterOrEqual {
            attribute,
            value: unescape(raw_value, value_offset)?,
        },
        ItemKind::LessOrEqual => Filter::LessOrEqual {
            attribute,
            value: unescape(raw_value, value_offset)?,
        },
        ItemKind::Equal if raw_value == "*" => Filter::Present { attribute },
        ItemKind::Equal if raw_value.contains('*') => {
            let components = parse_substrings(raw_value, value_offset)?;
            if components.is_empty() {
                Filter::Present { attribute }
            } else {
                Filter::Substring {
                    attribute,
                    components,
                }
            }
        }
        _ => Filter::EqualityMatch {
            attribute,
            value: unescape(raw_value, value_offset)?,
        },
    };
    Ok(filter)
}

enum ItemKind {
    Equal,
    Approx,
    GreaterOrEqual,
    LessOrEqual,
    Extensible,
}

fn parse_attribute(lhs: &str, offset: usize) -> CodecResult<String> {
    if lhs.is_empty() {
        return Err(CodecError::parse(offset, "missing attribute description"));
    }
    if let Some(bad) = lhs.find(|c: char| c == '*' || c == '\\' || c.is_control()) {
        return Err(CodecError::parse(offset + bad, "invalid character in attribute description"));
    }
    Ok(lhs.to_string())
}

fn parse_substrings(raw: &str, offset: usize) -> CodecResult<Vec<SubstringComponent>> {
    let parts: Vec<&str> = raw.split('*').collect();
    let last = parts.len() - 1;
    let mut components = Vec::new();
    let mut part_offset = offset;
    for (i, part) in parts.iter().enumerate() {
        if !part.is_empty() {
            let value = unescape(part, part_offset)?;
            components.push(if i == 0 {
                SubstringComponent::Initial(value)
            } else if i == last {
                SubstringComponent::Final(value)
            } else {
                SubstringComponent::Any(value)
            });
        }
        part_offset += part.len() + 1;
    }
    Ok(components)
}

/// `attr[:dn][:rule]` or `[:dn]:rule` (the `:=` has already been stripped).
fn parse_extensible(lhs: &str, raw_value: &str, offset: usize, value_offset: usize) -> CodecResult<Filter> {
    let mut tokens = lhs.split(':');
    let attr_token = tokens.next().unwrap_or("");
    let attribute = if attr_token.is_empty() {
        None
    } else {
        Some(parse_attribute(attr_token, offset)?)
    };

    let mut dn_attributes = false;
    let mut matching_rule: Option<String> = None;
    for token in tokens {
        if token.is_empty() {
            return Err(CodecError::parse(offset, "empty component in extensible match"));
        }
        if token.eq_ignore_ascii_case("dn") && !dn_attributes && matching_rule.is_none() {
            dn_attributes = true;
        } else if matching_rule.is_none() {
            matching_rule = Some(token.to_string());
        } else {
            return Err(CodecError::parse(offset, format!("unexpected extensible match component '{}'", token)));
        }
    }

    if attribute.is_none() && matching_rule.is_none() {
        return Err(CodecError::parse(
            offset,
            "extensible match needs an attribute or a matching rule",
        ));
    }

    Ok(Filter::ExtensibleMatch {
        matching_rule,
        attribute,
        value: unescape(raw_value, value_offset)?,
        dn_attributes,
    })
}

/// Decode `\XX` hex escapes into raw bytes.
fn unescape(raw: &str, offset: usize) -> CodecResult<AssertionValue> {
    if !raw.contains('\\') {
        return Ok(raw.into());
    }
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| CodecError::parse(offset + i, "invalid escape sequence"))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(out.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use SubstringComponent::*;

    fn parse(text: &str) -> Filter {
        query_to_filter(text).unwrap()
    }

    #[test]
    fn test_parse_simple_items() {
        assert_eq!(parse("(cn=John Doe)"), Filter::equality("cn", "John Doe"));
        assert_eq!(parse("(cn~=John)"), Filter::ApproxMatch { attribute: "cn".into(), value: "John".into() });
        assert_eq!(parse("(uSNChanged>=100)"), Filter::greater_or_equal("uSNChanged", "100"));
        assert_eq!(parse("(uSNChanged<=100)"), Filter::less_or_equal("uSNChanged", "100"));
        assert_eq!(parse("(objectClass=*)"), Filter::present("objectClass"));
    }

    #[test]
    fn test_parse_without_outer_parens() {
        assert_eq!(parse("cn=admin"), Filter::equality("cn", "admin"));
    }

    #[test]
    fn test_parse_boolean_operators() {
        let f = parse("(&(cn=John)(|(sn=Doe)(!(mail=*))))");
        assert_eq!(
            f,
            Filter::And(vec![
                Filter::equality("cn", "John"),
                Filter::Or(vec![Filter::equality("sn", "Doe"), Filter::not(Filter::present("mail"))]),
            ])
        );
    }

    #[test]
    fn test_parse_empty_lists() {
        assert_eq!(parse("(&)"), Filter::And(vec![]));
        assert_eq!(parse("(|)"), Filter::Or(vec![]));
    }

    #[test]
    fn test_parse_substrings() {
        assert_eq!(
            parse("(cn=Jo*n*Doe)"),
            Filter::Substring {
                attribute: "cn".into(),
                components: vec![Initial("Jo".into()), Any("n".into()), Final("Doe".into())],
            }
        );
        assert_eq!(
            parse("(cn=*ohn*)"),
            Filter::Substring { attribute: "cn".into(), components: vec![Any("ohn".into())] }
        );
        assert_eq!(
            parse("(cn=*Doe)"),
            Filter::Substring { attribute: "cn".into(), components: vec![Final("Doe".into())] }
        );
        assert_eq!(
            parse("(cn=John*)"),
            Filter::Substring { attribute: "cn".into(), components: vec![Initial("John".into())] }
        );
    }

    #[test]
    fn test_parse_extensible() {
        assert_eq!(
            parse("(userAccountControl:1.2.840.113556.1.4.803:=2)"),
            Filter::extensible("userAccountControl", "1.2.840.113556.1.4.803", "2")
        );
        assert_eq!(
            parse("(ou:dn:caseIgnoreMatch:=Users)"),
            Filter::ExtensibleMatch {
                matching_rule: Some("caseIgnoreMatch".into()),
                attribute: Some("ou".into()),
                value: "Users".into(),
                dn_attributes: true,
            }
        );
        assert_eq!(
            parse("(:dn:2.5.13.5:=x)"),
            Filter::ExtensibleMatch {
                matching_rule: Some("2.5.13.5".into()),
                attribute: None,
                value: "x".into(),
                dn_attributes: true,
            }
        );
        assert_eq!(
            parse("(cn:=x)"),
            Filter::ExtensibleMatch { matching_rule: None, attribute: Some("cn".into()), value: "x".into(), dn_attributes: false }
        );
    }

    #[test]
    fn test_parse_escapes() {
        assert_eq!(parse("(cn=a\\2ab\\28\\29\\5c)"), Filter::equality("cn", "a*b()\\"));
        assert_eq!(parse("(cn=\\c3\\a9)"), Filter::equality("cn", "é"));
    }

    #[test]
    fn test_binary_value_round_trip() {
        let f = parse("(objectGUID=\\9f\\aa\\01\\ff)");
        assert_eq!(f, Filter::equality("objectGUID", vec![0x9fu8, 0xaa, 0x01, 0xff]));
        assert_eq!(filter_to_query(&f), "(objectGUID=\\9f\\aa\\01\\ff)");
    }

    #[test]
    fn test_well_formed_filters_print_back_the_same_tree() {
        let dn_rule = Filter::ExtensibleMatch {
            matching_rule: Some("dn".into()),
            attribute: Some("cn".into()),
            value: "x".into(),
            dn_attributes: true,
        };
        assert_eq!(parse(&filter_to_query(&dn_rule)), dn_rule);

        let empty_initial = Filter::Substring { attribute: "cn".into(), components: vec![Initial("".into())] };
        assert!(!empty_initial.is_well_formed());
        assert_ne!(parse(&filter_to_query(&empty_initial)), empty_initial);
    }

    #[test]
    fn test_parse_errors() {
        for bad in [
            "(cn=John",
            "((cn=John))",
            "(cnJohn)",
            "(&(cn=a)",
            "(=x)",
            "(cn=a)(sn=b)",
            "(cn=\\zz)",
            "(:=x)",
            "",
        ] {
            match query_to_filter(bad) {
                Err(CodecError::Parse { .. }) => {}
                other => panic!("expected parse error for {:?}, got {:?}", bad, other),
            }
        }
    }

    #[test]
    fn test_serialize_escapes_metacharacters() {
        let f = Filter::equality("cn", "a*(b)\\");
        assert_eq!(filter_to_query(&f), "(cn=a\\2a\\28b\\29\\5c)");
    }

    #[test]
    fn test_text_round_trip() {
        for text in [
            "(cn=John Doe)",
            "(&(cn=John)(sn=Doe))",
            "(|(cn=a)(!(sn=b))(mail=*))",
            "(cn=Jo*n*Doe)",
            "(cn=*x*)",
            "(cn~=John)",
            "(uSNChanged>=10)",
            "(uSNChanged<=10)",
            "(userAccountControl:1.2.840.113556.1.4.803:=512)",
            "(ou:dn:caseIgnoreMatch:=Users)",
            "(:dn:2.5.13.5:=x)",
            "(aNR==John)",
            "(&)",
        ] {
            let f = parse(text);
            assert_eq!(filter_to_query(&f), text);
            assert_eq!(query_to_filter(&filter_to_query(&f)).unwrap(), f);
        }
    }
}
