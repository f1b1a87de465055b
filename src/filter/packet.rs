// BER form of the Filter CHOICE (RFC 4511 section 4.5.1).

use super::{substrings_well_formed, AssertionValue, Filter, SubstringComponent};
use crate::ber::{decode_boolean, decode_utf8, BerReader, BerWriter, TAG_OCTET_STRING};
use crate::error::{CodecError, CodecResult};

pub const FILTER_AND: u8 = 0xA0;
pub const FILTER_OR: u8 = 0xA1;
pub const FILTER_NOT: u8 = 0xA2;
pub const FILTER_EQUALITY: u8 = 0xA3;
pub const FILTER_SUBSTRINGS: u8 = 0xA4;
pub const FILTER_GREATER_OR_EQUAL: u8 = 0xA5;
pub const FILTER_LESS_OR_EQUAL: u8 = 0xA6;
pub const FILTER_PRESENT: u8 = 0x87;
pub const FILTER_APPROX: u8 = 0xA8;
pub const FILTER_EXTENSIBLE: u8 = 0xA9;

const SUBSTRING_INITIAL: u8 = 0x80;
const SUBSTRING_ANY: u8 = 0x81;
const SUBSTRING_FINAL: u8 = 0x82;

const MATCHING_RULE: u8 = 0x81;
const MATCHING_TYPE: u8 = 0x82;
const MATCH_VALUE: u8 = 0x83;
const DN_ATTRIBUTES: u8 = 0x84;

/// Deeper filters are rejected rather than recursed into.
const MAX_DEPTH: usize = 128;

/// Decode a complete BER filter element.
pub fn packet_to_filter(data: &[u8]) -> CodecResult<Filter> {
    let mut reader = BerReader::new(data);
    let filter = read_filter(&mut reader)?;
    if !reader.is_empty() {
        return Err(CodecError::decode(format!(
            "{} trailing bytes after filter",
            reader.remaining()
        )));
    }
    Ok(filter)
}

/// Encode a filter as one BER element.
pub fn filter_to_packet(filter: &Filter) -> CodecResult<Vec<u8>> {
    let mut writer = BerWriter::new();
    write_filter(&mut writer, filter)?;
    Ok(writer.into_vec())
}

/// Read the next filter element from `reader`.
pub fn read_filter(reader: &mut BerReader<'_>) -> CodecResult<Filter> {
    read_filter_at(reader, 0)
}

fn read_filter_at(reader: &mut BerReader<'_>, depth: usize) -> CodecResult<Filter> {
    if depth > MAX_DEPTH {
        return Err(CodecError::decode("filter nesting too deep"));
    }
    let (tag, content) = reader.read_element()?;
    match tag {
        FILTER_AND | FILTER_OR => {
            let mut children_reader = BerReader::new(content);
            let mut children = Vec::new();
            while !children_reader.is_empty() {
                children.push(read_filter_at(&mut children_reader, depth + 1)?);
            }
            Ok(if tag == FILTER_AND {
                Filter::And(children)
            } else {
                Filter::Or(children)
            })
        }
        FILTER_NOT => {
            let mut inner_reader = BerReader::new(content);
            let inner = read_filter_at(&mut inner_reader, depth + 1)?;
            if !inner_reader.is_empty() {
                return Err(CodecError::decode("not filter requires exactly 1 child"));
            }
            Ok(Filter::not(inner))
        }
        FILTER_EQUALITY => {
            let (attribute, value) = read_assertion(content, "equality match")?;
            Ok(Filter::EqualityMatch { attribute, value })
        }
        FILTER_GREATER_OR_EQUAL => {
            let (attribute, value) = read_assertion(content, "greater-or-equal")?;
            Ok(Filter::GreaterOrEqual { attribute, value })
        }
        FILTER_LESS_OR_EQUAL => {
            let (attribute, value) = read_assertion(content, "less-or-equal")?;
            Ok(Filter::LessOrEqual { attribute, value })
        }
        FILTER_APPROX => {
            let (attribute, value) = read_assertion(content, "approximate match")?;
            Ok(Filter::ApproxMatch { attribute, value })
        }
        FILTER_PRESENT => Ok(Filter::Present {
            attribute: decode_utf8(content)?,
        }),
        FILTER_SUBSTRINGS => read_substrings(content),
        FILTER_EXTENSIBLE => read_extensible(content),
        other => Err(CodecError::decode(format!(
            "unsupported filter tag 0x{:02X}",
            other
        ))),
    }
}

/// AttributeValueAssertion: exactly two OCTET STRINGs. The value is kept as raw bytes.
fn read_assertion(content: &[u8], what: &str) -> CodecResult<(String, AssertionValue)> {
    let mut reader = BerReader::new(content);
    let mut parts = Vec::with_capacity(2);
    while !reader.is_empty() {
        parts.push(reader.read_element()?);
    }
    if parts.len() != 2 {
        return Err(CodecError::decode(format!(
            "{} requires exactly 2 children, got {}",
            what,
            parts.len()
        )));
    }
    for (tag, _) in &parts {
        if *tag != TAG_OCTET_STRING {
            return Err(CodecError::decode(format!(
                "{} child has tag 0x{:02X}, expected OCTET STRING",
                what, tag
            )));
        }
    }
    Ok((decode_utf8(parts[0].1)?, AssertionValue::from(parts[1].1)))
}

fn read_substrings(content: &[u8]) -> CodecResult<Filter> {
    let mut reader = BerReader::new(content);
    let attribute = reader.read_string()?;
    let mut seq = reader.read_sequence()?;
    if !reader.is_empty() {
        return Err(CodecError::decode("substring filter requires exactly 2 children"));
    }
    let mut components = Vec::new();
    while !seq.is_empty() {
        let (tag, value) = seq.read_element()?;
        let value = AssertionValue::from(value);
        components.push(match tag {
            SUBSTRING_INITIAL => SubstringComponent::Initial(value),
            SUBSTRING_ANY => SubstringComponent::Any(value),
            SUBSTRING_FINAL => SubstringComponent::Final(value),
            other => {
                return Err(CodecError::decode(format!(
                    "unknown substring component tag 0x{:02X}",
                    other
                )))
            }
        });
    }
    if !substrings_well_formed(&components) {
        return Err(CodecError::decode("substring components empty or out of order"));
    }
    Ok(Filter::Substring {
        attribute,
        components,
    })
}

fn read_extensible(content: &[u8]) -> CodecResult<Filter> {
    let mut reader = BerReader::new(content);
    let mut matching_rule = None;
    let mut attribute = None;
    let mut value = None;
    let mut dn_attributes = false;
    while !reader.is_empty() {
        let (tag, field) = reader.read_element()?;
        match tag {
            MATCHING_RULE => matching_rule = Some(decode_utf8(field)?),
            MATCHING_TYPE => attribute = Some(decode_utf8(field)?),
            MATCH_VALUE => value = Some(AssertionValue::from(field)),
            DN_ATTRIBUTES => dn_attributes = decode_boolean(field)?,
            other => {
                return Err(CodecError::decode(format!(
                    "unknown extensible match field 0x{:02X}",
                    other
                )))
            }
        }
    }
    let value = value.ok_or_else(|| CodecError::decode("extensible match missing matchValue"))?;
    Ok(Filter::ExtensibleMatch {
        matching_rule,
        attribute,
        value,
        dn_attributes,
    })
}

/// Append `filter` to `writer`. Fails only for ASTs that cannot be represented on the wire.
pub fn write_filter(writer: &mut BerWriter, filter: &Filter) -> CodecResult<()> {
    match filter {
        Filter::And(children) | Filter::Or(children) => {
            let tag = if matches!(filter, Filter::And(_)) {
                FILTER_AND
            } else {
                FILTER_OR
            };
            let pos = writer.start(tag);
            for child in children {
                write_filter(writer, child)?;
            }
            writer.end(pos);
        }
        Filter::Not(inner) => {
            let pos = writer.start(FILTER_NOT);
            write_filter(writer, inner)?;
            writer.end(pos);
        }
        Filter::EqualityMatch { attribute, value } => {
            write_assertion(writer, FILTER_EQUALITY, attribute, value)
        }
        Filter::GreaterOrEqual { attribute, value } => {
            write_assertion(writer, FILTER_GREATER_OR_EQUAL, attribute, value)
        }
        Filter::LessOrEqual { attribute, value } => {
            write_assertion(writer, FILTER_LESS_OR_EQUAL, attribute, value)
        }
        Filter::ApproxMatch { attribute, value } => {
            write_assertion(writer, FILTER_APPROX, attribute, value)
        }
        Filter::Present { attribute } => writer.write_primitive(FILTER_PRESENT, attribute.as_bytes()),
        Filter::Substring {
            attribute,
            components,
        } => {
            if !substrings_well_formed(components) {
                return Err(CodecError::Encode(format!(
                    "substring filter on {} has empty or misordered components",
                    attribute
                )));
            }
            let pos = writer.start(FILTER_SUBSTRINGS);
            writer.write_string(attribute);
            let seq = writer.start_sequence();
            for component in components {
                let tag = match component {
                    SubstringComponent::Initial(_) => SUBSTRING_INITIAL,
                    SubstringComponent::Any(_) => SUBSTRING_ANY,
                    SubstringComponent::Final(_) => SUBSTRING_FINAL,
                };
                writer.write_primitive(tag, component.value().as_bytes());
            }
            writer.end(seq);
            writer.end(pos);
        }
        Filter::ExtensibleMatch {
            matching_rule,
            attribute,
            value,
            dn_attributes,
        } => {
            if matching_rule.is_none() && attribute.is_none() {
                return Err(CodecError::Encode(
                    "extensible match needs a matching rule or an attribute".into(),
                ));
            }
            let pos = writer.start(FILTER_EXTENSIBLE);
            if let Some(rule) = matching_rule {
                writer.write_primitive(MATCHING_RULE, rule.as_bytes());
            }
            if let Some(attr) = attribute {
                writer.write_primitive(MATCHING_TYPE, attr.as_bytes());
            }
            writer.write_primitive(MATCH_VALUE, value.as_bytes());
            if *dn_attributes {
                writer.write_primitive(DN_ATTRIBUTES, &[0xFF]);
            }
            writer.end(pos);
        }
    }
    Ok(())
}

fn write_assertion(writer: &mut BerWriter, tag: u8, attribute: &str, value: &AssertionValue) {
    let pos = writer.start(tag);
    writer.write_string(attribute);
    writer.write_octet_string(value.as_bytes());
    writer.end(pos);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::query_to_filter;

    #[test]
    fn test_equality_wire_format() {
        let bytes = filter_to_packet(&Filter::equality("cn", "x")).unwrap();
        assert_eq!(bytes, vec![0xA3, 0x07, 0x04, 0x02, b'c', b'n', 0x04, 0x01, b'x']);
    }

    #[test]
    fn test_present_is_primitive() {
        let bytes = filter_to_packet(&Filter::present("objectClass")).unwrap();
        assert_eq!(bytes[0], 0x87);
        assert_eq!(&bytes[2..], b"objectClass");
    }

    #[test]
    fn test_substring_wire_order() {
        let f = query_to_filter("(cn=a*b*c)").unwrap();
        let bytes = filter_to_packet(&f).unwrap();
        // A4 len 04 02 "cn" 30 09 80 01 'a' 81 01 'b' 82 01 'c'
        assert_eq!(
            bytes,
            vec![0xA4, 0x0F, 0x04, 0x02, b'c', b'n', 0x30, 0x09, 0x80, 0x01, b'a', 0x81, 0x01, b'b', 0x82, 0x01, b'c']
        );
    }

    #[test]
    fn test_packet_round_trip() {
        for text in [
            "(cn=John Doe)",
            "(&(cn=John)(|(sn=Doe)(!(mail=*))))",
            "(cn=Jo*n*Doe)",
            "(cn=*x)",
            "(cn~=John)",
            "(uSNChanged>=10)",
            "(uSNChanged<=10)",
            "(userAccountControl:1.2.840.113556.1.4.803:=512)",
            "(ou:dn:caseIgnoreMatch:=Users)",
            "(:2.5.13.5:=x)",
            "(&)",
            "(|)",
        ] {
            let f = query_to_filter(text).unwrap();
            let bytes = filter_to_packet(&f).unwrap();
            assert_eq!(packet_to_filter(&bytes).unwrap(), f, "round trip of {}", text);
        }
    }

    #[test]
    fn test_long_filter_round_trip() {
        let children = (0..100)
            .map(|i| Filter::equality(format!("attr{}", i), "v".repeat(20)))
            .collect();
        let f = Filter::Or(children);
        let bytes = filter_to_packet(&f).unwrap();
        assert!(bytes.len() > 255);
        assert_eq!(packet_to_filter(&bytes).unwrap(), f);
    }

    #[test]
    fn test_equality_arity_mismatch() {
        // equalityMatch with a single OCTET STRING
        let data = [0xA3, 0x04, 0x04, 0x02, b'c', b'n'];
        match packet_to_filter(&data) {
            Err(CodecError::Decode(msg)) => assert!(msg.contains("exactly 2 children")),
            other => panic!("unexpected {:?}", other),
        }
        // three children
        let data = [0xA3, 0x09, 0x04, 0x01, b'a', 0x04, 0x01, b'b', 0x04, 0x01, b'c'];
        assert!(matches!(packet_to_filter(&data), Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_unknown_tag() {
        let data = [0xAB, 0x00];
        assert!(matches!(packet_to_filter(&data), Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_binary_value_kept_as_bytes() {
        let data = [0xA3, 0x06, 0x04, 0x01, b'a', 0x04, 0x01, 0xFF];
        let f = packet_to_filter(&data).unwrap();
        assert_eq!(f, Filter::equality("a", vec![0xFFu8]));
        assert_eq!(filter_to_packet(&f).unwrap(), data);
    }

    #[test]
    fn test_non_utf8_attribute_rejected() {
        let data = [0xA3, 0x06, 0x04, 0x01, 0xFF, 0x04, 0x01, b'a'];
        assert!(matches!(packet_to_filter(&data), Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_empty_substring_value_rejected() {
        // A4 len 04 02 "cn" 30 02 80 00
        let data = [0xA4, 0x08, 0x04, 0x02, b'c', b'n', 0x30, 0x02, 0x80, 0x00];
        assert!(matches!(packet_to_filter(&data), Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_excessive_nesting_rejected() {
        let mut f = Filter::present("cn");
        for _ in 0..200 {
            f = Filter::not(f);
        }
        let bytes = filter_to_packet(&f).unwrap();
        assert!(packet_to_filter(&bytes).is_err());
    }

    #[test]
    fn test_encode_rejects_bad_substring_order() {
        let f = Filter::Substring {
            attribute: "cn".into(),
            components: vec![SubstringComponent::Final("a".into()), SubstringComponent::Initial("b".into())],
        };
        assert!(matches!(filter_to_packet(&f), Err(CodecError::Encode(_))));
    }
}
