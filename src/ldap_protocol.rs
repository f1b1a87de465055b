// LDAP v3 message envelope and the request codecs the proxy rewrites.
// Every other protocol operation is carried as an opaque tag + body and
// forwarded byte-for-byte.

use crate::ber::{BerReader, BerWriter, TAG_SET};
use crate::error::{CodecError, CodecResult};
use crate::filter::{read_filter, write_filter, Filter};

pub const LDAP_TAG_BIND_REQUEST: u8 = 0x60;
pub const LDAP_TAG_BIND_RESPONSE: u8 = 0x61;
pub const LDAP_TAG_UNBIND_REQUEST: u8 = 0x42;
pub const LDAP_TAG_SEARCH_REQUEST: u8 = 0x63;
pub const LDAP_TAG_SEARCH_RESULT_ENTRY: u8 = 0x64;
pub const LDAP_TAG_SEARCH_RESULT_DONE: u8 = 0x65;
pub const LDAP_TAG_MODIFY_REQUEST: u8 = 0x66;
pub const LDAP_TAG_MODIFY_RESPONSE: u8 = 0x67;
pub const LDAP_TAG_ADD_REQUEST: u8 = 0x68;
pub const LDAP_TAG_ADD_RESPONSE: u8 = 0x69;
pub const LDAP_TAG_DEL_REQUEST: u8 = 0x4A;
pub const LDAP_TAG_DEL_RESPONSE: u8 = 0x6B;
pub const LDAP_TAG_MODIFY_DN_REQUEST: u8 = 0x6C;
pub const LDAP_TAG_MODIFY_DN_RESPONSE: u8 = 0x6D;
pub const LDAP_TAG_COMPARE_REQUEST: u8 = 0x6E;
pub const LDAP_TAG_COMPARE_RESPONSE: u8 = 0x6F;
pub const LDAP_TAG_ABANDON_REQUEST: u8 = 0x50;
pub const LDAP_TAG_SEARCH_RESULT_REFERENCE: u8 = 0x73;
pub const LDAP_TAG_EXTENDED_REQUEST: u8 = 0x77;
pub const LDAP_TAG_EXTENDED_RESPONSE: u8 = 0x78;
pub const LDAP_TAG_INTERMEDIATE_RESPONSE: u8 = 0x79;

/// Context [0] IMPLICIT SEQUENCE OF Control
const LDAP_CONTEXT_CONTROLS: u8 = 0xA0;
/// ModifyDNRequest newSuperior [0] LDAPDN
const LDAP_CONTEXT_NEW_SUPERIOR: u8 = 0x80;

/// RFC 2696 Simple Paged Results control
pub const PAGED_RESULTS_OID: &str = "1.2.840.113556.1.4.319";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub oid: String,
    pub critical: bool,
    pub value: Option<Vec<u8>>,
}

/// One LDAPMessage. `op_body` is the protocolOp content without its tag and length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapMessage {
    pub message_id: i32,
    pub op_tag: u8,
    pub op_body: Vec<u8>,
    pub controls: Option<Vec<Control>>,
}

/// The five request types the proxy can rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterceptedOp {
    Search,
    Modify,
    Add,
    Delete,
    ModifyDn,
}

impl InterceptedOp {
    pub const ALL: [InterceptedOp; 5] = [
        InterceptedOp::Search,
        InterceptedOp::Modify,
        InterceptedOp::Add,
        InterceptedOp::Delete,
        InterceptedOp::ModifyDn,
    ];

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            LDAP_TAG_SEARCH_REQUEST => Some(InterceptedOp::Search),
            LDAP_TAG_MODIFY_REQUEST => Some(InterceptedOp::Modify),
            LDAP_TAG_ADD_REQUEST => Some(InterceptedOp::Add),
            LDAP_TAG_DEL_REQUEST => Some(InterceptedOp::Delete),
            LDAP_TAG_MODIFY_DN_REQUEST => Some(InterceptedOp::ModifyDn),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        op_name(match self {
            InterceptedOp::Search => LDAP_TAG_SEARCH_REQUEST,
            InterceptedOp::Modify => LDAP_TAG_MODIFY_REQUEST,
            InterceptedOp::Add => LDAP_TAG_ADD_REQUEST,
            InterceptedOp::Delete => LDAP_TAG_DEL_REQUEST,
            InterceptedOp::ModifyDn => LDAP_TAG_MODIFY_DN_REQUEST,
        })
    }

    /// Label used in metrics output.
    pub fn metric_name(self) -> &'static str {
        match self {
            InterceptedOp::Search => "search",
            InterceptedOp::Modify => "modify",
            InterceptedOp::Add => "add",
            InterceptedOp::Delete => "delete",
            InterceptedOp::ModifyDn => "modify_dn",
        }
    }
}

/// Protocol operation name for logging.
pub fn op_name(tag: u8) -> &'static str {
    match tag {
        LDAP_TAG_BIND_REQUEST => "BindRequest",
        LDAP_TAG_BIND_RESPONSE => "BindResponse",
        LDAP_TAG_UNBIND_REQUEST => "UnbindRequest",
        LDAP_TAG_SEARCH_REQUEST => "SearchRequest",
        LDAP_TAG_SEARCH_RESULT_ENTRY => "SearchResultEntry",
        LDAP_TAG_SEARCH_RESULT_DONE => "SearchResultDone",
        LDAP_TAG_SEARCH_RESULT_REFERENCE => "SearchResultReference",
        LDAP_TAG_MODIFY_REQUEST => "ModifyRequest",
        LDAP_TAG_MODIFY_RESPONSE => "ModifyResponse",
        LDAP_TAG_ADD_REQUEST => "AddRequest",
        LDAP_TAG_ADD_RESPONSE => "AddResponse",
        LDAP_TAG_DEL_REQUEST => "DelRequest",
        LDAP_TAG_DEL_RESPONSE => "DelResponse",
        LDAP_TAG_MODIFY_DN_REQUEST => "ModifyDNRequest",
        LDAP_TAG_MODIFY_DN_RESPONSE => "ModifyDNResponse",
        LDAP_TAG_COMPARE_REQUEST => "CompareRequest",
        LDAP_TAG_COMPARE_RESPONSE => "CompareResponse",
        LDAP_TAG_ABANDON_REQUEST => "AbandonRequest",
        LDAP_TAG_EXTENDED_REQUEST => "ExtendedRequest",
        LDAP_TAG_EXTENDED_RESPONSE => "ExtendedResponse",
        LDAP_TAG_INTERMEDIATE_RESPONSE => "IntermediateResponse",
        _ => "Unknown",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
    Subordinates = 3,
}

impl TryFrom<i64> for SearchScope {
    type Error = CodecError;
    fn try_from(value: i64) -> CodecResult<Self> {
        match value {
            0 => Ok(SearchScope::BaseObject),
            1 => Ok(SearchScope::SingleLevel),
            2 => Ok(SearchScope::WholeSubtree),
            3 => Ok(SearchScope::Subordinates),
            _ => Err(CodecError::decode(format!("invalid search scope: {}", value))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base_object: String,
    pub scope: SearchScope,
    pub deref_aliases: i64,
    pub size_limit: i64,
    pub time_limit: i64,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
}

impl SearchRequest {
    /// Identity of a search across pages, independent of any rewriting applied to it.
    pub fn signature(&self) -> String {
        format!(
            "{}\u{0}{:?}\u{0}{}\u{0}{}",
            self.base_object.to_ascii_lowercase(),
            self.scope,
            self.filter,
            self.attributes.join(",").to_ascii_lowercase()
        )
    }
}

/// One attribute with its values, as carried by Add and Modify requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeEntry {
    pub name: String,
    pub values: Vec<Vec<u8>>,
}

impl AttributeEntry {
    pub fn new(name: impl Into<String>, values: Vec<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOperation {
    Add = 0,
    Delete = 1,
    Replace = 2,
    Increment = 3,
}

impl TryFrom<i64> for ModifyOperation {
    type Error = CodecError;
    fn try_from(value: i64) -> CodecResult<Self> {
        match value {
            0 => Ok(ModifyOperation::Add),
            1 => Ok(ModifyOperation::Delete),
            2 => Ok(ModifyOperation::Replace),
            3 => Ok(ModifyOperation::Increment),
            _ => Err(CodecError::decode(format!("invalid modify operation: {}", value))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyChange {
    pub operation: ModifyOperation,
    pub modification: AttributeEntry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyRequest {
    pub object: String,
    pub changes: Vec<ModifyChange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequest {
    pub entry: String,
    pub attributes: Vec<AttributeEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelRequest {
    pub entry: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyDnRequest {
    pub entry: String,
    pub new_rdn: String,
    pub delete_old_rdn: bool,
    pub new_superior: Option<String>,
}

/// Simple Paged Results control value: SEQUENCE { size INTEGER, cookie OCTET STRING }
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagedResults {
    pub size: i64,
    pub cookie: Vec<u8>,
}

/// Parse only the LDAP message header (SEQUENCE, messageID, protocolOp tag).
pub fn parse_ldap_message_header(data: &[u8]) -> CodecResult<(i32, u8)> {
    let mut reader = BerReader::new(data);
    let mut seq = reader.read_sequence()?;
    let message_id = read_message_id(&mut seq)?;
    let tag = seq
        .peek_tag()
        .ok_or_else(|| CodecError::decode("LDAPMessage missing protocolOp"))?;
    Ok((message_id, tag))
}

pub fn parse_ldap_message(data: &[u8]) -> CodecResult<LdapMessage> {
    let mut reader = BerReader::new(data);
    // LDAPMessage ::= SEQUENCE { messageID, protocolOp, controls [0] OPTIONAL }
    let mut seq = reader.read_sequence()?;
    if !reader.is_empty() {
        return Err(CodecError::decode("trailing bytes after LDAPMessage"));
    }
    let message_id = read_message_id(&mut seq)?;
    let (op_tag, op_body) = seq.read_element()?;

    let controls = if seq.is_empty() {
        None
    } else {
        let (tag, content) = seq.read_element()?;
        if tag != LDAP_CONTEXT_CONTROLS {
            return Err(CodecError::decode(format!(
                "unexpected element 0x{:02X} after protocolOp",
                tag
            )));
        }
        Some(parse_controls(content)?)
    };

    Ok(LdapMessage {
        message_id,
        op_tag,
        op_body: op_body.to_vec(),
        controls,
    })
}

fn read_message_id(reader: &mut BerReader<'_>) -> CodecResult<i32> {
    let id = reader.read_integer()?;
    i32::try_from(id).map_err(|_| CodecError::decode(format!("messageID out of range: {}", id)))
}

/// Controls ::= SEQUENCE OF Control; Control ::= SEQUENCE { type, criticality DEFAULT FALSE, value OPTIONAL }
fn parse_controls(content: &[u8]) -> CodecResult<Vec<Control>> {
    let mut reader = BerReader::new(content);
    let mut controls = Vec::new();
    while !reader.is_empty() {
        let mut ctrl = reader.read_sequence()?;
        let oid = ctrl.read_string()?;
        let mut critical = false;
        let mut value = None;
        while !ctrl.is_empty() {
            match ctrl.peek_tag() {
                Some(crate::ber::TAG_BOOLEAN) => critical = ctrl.read_boolean()?,
                Some(crate::ber::TAG_OCTET_STRING) => value = Some(ctrl.read_octet_string()?.to_vec()),
                Some(tag) => {
                    return Err(CodecError::decode(format!(
                        "unexpected tag 0x{:02X} in control {}",
                        tag, oid
                    )))
                }
                None => break,
            }
        }
        controls.push(Control {
            oid,
            critical,
            value,
        });
    }
    Ok(controls)
}

pub fn encode_ldap_message(message: &LdapMessage) -> Vec<u8> {
    let mut writer = BerWriter::new();
    let seq = writer.start_sequence();
    writer.write_integer(message.message_id as i64);
    writer.write_primitive(message.op_tag, &message.op_body);
    if let Some(controls) = &message.controls {
        let ctx = writer.start(LDAP_CONTEXT_CONTROLS);
        for control in controls {
            let ctrl = writer.start_sequence();
            writer.write_string(&control.oid);
            if control.critical {
                writer.write_boolean(true);
            }
            if let Some(value) = &control.value {
                writer.write_octet_string(value);
            }
            writer.end(ctrl);
        }
        writer.end(ctx);
    }
    writer.end(seq);
    writer.into_vec()
}

pub fn parse_search_request(body: &[u8]) -> CodecResult<SearchRequest> {
    let mut reader = BerReader::new(body);
    let base_object = reader.read_string()?;
    let scope = SearchScope::try_from(reader.read_enumerated()?)?;
    let deref_aliases = reader.read_enumerated()?;
    let size_limit = reader.read_integer()?;
    let time_limit = reader.read_integer()?;
    let types_only = reader.read_boolean()?;
    let filter = read_filter(&mut reader)?;
    let mut attrs = reader.read_sequence()?;
    let mut attributes = Vec::new();
    while !attrs.is_empty() {
        attributes.push(attrs.read_string()?);
    }
    Ok(SearchRequest {
        base_object,
        scope,
        deref_aliases,
        size_limit,
        time_limit,
        types_only,
        filter,
        attributes,
    })
}

pub fn encode_search_request(req: &SearchRequest) -> CodecResult<Vec<u8>> {
    let mut writer = BerWriter::new();
    writer.write_string(&req.base_object);
    writer.write_enumerated(req.scope as i64);
    writer.write_enumerated(req.deref_aliases);
    writer.write_integer(req.size_limit);
    writer.write_integer(req.time_limit);
    writer.write_boolean(req.types_only);
    write_filter(&mut writer, &req.filter)?;
    let attrs = writer.start_sequence();
    for attr in &req.attributes {
        writer.write_string(attr);
    }
    writer.end(attrs);
    Ok(writer.into_vec())
}

/// PartialAttribute ::= SEQUENCE { type, vals SET OF value }
fn read_attribute_entry(reader: &mut BerReader<'_>) -> CodecResult<AttributeEntry> {
    let mut seq = reader.read_sequence()?;
    let name = seq.read_string()?;
    let mut set = BerReader::new(seq.read_expected(TAG_SET, "SET")?);
    let mut values = Vec::new();
    while !set.is_empty() {
        values.push(set.read_octet_string()?.to_vec());
    }
    Ok(AttributeEntry { name, values })
}

fn write_attribute_entry(writer: &mut BerWriter, entry: &AttributeEntry) {
    let seq = writer.start_sequence();
    writer.write_string(&entry.name);
    let set = writer.start(TAG_SET);
    for value in &entry.values {
        writer.write_octet_string(value);
    }
    writer.end(set);
    writer.end(seq);
}

pub fn parse_modify_request(body: &[u8]) -> CodecResult<ModifyRequest> {
    let mut reader = BerReader::new(body);
    let object = reader.read_string()?;
    let mut changes_reader = reader.read_sequence()?;
    let mut changes = Vec::new();
    while !changes_reader.is_empty() {
        let mut change = changes_reader.read_sequence()?;
        let operation = ModifyOperation::try_from(change.read_enumerated()?)?;
        let modification = read_attribute_entry(&mut change)?;
        changes.push(ModifyChange {
            operation,
            modification,
        });
    }
    Ok(ModifyRequest { object, changes })
}

pub fn encode_modify_request(req: &ModifyRequest) -> Vec<u8> {
    let mut writer = BerWriter::new();
    writer.write_string(&req.object);
    let changes = writer.start_sequence();
    for change in &req.changes {
        let seq = writer.start_sequence();
        writer.write_enumerated(change.operation as i64);
        write_attribute_entry(&mut writer, &change.modification);
        writer.end(seq);
    }
    writer.end(changes);
    writer.into_vec()
}

pub fn parse_add_request(body: &[u8]) -> CodecResult<AddRequest> {
    let mut reader = BerReader::new(body);
    let entry = reader.read_string()?;
    let mut attrs = reader.read_sequence()?;
    let mut attributes = Vec::new();
    while !attrs.is_empty() {
        attributes.push(read_attribute_entry(&mut attrs)?);
    }
    Ok(AddRequest { entry, attributes })
}

pub fn encode_add_request(req: &AddRequest) -> Vec<u8> {
    let mut writer = BerWriter::new();
    writer.write_string(&req.entry);
    let attrs = writer.start_sequence();
    for entry in &req.attributes {
        write_attribute_entry(&mut writer, entry);
    }
    writer.end(attrs);
    writer.into_vec()
}

/// DelRequest ::= [APPLICATION 10] LDAPDN, so the body is the DN itself.
pub fn parse_del_request(body: &[u8]) -> CodecResult<DelRequest> {
    Ok(DelRequest {
        entry: crate::ber::decode_utf8(body)?,
    })
}

pub fn encode_del_request(req: &DelRequest) -> Vec<u8> {
    req.entry.as_bytes().to_vec()
}

pub fn parse_modify_dn_request(body: &[u8]) -> CodecResult<ModifyDnRequest> {
    let mut reader = BerReader::new(body);
    let entry = reader.read_string()?;
    let new_rdn = reader.read_string()?;
    let delete_old_rdn = reader.read_boolean()?;
    let new_superior = if reader.is_empty() {
        None
    } else {
        let dn = reader.read_expected(LDAP_CONTEXT_NEW_SUPERIOR, "newSuperior")?;
        Some(crate::ber::decode_utf8(dn)?)
    };
    Ok(ModifyDnRequest {
        entry,
        new_rdn,
        delete_old_rdn,
        new_superior,
    })
}

pub fn encode_modify_dn_request(req: &ModifyDnRequest) -> Vec<u8> {
    let mut writer = BerWriter::new();
    writer.write_string(&req.entry);
    writer.write_string(&req.new_rdn);
    writer.write_boolean(req.delete_old_rdn);
    if let Some(superior) = &req.new_superior {
        writer.write_primitive(LDAP_CONTEXT_NEW_SUPERIOR, superior.as_bytes());
    }
    writer.into_vec()
}

/// Find the paged results control and parse its value. `None` if absent or malformed.
pub fn get_paged_results_control(controls: Option<&[Control]>) -> Option<PagedResults> {
    let ctrl = controls?.iter().find(|c| c.oid == PAGED_RESULTS_OID)?;
    parse_paged_results_value(ctrl.value.as_deref()?).ok()
}

fn parse_paged_results_value(data: &[u8]) -> CodecResult<PagedResults> {
    let mut reader = BerReader::new(data);
    let mut seq = reader.read_sequence()?;
    let size = seq.read_integer()?;
    let cookie = seq.read_octet_string()?.to_vec();
    Ok(PagedResults { size, cookie })
}

pub fn encode_paged_results_value(paged: &PagedResults) -> Vec<u8> {
    let mut writer = BerWriter::new();
    let seq = writer.start_sequence();
    writer.write_integer(paged.size);
    writer.write_octet_string(&paged.cookie);
    writer.end(seq);
    writer.into_vec()
}

/// Replace the cookie of an existing paged results control, keeping its page size.
/// Returns false when the message carries no parseable paged control.
pub fn set_paged_results_cookie(message: &mut LdapMessage, cookie: &[u8]) -> bool {
    let Some(controls) = message.controls.as_mut() else {
        return false;
    };
    let Some(ctrl) = controls.iter_mut().find(|c| c.oid == PAGED_RESULTS_OID) else {
        return false;
    };
    let Some(mut paged) = ctrl
        .value
        .as_deref()
        .and_then(|v| parse_paged_results_value(v).ok())
    else {
        return false;
    };
    paged.cookie = cookie.to_vec();
    ctrl.value = Some(encode_paged_results_value(&paged));
    true
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_search_scope_try_from() {
        assert_eq!(SearchScope::try_from(0).unwrap(), SearchScope::BaseObject);
        assert_eq!(SearchScope::try_from(2).unwrap(), SearchScope::WholeSubtree);
        assert!(SearchScope::try_from(7).is_err());
    }

    #[test]
    fn test_parse_message_header() {
        let data = search_message(7, "(cn=x)", None);
        assert_eq!(parse_ldap_message_header(&data).unwrap(), (7, LDAP_TAG_SEARCH_REQUEST));
    }

    #[test]
    fn test_search_request_round_trip() {
        let data = search_message(3, "(&(cn=John)(sn=Doe))", None);
        let msg = parse_ldap_message(&data).unwrap();
        assert_eq!(msg.message_id, 3);
        assert_eq!(msg.op_tag, LDAP_TAG_SEARCH_REQUEST);
        assert!(msg.controls.is_none());
        let req = parse_search_request(&msg.op_body).unwrap();
        assert_eq!(req.base_object, "dc=example,dc=com");
        assert_eq!(req.filter.to_string(), "(&(cn=John)(sn=Doe))");
        assert_eq!(req.attributes, vec!["cn", "mail"]);
        assert_eq!(encode_search_request(&req).unwrap(), msg.op_body);
        assert_eq!(encode_ldap_message(&msg), data);
    }

    #[test]
    fn test_controls_round_trip() {
        let controls = vec![
            paged_control(100, b""),
            Control {
                oid: "1.2.840.113556.1.4.417".into(),
                critical: true,
                value: None,
            },
        ];
        let data = search_message(1, "(objectClass=*)", Some(controls.clone()));
        let msg = parse_ldap_message(&data).unwrap();
        assert_eq!(msg.controls, Some(controls));
        assert_eq!(encode_ldap_message(&msg), data);
    }

    #[test]
    fn test_paged_cookie_get_and_set() {
        let data = search_message(2, "(cn=*)", Some(vec![paged_control(50, b"")]));
        let mut msg = parse_ldap_message(&data).unwrap();
        let paged = get_paged_results_control(msg.controls.as_deref()).unwrap();
        assert_eq!(paged, PagedResults { size: 50, cookie: vec![] });

        assert!(set_paged_results_cookie(&mut msg, b"C1"));
        let reparsed = parse_ldap_message(&encode_ldap_message(&msg)).unwrap();
        let paged = get_paged_results_control(reparsed.controls.as_deref()).unwrap();
        assert_eq!(paged, PagedResults { size: 50, cookie: b"C1".to_vec() });
    }

    #[test]
    fn test_set_cookie_without_control() {
        let data = search_message(2, "(cn=*)", None);
        let mut msg = parse_ldap_message(&data).unwrap();
        assert!(!set_paged_results_cookie(&mut msg, b"C1"));
    }

    #[test]
    fn test_modify_request_round_trip() {
        let req = ModifyRequest {
            object: "cn=John,dc=example,dc=com".into(),
            changes: vec![
                ModifyChange {
                    operation: ModifyOperation::Replace,
                    modification: AttributeEntry::new("mail", vec![b"j@example.com".to_vec()]),
                },
                ModifyChange {
                    operation: ModifyOperation::Delete,
                    modification: AttributeEntry::new("description", vec![]),
                },
            ],
        };
        let body = encode_modify_request(&req);
        assert_eq!(parse_modify_request(&body).unwrap(), req);
    }

    #[test]
    fn test_add_request_round_trip() {
        let req = AddRequest {
            entry: "cn=New,dc=example,dc=com".into(),
            attributes: vec![
                AttributeEntry::new("objectClass", vec![b"top".to_vec(), b"person".to_vec()]),
                AttributeEntry::new("cn", vec![b"New".to_vec()]),
                AttributeEntry::new("cn", vec![b"Other".to_vec()]),
            ],
        };
        let body = encode_add_request(&req);
        assert_eq!(parse_add_request(&body).unwrap(), req);
    }

    #[test]
    fn test_del_request_is_primitive() {
        let req = DelRequest {
            entry: "cn=Old,dc=example,dc=com".into(),
        };
        let msg = LdapMessage {
            message_id: 9,
            op_tag: LDAP_TAG_DEL_REQUEST,
            op_body: encode_del_request(&req),
            controls: None,
        };
        let data = encode_ldap_message(&msg);
        let parsed = parse_ldap_message(&data).unwrap();
        assert_eq!(parse_del_request(&parsed.op_body).unwrap(), req);
    }

    #[test]
    fn test_modify_dn_round_trip() {
        for new_superior in [None, Some("ou=People,dc=example,dc=com".to_string())] {
            let req = ModifyDnRequest {
                entry: "cn=A,dc=example,dc=com".into(),
                new_rdn: "cn=B".into(),
                delete_old_rdn: true,
                new_superior,
            };
            let body = encode_modify_dn_request(&req);
            assert_eq!(parse_modify_dn_request(&body).unwrap(), req);
        }
    }

    #[test]
    fn test_signature_ignores_message_id_and_controls() {
        let a = parse_ldap_message(&search_message(1, "(cn=x)", None)).unwrap();
        let b = parse_ldap_message(&search_message(2, "(cn=x)", Some(vec![paged_control(10, b"C1")]))).unwrap();
        let c = parse_ldap_message(&search_message(3, "(cn=y)", None)).unwrap();
        let sig = |m: &LdapMessage| parse_search_request(&m.op_body).unwrap().signature();
        assert_eq!(sig(&a), sig(&b));
        assert_ne!(sig(&a), sig(&c));
    }

    #[test]
    fn test_intercepted_op_names() {
        assert_eq!(InterceptedOp::from_tag(0x63), Some(InterceptedOp::Search));
        assert_eq!(InterceptedOp::from_tag(0x4A), Some(InterceptedOp::Delete));
        assert_eq!(InterceptedOp::from_tag(0x60), None);
        assert_eq!(InterceptedOp::ModifyDn.name(), "ModifyDNRequest");
        assert_eq!(InterceptedOp::ModifyDn.metric_name(), "modify_dn");
    }

    #[test]
    fn test_rejects_trailing_garbage_after_op() {
        let mut writer = BerWriter::new();
        let seq = writer.start_sequence();
        writer.write_integer(1);
        writer.write_primitive(LDAP_TAG_DEL_REQUEST, b"cn=x");
        writer.write_integer(5);
        writer.end(seq);
        assert!(parse_ldap_message(&writer.into_vec()).is_err());
    }
}
