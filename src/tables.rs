// Read-only attribute lookup tables consumed by the rewrite steps:
// attribute -> OID, attribute -> value format, and the ANR attribute set.
// Keys are matched case-insensitively.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// How an attribute's values are shaped. Drives the type-aware rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeFormat {
    #[default]
    String,
    Integer,
    Bitmask,
    Sid,
    Dn,
    Timestamp,
    Binary,
}

impl AttributeFormat {
    pub fn is_numeric(self) -> bool {
        matches!(self, AttributeFormat::Integer | AttributeFormat::Bitmask)
    }

    /// Formats whose matching rules ignore case.
    pub fn is_case_insensitive(self) -> bool {
        matches!(self, AttributeFormat::String | AttributeFormat::Dn)
    }
}

/// Extra or overriding table entries from configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributeOverrides {
    pub oids: HashMap<String, String>,
    pub formats: HashMap<String, AttributeFormat>,
    pub anr: Vec<String>,
}

// (name, OID, format)
const BUILTIN_ATTRIBUTES: &[(&str, &str, AttributeFormat)] = &[
    ("objectClass", "2.5.4.0", AttributeFormat::String),
    ("cn", "2.5.4.3", AttributeFormat::String),
    ("sn", "2.5.4.4", AttributeFormat::String),
    ("c", "2.5.4.6", AttributeFormat::String),
    ("l", "2.5.4.7", AttributeFormat::String),
    ("st", "2.5.4.8", AttributeFormat::String),
    ("street", "2.5.4.9", AttributeFormat::String),
    ("o", "2.5.4.10", AttributeFormat::String),
    ("ou", "2.5.4.11", AttributeFormat::String),
    ("title", "2.5.4.12", AttributeFormat::String),
    ("description", "2.5.4.13", AttributeFormat::String),
    ("postalCode", "2.5.4.17", AttributeFormat::String),
    ("telephoneNumber", "2.5.4.20", AttributeFormat::String),
    ("member", "2.5.4.31", AttributeFormat::Dn),
    ("givenName", "2.5.4.42", AttributeFormat::String),
    ("initials", "2.5.4.43", AttributeFormat::String),
    ("distinguishedName", "2.5.4.49", AttributeFormat::Dn),
    ("uid", "0.9.2342.19200300.100.1.1", AttributeFormat::String),
    ("mail", "0.9.2342.19200300.100.1.3", AttributeFormat::String),
    ("dc", "0.9.2342.19200300.100.1.25", AttributeFormat::String),
    ("name", "1.2.840.113556.1.4.1", AttributeFormat::String),
    ("objectGUID", "1.2.840.113556.1.4.2", AttributeFormat::Binary),
    ("userAccountControl", "1.2.840.113556.1.4.8", AttributeFormat::Bitmask),
    ("badPwdCount", "1.2.840.113556.1.4.12", AttributeFormat::Integer),
    ("homeDirectory", "1.2.840.113556.1.4.44", AttributeFormat::String),
    ("lastLogon", "1.2.840.113556.1.4.52", AttributeFormat::Integer),
    ("scriptPath", "1.2.840.113556.1.4.62", AttributeFormat::String),
    ("pwdLastSet", "1.2.840.113556.1.4.96", AttributeFormat::Integer),
    ("primaryGroupID", "1.2.840.113556.1.4.98", AttributeFormat::Integer),
    ("objectSid", "1.2.840.113556.1.4.146", AttributeFormat::Sid),
    ("adminCount", "1.2.840.113556.1.4.150", AttributeFormat::Integer),
    ("accountExpires", "1.2.840.113556.1.4.159", AttributeFormat::Integer),
    ("logonCount", "1.2.840.113556.1.4.169", AttributeFormat::Integer),
    ("sAMAccountName", "1.2.840.113556.1.4.221", AttributeFormat::String),
    ("sAMAccountType", "1.2.840.113556.1.4.302", AttributeFormat::Integer),
    ("operatingSystem", "1.2.840.113556.1.4.363", AttributeFormat::String),
    ("trustAttributes", "1.2.840.113556.1.4.470", AttributeFormat::Bitmask),
    ("dNSHostName", "1.2.840.113556.1.4.619", AttributeFormat::String),
    ("managedBy", "1.2.840.113556.1.4.653", AttributeFormat::Dn),
    ("userPrincipalName", "1.2.840.113556.1.4.656", AttributeFormat::String),
    ("groupType", "1.2.840.113556.1.4.750", AttributeFormat::Bitmask),
    ("servicePrincipalName", "1.2.840.113556.1.4.771", AttributeFormat::String),
    ("objectCategory", "1.2.840.113556.1.4.782", AttributeFormat::Dn),
    ("lastLogonTimestamp", "1.2.840.113556.1.4.1696", AttributeFormat::Integer),
    ("msDS-AllowedToDelegateTo", "1.2.840.113556.1.4.1787", AttributeFormat::String),
    ("msDS-SupportedEncryptionTypes", "1.2.840.113556.1.4.1963", AttributeFormat::Bitmask),
    ("displayName", "1.2.840.113556.1.2.13", AttributeFormat::String),
    ("whenCreated", "1.2.840.113556.1.2.2", AttributeFormat::Timestamp),
    ("whenChanged", "1.2.840.113556.1.2.3", AttributeFormat::Timestamp),
    ("uSNCreated", "1.2.840.113556.1.2.19", AttributeFormat::Integer),
    ("memberOf", "1.2.840.113556.1.2.102", AttributeFormat::Dn),
    ("uSNChanged", "1.2.840.113556.1.2.120", AttributeFormat::Integer),
];

// Default Active Directory ANR set.
const BUILTIN_ANR: &[&str] = &[
    "displayName",
    "givenName",
    "legacyExchangeDN",
    "msDS-AdditionalSamAccountName",
    "msDS-PhoneticCompanyName",
    "msDS-PhoneticDepartment",
    "msDS-PhoneticDisplayName",
    "msDS-PhoneticFirstName",
    "msDS-PhoneticLastName",
    "name",
    "physicalDeliveryOfficeName",
    "proxyAddresses",
    "sAMAccountName",
    "sn",
];

#[derive(Debug, Clone, Default)]
pub struct AttributeTables {
    /// lowercase name -> (canonical name, OID)
    oids: HashMap<String, (String, String)>,
    formats: HashMap<String, AttributeFormat>,
    anr: HashSet<String>,
}

impl AttributeTables {
    /// Built-in Active Directory oriented tables.
    pub fn builtin() -> Self {
        let mut tables = Self::default();
        for (name, oid, format) in BUILTIN_ATTRIBUTES {
            tables.insert_oid(name, oid);
            if *format != AttributeFormat::String {
                tables.insert_format(name, *format);
            }
        }
        for name in BUILTIN_ANR {
            tables.anr.insert(name.to_ascii_lowercase());
        }
        tables
    }

    pub fn with_overrides(mut self, overrides: &AttributeOverrides) -> Self {
        for (name, oid) in &overrides.oids {
            self.insert_oid(name, oid);
        }
        for (name, format) in &overrides.formats {
            self.insert_format(name, *format);
        }
        for name in &overrides.anr {
            self.anr.insert(name.to_ascii_lowercase());
        }
        self
    }

    pub fn insert_oid(&mut self, name: &str, oid: &str) {
        self.oids
            .insert(name.to_ascii_lowercase(), (name.to_string(), oid.to_string()));
    }

    pub fn insert_format(&mut self, name: &str, format: AttributeFormat) {
        self.formats.insert(name.to_ascii_lowercase(), format);
    }

    /// Numeric OID registered for `name`. Attribute options (`;binary`) are not stripped here.
    pub fn oid(&self, name: &str) -> Option<&str> {
        self.oids
            .get(&name.to_ascii_lowercase())
            .map(|(_, oid)| oid.as_str())
    }

    /// Format of `name`, `String` when unknown.
    pub fn format(&self, name: &str) -> AttributeFormat {
        self.formats
            .get(&name.to_ascii_lowercase())
            .copied()
            .unwrap_or_default()
    }

    pub fn is_anr(&self, name: &str) -> bool {
        self.anr.contains(&name.to_ascii_lowercase())
    }

    /// Canonical names of every attribute with a registered OID, sorted.
    pub fn known_attributes(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.oids.values().map(|(name, _)| name.as_str()).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lookups_are_case_insensitive() {
        let tables = AttributeTables::builtin();
        assert_eq!(tables.oid("cn"), Some("2.5.4.3"));
        assert_eq!(tables.oid("CN"), Some("2.5.4.3"));
        assert_eq!(tables.oid("useraccountcontrol"), Some("1.2.840.113556.1.4.8"));
        assert_eq!(tables.oid("noSuchAttribute"), None);
        assert_eq!(tables.format("USERACCOUNTCONTROL"), AttributeFormat::Bitmask);
        assert_eq!(tables.format("objectSid"), AttributeFormat::Sid);
        assert_eq!(tables.format("whatever"), AttributeFormat::String);
        assert!(tables.is_anr("samaccountname"));
        assert!(!tables.is_anr("mail"));
    }

    #[test]
    fn test_overrides_merge_over_builtin() {
        let overrides = AttributeOverrides {
            oids: HashMap::from([("myAttr".to_string(), "1.2.3.4".to_string()), ("cn".to_string(), "9.9".to_string())]),
            formats: HashMap::from([("myAttr".to_string(), AttributeFormat::Integer)]),
            anr: vec!["myAttr".to_string()],
        };
        let tables = AttributeTables::builtin().with_overrides(&overrides);
        assert_eq!(tables.oid("MYATTR"), Some("1.2.3.4"));
        assert_eq!(tables.oid("cn"), Some("9.9"));
        assert_eq!(tables.format("myattr"), AttributeFormat::Integer);
        assert!(tables.is_anr("myattr"));
        assert!(tables.known_attributes().contains(&"myAttr"));
    }

    #[test]
    fn test_format_deserializes_lowercase() {
        let format: AttributeFormat = serde_yaml::from_str("bitmask").unwrap();
        assert_eq!(format, AttributeFormat::Bitmask);
    }

    #[test]
    fn test_numeric_formats() {
        assert!(AttributeFormat::Integer.is_numeric());
        assert!(AttributeFormat::Bitmask.is_numeric());
        assert!(!AttributeFormat::Sid.is_numeric());
        assert!(AttributeFormat::Dn.is_case_insensitive());
        assert!(!AttributeFormat::Binary.is_case_insensitive());
    }
}
