use bincode::{Decode, Encode};

use super::{
    CodecError,
    message::{decode_payload, encode_payload},
};

/// Persistent search request control.
pub const PERSISTENT_SEARCH_OID: &str = "2.16.840.1.113730.3.4.3";

/// Entry change notification response control.
pub const ENTRY_CHANGE_OID: &str = "2.16.840.1.113730.3.4.7";

/// Optional protocol extension attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Control {
    pub oid: String,
    pub critical: bool,
    pub value: Option<Vec<u8>>,
}

impl Control {
    pub fn new(oid: impl Into<String>) -> Self {
        Self {
            oid: oid.into(),
            critical: false,
            value: None,
        }
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn with_value(mut self, value: Vec<u8>) -> Self {
        self.value = Some(value);
        self
    }

    /// Builds a critical persistent search control.
    pub fn persistent_search(
        changes: ChangeTypes,
        changes_only: bool,
        return_changes: bool,
    ) -> Result<Self, CodecError> {
        let value = encode_payload(&PersistentSearch {
            changes: changes.0,
            changes_only,
            return_changes,
        })?;
        Ok(Self::new(PERSISTENT_SEARCH_OID).critical().with_value(value))
    }
}

#[derive(Debug, Encode, Decode)]
struct PersistentSearch {
    changes: u32,
    changes_only: bool,
    return_changes: bool,
}

/// Change types a persistent search reports, as a bit mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeTypes(pub u32);

impl ChangeTypes {
    pub const ADD: ChangeTypes = ChangeTypes(1);
    pub const DELETE: ChangeTypes = ChangeTypes(2);
    pub const MODIFY: ChangeTypes = ChangeTypes(4);
    pub const MODIFY_DN: ChangeTypes = ChangeTypes(8);
    pub const ALL: ChangeTypes = ChangeTypes(15);

    pub const fn contains(self, other: ChangeTypes) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Decoded entry change notification.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct EntryChange {
    pub change: u32,
    pub previous_dn: Option<String>,
    pub change_number: Option<u64>,
}

impl EntryChange {
    /// Finds and decodes the entry change control among `controls`.
    pub fn find(controls: &[Control]) -> Result<Option<Self>, CodecError> {
        controls
            .iter()
            .find(|control| control.oid == ENTRY_CHANGE_OID)
            .and_then(|control| control.value.as_deref())
            .map(decode_payload::<Self>)
            .transpose()
    }

    pub fn to_control(&self) -> Result<Control, CodecError> {
        Ok(Control::new(ENTRY_CHANGE_OID).with_value(encode_payload(self)?))
    }

    pub fn change_types(&self) -> ChangeTypes {
        ChangeTypes(self.change)
    }
}
