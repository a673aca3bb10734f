use bincode::{Decode, Encode};

use super::{
    Attribute, CodecError, OpTag, Payload,
    message::{decode_payload, encode_payload},
};

/// Notice of Disconnection, sent unsolicited before a server drops a client.
pub const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";

/// Protocol-level result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub struct ResultCode(pub u32);

impl ResultCode {
    pub const SUCCESS: ResultCode = ResultCode(0);
    pub const OPERATIONS_ERROR: ResultCode = ResultCode(1);
    pub const PROTOCOL_ERROR: ResultCode = ResultCode(2);
    pub const TIME_LIMIT_EXCEEDED: ResultCode = ResultCode(3);
    pub const SIZE_LIMIT_EXCEEDED: ResultCode = ResultCode(4);
    pub const COMPARE_FALSE: ResultCode = ResultCode(5);
    pub const COMPARE_TRUE: ResultCode = ResultCode(6);
    pub const REFERRAL: ResultCode = ResultCode(10);
    pub const NO_SUCH_OBJECT: ResultCode = ResultCode(32);
    pub const INVALID_CREDENTIALS: ResultCode = ResultCode(49);
    pub const BUSY: ResultCode = ResultCode(51);
    pub const UNAVAILABLE: ResultCode = ResultCode(52);
    pub const OTHER: ResultCode = ResultCode(80);
}

/// What a consumer should do with a completed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome<'a> {
    Success,
    Referral(&'a [String]),
    Failure(ResultCode),
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct LdapResult {
    pub code: ResultCode,
    pub matched_dn: String,
    pub diagnostic: String,
    pub referrals: Vec<String>,
}

impl LdapResult {
    pub fn new(code: ResultCode) -> Self {
        Self {
            code,
            matched_dn: String::new(),
            diagnostic: String::new(),
            referrals: Vec::new(),
        }
    }

    pub fn success() -> Self {
        Self::new(ResultCode::SUCCESS)
    }

    pub fn with_diagnostic(mut self, diagnostic: impl Into<String>) -> Self {
        self.diagnostic = diagnostic.into();
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self.code,
            ResultCode::SUCCESS | ResultCode::COMPARE_TRUE | ResultCode::COMPARE_FALSE
        )
    }

    pub fn outcome(&self) -> Outcome<'_> {
        if self.is_success() {
            Outcome::Success
        } else if self.code == ResultCode::REFERRAL {
            Outcome::Referral(&self.referrals)
        } else {
            Outcome::Failure(self.code)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct BindResponse {
    pub result: LdapResult,
    pub server_credentials: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ExtendedResponse {
    pub result: LdapResult,
    pub name: Option<String>,
    pub value: Option<Vec<u8>>,
}

impl ExtendedResponse {
    pub fn is_notice_of_disconnection(&self) -> bool {
        self.name.as_deref() == Some(NOTICE_OF_DISCONNECTION_OID)
    }
}

/// A single search result entry.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct SearchEntry {
    pub dn: String,
    pub attributes: Vec<Attribute>,
}

impl SearchEntry {
    pub fn new(dn: impl Into<String>, attributes: Vec<Attribute>) -> Self {
        Self {
            dn: dn.into(),
            attributes,
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes
            .iter()
            .find(|attribute| attribute.name.eq_ignore_ascii_case(name))
    }

    /// Folds `other` into this entry, keeping every distinct value once.
    pub fn merge(&mut self, other: SearchEntry) {
        for incoming in other.attributes {
            match self
                .attributes
                .iter_mut()
                .find(|attribute| attribute.name.eq_ignore_ascii_case(&incoming.name))
            {
                Some(existing) => {
                    for value in incoming.values {
                        if !existing.values.contains(&value) {
                            existing.values.push(value);
                        }
                    }
                }
                None => self.attributes.push(incoming),
            }
        }
    }
}

/// Server-to-client operation payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Bind(BindResponse),
    SearchEntry(SearchEntry),
    SearchReference(Vec<String>),
    SearchDone(LdapResult),
    Modify(LdapResult),
    Add(LdapResult),
    Delete(LdapResult),
    ModifyDn(LdapResult),
    Compare(LdapResult),
    Extended(ExtendedResponse),
}

impl Response {
    /// Protocol-level status, for the responses that carry one.
    pub fn result(&self) -> Option<&LdapResult> {
        match self {
            Response::Bind(bind) => Some(&bind.result),
            Response::SearchEntry(_) | Response::SearchReference(_) => None,
            Response::SearchDone(result)
            | Response::Modify(result)
            | Response::Add(result)
            | Response::Delete(result)
            | Response::ModifyDn(result)
            | Response::Compare(result) => Some(result),
            Response::Extended(extended) => Some(&extended.result),
        }
    }

    pub fn decode(tag: OpTag, bytes: &[u8], kind: ResponseKind) -> Result<Self, CodecError> {
        if !kind.accepts(tag) {
            return Err(CodecError::UnexpectedResponse {
                tag,
                expected: kind,
            });
        }
        let response = match tag {
            OpTag::BindResponse => Response::Bind(decode_payload(bytes)?),
            OpTag::SearchResultEntry => Response::SearchEntry(decode_payload(bytes)?),
            OpTag::SearchResultReference => Response::SearchReference(decode_payload(bytes)?),
            OpTag::SearchResultDone => Response::SearchDone(decode_payload(bytes)?),
            OpTag::ModifyResponse => Response::Modify(decode_payload(bytes)?),
            OpTag::AddResponse => Response::Add(decode_payload(bytes)?),
            OpTag::DelResponse => Response::Delete(decode_payload(bytes)?),
            OpTag::ModDnResponse => Response::ModifyDn(decode_payload(bytes)?),
            OpTag::CompareResponse => Response::Compare(decode_payload(bytes)?),
            OpTag::ExtendedResponse => Response::Extended(decode_payload(bytes)?),
            tag => {
                return Err(CodecError::UnexpectedResponse {
                    tag,
                    expected: kind,
                });
            }
        };
        Ok(response)
    }
}

impl Payload for Response {
    fn op_tag(&self) -> OpTag {
        match self {
            Response::Bind(_) => OpTag::BindResponse,
            Response::SearchEntry(_) => OpTag::SearchResultEntry,
            Response::SearchReference(_) => OpTag::SearchResultReference,
            Response::SearchDone(_) => OpTag::SearchResultDone,
            Response::Modify(_) => OpTag::ModifyResponse,
            Response::Add(_) => OpTag::AddResponse,
            Response::Delete(_) => OpTag::DelResponse,
            Response::ModifyDn(_) => OpTag::ModDnResponse,
            Response::Compare(_) => OpTag::CompareResponse,
            Response::Extended(_) => OpTag::ExtendedResponse,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        match self {
            Response::Bind(bind) => encode_payload(bind),
            Response::SearchEntry(entry) => encode_payload(entry),
            Response::SearchReference(urls) => encode_payload(urls),
            Response::SearchDone(result)
            | Response::Modify(result)
            | Response::Add(result)
            | Response::Delete(result)
            | Response::ModifyDn(result)
            | Response::Compare(result) => encode_payload(result),
            Response::Extended(extended) => encode_payload(extended),
        }
    }
}

/// The set of responses an outstanding exchange can receive.
///
/// Recorded in the correlation table when a request is registered and used
/// to pick the payload decoder for every inbound message with that id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Nothing comes back (abandon, unbind).
    None,
    /// Exactly one response with the given tag.
    Single(OpTag),
    /// Entries and references, then a done marker.
    Search,
    /// Unsolicited extended responses on id 0.
    Notification,
}

impl ResponseKind {
    pub fn accepts(self, tag: OpTag) -> bool {
        match self {
            ResponseKind::None => false,
            ResponseKind::Single(expected) => tag == expected,
            ResponseKind::Search => matches!(
                tag,
                OpTag::SearchResultEntry | OpTag::SearchResultReference | OpTag::SearchResultDone
            ),
            ResponseKind::Notification => tag == OpTag::ExtendedResponse,
        }
    }

    /// Whether `tag` ends the exchange.
    pub fn is_terminal(self, tag: OpTag) -> bool {
        match self {
            ResponseKind::None => true,
            ResponseKind::Single(_) => true,
            ResponseKind::Search => tag == OpTag::SearchResultDone,
            ResponseKind::Notification => false,
        }
    }
}
