use std::{fmt, str::FromStr};

use bincode::{Decode, Encode};

use super::{
    CodecError, MessageId, OpTag, Payload, ResponseKind,
    message::{decode_payload, encode_payload},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum Scope {
    Base,
    OneLevel,
    Subtree,
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "base" => Ok(Scope::Base),
            "one" | "onelevel" => Ok(Scope::OneLevel),
            "sub" | "subtree" => Ok(Scope::Subtree),
            other => Err(format!("unrecognized scope '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum DerefAliases {
    Never,
    InSearching,
    FindingBase,
    Always,
}

#[derive(Clone, PartialEq, Eq, Encode, Decode)]
pub enum Authentication {
    Simple(String),
    Sasl {
        mechanism: String,
        credentials: Option<Vec<u8>>,
    },
}

// Credentials must not leak into request traces.
impl fmt::Debug for Authentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authentication::Simple(_) => f.write_str("Simple(<redacted>)"),
            Authentication::Sasl { mechanism, .. } => f
                .debug_struct("Sasl")
                .field("mechanism", mechanism)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct BindRequest {
    pub version: u8,
    pub name: String,
    pub authentication: Authentication,
}

impl BindRequest {
    pub fn simple(name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            version: 3,
            name: name.into(),
            authentication: Authentication::Simple(password.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct SearchRequest {
    pub base: String,
    pub scope: Scope,
    pub deref: DerefAliases,
    pub size_limit: u32,
    pub time_limit: u32,
    pub types_only: bool,
    /// Filter in its string form; parsing is the server's concern.
    pub filter: String,
    pub attributes: Vec<String>,
}

impl SearchRequest {
    pub fn new(base: impl Into<String>, scope: Scope, filter: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            scope,
            deref: DerefAliases::Never,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            filter: filter.into(),
            attributes: Vec::new(),
        }
    }

    pub fn with_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Attribute {
    pub name: String,
    pub values: Vec<String>,
}

impl Attribute {
    pub fn new<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum ModifyOperation {
    Add,
    Delete,
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Modification {
    pub operation: ModifyOperation,
    pub attribute: Attribute,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ModifyRequest {
    pub dn: String,
    pub changes: Vec<Modification>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct AddRequest {
    pub dn: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ModifyDnRequest {
    pub dn: String,
    pub new_rdn: String,
    pub delete_old_rdn: bool,
    pub new_superior: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct CompareRequest {
    pub dn: String,
    pub attribute: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ExtendedRequest {
    pub name: String,
    pub value: Option<Vec<u8>>,
}

/// Client-to-server operation payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Bind(BindRequest),
    Unbind,
    Search(SearchRequest),
    Modify(ModifyRequest),
    Add(AddRequest),
    Delete { dn: String },
    ModifyDn(ModifyDnRequest),
    Compare(CompareRequest),
    Abandon(MessageId),
    Extended(ExtendedRequest),
}

impl Request {
    /// How the server answers this operation.
    pub fn response_kind(&self) -> ResponseKind {
        match self {
            Request::Bind(_) => ResponseKind::Single(OpTag::BindResponse),
            Request::Unbind | Request::Abandon(_) => ResponseKind::None,
            Request::Search(_) => ResponseKind::Search,
            Request::Modify(_) => ResponseKind::Single(OpTag::ModifyResponse),
            Request::Add(_) => ResponseKind::Single(OpTag::AddResponse),
            Request::Delete { .. } => ResponseKind::Single(OpTag::DelResponse),
            Request::ModifyDn(_) => ResponseKind::Single(OpTag::ModDnResponse),
            Request::Compare(_) => ResponseKind::Single(OpTag::CompareResponse),
            Request::Extended(_) => ResponseKind::Single(OpTag::ExtendedResponse),
        }
    }

    pub fn decode(tag: OpTag, bytes: &[u8]) -> Result<Self, CodecError> {
        let request = match tag {
            OpTag::BindRequest => Request::Bind(decode_payload(bytes)?),
            OpTag::UnbindRequest => {
                decode_payload::<()>(bytes)?;
                Request::Unbind
            }
            OpTag::SearchRequest => Request::Search(decode_payload(bytes)?),
            OpTag::ModifyRequest => Request::Modify(decode_payload(bytes)?),
            OpTag::AddRequest => Request::Add(decode_payload(bytes)?),
            OpTag::DelRequest => Request::Delete {
                dn: decode_payload(bytes)?,
            },
            OpTag::ModDnRequest => Request::ModifyDn(decode_payload(bytes)?),
            OpTag::CompareRequest => Request::Compare(decode_payload(bytes)?),
            OpTag::AbandonRequest => Request::Abandon(decode_payload(bytes)?),
            OpTag::ExtendedRequest => Request::Extended(decode_payload(bytes)?),
            tag => return Err(CodecError::NotARequest { tag }),
        };
        Ok(request)
    }
}

impl Payload for Request {
    fn op_tag(&self) -> OpTag {
        match self {
            Request::Bind(_) => OpTag::BindRequest,
            Request::Unbind => OpTag::UnbindRequest,
            Request::Search(_) => OpTag::SearchRequest,
            Request::Modify(_) => OpTag::ModifyRequest,
            Request::Add(_) => OpTag::AddRequest,
            Request::Delete { .. } => OpTag::DelRequest,
            Request::ModifyDn(_) => OpTag::ModDnRequest,
            Request::Compare(_) => OpTag::CompareRequest,
            Request::Abandon(_) => OpTag::AbandonRequest,
            Request::Extended(_) => OpTag::ExtendedRequest,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        match self {
            Request::Bind(bind) => encode_payload(bind),
            Request::Unbind => encode_payload(&()),
            Request::Search(search) => encode_payload(search),
            Request::Modify(modify) => encode_payload(modify),
            Request::Add(add) => encode_payload(add),
            Request::Delete { dn } => encode_payload(dn),
            Request::ModifyDn(modify_dn) => encode_payload(modify_dn),
            Request::Compare(compare) => encode_payload(compare),
            Request::Abandon(id) => encode_payload(id),
            Request::Extended(extended) => encode_payload(extended),
        }
    }
}
