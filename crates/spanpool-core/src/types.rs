//! Data model shared by the pools and the RPC seam.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;

/// Fully qualified database identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DatabaseName {
    pub project: String,
    pub instance: String,
    pub database: String,
}

impl DatabaseName {
    pub fn new(project: &str, instance: &str, database: &str) -> Self {
        Self {
            project: project.to_string(),
            instance: instance.to_string(),
            database: database.to_string(),
        }
    }
}

impl fmt::Display for DatabaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "projects/{}/instances/{}/databases/{}",
            self.project, self.instance, self.database
        )
    }
}

/// Identity of the credentials a client handle authenticates with.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Credential(Arc<str>);

impl Credential {
    pub fn new(id: &str) -> Self {
        Self(Arc::from(id))
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

/// Service endpoint a client handle connects to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A server-side session, identified by its server-assigned name.
///
/// Cloning is cheap; equality and hashing use the name only.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Session {
    name: Arc<str>,
}

impl Session {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Read timestamp bound of a read-only transaction.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TimestampBound {
    Strong,
    ExactStaleness(Duration),
    MaxStaleness(Duration),
    /// Microseconds since the Unix epoch.
    ReadTimestamp(i64),
}

/// Options a transaction is begun with. Implicit (non-transactional) use is
/// expressed as `Option::<TransactionOptions>::None` by callers.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TransactionOptions {
    ReadWrite,
    ReadOnly(TimestampBound),
}

impl TransactionOptions {
    pub fn read_only() -> Self {
        TransactionOptions::ReadOnly(TimestampBound::Strong)
    }

    pub fn mode(&self) -> TransactionMode {
        match self {
            TransactionOptions::ReadWrite => TransactionMode::ReadWrite,
            TransactionOptions::ReadOnly(_) => TransactionMode::ReadOnly,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
}

/// Server-assigned transaction identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TransactionId(pub Bytes);

impl TransactionId {
    pub fn new(id: impl Into<Bytes>) -> Self {
        Self(id.into())
    }
}

/// A begun transaction; valid only while registered with the transaction pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionHandle {
    pub id: TransactionId,
    pub mode: TransactionMode,
    pub options: TransactionOptions,
}

impl TransactionHandle {
    pub fn new(id: TransactionId, options: TransactionOptions) -> Self {
        Self {
            id,
            mode: options.mode(),
            options,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationOp {
    Insert,
    Update,
    InsertOrUpdate,
    Replace,
}

/// A buffered write applied at commit.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    Write {
        op: MutationOp,
        table: String,
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    },
    Delete {
        table: String,
        keys: Vec<Vec<Value>>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitResponse {
    pub commit_timestamp: SystemTime,
}

/// Wire-level value, as carried by streaming result messages.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<Value>),
    Struct(Vec<(String, Value)>),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Struct(_) => "struct",
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeCode {
    Bool,
    Int64,
    Float64,
    Numeric,
    Timestamp,
    Date,
    String,
    Bytes,
    Json,
    Array,
    Struct,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub type_code: TypeCode,
}

impl Field {
    pub fn new(name: &str, type_code: TypeCode) -> Self {
        Self {
            name: name.to_string(),
            type_code,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResultSetMetadata {
    pub fields: Vec<Field>,
    /// Set when the read began a transaction inline.
    pub transaction: Option<TransactionId>,
}

/// One message of a streaming read.
///
/// When `chunked_value` is set, the last element of `values` continues in
/// the first element of the next message.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PartialResultSet {
    pub metadata: Option<ResultSetMetadata>,
    pub values: Vec<Value>,
    pub chunked_value: bool,
    pub resume_token: Option<Bytes>,
}

impl PartialResultSet {
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            values,
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, metadata: ResultSetMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_resume_token(mut self, token: impl Into<Bytes>) -> Self {
        self.resume_token = Some(token.into());
        self
    }

    pub fn chunked(mut self) -> Self {
        self.chunked_value = true;
        self
    }
}

/// A streaming SQL read against one session.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecuteSqlRequest {
    pub session: Session,
    pub sql: String,
    /// `None` runs the statement in a single-use read-only transaction.
    pub transaction: Option<TransactionId>,
    pub resume_token: Option<Bytes>,
}

impl ExecuteSqlRequest {
    pub fn new(session: Session, sql: &str) -> Self {
        Self {
            session,
            sql: sql.to_string(),
            transaction: None,
            resume_token: None,
        }
    }

    pub fn with_transaction(mut self, transaction: TransactionId) -> Self {
        self.transaction = Some(transaction);
        self
    }
}
