//! Statements submitted to the manager.

use sqltx_types::SqlValue;

/// One parameterized statement of a transaction.
///
/// Operations run strictly in the order given. `priority` is carried for
/// callers that schedule work across transactions; the manager never
/// reorders operations within one.
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseOperation {
    /// SQL text with positional placeholders.
    pub query: String,
    /// Bound parameters.
    pub params: Vec<SqlValue>,
    /// Whether a transient failure of this statement may retry the
    /// transaction.
    pub retryable: bool,
    /// Caller-defined priority.
    pub priority: i32,
}

impl DatabaseOperation {
    /// A retryable operation without parameters.
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            params: Vec::new(),
            retryable: true,
            priority: 0,
        }
    }

    /// Append one parameter.
    #[must_use]
    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.params.push(value.into());
        self
    }

    /// Replace all parameters.
    #[must_use]
    pub fn params<I, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<SqlValue>,
    {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }

    /// Set whether transient failures may be retried.
    #[must_use]
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Set the priority.
    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl From<&str> for DatabaseOperation {
    fn from(query: &str) -> Self {
        Self::new(query)
    }
}
