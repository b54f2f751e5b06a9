//! Filter Abstract Syntax Tree
//!
//! A Mongo-style filter document is parsed once into a [`Query`]: a
//! conjunction of per-field predicates plus an optional result limit.
//!
//! # Example Filters
//!
//! ```text
//! {"age": 30}
//! {"age": {"$gt": 18, "$lte": 65}}
//! {"location.room": {"$in": ["kitchen", "hall"]}, "$limit": 10}
//! {"tags": "alarm"}
//! ```

use serde_json::Value;

/// Name of the reserved field holding a record's tags
pub const TAGS_FIELD: &str = "_tags";

/// Filter field name that is matched against [`TAGS_FIELD`] by membership
pub const TAGS_ALIAS: &str = "tags";

/// A parsed query ready for evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub filter: Filter,
    /// Maximum number of results, already capped
    pub limit: Option<usize>,
}

impl Query {
    /// Query matching every document
    pub fn all() -> Self {
        Self {
            filter: Filter::And(Vec::new()),
            limit: None,
        }
    }

    /// Start building a query programmatically
    pub fn builder() -> QueryBuilder {
        QueryBuilder::new()
    }

    pub fn matches(&self, doc: &Value) -> bool {
        self.filter.matches(doc)
    }
}

/// Dot-separated path into nested objects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn parse(path: &str) -> Self {
        Self(path.split('.').map(str::to_string).collect())
    }

    /// Look the path up; any missing or non-object step means "absent"
    pub fn resolve<'a>(&self, doc: &'a Value) -> Option<&'a Value> {
        self.0
            .iter()
            .try_fold(doc, |current, segment| current.as_object()?.get(segment))
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// Filter operators accepted inside an operator object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Exists,
    Contains,
}

impl Operator {
    /// Parse from the `$`-prefixed spelling
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "$eq" => Some(Self::Eq),
            "$ne" => Some(Self::Ne),
            "$gt" => Some(Self::Gt),
            "$gte" => Some(Self::Gte),
            "$lt" => Some(Self::Lt),
            "$lte" => Some(Self::Lte),
            "$in" => Some(Self::In),
            "$exists" => Some(Self::Exists),
            "$contains" => Some(Self::Contains),
            _ => None,
        }
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Eq => "$eq",
            Self::Ne => "$ne",
            Self::Gt => "$gt",
            Self::Gte => "$gte",
            Self::Lt => "$lt",
            Self::Lte => "$lte",
            Self::In => "$in",
            Self::Exists => "$exists",
            Self::Contains => "$contains",
        };
        write!(f, "{}", s)
    }
}

/// A single test applied to one field value
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(Value),
    Ne(Value),
    Gt(f64),
    Gte(f64),
    Lt(f64),
    Lte(f64),
    In(Vec<Value>),
    Exists(bool),
    Contains(Value),
}

impl Predicate {
    /// Evaluate against a field value (`None` when the field is absent)
    pub fn matches(&self, value: Option<&Value>) -> bool {
        match self {
            Self::Eq(expected) => value.map_or(false, |v| values_equal(v, expected)),
            Self::Ne(expected) => value.map_or(true, |v| !values_equal(v, expected)),
            Self::Gt(n) => compare_numeric(value, |v| v > *n),
            Self::Gte(n) => compare_numeric(value, |v| v >= *n),
            Self::Lt(n) => compare_numeric(value, |v| v < *n),
            Self::Lte(n) => compare_numeric(value, |v| v <= *n),
            Self::In(options) => {
                value.map_or(false, |v| options.iter().any(|o| values_equal(v, o)))
            }
            Self::Exists(expected) => value.is_some() == *expected,
            Self::Contains(needle) => match (value, needle) {
                (Some(Value::String(haystack)), Value::String(needle)) => {
                    haystack.contains(needle.as_str())
                }
                (Some(Value::Array(items)), needle) => {
                    items.iter().any(|item| values_equal(item, needle))
                }
                _ => false,
            },
        }
    }

    /// Evaluate against a record's tag list by membership
    pub fn matches_tags(&self, tags: Option<&[Value]>) -> bool {
        let tags = tags.unwrap_or(&[]);
        let has = |tag: &Value| tags.iter().any(|t| values_equal(t, tag));
        let has_all = |wanted: &Value| match wanted {
            Value::Array(items) => items.iter().all(|item| has(item)),
            other => has(other),
        };

        match self {
            Self::Eq(wanted) | Self::Contains(wanted) => has_all(wanted),
            Self::Ne(unwanted) => !has_all(unwanted),
            Self::In(options) => options.iter().any(|o| has(o)),
            Self::Exists(expected) => !tags.is_empty() == *expected,
            Self::Gt(_) | Self::Gte(_) | Self::Lt(_) | Self::Lte(_) => false,
        }
    }
}

/// A node of the filter tree
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Predicate on the value found at a path
    Field { path: FieldPath, predicate: Predicate },
    /// Predicate on the record's tag list
    Tags(Predicate),
    /// Every child must match; empty matches everything
    And(Vec<Filter>),
}

impl Filter {
    pub fn field(path: &str, predicate: Predicate) -> Self {
        if path == TAGS_ALIAS {
            Filter::Tags(predicate)
        } else {
            Filter::Field {
                path: FieldPath::parse(path),
                predicate,
            }
        }
    }

    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Filter::Field { path, predicate } => predicate.matches(path.resolve(doc)),
            Filter::Tags(predicate) => {
                let tags = doc
                    .get(TAGS_FIELD)
                    .and_then(Value::as_array)
                    .map(Vec::as_slice);
                predicate.matches_tags(tags)
            }
            Filter::And(children) => children.iter().all(|child| child.matches(doc)),
        }
    }
}

/// Equality that treats `1` and `1.0` as the same number
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                x == y
            } else if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
                x == y
            } else {
                x.as_f64() == y.as_f64()
            }
        }
        _ => a == b,
    }
}

/// Non-numeric and absent values never match a comparison
fn compare_numeric(value: Option<&Value>, holds: impl Fn(f64) -> bool) -> bool {
    value.and_then(Value::as_f64).map_or(false, holds)
}

/// Builder for constructing queries programmatically
#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    filters: Vec<Filter>,
    limit: Option<usize>,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a predicate on a field path
    pub fn filter(mut self, path: &str, predicate: Predicate) -> Self {
        self.filters.push(Filter::field(path, predicate));
        self
    }

    pub fn eq(self, path: &str, value: impl Into<Value>) -> Self {
        self.filter(path, Predicate::Eq(value.into()))
    }

    pub fn gt(self, path: &str, value: f64) -> Self {
        self.filter(path, Predicate::Gt(value))
    }

    pub fn lt(self, path: &str, value: f64) -> Self {
        self.filter(path, Predicate::Lt(value))
    }

    pub fn exists(self, path: &str, expected: bool) -> Self {
        self.filter(path, Predicate::Exists(expected))
    }

    /// Require a tag on the record
    pub fn tag(self, tag: impl Into<String>) -> Self {
        self.filter(TAGS_ALIAS, Predicate::Contains(Value::String(tag.into())))
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn build(self) -> Query {
        Query {
            filter: Filter::And(self.filters),
            limit: self.limit,
        }
    }
}
