//! Document Query Engine
//!
//! Mongo-style filters over stored documents:
//!
//! - **AST**: Filter tree, predicates and the query builder
//! - **Parser**: JSON filter document into AST, validated once per query
//! - **Executor**: Lazy scan of the backing store in key order
//!
//! # Filter Language
//!
//! ```text
//! {"age": 30}                                   equality
//! {"age": {"$gt": 30}}                          $eq $ne $gt $gte $lt $lte
//! {"room": {"$in": ["hall", "kitchen"]}}        set membership
//! {"battery": {"$exists": false}}               presence
//! {"name": {"$contains": "temp"}}               substring / list element
//! {"location.room": "hall"}                     nested paths
//! {"tags": "alarm"}                             membership in `_tags`
//! {"$limit": 10}                                result cap
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use ttlkv::query::{parse_filter, Query};
//!
//! let query = parse_filter(&json!({"age": {"$gt": 30}, "$limit": 2}), 1000)?;
//!
//! let query = Query::builder().gt("age", 30.0).limit(2).build();
//! ```

mod ast;
mod error;
mod executor;
mod parser;

pub use ast::{
    values_equal, FieldPath, Filter, Operator, Predicate, Query, QueryBuilder, TAGS_ALIAS,
    TAGS_FIELD,
};
pub use error::{QueryError, QueryResult};
pub use executor::{QueryExecutor, QueryOutput};
pub use parser::{parse_filter, LIMIT_KEY};
