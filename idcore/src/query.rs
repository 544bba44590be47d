//! Read side: filtered, paginated searches over projection tables.
//!
//! Backends implement [`ProjectionReader`]. [`Queries`] wraps a reader and
//! the handler state store so that every response carries the projection's
//! watermark, letting callers detect that a just-performed write is not yet
//! visible.

use crate::errors::{QueryError, QueryResult};
use crate::handler::HandlerStateStore;
use crate::projection::ColumnValue;
use crate::types::Sequence;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use tracing::instrument;

/// One projection row as JSON, keyed by column name.
pub type Row = Map<String, Value>;

/// How a text column is compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextComparison {
    /// Exact match.
    Equals,
    /// Case-insensitive match.
    EqualsIgnoreCase,
    /// Not equal.
    NotEquals,
    /// Prefix match.
    StartsWith,
    /// Case-insensitive prefix match.
    StartsWithIgnoreCase,
    /// Suffix match.
    EndsWith,
    /// Case-insensitive suffix match.
    EndsWithIgnoreCase,
    /// Substring match.
    Contains,
    /// Case-insensitive substring match.
    ContainsIgnoreCase,
}

impl TextComparison {
    /// Whether the comparison ignores case.
    pub const fn ignores_case(self) -> bool {
        matches!(
            self,
            Self::EqualsIgnoreCase
                | Self::StartsWithIgnoreCase
                | Self::EndsWithIgnoreCase
                | Self::ContainsIgnoreCase
        )
    }

    fn matches(self, candidate: &str, value: &str) -> bool {
        let (candidate, value) = if self.ignores_case() {
            (candidate.to_lowercase(), value.to_lowercase())
        } else {
            (candidate.to_string(), value.to_string())
        };
        match self {
            Self::Equals | Self::EqualsIgnoreCase => candidate == value,
            Self::NotEquals => candidate != value,
            Self::StartsWith | Self::StartsWithIgnoreCase => candidate.starts_with(&value),
            Self::EndsWith | Self::EndsWithIgnoreCase => candidate.ends_with(&value),
            Self::Contains | Self::ContainsIgnoreCase => candidate.contains(&value),
        }
    }
}

/// How a numeric column is compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumberComparison {
    /// `=`
    Equals,
    /// `<>`
    NotEquals,
    /// `<`
    Less,
    /// `<=`
    LessOrEquals,
    /// `>`
    Greater,
    /// `>=`
    GreaterOrEquals,
}

impl NumberComparison {
    /// SQL operator.
    pub const fn operator(self) -> &'static str {
        match self {
            Self::Equals => "=",
            Self::NotEquals => "<>",
            Self::Less => "<",
            Self::LessOrEquals => "<=",
            Self::Greater => ">",
            Self::GreaterOrEquals => ">=",
        }
    }

    fn matches(self, candidate: i64, value: i64) -> bool {
        match self {
            Self::Equals => candidate == value,
            Self::NotEquals => candidate != value,
            Self::Less => candidate < value,
            Self::LessOrEquals => candidate <= value,
            Self::Greater => candidate > value,
            Self::GreaterOrEquals => candidate >= value,
        }
    }
}

/// A filter over projection rows.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchQuery {
    /// Text comparison.
    Text {
        /// Column name.
        column: String,
        /// Value compared against.
        value: String,
        /// Comparison method.
        comparison: TextComparison,
    },
    /// Integer comparison.
    Number {
        /// Column name.
        column: String,
        /// Value compared against.
        value: i64,
        /// Comparison method.
        comparison: NumberComparison,
    },
    /// Boolean equality.
    Bool {
        /// Column name.
        column: String,
        /// Required value.
        value: bool,
    },
    /// Column equals any of the values.
    List {
        /// Column name.
        column: String,
        /// Accepted values.
        values: Vec<ColumnValue>,
    },
    /// At least one sub-query matches.
    Or(Vec<SearchQuery>),
    /// Every sub-query matches.
    And(Vec<SearchQuery>),
}

impl SearchQuery {
    /// Text comparison.
    pub fn text(column: impl Into<String>, value: impl Into<String>, comparison: TextComparison) -> Self {
        Self::Text {
            column: column.into(),
            value: value.into(),
            comparison,
        }
    }

    /// Integer comparison.
    pub fn number(column: impl Into<String>, value: i64, comparison: NumberComparison) -> Self {
        Self::Number {
            column: column.into(),
            value,
            comparison,
        }
    }

    /// Boolean equality.
    pub fn boolean(column: impl Into<String>, value: bool) -> Self {
        Self::Bool {
            column: column.into(),
            value,
        }
    }

    /// Membership.
    pub fn list(column: impl Into<String>, values: Vec<ColumnValue>) -> Self {
        Self::List {
            column: column.into(),
            values,
        }
    }

    /// Whether `row` satisfies the query. Missing columns never match.
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Self::Text {
                column,
                value,
                comparison,
            } => row
                .get(column)
                .and_then(Value::as_str)
                .is_some_and(|candidate| comparison.matches(candidate, value)),
            Self::Number {
                column,
                value,
                comparison,
            } => row
                .get(column)
                .and_then(Value::as_i64)
                .is_some_and(|candidate| comparison.matches(candidate, *value)),
            Self::Bool { column, value } => row
                .get(column)
                .and_then(Value::as_bool)
                .is_some_and(|candidate| candidate == *value),
            Self::List { column, values } => row
                .get(column)
                .is_some_and(|candidate| values.iter().any(|value| &value.to_json() == candidate)),
            Self::Or(queries) => queries.iter().any(|query| query.matches(row)),
            Self::And(queries) => queries.iter().all(|query| query.matches(row)),
        }
    }

    /// Columns referenced by the query.
    pub fn columns(&self) -> Vec<&str> {
        match self {
            Self::Text { column, .. }
            | Self::Number { column, .. }
            | Self::Bool { column, .. }
            | Self::List { column, .. } => vec![column.as_str()],
            Self::Or(queries) | Self::And(queries) => {
                queries.iter().flat_map(Self::columns).collect()
            }
        }
    }
}

/// Pagination and ordering of a search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Rows to skip.
    pub offset: u64,
    /// Maximum rows to return; zero means unlimited.
    pub limit: u64,
    /// Column to order by; unordered if absent.
    pub sort_column: Option<String>,
    /// Ascending order.
    pub asc: bool,
}

impl SearchRequest {
    /// First `limit` rows in ascending order of `sort_column`.
    pub fn sorted_by(sort_column: impl Into<String>, limit: u64) -> Self {
        Self {
            offset: 0,
            limit,
            sort_column: Some(sort_column.into()),
            asc: true,
        }
    }

    /// Orders, skips and truncates `rows` in place.
    pub fn apply(&self, rows: &mut Vec<Row>) {
        if let Some(column) = &self.sort_column {
            rows.sort_by(|a, b| {
                let ordering = compare_json(a.get(column), b.get(column));
                if self.asc {
                    ordering
                } else {
                    ordering.reverse()
                }
            });
        }
        let offset = usize::try_from(self.offset).unwrap_or(usize::MAX).min(rows.len());
        let _ = rows.drain(..offset);
        if self.limit > 0 {
            rows.truncate(usize::try_from(self.limit).unwrap_or(usize::MAX));
        }
    }
}

/// Orders JSON scalars: absent and null first, then booleans, numbers and
/// strings in their natural order.
pub fn compare_json(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(value: Option<&Value>) -> u8 {
        match value {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(_) => 4,
        }
    }

    match (a, b) {
        (Some(Value::Bool(a)), Some(Value::Bool(b))) => a.cmp(b),
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Rows of one search together with the total count before pagination.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchResult {
    /// Matching rows ignoring offset and limit.
    pub count: u64,
    /// The requested page.
    pub rows: Vec<Row>,
}

/// Typed search response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResponse<T> {
    /// Matching rows ignoring offset and limit.
    pub count: u64,
    /// Watermark of the projection that answered the query.
    pub latest_sequence: Sequence,
    /// The requested page.
    pub items: Vec<T>,
}

/// Reads projection tables.
#[async_trait]
pub trait ProjectionReader: Send + Sync {
    /// Runs a filtered, paginated search over `table`. All queries must match.
    async fn search(
        &self,
        table: &str,
        request: &SearchRequest,
        queries: &[SearchQuery],
    ) -> QueryResult<SearchResult>;
}

#[async_trait]
impl<T: ProjectionReader + ?Sized> ProjectionReader for std::sync::Arc<T> {
    async fn search(
        &self,
        table: &str,
        request: &SearchRequest,
        queries: &[SearchQuery],
    ) -> QueryResult<SearchResult> {
        (**self).search(table, request, queries).await
    }
}

/// Query facade over a projection reader.
#[derive(Debug, Clone)]
pub struct Queries<R, S> {
    reader: R,
    state: S,
}

impl<R, S> Queries<R, S>
where
    R: ProjectionReader,
    S: HandlerStateStore,
{
    /// Creates a facade.
    pub const fn new(reader: R, state: S) -> Self {
        Self { reader, state }
    }

    /// The underlying reader.
    pub const fn reader(&self) -> &R {
        &self.reader
    }

    /// Watermark of `projection`.
    pub async fn latest_sequence(&self, projection: &str) -> QueryResult<Sequence> {
        self.state
            .current_sequence(projection)
            .await
            .map_err(|error| QueryError::Internal(error.to_string()))
    }

    /// Searches `table`, deserializing each row into `T`.
    #[instrument(name = "queries.search", skip(self, request, queries))]
    pub async fn search<T: DeserializeOwned>(
        &self,
        projection: &str,
        table: &str,
        request: &SearchRequest,
        queries: &[SearchQuery],
    ) -> QueryResult<SearchResponse<T>> {
        let latest_sequence = self.latest_sequence(projection).await?;
        let result = self.reader.search(table, request, queries).await?;
        let items = result
            .rows
            .into_iter()
            .map(|row| {
                serde_json::from_value(Value::Object(row))
                    .map_err(|error| QueryError::Internal(format!("row mapping failed: {error}")))
            })
            .collect::<QueryResult<Vec<T>>>()?;

        Ok(SearchResponse {
            count: result.count,
            latest_sequence,
            items,
        })
    }

    /// Returns the single row matching `queries`.
    ///
    /// # Errors
    ///
    /// [`QueryError::NotFound`] if no row matches.
    pub async fn single<T: DeserializeOwned>(
        &self,
        projection: &str,
        table: &str,
        queries: &[SearchQuery],
    ) -> QueryResult<(T, Sequence)> {
        let request = SearchRequest {
            limit: 1,
            ..SearchRequest::default()
        };
        let mut response = self.search::<T>(projection, table, &request, queries).await?;
        if response.items.is_empty() {
            return Err(QueryError::NotFound(format!("no row in {table}")));
        }
        Ok((response.items.swap_remove(0), response.latest_sequence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => panic!("row must be an object"),
        }
    }

    #[test]
    fn text_comparisons() {
        let row = row(json!({"username": "Gigi.Giraffe"}));

        assert!(SearchQuery::text("username", "Gigi.Giraffe", TextComparison::Equals).matches(&row));
        assert!(!SearchQuery::text("username", "gigi.giraffe", TextComparison::Equals).matches(&row));
        assert!(SearchQuery::text("username", "gigi.giraffe", TextComparison::EqualsIgnoreCase).matches(&row));
        assert!(SearchQuery::text("username", "gigi", TextComparison::StartsWithIgnoreCase).matches(&row));
        assert!(SearchQuery::text("username", "Giraffe", TextComparison::EndsWith).matches(&row));
        assert!(SearchQuery::text("username", ".gir", TextComparison::ContainsIgnoreCase).matches(&row));
        assert!(!SearchQuery::text("email", "x", TextComparison::NotEquals).matches(&row));
    }

    #[test]
    fn or_and_and_combine_subqueries() {
        let row = row(json!({"state": 1, "is_email_verified": true}));
        let active = SearchQuery::number("state", 1, NumberComparison::Equals);
        let locked = SearchQuery::number("state", 3, NumberComparison::Equals);
        let verified = SearchQuery::boolean("is_email_verified", true);

        assert!(SearchQuery::Or(vec![locked.clone(), active.clone()]).matches(&row));
        assert!(!SearchQuery::And(vec![locked, verified.clone()]).matches(&row));
        assert!(SearchQuery::And(vec![active, verified]).matches(&row));
        assert!(!SearchQuery::Or(vec![]).matches(&row));
    }

    #[test]
    fn list_matches_any_value() {
        let row = row(json!({"resource_owner": "org2"}));
        let query = SearchQuery::list(
            "resource_owner",
            vec![ColumnValue::from("org1"), ColumnValue::from("org2")],
        );

        assert!(query.matches(&row));
    }

    #[test]
    fn request_sorts_pages_and_limits() {
        let mut rows = vec![
            row(json!({"username": "c"})),
            row(json!({"username": "a"})),
            row(json!({"username": "b"})),
            row(json!({"username": null})),
        ];
        let request = SearchRequest {
            offset: 1,
            limit: 2,
            sort_column: Some("username".to_string()),
            asc: true,
        };

        request.apply(&mut rows);

        let names: Vec<_> = rows.iter().map(|row| row["username"].clone()).collect();
        assert_eq!(names, [json!("a"), json!("b")]);
    }

    #[test]
    fn descending_order_reverses() {
        let mut rows = vec![row(json!({"sequence": 2})), row(json!({"sequence": 10}))];
        let request = SearchRequest {
            sort_column: Some("sequence".to_string()),
            asc: false,
            ..SearchRequest::default()
        };

        request.apply(&mut rows);

        assert_eq!(rows[0]["sequence"], json!(10));
    }
}
