//! Statements produced by reducers.
//!
//! A [`Statement`] is the result of reducing one event: a description of the
//! relational change, not the change itself. Backends apply statements through
//! [`StatementExecutor`](super::StatementExecutor) with row-level idempotency:
//!
//! - `Create` inserts only if no row with the same key exists
//! - `Upsert` and `Update` only touch rows whose `sequence` is lower than the
//!   statement's sequence, so replays of already applied events are no-ops
//! - `Delete` is idempotent by nature

use crate::event::Event;
use crate::types::{AggregateId, AggregateType, Sequence};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

/// Standard column holding the aggregate id.
pub const AGGREGATE_ID: &str = "aggregate_id";
/// Standard column holding the first event's creation date.
pub const CREATION_DATE: &str = "creation_date";
/// Standard column holding the last applied event's creation date.
pub const CHANGE_DATE: &str = "change_date";
/// Standard column holding the last applied event's sequence.
pub const SEQUENCE: &str = "sequence";
/// Standard column holding the owning organisation.
pub const RESOURCE_OWNER: &str = "resource_owner";

/// A typed column value.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    /// SQL NULL.
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit integer.
    Int(i64),
    /// Double precision float.
    Float(f64),
    /// Text.
    Text(String),
    /// Timestamp with time zone.
    Timestamp(DateTime<Utc>),
    /// JSON document.
    Json(Value),
    /// Text array.
    TextArray(Vec<String>),
}

impl ColumnValue {
    /// JSON representation, used by in-memory rows and search results.
    ///
    /// Timestamps become RFC 3339 strings with microsecond precision.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(value) => Value::Bool(*value),
            Self::Int(value) => Value::from(*value),
            Self::Float(value) => Value::from(*value),
            Self::Text(value) => Value::String(value.clone()),
            Self::Timestamp(value) => {
                Value::String(value.to_rfc3339_opts(SecondsFormat::Micros, true))
            }
            Self::Json(value) => value.clone(),
            Self::TextArray(values) => Value::from(values.clone()),
        }
    }
}

impl From<bool> for ColumnValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ColumnValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for ColumnValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for ColumnValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<String> for ColumnValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for ColumnValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<DateTime<Utc>> for ColumnValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl From<Value> for ColumnValue {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<Vec<String>> for ColumnValue {
    fn from(values: Vec<String>) -> Self {
        Self::TextArray(values)
    }
}

impl From<Sequence> for ColumnValue {
    fn from(sequence: Sequence) -> Self {
        Self::Int(sequence.as_i64())
    }
}

impl<T: Into<Self>> From<Option<T>> for ColumnValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// A named column value.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Value to write.
    pub value: ColumnValue,
}

impl Column {
    /// Creates a column.
    pub fn new(name: impl Into<String>, value: impl Into<ColumnValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Equality filter on one column.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    /// Column name.
    pub column: String,
    /// Required value.
    pub value: ColumnValue,
}

impl Condition {
    /// `column = value`.
    pub fn eq(column: impl Into<String>, value: impl Into<ColumnValue>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    /// `aggregate_id = id`.
    pub fn aggregate_id(id: &AggregateId) -> Self {
        Self::eq(AGGREGATE_ID, id.as_ref())
    }
}

/// The relational change described by a statement.
#[derive(Debug, Clone, PartialEq)]
pub enum StatementKind {
    /// Insert a row unless one with the same key exists.
    Create {
        /// Target table.
        table: String,
        /// Columns identifying the row.
        key_columns: Vec<String>,
        /// Columns to insert.
        columns: Vec<Column>,
    },
    /// Insert a row, or update it if it exists and is older.
    Upsert {
        /// Target table.
        table: String,
        /// Columns identifying the row.
        key_columns: Vec<String>,
        /// Columns to insert or update.
        columns: Vec<Column>,
    },
    /// Update matching rows that are older than the statement.
    Update {
        /// Target table.
        table: String,
        /// Columns to set.
        values: Vec<Column>,
        /// Row filter.
        conditions: Vec<Condition>,
    },
    /// Delete matching rows.
    Delete {
        /// Target table.
        table: String,
        /// Row filter.
        conditions: Vec<Condition>,
    },
    /// Nothing to do; the watermark still advances.
    NoOp,
    /// Several changes applied in order within one transaction.
    Multi(Vec<StatementKind>),
}

impl StatementKind {
    /// Whether applying this statement changes nothing.
    pub fn is_no_op(&self) -> bool {
        match self {
            Self::NoOp => true,
            Self::Multi(kinds) => kinds.iter().all(Self::is_no_op),
            _ => false,
        }
    }
}

/// Result of reducing one event.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// Aggregate type of the reduced event.
    pub aggregate_type: AggregateType,
    /// Aggregate id of the reduced event.
    pub aggregate_id: AggregateId,
    /// Sequence of the reduced event.
    pub sequence: Sequence,
    /// Creation date of the reduced event.
    pub creation_date: DateTime<Utc>,
    /// The change.
    pub kind: StatementKind,
}

impl Statement {
    fn from_event(event: &Event, kind: StatementKind) -> Self {
        Self {
            aggregate_type: event.aggregate_type.clone(),
            aggregate_id: event.aggregate_id.clone(),
            sequence: event.sequence,
            creation_date: event.creation_date,
            kind,
        }
    }

    fn standard_columns(event: &Event) -> Vec<Column> {
        vec![
            Column::new(AGGREGATE_ID, event.aggregate_id.as_ref()),
            Column::new(CREATION_DATE, event.creation_date),
            Column::new(CHANGE_DATE, event.creation_date),
            Column::new(SEQUENCE, event.sequence),
            Column::new(RESOURCE_OWNER, event.resource_owner.as_ref()),
        ]
    }

    /// Inserts a row keyed by `aggregate_id` holding the standard columns
    /// followed by `columns`.
    pub fn create(event: &Event, table: impl Into<String>, columns: Vec<Column>) -> Self {
        Self::create_keyed(event, table, vec![AGGREGATE_ID.to_string()], columns)
    }

    /// Like [`create`](Self::create) for tables with a composite key.
    pub fn create_keyed(
        event: &Event,
        table: impl Into<String>,
        key_columns: Vec<String>,
        columns: Vec<Column>,
    ) -> Self {
        let mut all = Self::standard_columns(event);
        all.extend(columns);
        Self::from_event(
            event,
            StatementKind::Create {
                table: table.into(),
                key_columns,
                columns: all,
            },
        )
    }

    /// Inserts or refreshes a row keyed by `key_columns`.
    ///
    /// On conflict every column except `creation_date` is overwritten.
    pub fn upsert(
        event: &Event,
        table: impl Into<String>,
        key_columns: Vec<String>,
        columns: Vec<Column>,
    ) -> Self {
        let mut all = Self::standard_columns(event);
        all.extend(columns);
        Self::from_event(
            event,
            StatementKind::Upsert {
                table: table.into(),
                key_columns,
                columns: all,
            },
        )
    }

    /// Updates the row of the event's aggregate.
    pub fn update(event: &Event, table: impl Into<String>, values: Vec<Column>) -> Self {
        Self::update_where(
            event,
            table,
            values,
            vec![Condition::aggregate_id(&event.aggregate_id)],
        )
    }

    /// Updates rows matching `conditions`; `change_date` and `sequence` are
    /// set from the event.
    pub fn update_where(
        event: &Event,
        table: impl Into<String>,
        values: Vec<Column>,
        conditions: Vec<Condition>,
    ) -> Self {
        let mut all = vec![
            Column::new(CHANGE_DATE, event.creation_date),
            Column::new(SEQUENCE, event.sequence),
        ];
        all.extend(values);
        Self::from_event(
            event,
            StatementKind::Update {
                table: table.into(),
                values: all,
                conditions,
            },
        )
    }

    /// Deletes the row of the event's aggregate.
    pub fn delete(event: &Event, table: impl Into<String>) -> Self {
        Self::delete_where(
            event,
            table,
            vec![Condition::aggregate_id(&event.aggregate_id)],
        )
    }

    /// Deletes rows matching `conditions`.
    pub fn delete_where(event: &Event, table: impl Into<String>, conditions: Vec<Condition>) -> Self {
        Self::from_event(
            event,
            StatementKind::Delete {
                table: table.into(),
                conditions,
            },
        )
    }

    /// A statement that only advances the watermark.
    pub fn no_op(event: &Event) -> Self {
        Self::from_event(event, StatementKind::NoOp)
    }

    /// Combines statements reduced from the same event.
    pub fn multi(event: &Event, statements: Vec<Self>) -> Self {
        Self::from_event(
            event,
            StatementKind::Multi(statements.into_iter().map(|statement| statement.kind).collect()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AggregateVersion, EditorUser, EventType, ResourceOwner};
    use chrono::TimeZone;

    fn event() -> Event {
        Event {
            sequence: Sequence::new(15),
            previous_aggregate_sequence: Sequence::new(10),
            aggregate_type: AggregateType::new("user"),
            aggregate_id: AggregateId::try_new("agg-id").unwrap(),
            aggregate_version: AggregateVersion::new(2),
            resource_owner: ResourceOwner::try_new("ro-id").unwrap(),
            event_type: EventType::new("user.locked"),
            creation_date: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            editor_user: EditorUser::new("editor"),
            payload: None,
        }
    }

    #[test]
    fn create_prepends_standard_columns() {
        let statement = Statement::create(&event(), "projections.users", vec![Column::new("state", 1)]);

        let StatementKind::Create { columns, key_columns, .. } = statement.kind else {
            panic!("expected create");
        };
        let names: Vec<_> = columns.iter().map(|column| column.name.as_str()).collect();
        assert_eq!(
            names,
            ["aggregate_id", "creation_date", "change_date", "sequence", "resource_owner", "state"]
        );
        assert_eq!(key_columns, ["aggregate_id"]);
        assert_eq!(columns[3].value, ColumnValue::Int(15));
    }

    #[test]
    fn update_targets_the_aggregate_row() {
        let statement = Statement::update(&event(), "projections.users", vec![Column::new("state", 2)]);

        let StatementKind::Update { values, conditions, .. } = statement.kind else {
            panic!("expected update");
        };
        assert_eq!(values[0].name, "change_date");
        assert_eq!(values[1].name, "sequence");
        assert_eq!(conditions, [Condition::eq("aggregate_id", "agg-id")]);
    }

    #[test]
    fn multi_of_no_ops_is_no_op() {
        let event = event();
        let statement = Statement::multi(&event, vec![Statement::no_op(&event), Statement::no_op(&event)]);

        assert!(statement.kind.is_no_op());
        assert!(!Statement::delete(&event, "t").kind.is_no_op());
    }

    #[test]
    fn timestamps_render_as_rfc3339_micros() {
        let value = ColumnValue::from(event().creation_date).to_json();

        assert_eq!(value, Value::String("2024-01-02T03:04:05.000000Z".to_string()));
        assert_eq!(ColumnValue::from(None::<String>), ColumnValue::Null);
    }
}
