//! Reads of the user projection.

use crate::projection::{columns, USER_PROJECTION, USER_TABLE};
use crate::types::{UserState, Username};
use chrono::{DateTime, Utc};
use idcore::projection::{ColumnValue, AGGREGATE_ID, RESOURCE_OWNER};
use idcore::query::TextComparison;
use idcore::{
    AggregateId, HandlerStateStore, ProjectionReader, Queries, QueryResult, ResourceOwner,
    SearchQuery, SearchRequest, SearchResponse, Sequence,
};
use serde::{Deserialize, Serialize};
use tracing::instrument;

/// A row of `projections.users`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User id.
    #[serde(rename = "aggregate_id")]
    pub id: String,
    /// When the user was added.
    pub creation_date: DateTime<Utc>,
    /// When the row last changed.
    pub change_date: DateTime<Utc>,
    /// Sequence of the last event applied to the row.
    pub sequence: u64,
    /// Owning organisation.
    pub resource_owner: String,
    /// Lifecycle state.
    pub state: UserState,
    /// Login name.
    pub username: String,
    /// E-mail address.
    pub email: Option<String>,
    /// Whether the address is verified.
    pub is_email_verified: bool,
    /// Phone number.
    pub phone: Option<String>,
    /// Given name.
    pub first_name: Option<String>,
    /// Family name.
    pub last_name: Option<String>,
    /// Shown name.
    pub display_name: Option<String>,
}

/// Filters of [`UserQueries::search_users`]; unset filters match every user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserSearch {
    /// Paging and ordering.
    pub request: SearchRequest,
    /// Login name filter.
    pub username: Option<(String, TextComparison)>,
    /// E-mail filter.
    pub email: Option<(String, TextComparison)>,
    /// Accepted states; empty accepts all.
    pub states: Vec<UserState>,
    /// Owning organisation.
    pub resource_owner: Option<ResourceOwner>,
}

impl UserSearch {
    /// The filters as search queries.
    pub fn queries(&self) -> Vec<SearchQuery> {
        let mut queries = Vec::new();
        if let Some((username, comparison)) = &self.username {
            queries.push(SearchQuery::text(columns::USERNAME, username.as_str(), *comparison));
        }
        if let Some((email, comparison)) = &self.email {
            queries.push(SearchQuery::text(columns::EMAIL, email.as_str(), *comparison));
        }
        if !self.states.is_empty() {
            let states = self
                .states
                .iter()
                .map(|state| ColumnValue::from(state.as_i64()))
                .collect();
            queries.push(SearchQuery::list(columns::STATE, states));
        }
        if let Some(resource_owner) = &self.resource_owner {
            queries.push(SearchQuery::text(
                RESOURCE_OWNER,
                resource_owner.as_ref(),
                TextComparison::Equals,
            ));
        }
        queries
    }
}

/// User reads, each stamped with the projection's watermark.
#[derive(Debug, Clone)]
pub struct UserQueries<R, S> {
    queries: Queries<R, S>,
}

impl<R, S> UserQueries<R, S>
where
    R: ProjectionReader,
    S: HandlerStateStore,
{
    /// Reads `reader`, taking watermarks from `state`.
    pub const fn new(reader: R, state: S) -> Self {
        Self {
            queries: Queries::new(reader, state),
        }
    }

    /// The user with id `user_id`.
    ///
    /// # Errors
    ///
    /// [`QueryError::NotFound`](idcore::QueryError::NotFound) if the
    /// projection has no such user yet.
    #[instrument(name = "users.by_id", skip(self))]
    pub async fn user_by_id(&self, user_id: &AggregateId) -> QueryResult<(User, Sequence)> {
        let queries = [SearchQuery::text(AGGREGATE_ID, user_id.as_ref(), TextComparison::Equals)];
        self.queries.single(USER_PROJECTION, USER_TABLE, &queries).await
    }

    /// The user logging in as `username`, compared case-insensitively.
    pub async fn user_by_username(&self, username: &Username) -> QueryResult<(User, Sequence)> {
        let queries = [SearchQuery::text(
            columns::USERNAME,
            username.as_ref(),
            TextComparison::EqualsIgnoreCase,
        )];
        self.queries.single(USER_PROJECTION, USER_TABLE, &queries).await
    }

    /// Users matching `search`.
    #[instrument(name = "users.search", skip(self, search))]
    pub async fn search_users(&self, search: &UserSearch) -> QueryResult<SearchResponse<User>> {
        self.queries
            .search(USER_PROJECTION, USER_TABLE, &search.request, &search.queries())
            .await
    }

    /// Watermark of the user projection.
    pub async fn latest_sequence(&self) -> QueryResult<Sequence> {
        self.queries.latest_sequence(USER_PROJECTION).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unset_filters_produce_no_queries() {
        assert!(UserSearch::default().queries().is_empty());
    }

    #[test]
    fn every_filter_becomes_a_query() {
        let search = UserSearch {
            username: Some(("gi".to_string(), TextComparison::StartsWithIgnoreCase)),
            email: Some(("@example.com".to_string(), TextComparison::EndsWith)),
            states: vec![UserState::Active, UserState::Locked],
            resource_owner: Some(ResourceOwner::try_new("org1").unwrap()),
            ..UserSearch::default()
        };

        let queries = search.queries();

        assert_eq!(queries.len(), 4);
        let row = json!({
            "username": "Gigi",
            "email": "gigi@example.com",
            "state": 4,
            "resource_owner": "org1",
        });
        let serde_json::Value::Object(row) = row else {
            unreachable!()
        };
        assert!(queries.iter().all(|query| query.matches(&row)));
    }

    #[test]
    fn rows_map_to_users() {
        let row = json!({
            "aggregate_id": "u1",
            "creation_date": "2024-05-01T10:00:00.000000Z",
            "change_date": "2024-05-01T10:05:00.123456+00:00",
            "sequence": 12,
            "resource_owner": "org1",
            "state": 1,
            "username": "gigi",
            "email": "gigi@example.com",
            "is_email_verified": false,
            "phone": null,
            "first_name": "Gigi",
            "last_name": "Giraffe",
            "display_name": "Gigi Giraffe",
        });

        let user: User = serde_json::from_value(row).unwrap();

        assert_eq!(user.id, "u1");
        assert_eq!(user.state, UserState::Active);
        assert_eq!(user.phone, None);
        assert_eq!(user.sequence, 12);
    }
}
