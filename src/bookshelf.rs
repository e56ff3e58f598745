//! External bookshelf lookup: a user's ISBN-13 list by username.
//!
//! The [`Bookshelf`] trait is the seam the query engine depends on; the
//! shipped implementation talks to the Hardcover GraphQL API with a bearer
//! token. Calls are blocking, so the HTTP layer runs them on a blocking
//! thread.

use serde::{Deserialize, Serialize};

use crate::error::BookshelfError;

/// Anything that can resolve a username to a list of ISBN-13 strings.
pub trait Bookshelf: Send + Sync {
    fn isbns_for_user(&self, username: &str) -> Result<Vec<String>, BookshelfError>;
}

/// Default Hardcover GraphQL endpoint.
pub const HARDCOVER_ENDPOINT: &str = "https://api.hardcover.app/v1/graphql";

/// ISBNs of every edition on the user's "want to read" shelf.
const USER_BOOKS_QUERY: &str = r#"
query UserIsbns($username: citext) {
  users(where: {username: {_eq: $username}}) {
    user_books(where: {status_id: {_eq: 1}}) {
      book {
        editions(where: {isbn_13: {_is_null: false}}) {
          isbn_13
        }
      }
    }
  }
}"#;

#[derive(Serialize)]
struct GraphQlRequest<'a> {
    query: &'a str,
    variables: serde_json::Value,
}

#[derive(Deserialize)]
struct BooksResponse {
    #[serde(default)]
    data: BooksData,
}

#[derive(Deserialize, Default)]
struct BooksData {
    #[serde(default)]
    users: Vec<BooksUser>,
}

#[derive(Deserialize)]
struct BooksUser {
    #[serde(default)]
    user_books: Vec<UserBook>,
}

#[derive(Deserialize)]
struct UserBook {
    book: Book,
}

#[derive(Deserialize)]
struct Book {
    #[serde(default)]
    editions: Vec<Edition>,
}

#[derive(Deserialize)]
struct Edition {
    isbn_13: String,
}

/// Hardcover GraphQL client.
pub struct HardcoverClient {
    token: String,
    endpoint: String,
}

impl HardcoverClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            endpoint: HARDCOVER_ENDPOINT.to_string(),
        }
    }

    /// Point the client at a different endpoint (tests, proxies).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

impl Bookshelf for HardcoverClient {
    fn isbns_for_user(&self, username: &str) -> Result<Vec<String>, BookshelfError> {
        let started = std::time::Instant::now();
        let response = ureq::post(&self.endpoint)
            .set("Content-Type", "application/json")
            .set("Authorization", &format!("Bearer {}", self.token))
            .send_json(GraphQlRequest {
                query: USER_BOOKS_QUERY,
                variables: serde_json::json!({ "username": username }),
            })
            .map_err(|e| BookshelfError::Request {
                message: e.to_string(),
            })?;

        let body: BooksResponse =
            response.into_json().map_err(|e| BookshelfError::Decode {
                message: e.to_string(),
            })?;
        tracing::info!(
            username,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "bookshelf lookup"
        );

        if body.data.users.is_empty() {
            return Err(BookshelfError::NoUser {
                username: username.to_string(),
            });
        }

        let isbns: Vec<String> = body
            .data
            .users
            .into_iter()
            .flat_map(|user| user.user_books)
            .flat_map(|ub| ub.book.editions)
            .map(|edition| edition.isbn_13)
            .collect();
        Ok(isbns)
    }
}

impl std::fmt::Debug for HardcoverClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardcoverClient")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}
